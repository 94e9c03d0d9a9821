#![doc = r#"
# spark-session

## 设计动机（Why）
- **分层拦截**：每条连接拥有一条有序、可变的过滤器链，编解码、加密、日志等横切逻辑以过滤器的
  形式插入，应用只面对终端 [`IoHandler`]；
- **运行期可变**：过滤器（典型如 TLS）需要在连接存活期间插入与移除，链保证结构修改不会破坏在途事件；
- **错误不逃逸**：运行期错误一律流入 `exception_caught`，反应器永远不会从一次派发中收到错误。

## 核心契约（What）
- [`FilterChain`]：Head/Tail 哨兵之间的具名节点序列，入站自 Head 派发、出站自 Tail 派发；
- [`Filter`] / [`NextFilter`]：九类事件回调与四个生命周期钩子，以及绑定节点位置的转发句柄；
- [`IoSession`]：链、写队列、属性、计数器与完成句柄的拥有者；
- [`IoHandler`] / [`IoProcessor`]：应用侧与传输侧的协作者契约。

## 实现策略（How）
- 节点以竞技场下标寻址，移除的节点保留为墓碑以维持在途事件的邻接关系；
- 链的结构锁（`spin::RwLock`）只在解析邻居与修改结构时短暂持有，回调一律在锁外执行；
- 完成句柄同时支持回调与 `.await`，供同步反应器与异步调用方共用。

## 风险与考量（Trade-offs）
- 本 crate 不包含传输实现，测试以内存处理器驱动写队列与关闭流程；
- 墓碑槽位不回收，适用于过滤器装配相对稳定的连接。
"#]

mod attributes;
mod chain;
mod config;
pub mod error;
mod filter;
mod future;
mod handler;
mod message;
mod request;
mod session;

pub use attributes::{AttributeKey, AttributeMap};
pub use chain::{EntryId, FilterChain, FilterEntry};
pub use config::SessionConfig;
pub use error::{ChainError, CoreError, LifecyclePhase};
pub use filter::{AsAny, Filter, IdleStatus, NextFilter};
pub use future::{
    CloseFuture, CompletionHandle, ConnectFuture, ConnectStatus, ReadFuture, ReadOutcome, WriteFuture,
    WriteStatus,
};
pub use handler::{IoHandler, IoProcessor, NoopHandler};
pub use message::PipelineMessage;
pub use request::{WriteRequest, WriteToClosedSessionError};
pub use session::{IoCounters, IoSession, IoSessionBuilder};
