#![doc = r#"
# spark-session-tls

## 设计动机（Why）
- **透明加密层**：TLS 以一个普通过滤器的形式插入会话链，上游只看到明文，下游只看到密文；
  应用既可以在连接建立时直接启用，也可以在明文协商（STARTTLS）之后再插入；
- **引擎可替换**：密码学工作由 [`TlsEngine`] 承担，本 crate 只负责驱动其状态机、管理缓冲与
  维持事件顺序，默认提供基于 rustls 的 [`RustlsEngine`]。

## 核心契约（What）
- [`TlsFilter`]：链上至多一个；负责握手、加解密、`close_notify` 以及写完成信号的还原；
- [`TlsSessionHandler`]：每会话一份的状态机，所有状态变更都在其锁内完成；
- [`EncryptedWriteRequest`]：以密文替换明文但共享原始完成句柄的写请求；
- [`TlsError`]：握手失败与握手后的失败以不同错误码区分。

## 实现策略（How）
- 处理器持锁推进状态机，产生的写出、交付、失败通知进入延迟队列，释放锁之后统一派发，
  应用在回调中同步写回不会自锁；
- 握手完成前的明文写按提交顺序缓存，握手完成后依次加密；
- [`RustlsEngineFactory`] 以 `ArcSwapOption` 保存配置，支持证书热替换。

## 风险与考量（Trade-offs）
- 加解密在反应器线程上同步执行；
- 握手失败后会话立即关闭，不尝试发送 `close_notify`。
"#]

mod config;
mod engine;
pub mod error;
mod filter;
mod handler;
mod queue;
mod request;
mod rustls_engine;

pub use config::TlsFilterOptions;
pub use engine::{
    DelegatedTask, EngineRequest, EngineResult, EngineStatus, HandshakeStatus, TlsEngine, TlsEngineFactory,
};
pub use error::{TlsEngineError, TlsError, TlsFailureClass};
pub use filter::{DISABLE_ENCRYPTION_ONCE, PEER_ADDRESS, TlsFilter, TlsNotification, USE_NOTIFICATION};
pub use handler::TlsSessionHandler;
pub use queue::{DeferredEvent, EventQueue};
pub use request::{
    CLOSE_NOTIFY_WRITE, ENCRYPTED_WRITE, EncryptedWriteRequest, HANDSHAKE_WRITE, is_close_notify, is_control_write,
};
pub use rustls_engine::{RustlsEngine, RustlsEngineFactory};
