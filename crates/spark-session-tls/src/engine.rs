//! 加密引擎契约。
//!
//! # 设计背景（Why）
//! - TLS 过滤器只负责“何时包装、何时解包、结果交给谁”，真正的密码学工作由外部引擎完成；
//!   契约刻画为一台由结果码驱动的状态机，便于替换实现（rustls、测试用的脚本化引擎）。
//!
//! # 契约（What）
//! - `wrap`/`unwrap` 把输出追加到 `dst` 末尾，`dst` 的剩余容量即可写空间；引擎可以自行扩容，
//!   也可以返回 [`EngineStatus::BufferOverflow`] 让调用方扩容后重试；
//! - 返回的 [`EngineResult::handshake_status`] 为 [`HandshakeStatus::Finished`] 时，表示本次调用
//!   恰好完成了一次握手；此后 [`TlsEngine::handshake_status`] 报告 `NotHandshaking`；
//! - [`TlsEngine::delegated_task`] 返回的任务需在调用线程上同步执行。

use std::net::SocketAddr;

use bytes::BytesMut;

use crate::error::{TlsEngineError, TlsError};

/// 单次 `wrap`/`unwrap` 的结果状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EngineStatus {
    /// 正常推进。
    Ok,
    /// 输入不足以构成完整记录。
    BufferUnderflow,
    /// 输出空间不足。
    BufferOverflow,
    /// 对应方向已关闭。
    Closed,
}

/// 握手状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandshakeStatus {
    /// 需要产出握手报文。
    NeedWrap,
    /// 需要更多对端报文。
    NeedUnwrap,
    /// 需要同步执行委托任务。
    NeedTask,
    /// 本次调用完成了握手。
    Finished,
    /// 未处于握手中。
    NotHandshaking,
}

/// 一次 `wrap`/`unwrap` 的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineResult {
    /// 结果状态。
    pub status: EngineStatus,
    /// 调用结束时的握手状态。
    pub handshake_status: HandshakeStatus,
    /// 消耗的输入字节数。
    pub bytes_consumed: usize,
    /// 产出的输出字节数。
    pub bytes_produced: usize,
}

impl EngineResult {
    /// 构造结果。
    pub fn new(
        status: EngineStatus,
        handshake_status: HandshakeStatus,
        bytes_consumed: usize,
        bytes_produced: usize,
    ) -> Self {
        Self {
            status,
            handshake_status,
            bytes_consumed,
            bytes_produced,
        }
    }

    /// 本次调用是否有任何进展。
    pub fn made_progress(&self) -> bool {
        self.bytes_consumed > 0 || self.bytes_produced > 0
    }
}

/// 需同步执行的密码学任务。
pub type DelegatedTask = Box<dyn FnOnce() + Send>;

/// 外部加密引擎。
///
/// 每个会话独占一个引擎实例；所有调用都发生在会话处理器的锁内，因此实现无需内部同步。
pub trait TlsEngine: Send {
    /// 开始握手。
    fn begin_handshake(&mut self) -> Result<(), TlsEngineError>;

    /// 加密 `src`，把密文追加到 `dst`。
    fn wrap(&mut self, src: &[u8], dst: &mut BytesMut) -> Result<EngineResult, TlsEngineError>;

    /// 解密 `src`，把明文追加到 `dst`。
    fn unwrap(&mut self, src: &[u8], dst: &mut BytesMut) -> Result<EngineResult, TlsEngineError>;

    /// 当前握手状态。
    fn handshake_status(&self) -> HandshakeStatus;

    /// 取出下一个委托任务。
    fn delegated_task(&mut self) -> Option<DelegatedTask>;

    /// 关闭入站方向；尚未收到对端 `close_notify` 时返回截断错误。
    fn close_inbound(&mut self) -> Result<(), TlsEngineError>;

    /// 关闭出站方向；随后的 `wrap` 产出 `close_notify`。
    fn close_outbound(&mut self);

    /// 入站方向是否已结束。
    fn is_inbound_done(&self) -> bool;

    /// 出站方向是否已结束（`close_notify` 已全部产出）。
    fn is_outbound_done(&self) -> bool;

    /// 单条密文记录的最大长度。
    fn packet_buffer_size(&self) -> usize;

    /// 单条记录解密后的最大明文长度。
    fn application_buffer_size(&self) -> usize;

    /// 协商出的应用层协议（ALPN）。
    fn application_protocol(&self) -> Option<Vec<u8>> {
        None
    }

    /// 是否为客户端模式。
    fn is_client_mode(&self) -> bool;
}

/// 创建引擎时的会话上下文。
#[derive(Clone, Copy, Debug)]
pub struct EngineRequest<'a> {
    /// 对端地址；优先取会话属性 `PEER_ADDRESS`，否则取会话自身的对端地址。
    pub peer_addr: Option<SocketAddr>,
    /// 是否以客户端模式握手。
    pub client_mode: bool,
    /// 客户端 SNI。
    pub server_name: Option<&'a str>,
}

/// 按会话创建引擎。
pub trait TlsEngineFactory: Send + Sync + 'static {
    /// 创建一个新引擎。
    fn new_engine(&self, request: &EngineRequest<'_>) -> Result<Box<dyn TlsEngine>, TlsError>;
}
