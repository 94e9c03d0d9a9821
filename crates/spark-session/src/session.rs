//! 会话：过滤器链、写队列、属性与完成句柄的拥有者。
//!
//! # 设计背景（Why）
//! - 链通过 `Weak` 回指会话，会话通过 `Arc` 被反应器、应用与过滤器共享；
//!   `Arc::new_cyclic` 让二者在构造时即互相绑定，链的生命周期严格等于会话。
//! - 传输层只需要三个动作：取出下一个待写请求、报告写完成、关闭时清空写队列；
//!   其余状态（关闭中、写挂起、计数器、读队列）都由会话自身维护。
//!
//! # 契约（What）
//! - `write` 对关闭中/已关闭的会话立即以 `spark.session.write_to_closed` 失败；
//! - `close_now` 幂等，只有第一次调用会派发 `filter_close`；
//! - 读操作需显式启用，未启用时 `read()` 返回 `spark.session.read_disabled`。

use std::{
    collections::VecDeque,
    fmt,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use spin::Mutex;

use crate::{
    CoreError, FilterChain, PipelineMessage, WriteRequest,
    attributes::{AttributeKey, AttributeMap},
    config::SessionConfig,
    error::codes,
    future::{CloseFuture, ConnectFuture, ReadFuture, ReadOutcome, WriteFuture},
    handler::{IoHandler, IoProcessor},
    request::WriteToClosedSessionError,
};

/// 未完成的连接句柄；会话创建成功或失败时被取出。
pub(crate) const CONNECT_FUTURE: AttributeKey<ConnectFuture> =
    AttributeKey::new("spark.session.connect_future");

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// 会话 I/O 计数器。
#[derive(Debug, Default)]
pub struct IoCounters {
    scheduled_write_bytes: AtomicU64,
    scheduled_write_messages: AtomicU64,
    written_bytes: AtomicU64,
    written_messages: AtomicU64,
    read_bytes: AtomicU64,
    read_messages: AtomicU64,
}

impl IoCounters {
    /// 已入队、尚未写出的字节数。
    pub fn scheduled_write_bytes(&self) -> u64 {
        self.scheduled_write_bytes.load(Ordering::Acquire)
    }

    /// 已入队、尚未写出的请求数。
    pub fn scheduled_write_messages(&self) -> u64 {
        self.scheduled_write_messages.load(Ordering::Acquire)
    }

    /// 累计写出字节数。
    pub fn written_bytes(&self) -> u64 {
        self.written_bytes.load(Ordering::Acquire)
    }

    /// 累计写出消息数。
    pub fn written_messages(&self) -> u64 {
        self.written_messages.load(Ordering::Acquire)
    }

    /// 累计读取字节数。
    pub fn read_bytes(&self) -> u64 {
        self.read_bytes.load(Ordering::Acquire)
    }

    /// 累计读取消息数。
    pub fn read_messages(&self) -> u64 {
        self.read_messages.load(Ordering::Acquire)
    }

    fn record_scheduled(&self, message: &PipelineMessage) {
        self.scheduled_write_bytes
            .fetch_add(message.readable_bytes() as u64, Ordering::AcqRel);
        self.scheduled_write_messages.fetch_add(1, Ordering::AcqRel);
    }

    fn release_scheduled(&self, message: &PipelineMessage) {
        let bytes = message.readable_bytes() as u64;
        let _ = self
            .scheduled_write_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(bytes)));
        let _ = self
            .scheduled_write_messages
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(1)));
    }

    pub(crate) fn record_read(&self, message: &PipelineMessage) {
        self.read_bytes
            .fetch_add(message.readable_bytes() as u64, Ordering::AcqRel);
        self.read_messages.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn record_written_message(&self) {
        self.written_messages.fetch_add(1, Ordering::AcqRel);
    }
}

#[derive(Default)]
struct ReadQueue {
    ready: VecDeque<ReadFuture>,
    waiting: VecDeque<ReadFuture>,
}

/// 一条连接的会话。
///
/// # 教案式说明
/// - **意图（Why）**：为过滤器与应用提供统一的会话视图，同时向传输层暴露最小的写队列接口。
/// - **逻辑（How）**：
///   - 出站：`write` → 链 Tail → … → Head 把请求压入写队列并请求 `flush`；
///     传输层写出后调用 `complete_write`，链自 Head 派发 `message_sent`；
///   - 关闭：`close_now` → 链 `filter_close` → Head 调用处理器 `remove`；传输层随后调用
///     `clear_write_request_queue` 与 `fire_session_closed`。
/// - **契约（What）**：会话只能经由 [`IoSession::builder`] 构造并以 `Arc` 持有。
pub struct IoSession {
    id: u64,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    config: SessionConfig,
    handler: Arc<dyn IoHandler>,
    processor: Arc<dyn IoProcessor>,
    attributes: AttributeMap,
    chain: FilterChain,
    write_queue: Mutex<VecDeque<WriteRequest>>,
    reads: Mutex<ReadQueue>,
    closing: AtomicBool,
    write_suspended: AtomicBool,
    close_future: CloseFuture,
    counters: IoCounters,
}

impl IoSession {
    /// 以终端处理器与传输处理器开始构造会话。
    pub fn builder(handler: Arc<dyn IoHandler>, processor: Arc<dyn IoProcessor>) -> IoSessionBuilder {
        IoSessionBuilder {
            handler,
            processor,
            config: SessionConfig::default(),
            local_addr: None,
            peer_addr: None,
            connect_future: None,
        }
    }

    /// 会话标识，进程内单调递增。
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 本端地址。
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// 对端地址。
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// 会话配置。
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// 终端处理器。
    pub fn handler(&self) -> &Arc<dyn IoHandler> {
        &self.handler
    }

    /// 传输处理器。
    pub fn processor(&self) -> &Arc<dyn IoProcessor> {
        &self.processor
    }

    /// 会话属性。
    pub fn attributes(&self) -> &AttributeMap {
        &self.attributes
    }

    /// 会话独占的过滤器链。
    pub fn filter_chain(&self) -> &FilterChain {
        &self.chain
    }

    /// I/O 计数器。
    pub fn counters(&self) -> &IoCounters {
        &self.counters
    }

    /// 关闭完成句柄；`session_closed` 派发前完成。
    pub fn close_future(&self) -> &CloseFuture {
        &self.close_future
    }

    /// 是否已关闭。
    pub fn is_closed(&self) -> bool {
        self.close_future.is_done()
    }

    /// 是否仍处于连接状态。
    pub fn is_connected(&self) -> bool {
        !self.is_closed()
    }

    /// 是否正在关闭或已关闭。
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire) || self.is_closed()
    }

    /// 写入消息。
    pub fn write(&self, message: impl Into<PipelineMessage>) -> WriteFuture {
        self.submit(WriteRequest::new(message.into()))
    }

    /// 写入消息到指定目标（无连接传输）。
    pub fn write_to(&self, message: impl Into<PipelineMessage>, destination: SocketAddr) -> WriteFuture {
        self.submit(WriteRequest::new(message.into()).with_destination(destination))
    }

    fn submit(&self, request: WriteRequest) -> WriteFuture {
        let future = request.future().clone();
        if self.is_closing() {
            future.set_failed(closed_write_error());
            return future;
        }
        self.chain.fire_filter_write(request);
        future
    }

    /// 立即关闭会话；重复调用返回同一个关闭句柄。
    pub fn close_now(&self) -> CloseFuture {
        if !self.closing.swap(true, Ordering::AcqRel) {
            self.chain.fire_filter_close();
        }
        self.close_future.clone()
    }

    /// 挂起写出：请求仍会入队，但不再请求 `flush`。
    pub fn suspend_write(&self) {
        self.write_suspended.store(true, Ordering::Release);
    }

    /// 恢复写出并请求一次 `flush`。
    pub fn resume_write(self: &Arc<Self>) -> Result<(), CoreError> {
        self.write_suspended.store(false, Ordering::Release);
        self.processor.flush(self)
    }

    /// 写出是否被挂起。
    pub fn is_write_suspended(&self) -> bool {
        self.write_suspended.load(Ordering::Acquire)
    }

    pub(crate) fn schedule_write(&self, request: WriteRequest) {
        self.counters.record_scheduled(request.message());
        self.write_queue.lock().push_back(request);
    }

    /// 写队列中待写出的请求数。
    pub fn pending_writes(&self) -> usize {
        self.write_queue.lock().len()
    }

    /// 传输层取出下一个待写请求。
    pub fn poll_write_request(&self) -> Option<WriteRequest> {
        self.write_queue.lock().pop_front()
    }

    /// 传输层报告请求已写出：更新计数器并派发 `message_sent`。
    pub fn complete_write(&self, request: WriteRequest) {
        self.counters.release_scheduled(request.message());
        self.counters
            .written_bytes
            .fetch_add(request.message().readable_bytes() as u64, Ordering::AcqRel);
        self.chain.fire_message_sent(request);
    }

    /// 关闭时清空写队列。
    ///
    /// 队首若是空缓冲（常见于过滤器写出的结束标记），视为已写出并派发 `message_sent`；
    /// 其余请求全部失败，并以一次 `exception_caught` 携带整批失败请求。
    pub fn clear_write_request_queue(&self) {
        let drained: Vec<WriteRequest> = self.write_queue.lock().drain(..).collect();
        let mut drained = drained.into_iter();
        let mut failed = Vec::new();
        if let Some(first) = drained.next() {
            match first.message() {
                PipelineMessage::Buffer(bytes) if bytes.is_empty() => {
                    self.counters.release_scheduled(first.message());
                    self.chain.fire_message_sent(first);
                }
                _ => failed.push(first),
            }
            failed.extend(drained);
        }
        if failed.is_empty() {
            return;
        }
        for request in &failed {
            self.counters.release_scheduled(request.message());
            request.future().set_failed(closed_write_error());
        }
        self.chain
            .fire_exception_caught(WriteToClosedSessionError::new(failed).into_core_error());
    }

    pub(crate) fn dispose_write_queue(&self) {
        let drained: Vec<WriteRequest> = self.write_queue.lock().drain(..).collect();
        for request in drained {
            self.counters.release_scheduled(request.message());
            request.future().set_failed(closed_write_error());
        }
    }

    /// 拉取式读取下一条消息。
    ///
    /// 会话关闭后，已关闭的读句柄保留在就绪队列中，后续每次调用都得到“已关闭”。
    pub fn read(&self) -> Result<ReadFuture, CoreError> {
        if !self.config.use_read_operation {
            return Err(CoreError::new(
                codes::SESSION_READ_DISABLED,
                "read operation is disabled in the session config",
            ));
        }
        let mut reads = self.reads.lock();
        if let Some(future) = reads.ready.pop_front() {
            if matches!(future.value(), Some(ReadOutcome::Closed)) {
                reads.ready.push_back(future.clone());
            }
            return Ok(future);
        }
        let future = ReadFuture::new();
        reads.waiting.push_back(future.clone());
        Ok(future)
    }

    pub(crate) fn offer_read(&self, outcome: ReadOutcome) {
        let waiting = {
            let mut reads = self.reads.lock();
            match reads.waiting.pop_front() {
                Some(future) => future,
                None => {
                    reads.ready.push_back(ReadFuture::completed(outcome));
                    return;
                }
            }
        };
        waiting.complete(outcome);
    }
}

impl fmt::Debug for IoSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoSession")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("closing", &self.is_closing())
            .field("chain", &self.chain)
            .finish()
    }
}

fn closed_write_error() -> CoreError {
    CoreError::new(codes::SESSION_WRITE_TO_CLOSED, "session is closing or closed")
}

/// [`IoSession`] 构造器。
pub struct IoSessionBuilder {
    handler: Arc<dyn IoHandler>,
    processor: Arc<dyn IoProcessor>,
    config: SessionConfig,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    connect_future: Option<ConnectFuture>,
}

impl IoSessionBuilder {
    /// 会话配置。
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// 本端地址。
    pub fn local_addr(mut self, addr: SocketAddr) -> Self {
        self.local_addr = Some(addr);
        self
    }

    /// 对端地址。
    pub fn peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    /// 客户端连接句柄：`session_created` 派发完毕后完成，若其前发生异常则失败并关闭会话。
    pub fn connect_future(mut self, future: ConnectFuture) -> Self {
        self.connect_future = Some(future);
        self
    }

    /// 构造会话。
    pub fn build(self) -> Arc<IoSession> {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new_cyclic(|weak| IoSession {
            id,
            local_addr: self.local_addr,
            peer_addr: self.peer_addr,
            config: self.config,
            handler: self.handler,
            processor: self.processor,
            attributes: AttributeMap::new(),
            chain: FilterChain::new(weak.clone(), id),
            write_queue: Mutex::new(VecDeque::new()),
            reads: Mutex::new(ReadQueue::default()),
            closing: AtomicBool::new(false),
            write_suspended: AtomicBool::new(false),
            close_future: CloseFuture::new(),
            counters: IoCounters::default(),
        });
        if let Some(future) = self.connect_future {
            session.attributes.insert(CONNECT_FUTURE, future);
        }
        session
    }
}
