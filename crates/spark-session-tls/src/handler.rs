//! 会话级 TLS 状态机与缓冲管理。
//!
//! # 设计背景（Why）
//! - 一个会话的握手状态、四块缓冲与引擎实例必须作为整体变更：入站密文的累积、出站密文的
//!   排空、明文的一次性交付都依赖同一份状态；因此所有变更都在处理器自己的锁内完成。
//! - 锁内产生的事件若直接交给链上其它过滤器，它们可能同步回调进本处理器（例如应用在
//!   `message_received` 中立即写回）而自锁；于是事件先进入延迟队列，调用方释放锁后再
//!   调用 [`TlsSessionHandler::flush_scheduled_events`] 统一派发。
//!
//! # 逻辑（How）
//! - [`TlsSessionHandler::lock`] 返回持锁视图 [`Locked`]，状态机的全部步骤都是它的方法；
//! - 三个 [`EventQueue`]：握手完成前的明文写、待派发的出站写、待派发的入站消息；
//! - 派发阶段以 `try_lock` 保证同一时刻只有一个派发循环，嵌套调用只登记一次待派发计数，
//!   由外层循环补齐，保持事件的先后顺序。
//!
//! # 契约（What）
//! - 出站密文缓冲在下一次 `wrap` 之前必须已被取走；
//! - 解密得到的明文缓冲只交付一次，交付后即丢弃并在下次解密时重新分配；
//! - 被拒绝的写请求在派发阶段（锁外）才标记失败，完成句柄的监听器永远不会在锁内运行。

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::{Mutex, MutexGuard};
use spark_session::{
    CoreError, IoSession, NextFilter, PipelineMessage, WriteFuture, WriteRequest, WriteStatus,
    error::codes as session_codes,
};
use tracing::debug;

use crate::{
    config::TlsFilterOptions,
    engine::{EngineRequest, EngineResult, EngineStatus, HandshakeStatus, TlsEngine, TlsEngineFactory},
    error::{TlsEngineError, TlsError, TlsFailureClass},
    filter::{DISABLE_ENCRYPTION_ONCE, PEER_ADDRESS, TlsNotification, USE_NOTIFICATION},
    queue::{DeferredEvent, EventQueue},
    request::{CLOSE_NOTIFY_WRITE, EncryptedWriteRequest, HANDSHAKE_WRITE},
};

const NO_ENGINE: &str = "tls engine is not initialised";

/// 网络缓冲扩容上限，防止失常的引擎无限要求扩容。
const MAX_NET_BUFFER: usize = 16 * 1024 * 1024;

/// `destroy` 时排空引擎残留输出的最大轮数。
const MAX_DRAIN_ROUNDS: usize = 16;

struct HandlerState {
    engine: Option<Box<dyn TlsEngine>>,
    handshake_status: HandshakeStatus,
    handshake_complete: bool,
    first_handshake: bool,
    handshake_started: bool,
    handshake_failed: bool,
    in_net: BytesMut,
    out_net: Option<BytesMut>,
    app_buffer: Option<BytesMut>,
}

impl HandlerState {
    fn empty() -> Self {
        Self {
            engine: None,
            handshake_status: HandshakeStatus::NotHandshaking,
            handshake_complete: false,
            first_handshake: true,
            handshake_started: false,
            handshake_failed: false,
            in_net: BytesMut::new(),
            out_net: None,
            app_buffer: None,
        }
    }
}

/// 每个会话一份的 TLS 状态机。
///
/// # 教案式说明
/// - **意图（Why）**：把引擎驱动、缓冲管理与事件延迟派发从过滤器中剥离，
///   过滤器只负责“持锁调用一步、释放锁、派发”。
/// - **逻辑（How）**：状态由 `parking_lot::Mutex` 保护；延迟事件按产生顺序进入三个队列；
///   派发循环由独立的 `flush_lock` 与计数器串行化。
/// - **契约（What）**：处理器随过滤器接入而创建、随过滤器移除或会话关闭而销毁；
///   公开的查询方法会短暂获取状态锁，不可在持有 [`Locked`] 的同一线程上调用；
///   握手报文与密文一律经由过滤器自身的 [`NextFilter`] 向 Head 转发，不会再次进入
///   `TlsFilter::filter_write`，因此出站写不存在“已加密数据被二次加密”的情形。
/// - **风险（Trade-offs）**：派发发生在调用线程上，应用回调中的同步写入会延长本次派发循环。
pub struct TlsSessionHandler {
    factory: Arc<dyn TlsEngineFactory>,
    options: TlsFilterOptions,
    next: NextFilter,
    state: Mutex<HandlerState>,
    pre_handshake: EventQueue,
    deferred_writes: EventQueue,
    deferred_received: EventQueue,
    rejected: Mutex<Vec<(WriteRequest, CoreError)>>,
    scheduled: AtomicUsize,
    flush_lock: Mutex<()>,
}

impl TlsSessionHandler {
    pub(crate) fn new(factory: Arc<dyn TlsEngineFactory>, options: TlsFilterOptions, next: NextFilter) -> Self {
        Self {
            factory,
            options,
            next,
            state: Mutex::new(HandlerState::empty()),
            pre_handshake: EventQueue::new(),
            deferred_writes: EventQueue::new(),
            deferred_received: EventQueue::new(),
            rejected: Mutex::new(Vec::new()),
            scheduled: AtomicUsize::new(0),
            flush_lock: Mutex::new(()),
        }
    }

    /// 获取状态锁。
    pub(crate) fn lock<'a>(&'a self, session: &'a Arc<IoSession>) -> Locked<'a> {
        Locked {
            state: self.state.lock(),
            handler: self,
            session,
        }
    }

    /// 握手是否已完成（重协商期间为 `false`）。
    pub fn is_handshake_complete(&self) -> bool {
        self.state.lock().handshake_complete
    }

    /// 引擎存在且出站方向尚未关闭。
    pub fn is_tls_started(&self) -> bool {
        tls_started(&self.state.lock())
    }

    /// 会话是否处于已加密状态。
    pub fn is_secured(&self) -> bool {
        let state = self.state.lock();
        tls_started(&state) && state.handshake_complete
    }

    /// 入站方向是否已结束；引擎已销毁时视为结束。
    pub fn is_inbound_done(&self) -> bool {
        inbound_done(&self.state.lock())
    }

    /// 出站方向是否已结束；引擎已销毁时视为结束。
    pub fn is_outbound_done(&self) -> bool {
        outbound_done(&self.state.lock())
    }

    /// 最近一次记录的握手状态。
    pub fn handshake_status(&self) -> HandshakeStatus {
        self.state.lock().handshake_status
    }

    /// 握手完成前被缓存的写请求数。
    pub fn pending_handshake_writes(&self) -> usize {
        self.pre_handshake.len()
    }

    /// 协商出的应用层协议。
    pub fn application_protocol(&self) -> Option<Vec<u8>> {
        self.state
            .lock()
            .engine
            .as_ref()
            .and_then(|engine| engine.application_protocol())
    }

    /// 在锁外派发延迟事件。
    ///
    /// 同一时刻只允许一个派发循环；派发期间再次调用（例如应用在回调中写入）只会增加计数，
    /// 由正在运行的循环在当前批次结束后继续派发，从而保持事件顺序且不会重入。
    pub fn flush_scheduled_events(&self, session: &Arc<IoSession>) {
        self.scheduled.fetch_add(1, Ordering::AcqRel);
        loop {
            let Some(guard) = self.flush_lock.try_lock() else {
                return;
            };
            loop {
                self.deliver_scheduled(session);
                if !self.release_one() {
                    break;
                }
            }
            drop(guard);
            // 释放派发锁前后可能有新的登记未被处理。
            if self.scheduled.load(Ordering::Acquire) == 0 {
                return;
            }
        }
    }

    fn deliver_scheduled(&self, session: &Arc<IoSession>) {
        let rejected = std::mem::take(&mut *self.rejected.lock());
        for (request, error) in rejected {
            request.future().set_failed(error);
        }
        while let Some(event) = self.deferred_writes.poll() {
            event.deliver(session);
        }
        while let Some(event) = self.deferred_received.poll() {
            event.deliver(session);
        }
    }

    /// 计数减一，返回是否仍有待处理的登记。
    fn release_one(&self) -> bool {
        matches!(
            self.scheduled
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1)),
            Ok(previous) if previous > 1
        )
    }
}

impl fmt::Debug for TlsSessionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSessionHandler")
            .field("client_mode", &self.options.client_mode)
            .field("pre_handshake", &self.pre_handshake.len())
            .field("deferred_writes", &self.deferred_writes.len())
            .field("deferred_received", &self.deferred_received.len())
            .finish_non_exhaustive()
    }
}

/// 持有处理器状态锁的视图。
pub(crate) struct Locked<'a> {
    state: MutexGuard<'a, HandlerState>,
    handler: &'a TlsSessionHandler,
    session: &'a Arc<IoSession>,
}

impl Locked<'_> {
    /// 创建引擎并复位全部状态。
    pub(crate) fn init(&mut self) -> Result<(), TlsError> {
        let peer_addr = self
            .session
            .attributes()
            .get(PEER_ADDRESS)
            .map(|addr| *addr)
            .or_else(|| self.session.peer_addr());
        let request = EngineRequest {
            peer_addr,
            client_mode: self.handler.options.client_mode,
            server_name: self.handler.options.server_name.as_deref(),
        };
        let mut engine = self.handler.factory.new_engine(&request)?;
        engine.begin_handshake()?;

        let mut state = HandlerState::empty();
        state.handshake_status = engine.handshake_status();
        debug!(
            session = self.session.id(),
            client = engine.is_client_mode(),
            status = ?state.handshake_status,
            "tls engine initialised"
        );
        state.engine = Some(engine);
        *self.state = state;
        Ok(())
    }

    /// 开始握手；出站方向已关闭时先重建引擎。返回本次是否真的发起了握手。
    pub(crate) fn start(&mut self) -> Result<bool, TlsError> {
        if outbound_done(&self.state) {
            self.destroy();
            self.init()?;
        } else if self.state.handshake_started {
            return Ok(false);
        }
        self.handshake().map_err(TlsError::into_handshake)?;
        self.handle_tls_data()?;
        Ok(true)
    }

    pub(crate) fn is_tls_started(&self) -> bool {
        tls_started(&self.state)
    }

    pub(crate) fn is_inbound_done(&self) -> bool {
        inbound_done(&self.state)
    }

    pub(crate) fn is_outbound_done(&self) -> bool {
        outbound_done(&self.state)
    }

    pub(crate) fn is_handshake_complete(&self) -> bool {
        self.state.handshake_complete
    }

    pub(crate) fn is_handshake_failed(&self) -> bool {
        self.state.handshake_failed
    }

    /// 标记握手失败：此后的入站数据被丢弃，关闭请求不再尝试发送 `close_notify`。
    pub(crate) fn mark_handshake_failed(&mut self) {
        self.state.handshake_failed = true;
        self.release();
    }

    /// 驱动握手直到需要更多输入、输出尚未取走或握手完成。
    pub(crate) fn handshake(&mut self) -> Result<(), TlsError> {
        self.state.handshake_started = true;
        loop {
            match self.state.handshake_status {
                HandshakeStatus::Finished | HandshakeStatus::NotHandshaking => {
                    self.mark_complete();
                    return Ok(());
                }
                HandshakeStatus::NeedTask => {
                    let status = run_delegated_tasks(self.engine_mut()?);
                    self.state.handshake_status = status;
                }
                HandshakeStatus::NeedUnwrap => {
                    let status = self.unwrap_handshake()?;
                    let starved = status == EngineStatus::BufferUnderflow
                        && self.state.handshake_status != HandshakeStatus::Finished;
                    if starved || status == EngineStatus::Closed || self.is_inbound_done() {
                        return Ok(());
                    }
                }
                HandshakeStatus::NeedWrap => {
                    if self.state.out_net.as_ref().is_some_and(|buffer| !buffer.is_empty()) {
                        return Ok(());
                    }
                    let result = self.wrap_empty()?;
                    self.state.handshake_status = result.handshake_status;
                    self.emit_out_net(HANDSHAKE_WRITE);
                    if result.status == EngineStatus::Closed {
                        return Ok(());
                    }
                    if !result.made_progress() && result.handshake_status == HandshakeStatus::NeedWrap {
                        return Err(TlsError::IllegalState("engine made no progress while wrapping handshake"));
                    }
                }
            }
        }
    }

    fn mark_complete(&mut self) {
        self.state.handshake_complete = true;
        if !self.state.first_handshake {
            return;
        }
        self.state.first_handshake = false;
        debug!(session = self.session.id(), "tls handshake completed");
        if self.session.attributes().contains(USE_NOTIFICATION) {
            self.schedule_received(PipelineMessage::from_user(TlsNotification::SessionSecured));
        }
    }

    fn unwrap_handshake(&mut self) -> Result<EngineStatus, TlsError> {
        if self.state.in_net.is_empty() {
            return Ok(EngineStatus::BufferUnderflow);
        }
        let result = self.unwrap()?;
        self.state.handshake_status = result.handshake_status;
        check_status(&result)?;

        if result.handshake_status == HandshakeStatus::Finished
            && result.status == EngineStatus::Ok
            && !self.state.in_net.is_empty()
        {
            // 对端可能把首批应用数据与握手结束报文一起发出。
            let trailing = self.unwrap()?;
            check_status(&trailing)?;
            self.renegotiate_if_needed(&trailing)?;
        }

        if result.status == EngineStatus::Ok && !result.made_progress() {
            return Ok(EngineStatus::BufferUnderflow);
        }
        Ok(result.status)
    }

    fn unwrap(&mut self) -> Result<EngineResult, TlsError> {
        let HandlerState {
            engine,
            in_net,
            app_buffer,
            ..
        } = &mut *self.state;
        let engine = engine.as_deref_mut().ok_or(TlsError::IllegalState(NO_ENGINE))?;
        let app = app_buffer.get_or_insert_with(|| BytesMut::with_capacity(engine.application_buffer_size()));
        loop {
            let result = engine.unwrap(&in_net[..], app)?;
            let consumed = result.bytes_consumed.min(in_net.len());
            in_net.advance(consumed);

            if result.status == EngineStatus::BufferOverflow {
                let needed = engine.application_buffer_size();
                if app.capacity() - app.len() >= needed {
                    return Err(TlsError::IllegalState("application buffer overflow"));
                }
                app.reserve(needed);
                continue;
            }

            let more = result.status == EngineStatus::Ok
                && matches!(
                    result.handshake_status,
                    HandshakeStatus::NotHandshaking | HandshakeStatus::NeedUnwrap
                )
                && result.made_progress()
                && !in_net.is_empty();
            if !more {
                return Ok(result);
            }
        }
    }

    fn renegotiate_if_needed(&mut self, result: &EngineResult) -> Result<(), TlsError> {
        if matches!(result.status, EngineStatus::Closed | EngineStatus::BufferUnderflow)
            || result.handshake_status == HandshakeStatus::NotHandshaking
        {
            return Ok(());
        }
        self.state.handshake_complete = false;
        self.state.handshake_status = result.handshake_status;
        debug!(
            session = self.session.id(),
            status = ?result.handshake_status,
            "tls renegotiation"
        );
        self.handshake()
    }

    /// 累积入站密文并推进握手或解密。
    pub(crate) fn receive(&mut self, bytes: &[u8]) -> Result<(), TlsError> {
        self.state.in_net.extend_from_slice(bytes);
        if !self.state.handshake_complete {
            return self.handshake();
        }
        if self.state.in_net.is_empty() {
            return Ok(());
        }
        let result = self.unwrap()?;
        check_status(&result)?;
        self.renegotiate_if_needed(&result)
    }

    /// 入站处理的完整一步：接收、产出、关闭边界处理。
    pub(crate) fn decode(&mut self, bytes: &[u8]) -> Result<(), TlsError> {
        self.receive(bytes)?;
        self.handle_tls_data()?;
        if self.is_inbound_done() {
            // 关闭边界之后的字节按明文交付；destroy 会清空入站缓冲，先取出。
            let leftover = self.state.in_net.split().freeze();
            if self.is_outbound_done() {
                self.destroy();
            } else {
                self.initiate_closure()?;
            }
            if !leftover.is_empty() {
                self.schedule_received(PipelineMessage::Buffer(leftover));
            }
        }
        Ok(())
    }

    /// 握手完成时放行缓存的明文写，写出待发密文，交付解密出的明文。
    pub(crate) fn handle_tls_data(&mut self) -> Result<(), TlsError> {
        if self.state.handshake_complete {
            self.flush_pre_handshake()?;
        }
        self.write_net_buffer(HANDSHAKE_WRITE)?;
        if let Some(plain) = self.fetch_app_buffer()
            && !plain.is_empty()
        {
            self.schedule_received(PipelineMessage::Buffer(plain));
        }
        Ok(())
    }

    fn flush_pre_handshake(&mut self) -> Result<(), TlsError> {
        while let Some(event) = self.handler.pre_handshake.poll() {
            if let Some(request) = event.into_write_request() {
                self.filter_write(request)?;
            }
        }
        Ok(())
    }

    /// 出站写请求的持锁部分，返回是否需要派发。
    pub(crate) fn filter_write(&mut self, request: WriteRequest) -> Result<bool, TlsError> {
        if !self.is_tls_started() || self.session.attributes().take_marker(DISABLE_ENCRYPTION_ONCE) {
            self.schedule_write(request);
            return Ok(true);
        }

        if self.state.handshake_complete {
            let Some(plain) = request.message().as_bytes().cloned() else {
                let error = TlsError::IllegalState("only byte buffers can be encrypted");
                self.reject(request, error.clone().into());
                return Err(error);
            };
            let last = match self.encrypt(&plain) {
                Ok(last) => last,
                Err(error) => {
                    self.reject(request, error.clone().into());
                    return Err(error);
                }
            };
            let ciphertext = self.fetch_out_net_buffer();
            self.schedule_write(EncryptedWriteRequest::new(request, ciphertext).into_request());
            // 引擎在加密后要求重新握手：之后的写入改为缓存，直到握手再次完成。
            if let Some(result) = last
                && matches!(
                    result.handshake_status,
                    HandshakeStatus::NeedWrap | HandshakeStatus::NeedUnwrap
                )
            {
                self.renegotiate_if_needed(&result)
                    .map_err(TlsError::into_handshake)?;
            }
            return Ok(true);
        }

        if self.session.is_connected() {
            self.handler
                .pre_handshake
                .push(DeferredEvent::FilterWrite(self.handler.next, request));
            Ok(false)
        } else {
            self.reject(request, closed_write_error());
            Ok(true)
        }
    }

    /// 加密整段明文，返回最后一次包装的结果。
    fn encrypt(&mut self, src: &[u8]) -> Result<Option<EngineResult>, TlsError> {
        if !self.state.handshake_complete {
            return Err(TlsError::IllegalState("handshake is not complete"));
        }
        if self.state.out_net.as_ref().is_some_and(|buffer| !buffer.is_empty()) {
            return Err(TlsError::IllegalState("outbound ciphertext has not been drained"));
        }
        let HandlerState { engine, out_net, .. } = &mut *self.state;
        let engine = engine.as_deref_mut().ok_or(TlsError::IllegalState(NO_ENGINE))?;
        let out = out_net.insert(BytesMut::with_capacity(engine.packet_buffer_size()));

        let mut offset = 0;
        let mut last = None;
        while offset < src.len() {
            let result = engine.wrap(&src[offset..], out)?;
            match result.status {
                EngineStatus::Ok => {
                    offset += result.bytes_consumed.min(src.len() - offset);
                    if result.handshake_status == HandshakeStatus::NeedTask {
                        run_delegated_tasks(engine);
                    }
                    if !result.made_progress() {
                        return Err(TlsError::IllegalState("engine made no progress while encrypting"));
                    }
                    last = Some(result);
                }
                EngineStatus::BufferOverflow => grow_spare(out, engine.packet_buffer_size())?,
                status => {
                    return Err(TlsEngineError::new(
                        TlsFailureClass::Integrity,
                        format!("unexpected engine status during encryption: {status:?}"),
                    )
                    .into());
                }
            }
        }
        Ok(last)
    }

    /// 以空输入包装，输出追加到出站密文缓冲。
    fn wrap_empty(&mut self) -> Result<EngineResult, TlsError> {
        let HandlerState { engine, out_net, .. } = &mut *self.state;
        let engine = engine.as_deref_mut().ok_or(TlsError::IllegalState(NO_ENGINE))?;
        let out = out_net.get_or_insert_with(|| BytesMut::with_capacity(engine.packet_buffer_size()));
        loop {
            let result = engine.wrap(&[], out)?;
            if result.status != EngineStatus::BufferOverflow {
                return Ok(result);
            }
            grow_spare(out, engine.packet_buffer_size())?;
        }
    }

    /// 关闭出站方向并产出 `close_notify`；引擎不存在或已关闭时返回 `false`。
    pub(crate) fn close_outbound(&mut self) -> Result<bool, TlsError> {
        let Some(engine) = self.state.engine.as_deref_mut() else {
            return Ok(false);
        };
        if engine.is_outbound_done() {
            return Ok(false);
        }
        engine.close_outbound();
        let result = self.wrap_empty()?;
        if result.status != EngineStatus::Closed {
            return Err(TlsError::IllegalState("engine did not close the outbound direction"));
        }
        Ok(true)
    }

    /// 发送 `close_notify`，返回其写完成句柄。
    pub(crate) fn initiate_closure(&mut self) -> Result<WriteFuture, TlsError> {
        if !self.close_outbound()? {
            return Ok(WriteFuture::completed(WriteStatus::Failed(
                TlsError::AlreadyShutdown.into(),
            )));
        }
        let future = self
            .write_net_buffer(CLOSE_NOTIFY_WRITE)?
            .unwrap_or_else(|| WriteFuture::completed(WriteStatus::Written));
        if self.is_inbound_done() {
            self.destroy();
        }
        if self.session.attributes().contains(USE_NOTIFICATION) {
            self.schedule_received(PipelineMessage::from_user(TlsNotification::SessionUnsecured));
        }
        Ok(future)
    }

    /// 写出待发密文；引擎仍要求包装时继续推进握手。
    fn write_net_buffer(&mut self, tag: &'static str) -> Result<Option<WriteFuture>, TlsError> {
        let future = self.emit_out_net(tag);
        if self.state.handshake_status == HandshakeStatus::NeedWrap && !self.is_inbound_done() {
            self.handshake().map_err(TlsError::into_handshake)?;
        }
        Ok(future)
    }

    fn emit_out_net(&mut self, tag: &'static str) -> Option<WriteFuture> {
        let buffer = self.state.out_net.take().filter(|buffer| !buffer.is_empty())?;
        let request = WriteRequest::tagged(PipelineMessage::Buffer(buffer.freeze()), tag);
        let future = request.future().clone();
        self.schedule_write(request);
        Some(future)
    }

    /// 销毁引擎；缓存的明文写以 `write_to_closed` 失败。
    pub(crate) fn destroy(&mut self) {
        let Some(mut engine) = self.state.engine.take() else {
            return;
        };
        if let Err(error) = engine.close_inbound() {
            debug!(
                session = self.session.id(),
                error = %error,
                "tls inbound closed before close_notify"
            );
        }
        let mut scratch = BytesMut::with_capacity(engine.packet_buffer_size());
        for _ in 0..MAX_DRAIN_ROUNDS {
            scratch.clear();
            match engine.wrap(&[], &mut scratch) {
                Ok(result) if result.bytes_produced > 0 => {}
                _ => break,
            }
        }
        engine.close_outbound();
        self.release();
        for event in self.handler.pre_handshake.drain() {
            if let Some(request) = event.into_write_request() {
                self.reject(request, closed_write_error());
            }
        }
        debug!(session = self.session.id(), "tls engine destroyed");
    }

    /// 释放缓冲。
    pub(crate) fn release(&mut self) {
        self.state.in_net = BytesMut::new();
        self.state.out_net = None;
        self.state.app_buffer = None;
    }

    fn fetch_app_buffer(&mut self) -> Option<Bytes> {
        self.state.app_buffer.take().map(BytesMut::freeze)
    }

    fn fetch_out_net_buffer(&mut self) -> Bytes {
        self.state
            .out_net
            .take()
            .map(BytesMut::freeze)
            .unwrap_or_default()
    }

    pub(crate) fn schedule_write(&self, request: WriteRequest) {
        self.handler
            .deferred_writes
            .push(DeferredEvent::FilterWrite(self.handler.next, request));
    }

    pub(crate) fn schedule_received(&self, message: PipelineMessage) {
        self.handler
            .deferred_received
            .push(DeferredEvent::MessageReceived(self.handler.next, message));
    }

    fn reject(&self, request: WriteRequest, error: CoreError) {
        self.handler.rejected.lock().push((request, error));
    }

    fn engine_mut(&mut self) -> Result<&mut (dyn TlsEngine + 'static), TlsError> {
        self.state
            .engine
            .as_deref_mut()
            .ok_or(TlsError::IllegalState(NO_ENGINE))
    }
}

fn tls_started(state: &HandlerState) -> bool {
    state
        .engine
        .as_ref()
        .is_some_and(|engine| !engine.is_outbound_done())
}

fn inbound_done(state: &HandlerState) -> bool {
    state.engine.as_ref().is_none_or(|engine| engine.is_inbound_done())
}

fn outbound_done(state: &HandlerState) -> bool {
    state.engine.as_ref().is_none_or(|engine| engine.is_outbound_done())
}

fn run_delegated_tasks(engine: &mut dyn TlsEngine) -> HandshakeStatus {
    while let Some(task) = engine.delegated_task() {
        task();
    }
    engine.handshake_status()
}

fn check_status(result: &EngineResult) -> Result<(), TlsError> {
    match result.status {
        EngineStatus::BufferOverflow => Err(TlsError::IllegalState("engine reported buffer overflow")),
        _ => Ok(()),
    }
}

/// 把剩余可写空间至少扩大一倍。
fn grow_spare(buffer: &mut BytesMut, minimum: usize) -> Result<(), TlsError> {
    let spare = buffer.capacity() - buffer.len();
    let wanted = (spare * 2).max(minimum).max(1);
    if wanted > MAX_NET_BUFFER {
        return Err(TlsError::IllegalState("network buffer exceeds its limit"));
    }
    buffer.reserve(wanted);
    Ok(())
}

fn closed_write_error() -> CoreError {
    CoreError::new(
        session_codes::SESSION_WRITE_TO_CLOSED,
        "tls session closed before the write could be encrypted",
    )
}
