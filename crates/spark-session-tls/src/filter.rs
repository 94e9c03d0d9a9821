use std::{
    net::SocketAddr,
    sync::{Arc, Weak},
};

use spark_session::{
    AttributeKey, CoreError, Filter, FilterChain, IoSession, NextFilter, PipelineMessage, WriteFuture,
    WriteRequest, WriteToClosedSessionError,
};
use tracing::debug;

use crate::{
    config::TlsFilterOptions,
    engine::TlsEngineFactory,
    error::TlsError,
    handler::TlsSessionHandler,
    request::{EncryptedWriteRequest, is_close_notify, is_control_write},
};

/// 一次性标记：下一次写请求不加密，原样下发（典型用于 STARTTLS 的明文应答）。
pub const DISABLE_ENCRYPTION_ONCE: AttributeKey<()> = AttributeKey::new("spark.tls.disable_encryption_once");

/// 会话标记：安全状态变化以 [`TlsNotification`] 用户消息送达处理器。
pub const USE_NOTIFICATION: AttributeKey<()> = AttributeKey::new("spark.tls.use_notification");

/// 创建引擎时使用的对端地址，优先于会话自身的对端地址。
pub const PEER_ADDRESS: AttributeKey<SocketAddr> = AttributeKey::new("spark.tls.peer_address");

const SESSION_HANDLER: AttributeKey<TlsSessionHandler> = AttributeKey::new("spark.tls.session_handler");

/// 会话安全状态通知。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TlsNotification {
    /// 首次握手完成。
    SessionSecured,
    /// 已发出 `close_notify`，会话不再加密。
    SessionUnsecured,
}

/// 会话级 TLS 过滤器。
///
/// # 教案式说明
/// - **意图（Why）**：TLS 作为链上的一层透明插入：上游过滤器与处理器只看到明文，
///   下游（Head 与传输）只看到密文；同一过滤器实例可被多个会话共享，
///   每个会话的状态保存在会话属性中的 [`TlsSessionHandler`] 里。
/// - **逻辑（How）**：
///   - 每个回调先短暂持有处理器锁推进状态机，产生的事件进入延迟队列；
///   - 释放锁之后调用 `flush_scheduled_events` 把事件交给邻居；
///   - 握手失败时在释放锁后立即关闭会话，错误以 `spark.tls.handshake_failed` 进入 `exception_caught`。
/// - **契约（What）**：
///   - 一条链上至多一个 `TlsFilter`；
///   - 握手完成前提交的写请求按提交顺序缓存，握手完成后依次加密下发；
///   - 应用在 `message_sent` 中永远只看到自己提交的明文请求；
///   - `filter_close` 先发送 `close_notify`，写完成后才继续向 Head 转发关闭。
/// - **风险（Trade-offs）**：加密在调用线程上同步完成，大块写入会占用反应器线程。
pub struct TlsFilter {
    factory: Arc<dyn TlsEngineFactory>,
    options: TlsFilterOptions,
}

impl TlsFilter {
    /// 以默认（服务端、自动握手）选项创建。
    pub fn new(factory: Arc<dyn TlsEngineFactory>) -> Self {
        Self::with_options(factory, TlsFilterOptions::default())
    }

    /// 以指定选项创建。
    pub fn with_options(factory: Arc<dyn TlsEngineFactory>, options: TlsFilterOptions) -> Self {
        Self { factory, options }
    }

    /// 过滤器选项。
    pub fn options(&self) -> &TlsFilterOptions {
        &self.options
    }

    /// 会话当前的 TLS 处理器。
    pub fn session_handler(session: &IoSession) -> Option<Arc<TlsSessionHandler>> {
        session.attributes().get(SESSION_HANDLER)
    }

    /// 会话是否已加密（握手完成且出站方向未关闭）。
    pub fn is_secured(session: &IoSession) -> bool {
        Self::session_handler(session).is_some_and(|handler| handler.is_secured())
    }

    /// 会话的 TLS 是否已启动。
    pub fn is_tls_started(session: &IoSession) -> bool {
        Self::session_handler(session).is_some_and(|handler| handler.is_tls_started())
    }

    /// 协商出的应用层协议。
    pub fn negotiated_protocol(session: &IoSession) -> Option<Vec<u8>> {
        Self::session_handler(session).and_then(|handler| handler.application_protocol())
    }

    /// 发起握手；`stop_tls` 之后调用会重建引擎。返回本次是否真的发起了握手。
    pub fn start_tls(&self, session: &Arc<IoSession>) -> Result<bool, TlsError> {
        let handler = Self::session_handler(session).ok_or(TlsError::NotInstalled)?;
        let result = {
            let mut locked = handler.lock(session);
            let result = locked.start();
            if result.as_ref().is_err_and(|error| error.is_handshake()) {
                locked.mark_handshake_failed();
            }
            result
        };
        handler.flush_scheduled_events(session);
        result
    }

    /// 发送 `close_notify`，返回其写完成句柄；会话随后以明文继续。
    pub fn stop_tls(&self, session: &Arc<IoSession>) -> Result<WriteFuture, TlsError> {
        let handler = Self::session_handler(session).ok_or(TlsError::NotInstalled)?;
        let result = {
            let mut locked = handler.lock(session);
            let result = locked.initiate_closure();
            if result.is_err() {
                locked.release();
            }
            result
        };
        handler.flush_scheduled_events(session);
        result
    }
}

impl Filter for TlsFilter {
    fn on_pre_add(&self, chain: &FilterChain, name: &str, next: &NextFilter) -> Result<(), CoreError> {
        if chain.contains_type::<TlsFilter>() {
            return Err(TlsError::SingleInstanceViolation.into());
        }
        let session = chain
            .session()
            .ok_or(TlsError::IllegalState("filter chain is detached from its session"))?;
        if self.options.use_notification {
            session.attributes().insert(USE_NOTIFICATION, ());
        }

        let handler = Arc::new(TlsSessionHandler::new(
            Arc::clone(&self.factory),
            self.options.clone(),
            *next,
        ));
        handler.lock(&session).init()?;
        session.attributes().insert_shared(SESSION_HANDLER, handler);
        debug!(session = session.id(), filter = name, "tls filter attached");
        Ok(())
    }

    fn on_post_add(&self, chain: &FilterChain, _name: &str, _next: &NextFilter) -> Result<(), CoreError> {
        if !self.options.auto_start {
            return Ok(());
        }
        let session = chain
            .session()
            .ok_or(TlsError::IllegalState("filter chain is detached from its session"))?;
        self.start_tls(&session)?;
        Ok(())
    }

    fn on_pre_remove(&self, chain: &FilterChain, name: &str, _next: &NextFilter) -> Result<(), CoreError> {
        let Some(session) = chain.session() else {
            return Ok(());
        };
        let Some(handler) = Self::session_handler(&session) else {
            return Ok(());
        };
        let closure = {
            let mut locked = handler.lock(&session);
            let closure = if locked.is_tls_started() {
                locked.initiate_closure().map(drop)
            } else {
                Ok(())
            };
            locked.destroy();
            closure
        };
        handler.flush_scheduled_events(&session);
        session.attributes().remove(SESSION_HANDLER);
        debug!(session = session.id(), filter = name, "tls filter detached");
        closure.map_err(CoreError::from)
    }

    fn session_closed(&self, next: &NextFilter, session: &Arc<IoSession>) -> Result<(), CoreError> {
        if let Some(handler) = session.attributes().remove(SESSION_HANDLER) {
            handler.lock(session).destroy();
            handler.flush_scheduled_events(session);
        }
        next.session_closed(session);
        Ok(())
    }

    fn message_received(
        &self,
        next: &NextFilter,
        session: &Arc<IoSession>,
        message: PipelineMessage,
    ) -> Result<(), CoreError> {
        let Some(handler) = Self::session_handler(session) else {
            next.message_received(session, message);
            return Ok(());
        };
        let PipelineMessage::Buffer(bytes) = message else {
            next.message_received(session, message);
            return Ok(());
        };

        let mut close = false;
        let result = {
            let mut locked = handler.lock(session);
            let result = if locked.is_handshake_failed() {
                debug!(
                    session = session.id(),
                    bytes = bytes.len(),
                    "dropping inbound data after tls handshake failure"
                );
                Ok(())
            } else if !locked.is_tls_started() && locked.is_inbound_done() {
                locked.schedule_received(PipelineMessage::Buffer(bytes));
                Ok(())
            } else {
                locked.decode(&bytes)
            };
            result.map_err(|error| {
                if locked.is_handshake_complete() {
                    locked.release();
                    error
                } else {
                    locked.mark_handshake_failed();
                    close = true;
                    error.into_handshake()
                }
            })
        };

        handler.flush_scheduled_events(session);
        if close {
            debug!(session = session.id(), "closing session after tls handshake failure");
            session.close_now();
        }
        result.map_err(CoreError::from)
    }

    fn message_sent(
        &self,
        next: &NextFilter,
        session: &Arc<IoSession>,
        request: WriteRequest,
    ) -> Result<(), CoreError> {
        match EncryptedWriteRequest::from_request(request) {
            Ok(encrypted) => next.message_sent(session, encrypted.into_parent()),
            Err(request) if is_control_write(&request) => {}
            Err(request) => next.message_sent(session, request),
        }
        Ok(())
    }

    fn exception_caught(
        &self,
        next: &NextFilter,
        session: &Arc<IoSession>,
        cause: CoreError,
    ) -> Result<(), CoreError> {
        let remaining = cause
            .cause_as::<WriteToClosedSessionError>()
            .filter(|error| error.requests().iter().any(is_close_notify))
            .map(|error| {
                error
                    .requests()
                    .iter()
                    .filter(|request| !is_close_notify(request))
                    .cloned()
                    .collect::<Vec<_>>()
            });

        match remaining {
            Some(requests) if requests.is_empty() => {
                debug!(session = session.id(), "ignoring failed close_notify write");
            }
            Some(requests) => {
                next.exception_caught(session, WriteToClosedSessionError::new(requests).into_core_error());
            }
            None => next.exception_caught(session, cause),
        }
        Ok(())
    }

    fn filter_write(
        &self,
        next: &NextFilter,
        session: &Arc<IoSession>,
        request: WriteRequest,
    ) -> Result<(), CoreError> {
        let Some(handler) = Self::session_handler(session) else {
            next.filter_write(session, request);
            return Ok(());
        };
        let result = handler.lock(session).filter_write(request);
        if !matches!(result, Ok(false)) {
            handler.flush_scheduled_events(session);
        }
        result.map(drop).map_err(CoreError::from)
    }

    fn filter_close(&self, next: &NextFilter, session: &Arc<IoSession>) -> Result<(), CoreError> {
        let Some(handler) = Self::session_handler(session) else {
            next.filter_close(session);
            return Ok(());
        };

        let closure = {
            let mut locked = handler.lock(session);
            if locked.is_handshake_failed() || !locked.is_tls_started() {
                None
            } else {
                let result = locked.initiate_closure();
                if result.is_err() {
                    locked.release();
                }
                Some(result)
            }
        };
        handler.flush_scheduled_events(session);

        match closure {
            None => next.filter_close(session),
            Some(Ok(future)) => {
                let weak: Weak<IoSession> = Arc::downgrade(session);
                let next = *next;
                future.add_listener(move |_| {
                    if let Some(session) = weak.upgrade() {
                        next.filter_close(&session);
                    }
                });
            }
            Some(Err(error)) => {
                next.filter_close(session);
                return Err(error.into());
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for TlsFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsFilter").field("options", &self.options).finish_non_exhaustive()
    }
}
