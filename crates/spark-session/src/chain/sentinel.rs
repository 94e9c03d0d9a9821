//! Head/Tail 哨兵过滤器。
//!
//! - Head 位于线路一侧：把出站写请求交给传输层的写队列，把关闭请求交给处理器；
//! - Tail 位于应用一侧：把入站事件交付给会话的 [`IoHandler`](crate::IoHandler)，
//!   并负责连接/读句柄的完成与会话关闭时的资源释放。

use std::sync::Arc;

use crate::{
    CoreError, IoSession, PipelineMessage, WriteRequest,
    filter::{Filter, IdleStatus, NextFilter},
    future::{ConnectStatus, ReadOutcome},
    session::CONNECT_FUTURE,
};

pub(crate) struct HeadFilter;

impl Filter for HeadFilter {
    fn filter_write(
        &self,
        _next: &NextFilter,
        session: &Arc<IoSession>,
        request: WriteRequest,
    ) -> Result<(), CoreError> {
        session.schedule_write(request);
        if session.is_write_suspended() {
            return Ok(());
        }
        session.processor().flush(session)
    }

    fn filter_close(&self, _next: &NextFilter, session: &Arc<IoSession>) -> Result<(), CoreError> {
        session.processor().remove(session)
    }
}

pub(crate) struct TailFilter;

impl Filter for TailFilter {
    fn session_created(&self, _next: &NextFilter, session: &Arc<IoSession>) -> Result<(), CoreError> {
        let result = session.handler().session_created(session);
        if let Some(connect) = session.attributes().remove(CONNECT_FUTURE) {
            connect.complete(ConnectStatus::Connected);
        }
        result
    }

    fn session_opened(&self, _next: &NextFilter, session: &Arc<IoSession>) -> Result<(), CoreError> {
        session.handler().session_opened(session)
    }

    fn session_closed(&self, _next: &NextFilter, session: &Arc<IoSession>) -> Result<(), CoreError> {
        let result = session.handler().session_closed(session);
        session.dispose_write_queue();
        session.attributes().clear();
        let cleared = session.filter_chain().clear().map_err(CoreError::from);
        if session.config().use_read_operation {
            session.offer_read(ReadOutcome::Closed);
        }
        result.and(cleared)
    }

    fn session_idle(
        &self,
        _next: &NextFilter,
        session: &Arc<IoSession>,
        status: IdleStatus,
    ) -> Result<(), CoreError> {
        session.handler().session_idle(session, status)
    }

    fn exception_caught(
        &self,
        _next: &NextFilter,
        session: &Arc<IoSession>,
        cause: CoreError,
    ) -> Result<(), CoreError> {
        let result = session.handler().exception_caught(session, cause.clone());
        if session.config().use_read_operation {
            session.offer_read(ReadOutcome::Failed(cause));
        }
        result
    }

    fn message_received(
        &self,
        _next: &NextFilter,
        session: &Arc<IoSession>,
        message: PipelineMessage,
    ) -> Result<(), CoreError> {
        session.counters().record_read(&message);
        if !session.config().use_read_operation {
            return session.handler().message_received(session, message);
        }
        let result = session.handler().message_received(session, message.clone());
        session.offer_read(ReadOutcome::Message(message));
        result
    }

    fn message_sent(
        &self,
        _next: &NextFilter,
        session: &Arc<IoSession>,
        request: WriteRequest,
    ) -> Result<(), CoreError> {
        session.counters().record_written_message();
        session.handler().message_sent(session, request.into_message())
    }
}
