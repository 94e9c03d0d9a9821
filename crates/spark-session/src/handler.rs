use std::sync::Arc;

use crate::{CoreError, IoSession, PipelineMessage, filter::IdleStatus};

/// 终端会话处理器：Tail 哨兵把入站事件最终交付到这里。
///
/// # 教案式说明
/// - **意图（Why）**：应用逻辑只需关心“消息到了、消息发出了、会话变化了”，
///   不应感知链上有哪些过滤器。
/// - **契约（What）**：
///   - 所有回调默认什么都不做；
///   - 回调返回 `Err` 会被链转入 `exception_caught`，因此 `exception_caught` 本身的失败
///     只会被记录日志；
///   - `message_sent` 收到的是应用最初提交的消息，加密等改写对处理器不可见。
pub trait IoHandler: Send + Sync + 'static {
    /// 会话已创建。
    fn session_created(&self, session: &Arc<IoSession>) -> Result<(), CoreError> {
        let _ = session;
        Ok(())
    }

    /// 会话已打开。
    fn session_opened(&self, session: &Arc<IoSession>) -> Result<(), CoreError> {
        let _ = session;
        Ok(())
    }

    /// 会话已关闭。
    fn session_closed(&self, session: &Arc<IoSession>) -> Result<(), CoreError> {
        let _ = session;
        Ok(())
    }

    /// 会话空闲。
    fn session_idle(&self, session: &Arc<IoSession>, status: IdleStatus) -> Result<(), CoreError> {
        let _ = (session, status);
        Ok(())
    }

    /// 链上出现未被过滤器消化的异常。
    fn exception_caught(&self, session: &Arc<IoSession>, cause: CoreError) -> Result<(), CoreError> {
        let _ = (session, cause);
        Ok(())
    }

    /// 收到消息。
    fn message_received(&self, session: &Arc<IoSession>, message: PipelineMessage) -> Result<(), CoreError> {
        let _ = (session, message);
        Ok(())
    }

    /// 消息已写出。
    fn message_sent(&self, session: &Arc<IoSession>, message: PipelineMessage) -> Result<(), CoreError> {
        let _ = (session, message);
        Ok(())
    }
}

/// 不处理任何事件的处理器。
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopHandler;

impl IoHandler for NoopHandler {}

/// 传输层处理器契约：Head 哨兵通过它把出站工作交还给反应器。
///
/// - `flush`：会话写队列中有新请求，传输层应尽快从 [`IoSession::poll_write_request`] 取出写出，
///   每写完一个请求调用 [`IoSession::complete_write`]；
/// - `remove`：会话请求关闭，传输层释放底层资源，调用
///   [`IoSession::clear_write_request_queue`] 后再触发
///   [`FilterChain::fire_session_closed`](crate::FilterChain::fire_session_closed)。
pub trait IoProcessor: Send + Sync + 'static {
    /// 请求写出会话写队列。
    fn flush(&self, session: &Arc<IoSession>) -> Result<(), CoreError>;

    /// 请求关闭并移除会话。
    fn remove(&self, session: &Arc<IoSession>) -> Result<(), CoreError>;
}
