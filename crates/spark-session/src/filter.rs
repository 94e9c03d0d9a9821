use std::{any::Any, sync::Arc};

use crate::{
    CoreError, IoSession, PipelineMessage, WriteRequest,
    chain::{ChainEvent, EntryId, FilterChain},
};

/// 会话空闲类型。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IdleStatus {
    /// 读空闲。
    ReaderIdle,
    /// 写空闲。
    WriterIdle,
    /// 读写均空闲。
    BothIdle,
}

/// 允许从 `dyn Filter` 回到具体类型，用于按类型查找、移除、替换。
pub trait AsAny: Any {
    /// 以 `Any` 视图借用自身。
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// 过滤器：拦截会话事件与写/关闭请求的可插拔节点。
///
/// # 教案式说明
/// - **意图（Why）**：协议栈中的每一层（编解码、加密、日志、限流）只关心自己那一层的
///   变换；过滤器以统一的九类事件回调描述这种分层，实现者只覆盖自己关心的回调。
/// - **逻辑（How）**：
///   - 入站事件（`session_*`、`message_received`、`message_sent`、`exception_caught`）
///     从 Head 向 Tail 传播；
///   - 出站请求（`filter_write`、`filter_close`）从 Tail 向 Head 传播；
///   - 所有回调的默认实现都是“原样转交给 [`NextFilter`]”，即适配器语义；
///   - 四个生命周期钩子默认什么都不做。
/// - **契约（What）**：
///   - 回调返回 `Err` 时，链在调用点捕获该错误并转入 `exception_caught`，
///     不会回抛给触发事件的反应器；
///   - 回调内部若需要同步，需由过滤器自行负责，链在派发单个事件时不持有任何锁；
///   - 钩子中的 `next` 与链上该节点永久绑定，可被保存以便稍后主动发起事件。
pub trait Filter: AsAny + Send + Sync {
    /// 插入链路前调用；失败则插入被放弃。
    fn on_pre_add(&self, chain: &FilterChain, name: &str, next: &NextFilter) -> Result<(), CoreError> {
        let _ = (chain, name, next);
        Ok(())
    }

    /// 插入链路后调用；失败则节点被完整撤出。
    fn on_post_add(&self, chain: &FilterChain, name: &str, next: &NextFilter) -> Result<(), CoreError> {
        let _ = (chain, name, next);
        Ok(())
    }

    /// 移出链路前调用；失败不阻止移除。
    fn on_pre_remove(&self, chain: &FilterChain, name: &str, next: &NextFilter) -> Result<(), CoreError> {
        let _ = (chain, name, next);
        Ok(())
    }

    /// 移出链路后调用。
    fn on_post_remove(&self, chain: &FilterChain, name: &str, next: &NextFilter) -> Result<(), CoreError> {
        let _ = (chain, name, next);
        Ok(())
    }

    /// 会话已创建。
    fn session_created(&self, next: &NextFilter, session: &Arc<IoSession>) -> Result<(), CoreError> {
        next.session_created(session);
        Ok(())
    }

    /// 会话已打开。
    fn session_opened(&self, next: &NextFilter, session: &Arc<IoSession>) -> Result<(), CoreError> {
        next.session_opened(session);
        Ok(())
    }

    /// 会话已关闭。
    fn session_closed(&self, next: &NextFilter, session: &Arc<IoSession>) -> Result<(), CoreError> {
        next.session_closed(session);
        Ok(())
    }

    /// 会话空闲。
    fn session_idle(
        &self,
        next: &NextFilter,
        session: &Arc<IoSession>,
        status: IdleStatus,
    ) -> Result<(), CoreError> {
        next.session_idle(session, status);
        Ok(())
    }

    /// 捕获到异常。
    fn exception_caught(
        &self,
        next: &NextFilter,
        session: &Arc<IoSession>,
        cause: CoreError,
    ) -> Result<(), CoreError> {
        next.exception_caught(session, cause);
        Ok(())
    }

    /// 收到消息。
    fn message_received(
        &self,
        next: &NextFilter,
        session: &Arc<IoSession>,
        message: PipelineMessage,
    ) -> Result<(), CoreError> {
        next.message_received(session, message);
        Ok(())
    }

    /// 写请求已被传输层写出。
    fn message_sent(
        &self,
        next: &NextFilter,
        session: &Arc<IoSession>,
        request: WriteRequest,
    ) -> Result<(), CoreError> {
        next.message_sent(session, request);
        Ok(())
    }

    /// 出站写请求。
    fn filter_write(
        &self,
        next: &NextFilter,
        session: &Arc<IoSession>,
        request: WriteRequest,
    ) -> Result<(), CoreError> {
        next.filter_write(session, request);
        Ok(())
    }

    /// 出站关闭请求。
    fn filter_close(&self, next: &NextFilter, session: &Arc<IoSession>) -> Result<(), CoreError> {
        next.filter_close(session);
        Ok(())
    }
}

/// 绑定到链上某一位置的转发句柄。
///
/// # 教案式说明
/// - **意图（Why）**：过滤器只需要“把事件交给邻居”，而不应感知链的全局结构；
///   同时链在运行期可被增删，转发目标必须是调用时刻的邻居而非快照。
/// - **逻辑（How）**：句柄只记录节点标识；每次转发都到会话的链上实时解析后继（入站）
///   或前驱（出站），解析时短暂持有读锁，调用下一个过滤器时不持锁。
/// - **契约（What）**：句柄廉价可复制、可跨线程保存；节点被移除后，句柄仍按移除时的邻接关系
///   继续转发，保证在途事件不被破坏；节点槽位被回收之后，入站转发直达 Tail，出站转发直达 Head。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NextFilter {
    entry: EntryId,
}

impl NextFilter {
    pub(crate) fn new(entry: EntryId) -> Self {
        Self { entry }
    }

    /// 绑定的节点标识。
    pub fn entry(&self) -> EntryId {
        self.entry
    }

    /// 转发 `session_created`。
    pub fn session_created(&self, session: &Arc<IoSession>) {
        self.forward(session, ChainEvent::SessionCreated);
    }

    /// 转发 `session_opened`。
    pub fn session_opened(&self, session: &Arc<IoSession>) {
        self.forward(session, ChainEvent::SessionOpened);
    }

    /// 转发 `session_closed`。
    pub fn session_closed(&self, session: &Arc<IoSession>) {
        self.forward(session, ChainEvent::SessionClosed);
    }

    /// 转发 `session_idle`。
    pub fn session_idle(&self, session: &Arc<IoSession>, status: IdleStatus) {
        self.forward(session, ChainEvent::SessionIdle(status));
    }

    /// 转发 `exception_caught`。
    pub fn exception_caught(&self, session: &Arc<IoSession>, cause: CoreError) {
        self.forward(session, ChainEvent::ExceptionCaught(cause));
    }

    /// 转发 `message_received`。
    pub fn message_received(&self, session: &Arc<IoSession>, message: PipelineMessage) {
        self.forward(session, ChainEvent::MessageReceived(message));
    }

    /// 转发 `message_sent`。
    pub fn message_sent(&self, session: &Arc<IoSession>, request: WriteRequest) {
        self.forward(session, ChainEvent::MessageSent(request));
    }

    /// 向 Head 方向转发 `filter_write`。
    pub fn filter_write(&self, session: &Arc<IoSession>, request: WriteRequest) {
        self.forward(session, ChainEvent::FilterWrite(request));
    }

    /// 向 Head 方向转发 `filter_close`。
    pub fn filter_close(&self, session: &Arc<IoSession>) {
        self.forward(session, ChainEvent::FilterClose);
    }

    fn forward(&self, session: &Arc<IoSession>, event: ChainEvent) {
        session.filter_chain().forward(self.entry, session, event);
    }
}
