use std::{collections::VecDeque, fmt, sync::Arc};

use parking_lot::Mutex;
use spark_session::{IoSession, NextFilter, PipelineMessage, WriteRequest};

/// 延迟到锁外派发的事件。
pub enum DeferredEvent {
    /// 向 Head 方向转发写请求。
    FilterWrite(NextFilter, WriteRequest),
    /// 向 Tail 方向转发入站消息。
    MessageReceived(NextFilter, PipelineMessage),
}

impl DeferredEvent {
    /// 把事件交给绑定的邻居。
    pub fn deliver(self, session: &Arc<IoSession>) {
        match self {
            DeferredEvent::FilterWrite(next, request) => next.filter_write(session, request),
            DeferredEvent::MessageReceived(next, message) => next.message_received(session, message),
        }
    }

    /// 写请求事件携带的请求。
    pub fn into_write_request(self) -> Option<WriteRequest> {
        match self {
            DeferredEvent::FilterWrite(_, request) => Some(request),
            DeferredEvent::MessageReceived(..) => None,
        }
    }
}

impl fmt::Debug for DeferredEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeferredEvent::FilterWrite(_, request) => f.debug_tuple("FilterWrite").field(request).finish(),
            DeferredEvent::MessageReceived(_, message) => {
                f.debug_tuple("MessageReceived").field(message).finish()
            }
        }
    }
}

/// 有序的延迟事件队列。
///
/// # 教案式说明
/// - **意图（Why）**：会话处理器在持锁期间产生的事件（密文写出、解密后的明文、安全通知）
///   不能在锁内交给链上其它过滤器，否则这些过滤器同步回调进处理器时会自锁；
///   事件先按产生顺序入队，释放锁之后再统一派发。
/// - **契约（What）**：先进先出；队列自身的锁只在入队与出队的瞬间持有，派发时不持锁。
#[derive(Default)]
pub struct EventQueue {
    events: Mutex<VecDeque<DeferredEvent>>,
}

impl EventQueue {
    /// 创建空队列。
    pub fn new() -> Self {
        Self::default()
    }

    /// 入队。
    pub fn push(&self, event: DeferredEvent) {
        self.events.lock().push_back(event);
    }

    /// 出队。
    pub fn poll(&self) -> Option<DeferredEvent> {
        self.events.lock().pop_front()
    }

    /// 取出全部事件。
    pub fn drain(&self) -> Vec<DeferredEvent> {
        self.events.lock().drain(..).collect()
    }

    /// 待派发事件数。
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// 是否为空。
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventQueue").field("len", &self.len()).finish()
    }
}
