//! 完成句柄：调用方观察异步操作结果的统一入口。
//!
//! # 设计背景（Why）
//! - 写入、关闭、连接与读取都在反应器线程上异步完成，调用方既可能注册回调，
//!   也可能在异步上下文中 `.await`；两种用法共享同一份单次赋值状态。
//! - 加密写请求需要把完成信号委托给原始请求，因此句柄必须可克隆且共享状态。
//!
//! # 契约（What）
//! - 结果只能被设置一次，[`CompletionHandle::complete`] 返回本次调用是否生效；
//! - 监听器恰好执行一次：注册时若已完成则立即执行，否则在完成时按注册顺序执行；
//! - 监听器在锁外执行，可在回调中安全地再次访问句柄。

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
};

use spin::Mutex;

use crate::{CoreError, PipelineMessage};

type Listener<T> = Box<dyn FnOnce(&T) + Send>;

struct Slot<T> {
    value: Option<T>,
    listeners: Vec<Listener<T>>,
    wakers: Vec<Waker>,
}

/// 单次赋值、可共享的完成句柄。
pub struct CompletionHandle<T> {
    inner: Arc<Mutex<Slot<T>>>,
}

impl<T> Clone for CompletionHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Default for CompletionHandle<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> CompletionHandle<T> {
    /// 创建尚未完成的句柄。
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Slot {
                value: None,
                listeners: Vec::new(),
                wakers: Vec::new(),
            })),
        }
    }

    /// 创建已完成的句柄。
    pub fn completed(value: T) -> Self {
        let handle = Self::new();
        handle.complete(value);
        handle
    }

    /// 设置结果；仅第一次调用生效。
    pub fn complete(&self, value: T) -> bool {
        let (listeners, wakers) = {
            let mut slot = self.inner.lock();
            if slot.value.is_some() {
                return false;
            }
            slot.value = Some(value.clone());
            (
                core::mem::take(&mut slot.listeners),
                core::mem::take(&mut slot.wakers),
            )
        };
        for listener in listeners {
            listener(&value);
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }

    /// 是否已完成。
    pub fn is_done(&self) -> bool {
        self.inner.lock().value.is_some()
    }

    /// 当前结果的副本。
    pub fn value(&self) -> Option<T> {
        self.inner.lock().value.clone()
    }

    /// 注册完成监听器。
    pub fn add_listener(&self, listener: impl FnOnce(&T) + Send + 'static) {
        let ready = {
            let mut slot = self.inner.lock();
            match &slot.value {
                Some(value) => Some(value.clone()),
                None => {
                    slot.listeners.push(Box::new(listener));
                    return;
                }
            }
        };
        if let Some(value) = ready {
            listener(&value);
        }
    }

    /// 两个句柄是否共享同一份状态。
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Clone + Send + 'static> Future for CompletionHandle<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut slot = self.inner.lock();
        match &slot.value {
            Some(value) => Poll::Ready(value.clone()),
            None => {
                if !slot.wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
                    slot.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for CompletionHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("value", &self.inner.lock().value)
            .finish()
    }
}

/// 写操作结果。
#[derive(Clone, Debug)]
pub enum WriteStatus {
    /// 已交给传输层写出。
    Written,
    /// 写入失败。
    Failed(CoreError),
}

/// 写完成句柄。
pub type WriteFuture = CompletionHandle<WriteStatus>;

impl CompletionHandle<WriteStatus> {
    /// 标记写入成功。
    pub fn set_written(&self) -> bool {
        self.complete(WriteStatus::Written)
    }

    /// 标记写入失败。
    pub fn set_failed(&self, error: CoreError) -> bool {
        self.complete(WriteStatus::Failed(error))
    }

    /// 是否已成功写出。
    pub fn is_written(&self) -> bool {
        matches!(self.value(), Some(WriteStatus::Written))
    }

    /// 失败原因。
    pub fn failure(&self) -> Option<CoreError> {
        match self.value() {
            Some(WriteStatus::Failed(error)) => Some(error),
            _ => None,
        }
    }
}

/// 关闭完成句柄。
pub type CloseFuture = CompletionHandle<()>;

/// 连接结果。
#[derive(Clone, Debug)]
pub enum ConnectStatus {
    /// 会话已创建。
    Connected,
    /// 建立过程中失败。
    Failed(CoreError),
}

/// 连接完成句柄。
pub type ConnectFuture = CompletionHandle<ConnectStatus>;

/// 读操作结果。
#[derive(Clone, Debug)]
pub enum ReadOutcome {
    /// 收到一条消息。
    Message(PipelineMessage),
    /// 会话已关闭。
    Closed,
    /// 会话异常。
    Failed(CoreError),
}

/// 读完成句柄。
pub type ReadFuture = CompletionHandle<ReadOutcome>;
