use std::{any::Any, fmt, sync::Arc};

use bytes::Bytes;

/// 沿过滤器链流动的不透明消息。
///
/// # 教案式说明
/// - **意图（Why）**：传输层与编解码层交换字节缓冲，而业务层与协议层（例如 TLS 的安全通知）
///   交换任意用户对象；两者都需要在同一条链上流动。
/// - **逻辑（How）**：`Buffer` 使用 [`Bytes`] 承载零拷贝字节；`User` 使用 `Arc<dyn Any>` 承载
///   任意对象，使消息整体可以廉价克隆（读操作需要同时交付给处理器与读句柄）。
/// - **契约（What）**：消息按值在链上移动；克隆只增加引用计数。
#[derive(Clone)]
pub enum PipelineMessage {
    /// 字节缓冲。
    Buffer(Bytes),
    /// 用户对象。
    User(Arc<dyn Any + Send + Sync>),
}

impl PipelineMessage {
    /// 由字节构造消息。
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        PipelineMessage::Buffer(bytes.into())
    }

    /// 由任意用户对象构造消息。
    pub fn from_user<T: Any + Send + Sync>(value: T) -> Self {
        PipelineMessage::User(Arc::new(value))
    }

    /// 若为字节缓冲则返回其引用。
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            PipelineMessage::Buffer(bytes) => Some(bytes),
            PipelineMessage::User(_) => None,
        }
    }

    /// 取出字节缓冲；非缓冲消息原样返回。
    pub fn into_bytes(self) -> Result<Bytes, Self> {
        match self {
            PipelineMessage::Buffer(bytes) => Ok(bytes),
            other => Err(other),
        }
    }

    /// 以具体类型借用用户对象。
    pub fn downcast_user<T: Any>(&self) -> Option<&T> {
        match self {
            PipelineMessage::User(value) => value.downcast_ref::<T>(),
            PipelineMessage::Buffer(_) => None,
        }
    }

    /// 字节缓冲的可读长度；用户对象视为 0。
    pub fn readable_bytes(&self) -> usize {
        match self {
            PipelineMessage::Buffer(bytes) => bytes.len(),
            PipelineMessage::User(_) => 0,
        }
    }
}

impl fmt::Debug for PipelineMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineMessage::Buffer(bytes) => f.debug_tuple("Buffer").field(&bytes.len()).finish(),
            PipelineMessage::User(_) => f.write_str("User(..)"),
        }
    }
}

impl From<Bytes> for PipelineMessage {
    fn from(bytes: Bytes) -> Self {
        PipelineMessage::Buffer(bytes)
    }
}

impl From<Vec<u8>> for PipelineMessage {
    fn from(bytes: Vec<u8>) -> Self {
        PipelineMessage::Buffer(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for PipelineMessage {
    fn from(bytes: &'static [u8]) -> Self {
        PipelineMessage::Buffer(Bytes::from_static(bytes))
    }
}
