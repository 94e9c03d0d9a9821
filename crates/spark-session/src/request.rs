use std::{fmt, net::SocketAddr};

use crate::{
    CoreError, PipelineMessage,
    error::codes,
    future::WriteFuture,
};

/// 写请求：一条待写出的消息与调用方观察的完成句柄。
///
/// # 教案式说明
/// - **意图（Why）**：写路径上的过滤器可能改写消息（编码、加密），但调用方只关心
///   自己提交的那一次写入是否完成；因此改写后的请求必须把完成信号委托给原始请求。
/// - **逻辑（How）**：[`WriteRequest::wrap`] 生成包装请求，复用父请求的 [`WriteFuture`]，
///   并持有父请求本身，供 `messageSent` 阶段还原；`tag` 用于标记过滤器内部生成的控制写
///   （如握手报文），这类写入不应向上层暴露 `messageSent`。
/// - **契约（What）**：包装请求的 `future()` 与父请求共享同一状态，完成信号只会落在原始请求上一次。
#[derive(Clone)]
pub struct WriteRequest {
    message: PipelineMessage,
    future: WriteFuture,
    destination: Option<SocketAddr>,
    parent: Option<Box<WriteRequest>>,
    tag: Option<&'static str>,
}

impl WriteRequest {
    /// 以新的完成句柄构造请求。
    pub fn new(message: PipelineMessage) -> Self {
        Self::with_future(message, WriteFuture::new())
    }

    /// 以指定完成句柄构造请求。
    pub fn with_future(message: PipelineMessage, future: WriteFuture) -> Self {
        Self {
            message,
            future,
            destination: None,
            parent: None,
            tag: None,
        }
    }

    /// 由过滤器内部生成、带控制标签的请求。
    pub fn tagged(message: PipelineMessage, tag: &'static str) -> Self {
        Self {
            tag: Some(tag),
            ..Self::new(message)
        }
    }

    /// 以替换后的消息包装父请求，完成句柄委托给父请求。
    pub fn wrap(parent: WriteRequest, message: PipelineMessage, tag: &'static str) -> Self {
        Self {
            message,
            future: parent.future.clone(),
            destination: parent.destination,
            tag: Some(tag),
            parent: Some(Box::new(parent)),
        }
    }

    /// 指定目标地址（无连接传输使用）。
    pub fn with_destination(mut self, destination: SocketAddr) -> Self {
        self.destination = Some(destination);
        self
    }

    /// 当前承载的消息。
    pub fn message(&self) -> &PipelineMessage {
        &self.message
    }

    /// 取出消息。
    pub fn into_message(self) -> PipelineMessage {
        self.message
    }

    /// 完成句柄。
    pub fn future(&self) -> &WriteFuture {
        &self.future
    }

    /// 目标地址。
    pub fn destination(&self) -> Option<SocketAddr> {
        self.destination
    }

    /// 控制标签。
    pub fn tag(&self) -> Option<&'static str> {
        self.tag
    }

    /// 是否带有指定标签。
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tag == Some(tag)
    }

    /// 被包装的父请求。
    pub fn parent(&self) -> Option<&WriteRequest> {
        self.parent.as_deref()
    }

    /// 拆出父请求；非包装请求返回自身。
    pub fn into_parent(self) -> WriteRequest {
        match self.parent {
            Some(parent) => *parent,
            None => self,
        }
    }

    /// 逐层回溯到最初提交的请求。
    pub fn original(&self) -> &WriteRequest {
        let mut current = self;
        while let Some(parent) = current.parent.as_deref() {
            current = parent;
        }
        current
    }
}

impl fmt::Debug for WriteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteRequest")
            .field("message", &self.message)
            .field("tag", &self.tag)
            .field("wrapped", &self.parent.is_some())
            .finish()
    }
}

/// 向已关闭会话写入时的失败明细。
///
/// 作为 `spark.session.write_to_closed` 错误的根因，携带这一批次全部失败的请求，
/// 过滤器可据此剔除自己生成的控制写后再决定是否继续上报。
#[derive(Clone, Debug)]
pub struct WriteToClosedSessionError {
    requests: Vec<WriteRequest>,
}

impl WriteToClosedSessionError {
    /// 以失败请求批次构造。
    pub fn new(requests: Vec<WriteRequest>) -> Self {
        Self { requests }
    }

    /// 失败的请求。
    pub fn requests(&self) -> &[WriteRequest] {
        &self.requests
    }

    /// 包装为核心错误。
    pub fn into_core_error(self) -> CoreError {
        let message = format!("{} write request(s) to a closed session", self.requests.len());
        CoreError::new(codes::SESSION_WRITE_TO_CLOSED, message).with_cause(self)
    }
}

impl fmt::Display for WriteToClosedSessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} write request(s) failed: session closed", self.requests.len())
    }
}

impl std::error::Error for WriteToClosedSessionError {}
