use bytes::Bytes;
use spark_session::{PipelineMessage, WriteRequest};

/// 加密后替换明文的写请求。
pub const ENCRYPTED_WRITE: &str = "spark.tls.encrypted";
/// 握手报文写请求。
pub const HANDSHAKE_WRITE: &str = "spark.tls.handshake";
/// `close_notify` 写请求。
pub const CLOSE_NOTIFY_WRITE: &str = "spark.tls.close_notify";

/// 以密文替换原始明文的写请求。
///
/// # 教案式说明
/// - **意图（Why）**：应用只持有自己提交的明文请求的完成句柄；加密后的请求必须把完成信号
///   委托回原始请求，且 `message_sent` 阶段要还原出原始请求，应用才永远看不到密文。
/// - **逻辑（How）**：基于 [`WriteRequest::wrap`]，共享父请求的 [`WriteFuture`](spark_session::WriteFuture)
///   并以 [`ENCRYPTED_WRITE`] 标记，`from_request` 依据标记识别。
/// - **契约（What）**：完成信号只落在原始请求上，且恰好一次。
#[derive(Clone, Debug)]
pub struct EncryptedWriteRequest {
    request: WriteRequest,
}

impl EncryptedWriteRequest {
    /// 以密文包装原始请求。
    pub fn new(parent: WriteRequest, ciphertext: Bytes) -> Self {
        Self {
            request: WriteRequest::wrap(parent, PipelineMessage::Buffer(ciphertext), ENCRYPTED_WRITE),
        }
    }

    /// 识别链上流回的加密请求；不是加密请求时原样返回。
    pub fn from_request(request: WriteRequest) -> Result<Self, WriteRequest> {
        if request.has_tag(ENCRYPTED_WRITE) && request.parent().is_some() {
            Ok(Self { request })
        } else {
            Err(request)
        }
    }

    /// 原始明文请求。
    pub fn parent(&self) -> Option<&WriteRequest> {
        self.request.parent()
    }

    /// 拆出原始明文请求。
    pub fn into_parent(self) -> WriteRequest {
        self.request.into_parent()
    }

    /// 作为普通写请求继续向 Head 传递。
    pub fn into_request(self) -> WriteRequest {
        self.request
    }
}

/// 请求是否为过滤器产生的 `close_notify`。
pub fn is_close_notify(request: &WriteRequest) -> bool {
    request.has_tag(CLOSE_NOTIFY_WRITE)
}

/// 请求是否为过滤器产生的控制写（握手报文或 `close_notify`）。
pub fn is_control_write(request: &WriteRequest) -> bool {
    request.has_tag(HANDSHAKE_WRITE) || is_close_notify(request)
}
