//! TLS 会话层错误域。
//!
//! # 设计背景（Why）
//! - 调用方需要区分“从未建立安全会话”（握手失败）与“安全会话建立后出错”，前者通常意味着
//!   证书或协议配置问题，后者多为链路或对端故障；
//! - 引擎错误按故障性质分类（完整性、认证、资源、瞬时），运维可据此决定告警或重试，
//!   而不必解析底层库的错误细节。
//!
//! # 契约（What）
//! - [`TlsError`] 转换为 `CoreError` 时携带 [`codes`] 中的稳定错误码；
//! - [`TlsError::into_handshake`] 幂等：已是握手错误时不再重复包装。

use std::{borrow::Cow, fmt, io};

use rustls::{AlertDescription, Error as RustlsError};
use spark_session::CoreError;
use thiserror::Error;

/// TLS 会话层稳定错误码。
pub mod codes {
    /// 握手完成前发生的任何加密失败。
    pub const HANDSHAKE_FAILED: &str = "spark.tls.handshake_failed";
    /// 同一条链上出现第二个 TLS 过滤器。
    pub const SINGLE_INSTANCE_VIOLATION: &str = "spark.tls.single_instance_violation";
    /// 握手完成后的引擎失败。
    pub const ENGINE_FAILED: &str = "spark.tls.engine_failed";
    /// 状态机处于不允许该操作的状态。
    pub const ILLEGAL_STATE: &str = "spark.tls.illegal_state";
    /// 会话已经关闭了 TLS 出站方向。
    pub const ALREADY_SHUTDOWN: &str = "spark.tls.already_shutdown";
    /// 会话上没有安装 TLS 过滤器。
    pub const NOT_INSTALLED: &str = "spark.tls.not_installed";
}

/// 引擎故障分类。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TlsFailureClass {
    /// 报文被篡改、格式非法或对端违反协议。
    Integrity,
    /// 证书缺失、无效或不受信任。
    Authentication,
    /// 对端拒绝访问。
    Authorization,
    /// 本地资源不足（随机数、时钟、缓冲区）。
    Resource,
    /// 瞬时故障，重建连接后可能恢复。
    Transient,
}

impl fmt::Display for TlsFailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TlsFailureClass::Integrity => "integrity",
            TlsFailureClass::Authentication => "authentication",
            TlsFailureClass::Authorization => "authorization",
            TlsFailureClass::Resource => "resource",
            TlsFailureClass::Transient => "transient",
        };
        f.write_str(label)
    }
}

/// 引擎报告的失败。
#[derive(Clone, Debug, Error)]
#[error("{class} failure: {message}")]
pub struct TlsEngineError {
    class: TlsFailureClass,
    message: Cow<'static, str>,
}

impl TlsEngineError {
    /// 构造引擎错误。
    pub fn new(class: TlsFailureClass, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    /// 故障分类。
    pub fn class(&self) -> TlsFailureClass {
        self.class
    }

    /// 描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 由 rustls 错误推导分类。
    pub fn from_rustls(error: &RustlsError) -> Self {
        Self::new(classify_rustls(error), error.to_string())
    }

    /// 由 I/O 错误推导分类；若内部嵌套 rustls 错误则按后者分类。
    pub fn from_io(error: &io::Error) -> Self {
        if let Some(source) = error.get_ref()
            && let Some(rustls_error) = source.downcast_ref::<RustlsError>()
        {
            return Self::from_rustls(rustls_error);
        }
        let class = match error.kind() {
            io::ErrorKind::OutOfMemory | io::ErrorKind::WriteZero => TlsFailureClass::Resource,
            io::ErrorKind::InvalidData => TlsFailureClass::Integrity,
            _ => TlsFailureClass::Transient,
        };
        Self::new(class, error.to_string())
    }
}

/// TLS 会话层错误。
#[derive(Clone, Debug, Error)]
pub enum TlsError {
    /// 握手完成前的失败。
    #[error("tls handshake failed: {0}")]
    Handshake(#[source] Box<TlsError>),

    /// 链上已存在 TLS 过滤器。
    #[error("only one tls filter is permitted in a chain")]
    SingleInstanceViolation,

    /// 引擎失败。
    #[error(transparent)]
    Engine(#[from] TlsEngineError),

    /// 状态机不允许该操作。
    #[error("illegal tls state: {0}")]
    IllegalState(&'static str),

    /// TLS 出站方向已关闭。
    #[error("tls session is shut down already")]
    AlreadyShutdown,

    /// 会话未安装 TLS 过滤器。
    #[error("tls filter is not installed on the session")]
    NotInstalled,
}

impl TlsError {
    /// 对应的稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            TlsError::Handshake(_) => codes::HANDSHAKE_FAILED,
            TlsError::SingleInstanceViolation => codes::SINGLE_INSTANCE_VIOLATION,
            TlsError::Engine(_) => codes::ENGINE_FAILED,
            TlsError::IllegalState(_) => codes::ILLEGAL_STATE,
            TlsError::AlreadyShutdown => codes::ALREADY_SHUTDOWN,
            TlsError::NotInstalled => codes::NOT_INSTALLED,
        }
    }

    /// 重新归类为握手失败。
    pub fn into_handshake(self) -> Self {
        match self {
            handshake @ TlsError::Handshake(_) => handshake,
            other => TlsError::Handshake(Box::new(other)),
        }
    }

    /// 是否为握手失败。
    pub fn is_handshake(&self) -> bool {
        matches!(self, TlsError::Handshake(_))
    }

    /// 若底层为引擎错误，返回其分类。
    pub fn failure_class(&self) -> Option<TlsFailureClass> {
        match self {
            TlsError::Engine(engine) => Some(engine.class()),
            TlsError::Handshake(inner) => inner.failure_class(),
            _ => None,
        }
    }
}

impl From<TlsError> for CoreError {
    fn from(error: TlsError) -> Self {
        CoreError::new(error.code(), error.to_string()).with_cause(error)
    }
}

fn classify_rustls(error: &RustlsError) -> TlsFailureClass {
    use RustlsError::*;
    match error {
        InappropriateMessage { .. }
        | InappropriateHandshakeMessage { .. }
        | InvalidEncryptedClientHello(_)
        | InvalidMessage(_)
        | PeerMisbehaved(_)
        | DecryptError
        | EncryptError
        | PeerSentOversizedRecord => TlsFailureClass::Integrity,
        NoCertificatesPresented
        | InvalidCertificate(_)
        | InvalidCertRevocationList(_)
        | UnsupportedNameType => TlsFailureClass::Authentication,
        FailedToGetCurrentTime
        | FailedToGetRandomBytes
        | BadMaxFragmentSize
        | InconsistentKeys(_) => TlsFailureClass::Resource,
        AlertReceived(alert) => classify_alert(alert),
        NoApplicationProtocol => TlsFailureClass::Integrity,
        _ => TlsFailureClass::Transient,
    }
}

fn classify_alert(alert: &AlertDescription) -> TlsFailureClass {
    use AlertDescription::*;
    match alert {
        BadCertificate
        | UnsupportedCertificate
        | CertificateRevoked
        | CertificateExpired
        | CertificateUnknown
        | UnknownCA
        | NoCertificate
        | CertificateUnobtainable
        | CertificateRequired => TlsFailureClass::Authentication,
        AccessDenied => TlsFailureClass::Authorization,
        CloseNotify | UserCanceled | NoRenegotiation => TlsFailureClass::Transient,
        DecompressionFailure => TlsFailureClass::Resource,
        DecodeError
        | DecryptError
        | DecryptionFailed
        | HandshakeFailure
        | IllegalParameter
        | RecordOverflow
        | BadRecordMac
        | UnexpectedMessage
        | InsufficientSecurity
        | InternalError
        | ProtocolVersion => TlsFailureClass::Integrity,
        _ => TlsFailureClass::Transient,
    }
}
