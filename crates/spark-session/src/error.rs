//! 会话层错误域。
//!
//! # 设计背景（Why）
//! - 过滤器链上存在两类错误：装配期（`add/remove/replace`）的配置错误必须同步返回给调用方；
//!   运行期（事件处理）错误则经由 `exceptionCaught` 事件流转，绝不回抛给反应器。
//! - 运行期错误需要同时交付给写完成句柄与 `exceptionCaught` 管道，因此 [`CoreError`] 必须廉价可克隆。
//!
//! # 契约（What）
//! - [`CoreError`]：稳定错误码 + 可读消息 + 可选共享根因；
//! - [`ChainError`]：链路装配错误，`thiserror` 派生，可无损转换为 [`CoreError`]；
//! - [`codes`]：本 crate 使用的全部稳定错误码。

use std::{borrow::Cow, error::Error, fmt, sync::Arc};

use thiserror::Error;

/// 会话层稳定错误码。
///
/// 命名遵循 `<域>.<语义>`，上层可据此做告警聚合或自动化处置。
pub mod codes {
    /// 过滤器名称在链内重复。
    pub const CHAIN_DUPLICATE_NAME: &str = "spark.chain.duplicate_name";
    /// 目标过滤器不存在。
    pub const CHAIN_FILTER_NOT_FOUND: &str = "spark.chain.filter_not_found";
    /// 生命周期钩子（pre/post add/remove）失败。
    pub const CHAIN_LIFECYCLE: &str = "spark.chain.lifecycle_failed";
    /// `clear()` 期间累计的多个错误。
    pub const CHAIN_CLEAR: &str = "spark.chain.clear_failed";
    /// 向已关闭（或正在关闭）的会话写入。
    pub const SESSION_WRITE_TO_CLOSED: &str = "spark.session.write_to_closed";
    /// 会话未启用读操作却调用了 `read()`。
    pub const SESSION_READ_DISABLED: &str = "spark.session.read_disabled";
    /// 终端处理器回调失败。
    pub const HANDLER_FAILED: &str = "spark.session.handler_failed";
}

/// `CoreError` 是会话层跨过滤器传播的统一错误形态。
///
/// # 教案式说明
/// - **意图（Why）**：过滤器之间只通过错误码与消息交流语义，避免依赖彼此的具体错误类型；
///   根因以 `Arc` 共享，使同一故障可以同时写入 `WriteFuture` 与 `exceptionCaught`。
/// - **逻辑（How）**：Builder 风格地附加根因；`source()` 暴露根因链路。
/// - **契约（What）**：`code` 必须是 [`codes`] 中或遵循同一约定的 `'static` 字符串；
///   克隆只增加引用计数，不复制根因。
#[derive(Clone)]
pub struct CoreError {
    code: &'static str,
    message: Cow<'static, str>,
    cause: Option<Arc<dyn Error + Send + Sync + 'static>>,
}

impl CoreError {
    /// 构造核心错误。
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    /// 附带底层原因并返回新的核心错误。
    pub fn with_cause(mut self, cause: impl Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 人类可读描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 底层原因。
    pub fn cause(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// 将根因按具体类型取出，供过滤器识别特定故障（例如批量写失败）。
    pub fn cause_as<T: Error + 'static>(&self) -> Option<&T> {
        self.cause().and_then(|cause| cause.downcast_ref::<T>())
    }

    /// 判断错误码是否匹配。
    pub fn is(&self, code: &str) -> bool {
        self.code == code
    }
}

impl fmt::Debug for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreError")
            .field("code", &self.code)
            .field("message", &self.message)
            .field("cause", &self.cause.as_ref().map(|cause| cause.to_string()))
            .finish()
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl Error for CoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn Error + 'static))
    }
}

/// 生命周期钩子所处阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecyclePhase {
    /// `on_pre_add`
    PreAdd,
    /// `on_post_add`
    PostAdd,
    /// `on_pre_remove`
    PreRemove,
    /// `on_post_remove`
    PostRemove,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LifecyclePhase::PreAdd => "on_pre_add",
            LifecyclePhase::PostAdd => "on_post_add",
            LifecyclePhase::PreRemove => "on_pre_remove",
            LifecyclePhase::PostRemove => "on_post_remove",
        };
        f.write_str(label)
    }
}

/// 过滤器链装配错误。
///
/// # 教案式说明
/// - **意图（Why）**：装配错误属于编程错误，必须同步、精确地反馈给调用方，从不被吞掉。
/// - **契约（What）**：
///   - `DuplicateName`：链上已存在同名过滤器，链保持不变；
///   - `FilterNotFound`：目标（或锚点）过滤器不存在；
///   - `Lifecycle`：钩子失败；新增期失败会完整回滚，移除期失败不阻止移除；
///   - `Aggregate`：`clear()` 收集到的全部失败，剩余移除不会因单个失败而中止。
#[derive(Debug, Error)]
pub enum ChainError {
    /// 名称重复。
    #[error("filter name `{name}` already exists in the chain")]
    DuplicateName { name: String },

    /// 过滤器不存在。
    #[error("filter `{target}` not found in the chain")]
    FilterNotFound { target: String },

    /// 生命周期钩子失败。
    #[error("{phase}() failed for filter `{name}`: {source}")]
    Lifecycle {
        phase: LifecyclePhase,
        name: String,
        #[source]
        source: CoreError,
    },

    /// 多个失败的聚合。
    #[error("{} lifecycle failure(s) while clearing the chain", .0.len())]
    Aggregate(Vec<ChainError>),
}

impl ChainError {
    pub(crate) fn not_found(target: impl Into<String>) -> Self {
        ChainError::FilterNotFound {
            target: target.into(),
        }
    }

    /// 若为生命周期错误，返回钩子抛出的原始错误。
    pub fn lifecycle_source(&self) -> Option<&CoreError> {
        match self {
            ChainError::Lifecycle { source, .. } => Some(source),
            _ => None,
        }
    }

    /// 对应的稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            ChainError::DuplicateName { .. } => codes::CHAIN_DUPLICATE_NAME,
            ChainError::FilterNotFound { .. } => codes::CHAIN_FILTER_NOT_FOUND,
            ChainError::Lifecycle { .. } => codes::CHAIN_LIFECYCLE,
            ChainError::Aggregate(_) => codes::CHAIN_CLEAR,
        }
    }
}

impl From<ChainError> for CoreError {
    fn from(error: ChainError) -> Self {
        CoreError::new(error.code(), error.to_string()).with_cause(error)
    }
}
