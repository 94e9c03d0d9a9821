use serde::Deserialize;

/// [`TlsFilter`](crate::TlsFilter) 选项。
///
/// 可从 TOML 片段反序列化，缺省字段取默认值：
///
/// ```toml
/// auto_start = true
/// client_mode = true
/// use_notification = false
/// server_name = "example.com"
/// ```
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TlsFilterOptions {
    /// 过滤器接入链路后立即开始握手。
    pub auto_start: bool,
    /// 以客户端模式握手。
    pub client_mode: bool,
    /// 为会话设置 `USE_NOTIFICATION`，安全状态变化以用户消息形式送达处理器。
    pub use_notification: bool,
    /// 客户端 SNI；缺省时引擎工厂可回退到对端地址。
    pub server_name: Option<String>,
}

impl Default for TlsFilterOptions {
    fn default() -> Self {
        Self {
            auto_start: true,
            client_mode: false,
            use_notification: false,
            server_name: None,
        }
    }
}

impl TlsFilterOptions {
    /// 服务端默认选项。
    pub fn server() -> Self {
        Self::default()
    }

    /// 客户端默认选项。
    pub fn client(server_name: impl Into<String>) -> Self {
        Self {
            client_mode: true,
            server_name: Some(server_name.into()),
            ..Self::default()
        }
    }

    /// 设置是否自动握手。
    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    /// 设置是否投递安全状态通知。
    pub fn with_notification(mut self, enabled: bool) -> Self {
        self.use_notification = enabled;
        self
    }
}
