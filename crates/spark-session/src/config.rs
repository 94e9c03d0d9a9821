use serde::Deserialize;

/// 会话配置。
///
/// # 教案式说明
/// - **意图（Why）**：会话层只直接消费 `use_read_operation`；其余字段是交给传输协作者的
///   建议值，集中在一处便于从同一份 TOML 配置中加载。
/// - **契约（What）**：缺省字段取 [`SessionConfig::default`]；时间单位为毫秒，`0` 表示禁用。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// 是否启用 `IoSession::read()` 拉取式读取。
    pub use_read_operation: bool,
    /// 单次读取的缓冲区大小建议值。
    pub read_buffer_size: usize,
    /// 写超时。
    pub write_timeout_ms: u64,
    /// 读写空闲判定时间。
    pub idle_time_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            use_read_operation: false,
            read_buffer_size: 2048,
            write_timeout_ms: 60_000,
            idle_time_ms: 0,
        }
    }
}

impl SessionConfig {
    /// 启用读操作。
    pub fn with_read_operation(mut self, enabled: bool) -> Self {
        self.use_read_operation = enabled;
        self
    }
}
