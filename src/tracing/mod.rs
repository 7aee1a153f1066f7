//! 日志初始化模块
//!
//! 宿主服务在启动时调用一次，之后数据访问层内部统一使用 `tracing` 宏输出结构化日志。

use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LoggingConfig;

/// 从配置初始化日志系统
///
/// 优先使用环境变量 `RUST_LOG`，否则使用配置中的日志级别；
/// 未提供配置时使用默认配置（info 级别）。
///
/// 重复初始化不会 panic，会返回错误信息。
///
/// # 示例
/// ```rust,ignore
/// use flare_logic_dao::config::LoggingConfig;
/// use flare_logic_dao::tracing::init_tracing_from_config;
///
/// init_tracing_from_config(None)?;
///
/// let config = LoggingConfig {
///     level: "debug".to_string(),
///     with_target: false,
///     with_thread_ids: true,
///     with_file: true,
///     with_line_number: true,
/// };
/// init_tracing_from_config(Some(&config))?;
/// ```
pub fn init_tracing_from_config(logging_config: Option<&LoggingConfig>) -> anyhow::Result<()> {
    let default_config = LoggingConfig::default();
    let config = logging_config.unwrap_or(&default_config);

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)?,
    };

    fmt::Subscriber::builder()
        .with_target(config.with_target)
        .with_thread_ids(config.with_thread_ids)
        .with_file(config.with_file)
        .with_line_number(config.with_line_number)
        .with_env_filter(env_filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialise tracing subscriber: {e}"))
}
