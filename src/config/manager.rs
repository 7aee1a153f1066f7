//! 配置管理器 - 负责处理环境变量对配置文件的覆盖
//!
//! 支持的环境变量：
//! - FLARE_LOGIC_REDIS_ADDR：Redis 地址
//! - FLARE_LOGIC_REDIS_AUTH：Redis 密码
//! - FLARE_LOGIC_USE_NATS：是否使用 NATS（true/false/1/0）
//! - FLARE_LOGIC_KAFKA_BROKERS：Kafka 地址列表，逗号分隔
//! - FLARE_LOGIC_NATS_URL：NATS 地址

use std::env;

use tracing::{info, warn};

use super::DaoConfig;

pub const ENV_REDIS_ADDR: &str = "FLARE_LOGIC_REDIS_ADDR";
pub const ENV_REDIS_AUTH: &str = "FLARE_LOGIC_REDIS_AUTH";
pub const ENV_USE_NATS: &str = "FLARE_LOGIC_USE_NATS";
pub const ENV_KAFKA_BROKERS: &str = "FLARE_LOGIC_KAFKA_BROKERS";
pub const ENV_NATS_URL: &str = "FLARE_LOGIC_NATS_URL";

/// 配置管理器
pub struct ConfigManager;

impl ConfigManager {
    /// 使用进程环境变量覆盖配置
    pub fn apply_env_overrides(config: &mut DaoConfig) {
        Self::apply_overrides_with(config, |name| env::var(name).ok());
    }

    /// 使用给定的查找函数覆盖配置
    ///
    /// # 参数
    /// * `config` - 将被修改的配置
    /// * `lookup` - 变量名到取值的查找函数，返回 None 表示未设置
    pub fn apply_overrides_with<F>(config: &mut DaoConfig, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup(ENV_REDIS_ADDR).filter(|v| !v.is_empty()) {
            info!(addr = %addr, "redis address overridden by environment");
            config.redis.address = addr;
        }
        if let Some(auth) = lookup(ENV_REDIS_AUTH) {
            config.redis.auth = auth;
        }
        if let Some(raw) = lookup(ENV_USE_NATS) {
            match parse_bool(&raw) {
                Some(flag) => config.use_nats = flag,
                None => warn!(value = %raw, "ignoring invalid {ENV_USE_NATS}"),
            }
        }
        if let Some(brokers) = lookup(ENV_KAFKA_BROKERS) {
            let brokers: Vec<String> = brokers
                .split(',')
                .map(str::trim)
                .filter(|b| !b.is_empty())
                .map(str::to_string)
                .collect();
            if !brokers.is_empty() {
                config.kafka.brokers = brokers;
            }
        }
        if let Some(url) = lookup(ENV_NATS_URL).filter(|v| !v.is_empty()) {
            config.nats.url = url;
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
