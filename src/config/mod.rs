//! Flare Logic DAO 配置模块
//!
//! 该模块提供数据访问层的配置定义与加载：
//! - 配置文件（单文件或目录）加载和解析
//! - 环境变量覆盖
//! - Redis 连接池、Kafka、NATS 配置定义
//! - 启动期配置校验

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use toml::{Table, Value};
use tracing::warn;

use crate::error::{DaoError, DaoResult};

mod manager;
pub use manager::ConfigManager;

/// 日志配置
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别（RUST_LOG 优先）
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub with_target: bool,
    #[serde(default)]
    pub with_thread_ids: bool,
    #[serde(default)]
    pub with_file: bool,
    #[serde(default)]
    pub with_line_number: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            with_target: true,
            with_thread_ids: false,
            with_file: false,
            with_line_number: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Redis 连接池配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// 网络类型：tcp 或 unix
    pub network: String,
    /// 地址（host:port 或 unix socket 路径）
    pub address: String,
    /// 认证密码（为空表示不认证）
    pub auth: String,
    /// 数据库编号
    pub db: i64,
    /// 拨号超时（毫秒）
    pub dial_timeout_ms: u64,
    /// 读超时（毫秒）
    pub read_timeout_ms: u64,
    /// 写超时（毫秒）
    pub write_timeout_ms: u64,
    /// 最大空闲连接数
    pub max_idle: usize,
    /// 最大活跃连接数（空闲 + 借出）
    pub max_active: usize,
    /// 空闲连接回收时间（毫秒，0 表示不回收）
    pub idle_timeout_ms: u64,
    /// 默认过期时间（秒）
    pub expire_seconds: u64,
    /// 等待可用连接的最长时间（毫秒），未设置时一直阻塞
    pub wait_timeout_ms: Option<u64>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            network: "tcp".to_string(),
            address: "127.0.0.1:6379".to_string(),
            auth: String::new(),
            db: 0,
            dial_timeout_ms: 1_000,
            read_timeout_ms: 1_000,
            write_timeout_ms: 1_000,
            max_idle: 10,
            max_active: 64,
            idle_timeout_ms: 10_000,
            expire_seconds: 1_800,
            wait_timeout_ms: None,
        }
    }
}

impl RedisConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// 空闲回收时间，0 表示不回收
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_ms.map(Duration::from_millis)
    }

    pub fn expire(&self) -> Duration {
        Duration::from_secs(self.expire_seconds)
    }
}

/// Kafka 生产者配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    /// Kafka 服务器地址列表
    pub brokers: Vec<String>,
    /// 推送主题
    pub topic: String,
    /// 客户端标识
    pub client_id: Option<String>,
    /// 投递超时（毫秒）
    pub timeout_ms: u64,
    /// 是否开启幂等生产
    pub enable_idempotence: bool,
    /// 压缩算法
    pub compression_type: String,
    /// 其他 librdkafka 选项
    pub options: HashMap<String, String>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["127.0.0.1:9092".to_string()],
            topic: "goim-push-topic".to_string(),
            client_id: None,
            timeout_ms: 5_000,
            enable_idempotence: true,
            compression_type: "snappy".to_string(),
            options: HashMap::new(),
        }
    }
}

impl KafkaConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// NATS 配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    /// 服务器地址，多个地址用逗号分隔
    pub url: String,
    /// 推送主题
    pub topic: String,
    /// ACK 回复主题
    pub ack_inbox: String,
    /// 客户端名称
    pub client_name: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    /// 连接超时（毫秒）
    pub connect_timeout_ms: u64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            topic: "goim-push-topic".to_string(),
            ack_inbox: String::new(),
            client_name: None,
            user: None,
            password: None,
            token: None,
            connect_timeout_ms: 2_000,
        }
    }
}

impl NatsConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// 消息中间件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    Kafka,
    Nats,
}

impl std::fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerKind::Kafka => write!(f, "kafka"),
            BrokerKind::Nats => write!(f, "nats"),
        }
    }
}

/// 数据访问层配置主结构体
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DaoConfig {
    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Redis 配置
    #[serde(default)]
    pub redis: RedisConfig,
    /// 是否使用 NATS 替代 Kafka（进程生命周期内不可变）
    #[serde(default, alias = "use_alt_backend")]
    pub use_nats: bool,
    /// Kafka 配置
    #[serde(default)]
    pub kafka: KafkaConfig,
    /// NATS 配置
    #[serde(default)]
    pub nats: NatsConfig,
}

impl DaoConfig {
    /// 当前选中的消息中间件
    pub fn broker(&self) -> BrokerKind {
        if self.use_nats {
            BrokerKind::Nats
        } else {
            BrokerKind::Kafka
        }
    }

    /// 当前中间件的推送主题
    pub fn push_topic(&self) -> &str {
        match self.broker() {
            BrokerKind::Kafka => &self.kafka.topic,
            BrokerKind::Nats => &self.nats.topic,
        }
    }

    /// 当前中间件的 ACK 回复主题，Kafka 不支持回复地址
    pub fn ack_inbox(&self) -> &str {
        match self.broker() {
            BrokerKind::Kafka => "",
            BrokerKind::Nats => &self.nats.ack_inbox,
        }
    }

    /// 从文件或目录加载配置，并应用环境变量覆盖
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut cfg = load_config_from_source(path.as_ref())?;
        ConfigManager::apply_env_overrides(&mut cfg);
        Ok(cfg)
    }

    /// 校验配置，矛盾或不支持的设置返回 `DaoError::Config`
    pub fn validate(&self) -> DaoResult<()> {
        let redis = &self.redis;
        match redis.network.as_str() {
            "tcp" | "unix" => {}
            other => {
                return Err(DaoError::Config(format!(
                    "unsupported redis network: {other}"
                )));
            }
        }
        if redis.address.trim().is_empty() {
            return Err(DaoError::Config("redis address is empty".to_string()));
        }
        if redis.max_active == 0 {
            return Err(DaoError::Config(
                "redis max_active must be greater than zero".to_string(),
            ));
        }
        if redis.max_idle > redis.max_active {
            return Err(DaoError::Config(format!(
                "redis max_idle ({}) exceeds max_active ({})",
                redis.max_idle, redis.max_active
            )));
        }
        if redis.expire_seconds == 0 {
            return Err(DaoError::Config(
                "redis expire_seconds must be greater than zero".to_string(),
            ));
        }
        if i64::try_from(redis.expire_seconds).is_err() {
            return Err(DaoError::Config(
                "redis expire_seconds is out of range".to_string(),
            ));
        }

        match self.broker() {
            BrokerKind::Kafka => {
                if self.kafka.brokers.iter().all(|b| b.trim().is_empty()) {
                    return Err(DaoError::Config("kafka brokers are empty".to_string()));
                }
                if self.kafka.topic.is_empty() {
                    return Err(DaoError::Config("kafka topic is empty".to_string()));
                }
            }
            BrokerKind::Nats => {
                if self.nats.url.trim().is_empty() {
                    return Err(DaoError::Config("nats url is empty".to_string()));
                }
                if self.nats.topic.is_empty() {
                    return Err(DaoError::Config("nats topic is empty".to_string()));
                }
            }
        }
        Ok(())
    }
}

/// 按候选路径加载配置，全部失败时回退到默认配置
pub fn load_config(path: Option<&str>) -> DaoConfig {
    let candidates: Vec<PathBuf> = match path {
        Some(p) => vec![PathBuf::from(p)],
        None => vec![PathBuf::from("config"), PathBuf::from("logic.toml")],
    };

    for path in &candidates {
        match DaoConfig::load(path) {
            Ok(cfg) => return cfg,
            Err(err) => {
                warn!("failed to load config from {}: {err:#}", path.display());
            }
        }
    }

    warn!("no configuration source succeeded, falling back to defaults");
    let mut cfg = DaoConfig::default();
    ConfigManager::apply_env_overrides(&mut cfg);
    cfg
}

/// 读取配置源：文件直接解析，目录按分层规则合并
fn load_config_from_source(path: &Path) -> Result<DaoConfig> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("configuration path {} is not accessible", path.display()))?;

    let table = if metadata.is_dir() {
        read_layered(path)?
    } else {
        read_table(path)?
    };

    Value::Table(table)
        .try_into()
        .with_context(|| format!("invalid configuration in {}", path.display()))
}

/// 分层目录：`base.toml` 打底，`overrides/*.toml` 按文件名顺序逐层覆盖
fn read_layered(dir: &Path) -> Result<Table> {
    let base = dir.join("base.toml");
    let mut merged = read_table(&base)
        .with_context(|| format!("missing base configuration in {}", dir.display()))?;

    for fragment in override_fragments(&dir.join("overrides"))? {
        let patch = read_table(&fragment)?;
        overlay(&mut merged, patch);
    }
    Ok(merged)
}

fn override_fragments(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut fragments = Vec::new();
    for entry in fs::read_dir(dir)
        .with_context(|| format!("unable to list overrides in {}", dir.display()))?
    {
        let path = entry?.path();
        if path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(OsStr::new("toml")))
        {
            fragments.push(path);
        }
    }
    fragments.sort();
    Ok(fragments)
}

fn read_table(path: &Path) -> Result<Table> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("unable to read {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("malformed TOML in {}", path.display()))
}

/// 表按键递归合并，其余类型整体替换
fn overlay(base: &mut Table, patch: Table) {
    for (key, value) in patch {
        match base.get_mut(&key) {
            Some(Value::Table(existing)) if value.is_table() => {
                if let Value::Table(nested) = value {
                    overlay(existing, nested);
                }
            }
            _ => {
                base.insert(key, value);
            }
        }
    }
}
