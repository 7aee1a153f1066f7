//! Flare 逻辑层数据访问库
//!
//! 提供 Redis 连接池、Kafka / NATS 推送发布器以及统一的 `Dao` 门面

pub mod config;
pub mod dao;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod tracing;
pub mod utils;

pub use config::{
    BrokerKind, ConfigManager, DaoConfig, KafkaConfig, LoggingConfig, NatsConfig, RedisConfig,
    load_config,
};
pub use crate::tracing::init_tracing_from_config;
pub use dao::Dao;
pub use domain::{Online, PushMsg, PushMsgType, PushPublisher};
pub use error::{DaoError, DaoResult};
pub use infrastructure::cache::{CachePool, Dialer, PoolSettings, PoolStatus, RedisPool};
pub use infrastructure::messaging::{KafkaPushPublisher, NatsPushPublisher, build_publisher};
pub use utils::Context;
