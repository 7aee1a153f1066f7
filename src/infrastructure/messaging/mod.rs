pub mod kafka_publisher;
pub mod nats_publisher;

use std::future::Future;
use std::sync::Arc;

use tracing::info;

use crate::config::DaoConfig;
use crate::domain::repositories::PushPublisher;
use crate::error::DaoResult;

pub use kafka_publisher::{KafkaClient, KafkaPushPublisher, build_kafka_producer};
pub use nats_publisher::{KEY_HEADER, NatsClient, NatsPushPublisher, connect_nats};

/// 按开关选择发布器，只会调用被选中的构造函数
pub async fn select_publisher<K, N, KF, NF, NFut>(
    use_nats: bool,
    kafka_factory: KF,
    nats_factory: NF,
) -> DaoResult<Arc<dyn PushPublisher>>
where
    K: PushPublisher + 'static,
    N: PushPublisher + 'static,
    KF: FnOnce() -> DaoResult<K>,
    NF: FnOnce() -> NFut,
    NFut: Future<Output = DaoResult<N>>,
{
    if use_nats {
        Ok(Arc::new(nats_factory().await?))
    } else {
        Ok(Arc::new(kafka_factory()?))
    }
}

/// 根据配置构建推送发布器
pub async fn build_publisher(config: &DaoConfig) -> DaoResult<Arc<dyn PushPublisher>> {
    let publisher = select_publisher(
        config.use_nats,
        || KafkaPushPublisher::new(&config.kafka),
        || NatsPushPublisher::connect(&config.nats),
    )
    .await?;

    info!(backend = %publisher.backend(), topic = config.push_topic(), "push publisher ready");
    Ok(publisher)
}
