use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use rdkafka::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use tracing::{debug, info};

use crate::config::{BrokerKind, KafkaConfig};
use crate::domain::repositories::PushPublisher;
use crate::error::{DaoError, DaoResult};

/// Kafka 客户端抽象，便于替换为测试替身
#[async_trait]
pub trait KafkaClient: Send + Sync + 'static {
    /// 发送一条记录并等待投递结果；`key` 为空时不设置记录键
    async fn deliver(&self, topic: &str, key: &str, payload: &[u8], timeout: Duration)
    -> Result<()>;

    /// 刷新尚未投递的消息
    async fn flush_pending(&self, timeout: Duration) -> Result<()>;
}

#[async_trait]
impl KafkaClient for FutureProducer {
    async fn deliver(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<()> {
        let mut record = FutureRecord::<str, [u8]>::to(topic).payload(payload);
        if !key.is_empty() {
            record = record.key(key);
        }

        self.send(record, timeout)
            .await
            .map_err(|(err, _)| anyhow!("failed to enqueue kafka message: {err}"))?;
        Ok(())
    }

    async fn flush_pending(&self, timeout: Duration) -> Result<()> {
        // rd_kafka_flush 会阻塞调用线程，放到阻塞线程池执行
        let producer = self.clone();
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|err| anyhow!("kafka flush task failed: {err}"))?
            .map_err(|err| anyhow!("failed to flush kafka producer: {err}"))
    }
}

/// 构建 Kafka 生产者（创建时不建立连接）
pub fn build_kafka_producer(config: &KafkaConfig) -> Result<FutureProducer> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", config.brokers.join(","))
        .set("message.timeout.ms", config.timeout_ms.to_string())
        .set("compression.type", &config.compression_type)
        .set("enable.idempotence", config.enable_idempotence.to_string())
        .set("acks", "all");
    if let Some(client_id) = &config.client_id {
        client_config.set("client.id", client_id);
    }
    for (key, value) in &config.options {
        client_config.set(key, value);
    }

    client_config
        .create()
        .map_err(|err| anyhow!("failed to create Kafka producer: {err}"))
}

/// Kafka 推送发布器
pub struct KafkaPushPublisher<C: KafkaClient = FutureProducer> {
    client: Arc<C>,
    timeout: Duration,
    closed: AtomicBool,
}

impl KafkaPushPublisher<FutureProducer> {
    pub fn new(config: &KafkaConfig) -> DaoResult<Self> {
        let producer = build_kafka_producer(config)
            .map_err(|err| DaoError::Config(format!("{err:#}")))?;

        info!(
            brokers = %config.brokers.join(","),
            topic = %config.topic,
            "kafka push publisher created"
        );
        Ok(Self::with_client(Arc::new(producer), config.timeout()))
    }
}

impl<C: KafkaClient> KafkaPushPublisher<C> {
    pub fn with_client(client: Arc<C>, timeout: Duration) -> Self {
        Self {
            client,
            timeout,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl<C: KafkaClient> PushPublisher for KafkaPushPublisher<C> {
    async fn publish_message(
        &self,
        topic: &str,
        ack_inbox: &str,
        key: &str,
        msg: &[u8],
    ) -> DaoResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DaoError::Publish("kafka publisher is closed".to_string()));
        }
        if topic.is_empty() {
            return Err(DaoError::Publish("topic must not be empty".to_string()));
        }
        if !ack_inbox.is_empty() {
            return Err(DaoError::Publish(format!(
                "kafka does not support ack inbox (got {ack_inbox})"
            )));
        }

        self.client
            .deliver(topic, key, msg, self.timeout)
            .await
            .map_err(|err| DaoError::Publish(format!("{err:#}")))?;

        debug!(topic, key, bytes = msg.len(), "message published to kafka");
        Ok(())
    }

    async fn close(&self) -> DaoResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.client
            .flush_pending(self.timeout)
            .await
            .map_err(|err| DaoError::Shutdown(format!("{err:#}")))?;
        info!("kafka push publisher closed");
        Ok(())
    }

    fn backend(&self) -> BrokerKind {
        BrokerKind::Kafka
    }
}
