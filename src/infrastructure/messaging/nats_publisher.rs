//! NATS 推送发布器
//!
//! - 连接在构建时建立（客户端要求），受连接超时约束
//! - `ack_inbox` 作为回复主题随消息发送
//! - 分区键放在 `Flare-Partition-Key` 消息头中，供下游按键路由
//! - 关闭时清空发送缓冲并断开连接

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, anyhow};
use async_nats::HeaderMap;
use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info};

use crate::config::{BrokerKind, NatsConfig};
use crate::domain::repositories::PushPublisher;
use crate::error::{DaoError, DaoResult};

/// 承载分区键的消息头
pub const KEY_HEADER: &str = "Flare-Partition-Key";

/// NATS 客户端抽象，便于替换为测试替身
#[async_trait]
pub trait NatsClient: Send + Sync + 'static {
    async fn send_message(
        &self,
        subject: &str,
        reply: Option<&str>,
        key: &str,
        payload: Bytes,
    ) -> Result<()>;

    /// 发送缓冲中的消息并断开连接
    async fn shutdown(&self) -> Result<()>;
}

#[async_trait]
impl NatsClient for async_nats::Client {
    async fn send_message(
        &self,
        subject: &str,
        reply: Option<&str>,
        key: &str,
        payload: Bytes,
    ) -> Result<()> {
        let mut headers = HeaderMap::new();
        if !key.is_empty() {
            headers.insert(KEY_HEADER, key.to_string());
        }

        match reply {
            Some(reply) => self
                .publish_with_reply_and_headers(
                    subject.to_string(),
                    reply.to_string(),
                    headers,
                    payload,
                )
                .await
                .map_err(|err| anyhow!("failed to publish to NATS subject '{subject}': {err}")),
            None => self
                .publish_with_headers(subject.to_string(), headers, payload)
                .await
                .map_err(|err| anyhow!("failed to publish to NATS subject '{subject}': {err}")),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        self.flush()
            .await
            .map_err(|err| anyhow!("failed to flush NATS client: {err}"))?;
        // drain 之后客户端不再接受发布，连接在缓冲清空后关闭
        self.drain()
            .await
            .map_err(|err| anyhow!("failed to drain NATS client: {err}"))
    }
}

/// 连接 NATS 服务器
pub async fn connect_nats(config: &NatsConfig) -> Result<async_nats::Client> {
    info!("Connecting to NATS server at {}", config.url);

    let mut options =
        async_nats::ConnectOptions::new().connection_timeout(config.connect_timeout());
    if let Some(name) = &config.client_name {
        options = options.name(name);
    }
    if let (Some(user), Some(password)) = (&config.user, &config.password) {
        options = options.user_and_password(user.clone(), password.clone());
    } else if let Some(token) = &config.token {
        options = options.token(token.clone());
    }

    let client = tokio::time::timeout(
        config.connect_timeout(),
        options.connect(config.url.as_str()),
    )
    .await
    .map_err(|_| {
        anyhow!(
            "timed out connecting to NATS server at {} after {:?}",
            config.url,
            config.connect_timeout()
        )
    })?
    .map_err(|err| anyhow!("Failed to connect to NATS server at {}: {err}", config.url))?;

    info!("Connected to NATS server at {}", config.url);
    Ok(client)
}

/// NATS 推送发布器
pub struct NatsPushPublisher<C: NatsClient = async_nats::Client> {
    client: Arc<C>,
    closed: AtomicBool,
}

impl NatsPushPublisher<async_nats::Client> {
    pub async fn connect(config: &NatsConfig) -> DaoResult<Self> {
        let client = connect_nats(config)
            .await
            .map_err(|err| DaoError::Connection(format!("{err:#}")))?;
        Ok(Self::with_client(Arc::new(client)))
    }
}

impl<C: NatsClient> NatsPushPublisher<C> {
    pub fn with_client(client: Arc<C>) -> Self {
        Self {
            client,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl<C: NatsClient> PushPublisher for NatsPushPublisher<C> {
    async fn publish_message(
        &self,
        topic: &str,
        ack_inbox: &str,
        key: &str,
        msg: &[u8],
    ) -> DaoResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DaoError::Publish("nats publisher is closed".to_string()));
        }
        if topic.is_empty() {
            return Err(DaoError::Publish("topic must not be empty".to_string()));
        }

        let reply = (!ack_inbox.is_empty()).then_some(ack_inbox);
        self.client
            .send_message(topic, reply, key, Bytes::copy_from_slice(msg))
            .await
            .map_err(|err| DaoError::Publish(format!("{err:#}")))?;

        debug!(topic, key, bytes = msg.len(), "message published to nats");
        Ok(())
    }

    async fn close(&self) -> DaoResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.client
            .shutdown()
            .await
            .map_err(|err| DaoError::Shutdown(format!("{err:#}")))?;
        info!("nats push publisher closed");
        Ok(())
    }

    fn backend(&self) -> BrokerKind {
        BrokerKind::Nats
    }
}
