use async_trait::async_trait;

use crate::config::BrokerKind;
use crate::error::DaoResult;

/// 推送消息发布器（Kafka / NATS 二选一，需要作为 trait 对象使用，保留 async-trait）
///
/// - `topic` 不能为空
/// - `key` 决定分区/亲和性，同一 key 的消息在后端支持时保持相对顺序
/// - `ack_inbox` 为回复地址，后端不支持时必须为空，否则返回错误
/// - 只保证交给后端客户端，不做重试与缓冲
#[async_trait]
pub trait PushPublisher: Send + Sync {
    async fn publish_message(
        &self,
        topic: &str,
        ack_inbox: &str,
        key: &str,
        msg: &[u8],
    ) -> DaoResult<()>;

    /// 释放后端客户端资源，重复调用无副作用
    async fn close(&self) -> DaoResult<()>;

    fn backend(&self) -> BrokerKind;
}
