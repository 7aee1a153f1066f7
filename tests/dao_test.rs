// 集成测试 - 通过公开接口验证 Dao 的生命周期、发布路由与存活检查
// 需要真实 Redis 的用例通过 FLARE_LOGIC_TEST_REDIS 指定地址，未设置时跳过
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use flare_logic_dao::{
    BrokerKind, Context, Dao, DaoConfig, DaoError, DaoResult, Online, PushMsg, PushPublisher,
    RedisConfig,
};
use flare_logic_dao::infrastructure::cache::new_redis_pool;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

struct RecordingPublisher {
    backend: BrokerKind,
    sent: Mutex<Vec<(String, String, String, Vec<u8>)>>,
    closes: AtomicUsize,
}

impl RecordingPublisher {
    fn new(backend: BrokerKind) -> Arc<Self> {
        Arc::new(Self {
            backend,
            sent: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl PushPublisher for RecordingPublisher {
    async fn publish_message(
        &self,
        topic: &str,
        ack_inbox: &str,
        key: &str,
        msg: &[u8],
    ) -> DaoResult<()> {
        if topic.is_empty() {
            return Err(DaoError::Publish("topic must not be empty".to_string()));
        }
        self.sent.lock().await.push((
            topic.to_string(),
            ack_inbox.to_string(),
            key.to_string(),
            msg.to_vec(),
        ));
        Ok(())
    }

    async fn close(&self) -> DaoResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn backend(&self) -> BrokerKind {
        self.backend
    }
}

fn config_for(address: &str, use_nats: bool) -> DaoConfig {
    let mut config = DaoConfig {
        redis: RedisConfig {
            address: address.to_string(),
            dial_timeout_ms: 500,
            ..RedisConfig::default()
        },
        use_nats,
        ..DaoConfig::default()
    };
    config.nats.ack_inbox = "goim.push.ack".to_string();
    config
}

fn build_dao(config: DaoConfig) -> Result<(Dao, Arc<RecordingPublisher>)> {
    let pool = new_redis_pool(&config.redis)?;
    let publisher = RecordingPublisher::new(config.broker());
    let dao = Dao::from_parts(config, pool, publisher.clone());
    Ok((dao, publisher))
}

#[tokio::test]
async fn test_backend_routing_follows_flag() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    for use_nats in [false, true] {
        let (dao, publisher) = build_dao(config_for("127.0.0.1:1", use_nats))?;
        dao.broadcast_room_msg(5, "live://1000", b"hello").await?;

        let sent = publisher.sent.lock().await;
        let (topic, ack_inbox, key, payload) = &sent[0];
        info!(use_nats, topic = %topic, "routed push envelope");
        assert_eq!(topic, dao.config().push_topic());
        assert_eq!(key, "live://1000");
        if use_nats {
            assert_eq!(dao.backend(), BrokerKind::Nats);
            assert_eq!(ack_inbox, "goim.push.ack");
        } else {
            assert_eq!(dao.backend(), BrokerKind::Kafka);
            assert!(ack_inbox.is_empty());
        }
        assert_eq!(PushMsg::decode(payload)?.room, "live://1000");
    }
    Ok(())
}

#[tokio::test]
async fn test_close_is_idempotent() -> Result<()> {
    let (dao, publisher) = build_dao(config_for("127.0.0.1:1", false))?;

    dao.close().await?;
    dao.close().await?;
    assert_eq!(publisher.closes.load(Ordering::SeqCst), 1);
    assert_eq!(dao.pool_status().total, 0);

    let err = dao.ping(&Context::background()).await.unwrap_err();
    assert!(matches!(err, DaoError::PoolClosed));
    Ok(())
}

#[tokio::test]
async fn test_ping_respects_context() -> Result<()> {
    let (dao, _) = build_dao(config_for("127.0.0.1:1", false))?;

    let expired = Context::with_timeout(Duration::ZERO);
    assert!(dao.ping(&expired).await.unwrap_err().is_timeout());

    let token = CancellationToken::new();
    let cancelled = Context::background().with_cancellation(token.clone());
    token.cancel();
    assert!(dao.ping(&cancelled).await.unwrap_err().is_timeout());

    dao.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_session_state_against_live_redis() -> Result<()> {
    let Ok(address) = std::env::var("FLARE_LOGIC_TEST_REDIS") else {
        return Ok(());
    };
    let _ = tracing_subscriber::fmt::try_init();

    let (dao, _) = build_dao(config_for(&address, false))?;
    dao.ping(&Context::with_timeout(Duration::from_secs(2))).await?;

    let mid = 9_000_001;
    dao.add_mapping(mid, "it-key-1", "comet-1").await?;
    dao.add_mapping(mid, "it-key-2", "comet-2").await?;
    assert!(dao.expire_mapping(mid, "it-key-1").await?);

    let servers = dao
        .servers_by_keys(&["it-key-1".to_string(), "it-missing".to_string()])
        .await?;
    assert_eq!(servers, vec!["comet-1".to_string(), String::new()]);

    let (key_servers, online_mids) = dao.keys_by_mids(&[mid, mid + 1]).await?;
    assert_eq!(key_servers.get("it-key-2").map(String::as_str), Some("comet-2"));
    assert_eq!(online_mids, vec![mid]);

    assert!(dao.del_mapping(mid, "it-key-1", "comet-1").await?);
    assert!(dao.del_mapping(mid, "it-key-2", "comet-2").await?);
    assert!(!dao.expire_mapping(mid, "it-key-1").await?);

    let online = Online::new("it-comet", HashMap::from([("live://1".to_string(), 2)]));
    dao.add_server_online("it-comet", &online).await?;
    assert_eq!(dao.server_online("it-comet").await?, Some(online));
    dao.del_server_online("it-comet").await?;
    assert_eq!(dao.server_online("it-comet").await?, None);

    assert!(dao.pool_status().idle >= 1);
    dao.close().await?;
    Ok(())
}
