//! 逻辑层数据访问门面
//!
//! `Dao` 持有一个 Redis 连接池和一个推送发布器（构造时按配置二选一，之后不再切换），
//! 上层业务只通过它访问缓存与消息中间件。

mod push;
mod session;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{BrokerKind, DaoConfig};
use crate::domain::repositories::PushPublisher;
use crate::error::{DaoError, DaoResult};
use crate::infrastructure::cache::{PoolStatus, RedisPool, new_redis_pool};
use crate::infrastructure::messaging::build_publisher;
use crate::utils::Context;

pub use session::{key_key_server, key_mid_server, key_server_online};

/// 空闲回收的最小间隔
const MIN_REAP_INTERVAL: Duration = Duration::from_secs(1);

/// 逻辑层数据访问对象
pub struct Dao {
    config: Arc<DaoConfig>,
    push: Arc<dyn PushPublisher>,
    redis: RedisPool,
    redis_expire: i64,
    ack_inbox: String,
    reaper: Option<JoinHandle<()>>,
    closed: AtomicBool,
}

impl Dao {
    /// 根据配置构建
    ///
    /// 配置不合法时返回 `DaoError::Config`。Redis 连接池惰性拨号；
    /// Kafka 生产者惰性连接，NATS 客户端在此处建立连接。
    pub async fn new(config: DaoConfig) -> DaoResult<Self> {
        config.validate()?;

        let redis = new_redis_pool(&config.redis)?;
        let push = build_publisher(&config).await?;

        let mut dao = Self::from_parts(config, redis, push);
        if let Some(idle_timeout) = dao.config.redis.idle_timeout() {
            dao.reaper = dao
                .redis
                .spawn_idle_reaper(idle_timeout.max(MIN_REAP_INTERVAL));
        }

        info!(
            redis = %dao.config.redis.address,
            backend = %dao.backend(),
            topic = dao.config.push_topic(),
            "logic dao created"
        );
        Ok(dao)
    }

    /// 使用已构建的连接池与发布器组装（不启动后台回收任务）
    pub fn from_parts(config: DaoConfig, redis: RedisPool, push: Arc<dyn PushPublisher>) -> Self {
        let redis_expire = i64::try_from(config.redis.expire_seconds).unwrap_or(i64::MAX);
        let ack_inbox = config.ack_inbox().to_string();
        Self {
            config: Arc::new(config),
            push,
            redis,
            redis_expire,
            ack_inbox,
            reaper: None,
            closed: AtomicBool::new(false),
        }
    }

    /// 释放连接池与发布器
    ///
    /// 两者都会尝试关闭，返回第一个失败（`DaoError::Shutdown`）。重复调用直接返回 `Ok(())`。
    pub async fn close(&self) -> DaoResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(reaper) = &self.reaper {
            reaper.abort();
        }

        let pool_result = self.redis.close();
        if let Err(err) = &pool_result {
            warn!(error = %err, "failed to close redis pool");
        }
        let push_result = self.push.close().await;
        if let Err(err) = &push_result {
            warn!(error = %err, backend = %self.backend(), "failed to close push publisher");
        }

        pool_result.and(push_result).map_err(|err| match err {
            DaoError::Shutdown(msg) => DaoError::Shutdown(msg),
            other => DaoError::Shutdown(other.to_string()),
        })?;

        info!("logic dao closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 缓存存活检查：借出连接、PING、归还，整体受上下文截止时间与取消约束
    pub async fn ping(&self, ctx: &Context) -> DaoResult<()> {
        ctx.run(async {
            let mut conn = self.redis.acquire().await?;
            conn.ping().await
        })
        .await
    }

    /// 发布消息到当前选中的中间件
    pub async fn publish_message(
        &self,
        topic: &str,
        ack_inbox: &str,
        key: &str,
        msg: &[u8],
    ) -> DaoResult<()> {
        self.push.publish_message(topic, ack_inbox, key, msg).await
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.redis.status()
    }

    pub fn backend(&self) -> BrokerKind {
        self.push.backend()
    }

    pub fn config(&self) -> &DaoConfig {
        &self.config
    }

    /// 写入缓存的过期时间（秒）
    pub fn redis_expire(&self) -> i64 {
        self.redis_expire
    }
}

impl Drop for Dao {
    fn drop(&mut self) {
        if let Some(reaper) = self.reaper.take() {
            reaper.abort();
        }
    }
}
