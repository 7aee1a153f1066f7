//! Redis 拨号器与连接
//!
//! 拨号受连接超时约束，命令执行受读/写超时约束，两者互不占用。
//! 传输层错误或超时会把借出的连接标记为损坏，归还时丢弃。

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Cmd, ConnectionAddr, ConnectionInfo, FromRedisValue, Pipeline, RedisConnectionInfo};
use tracing::{debug, warn};

use super::pool::{CachePool, Dialer, PoolSettings, PooledConnection};
use crate::config::RedisConfig;
use crate::error::{DaoError, DaoResult};

/// Redis 连接池
pub type RedisPool = CachePool<RedisDialer>;

/// 从 Redis 连接池借出的连接
pub type RedisConnection = PooledConnection<RedisDialer>;

/// 命令类型，决定适用的超时预算
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// 只读命令：受读超时约束
    Read,
    /// 写命令：发送受写超时约束，等待应答受读超时约束
    Write,
}

/// Redis 拨号器
pub struct RedisDialer {
    client: redis::Client,
    address: String,
    dial_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl fmt::Debug for RedisDialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisDialer")
            .field("address", &self.address)
            .field("dial_timeout", &self.dial_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .finish()
    }
}

impl RedisDialer {
    /// 根据配置构建拨号器，不发起网络连接
    pub fn new(config: &RedisConfig) -> DaoResult<Self> {
        let addr = match config.network.as_str() {
            "tcp" => tcp_addr(&config.address)?,
            "unix" => unix_addr(&config.address)?,
            other => {
                return Err(DaoError::Config(format!(
                    "unsupported redis network: {other}"
                )));
            }
        };

        let info = ConnectionInfo {
            addr,
            redis: RedisConnectionInfo {
                db: config.db,
                password: (!config.auth.is_empty()).then(|| config.auth.clone()),
                ..Default::default()
            },
        };
        let client = redis::Client::open(info)
            .map_err(|e| DaoError::Config(format!("invalid redis connection info: {e}")))?;

        Ok(Self {
            client,
            address: config.address.clone(),
            dial_timeout: config.dial_timeout(),
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
        })
    }
}

fn tcp_addr(address: &str) -> DaoResult<ConnectionAddr> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| DaoError::Config(format!("redis address must be host:port: {address}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| DaoError::Config(format!("invalid redis port in {address}")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(DaoError::Config(format!("missing redis host in {address}")));
    }
    Ok(ConnectionAddr::Tcp(host.to_string(), port))
}

#[cfg(unix)]
fn unix_addr(path: &str) -> DaoResult<ConnectionAddr> {
    Ok(ConnectionAddr::Unix(std::path::PathBuf::from(path)))
}

#[cfg(not(unix))]
fn unix_addr(_path: &str) -> DaoResult<ConnectionAddr> {
    Err(DaoError::Config(
        "unix sockets are not supported on this platform".to_string(),
    ))
}

/// 超时为 0 表示不限制
fn budget(timeout: Duration) -> Option<Duration> {
    (!timeout.is_zero()).then_some(timeout)
}

async fn within<F: Future>(
    limit: Option<Duration>,
    fut: F,
) -> Result<F::Output, tokio::time::error::Elapsed> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await,
        None => Ok(fut.await),
    }
}

#[async_trait]
impl Dialer for RedisDialer {
    type Conn = CacheConnection;

    async fn dial(&self) -> DaoResult<CacheConnection> {
        let inner = within(
            budget(self.dial_timeout),
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| {
            DaoError::Connection(format!(
                "dial redis {} timed out after {:?}",
                self.address, self.dial_timeout
            ))
        })?
        .map_err(|e| DaoError::Connection(format!("dial redis {} failed: {e}", self.address)))?;

        debug!(address = %self.address, "redis connection established");
        Ok(CacheConnection {
            inner,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
        })
    }
}

/// 一条 Redis 连接及其读写超时
pub struct CacheConnection {
    inner: MultiplexedConnection,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl CacheConnection {
    fn limit(&self, kind: CommandKind) -> Option<Duration> {
        command_budget(kind, self.read_timeout, self.write_timeout)
    }
}

/// 写命令的预算为写超时与读超时之和，只配置了其中一项时单独使用该项
fn command_budget(kind: CommandKind, read: Duration, write: Duration) -> Option<Duration> {
    match kind {
        CommandKind::Read => budget(read),
        CommandKind::Write => match (budget(write), budget(read)) {
            (Some(write), Some(read)) => Some(write + read),
            (Some(single), None) | (None, Some(single)) => Some(single),
            (None, None) => None,
        },
    }
}

fn is_transport_error(err: &redis::RedisError) -> bool {
    err.is_io_error()
        || err.is_timeout()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_unrecoverable_error()
}

impl PooledConnection<RedisDialer> {
    /// 执行单条命令
    pub async fn query_cmd<T: FromRedisValue>(
        &mut self,
        kind: CommandKind,
        cmd: &Cmd,
    ) -> DaoResult<T> {
        self.execute(kind, |mut conn| async move { cmd.query_async(&mut conn).await })
            .await
    }

    /// 执行流水线
    pub async fn query_pipe<T: FromRedisValue>(
        &mut self,
        kind: CommandKind,
        pipe: &Pipeline,
    ) -> DaoResult<T> {
        self.execute(kind, |mut conn| async move { pipe.query_async(&mut conn).await })
            .await
    }

    async fn execute<T, F, Fut>(&mut self, kind: CommandKind, op: F) -> DaoResult<T>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let limit = self.limit(kind);
        let conn = self.inner.clone();

        // 命令执行期间被取消（future 被丢弃）时连接保持损坏标记，归还时丢弃
        self.set_broken(true);
        let result = within(limit, op(conn)).await;

        match result {
            Ok(Ok(value)) => {
                self.set_broken(false);
                Ok(value)
            }
            Ok(Err(err)) if is_transport_error(&err) => {
                warn!(error = %err, "redis transport error, discarding connection");
                Err(DaoError::Connection(err.to_string()))
            }
            Ok(Err(err)) => {
                self.set_broken(false);
                Err(DaoError::Command(err))
            }
            Err(_) => {
                warn!(?kind, ?limit, "redis command timed out, discarding connection");
                Err(DaoError::Timeout(format!("redis {kind:?} command timed out")))
            }
        }
    }

    /// 连接存活检查
    pub async fn ping(&mut self) -> DaoResult<()> {
        let reply: String = self.query_cmd(CommandKind::Read, &redis::cmd("PING")).await?;
        if reply != "PONG" {
            self.mark_broken();
            return Err(DaoError::Connection(format!(
                "unexpected PING reply: {reply}"
            )));
        }
        Ok(())
    }
}

/// 根据配置构建 Redis 连接池（惰性拨号）
pub fn new_redis_pool(config: &RedisConfig) -> DaoResult<RedisPool> {
    let dialer = RedisDialer::new(config)?;
    CachePool::new(dialer, PoolSettings::from(config))
}
