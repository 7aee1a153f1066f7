//! 缓存连接池
//!
//! 基于 deadpool 的受管连接池，对外提供：
//! - 有界的活跃连接数（空闲 + 借出不超过 `max_active`），达到上限时阻塞等待
//! - 空闲连接上限 `max_idle`，超出部分在归还时直接关闭；并发归还可能短暂超出，
//!   由回收任务裁剪到上限
//! - 空闲超时回收（从归还时刻计时，借出时校验 + 后台定期回收）
//! - 出错连接丢弃而不是归还，避免故障后端污染连接池
//! - 关闭后立即失败
//!
//! 连接池只依赖 [`Dialer`]，不感知具体的缓存协议。

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use async_trait::async_trait;
use deadpool::Runtime;
use deadpool::managed::{
    self, Metrics, Object, PoolError, QueueMode, RecycleError, RecycleResult, TimeoutType,
};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::RedisConfig;
use crate::error::{DaoError, DaoResult};

/// 连接拨号器：负责建立一条可用的后端连接（含认证与超时设置）
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Conn: Send + 'static;

    async fn dial(&self) -> DaoResult<Self::Conn>;
}

/// 连接池参数
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// 最大活跃连接数（空闲 + 借出）
    pub max_active: usize,
    /// 最大空闲连接数
    pub max_idle: usize,
    /// 空闲超时，None 表示不回收
    pub idle_timeout: Option<Duration>,
    /// 等待可用连接的最长时间，None 表示一直阻塞
    pub wait_timeout: Option<Duration>,
}

impl From<&RedisConfig> for PoolSettings {
    fn from(config: &RedisConfig) -> Self {
        Self {
            max_active: config.max_active,
            max_idle: config.max_idle,
            idle_timeout: config.idle_timeout(),
            wait_timeout: config.wait_timeout(),
        }
    }
}

/// 连接池状态快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// 活跃连接上限，关闭后为 0
    pub max_active: usize,
    /// 当前持有的连接总数（空闲 + 借出）
    pub total: usize,
    /// 空闲连接数
    pub idle: usize,
    /// 借出中的连接数
    pub in_use: usize,
    /// 正在等待连接的调用方数量
    pub waiting: usize,
}

/// 池内连接，记录最近一次归还的时间
pub struct IdleConn<C> {
    conn: C,
    released_at: Instant,
}

impl<C> IdleConn<C> {
    fn is_stale(&self, idle_timeout: Option<Duration>) -> bool {
        idle_timeout.is_some_and(|timeout| self.released_at.elapsed() > timeout)
    }
}

/// deadpool 管理器：创建时拨号，复用时检查空闲超时
pub struct PoolManager<D: Dialer> {
    dialer: D,
    idle_timeout: Option<Duration>,
}

impl<D: Dialer> managed::Manager for PoolManager<D> {
    type Type = IdleConn<D::Conn>;
    type Error = DaoError;

    async fn create(&self) -> Result<IdleConn<D::Conn>, DaoError> {
        let conn = self.dialer.dial().await?;
        Ok(IdleConn {
            conn,
            released_at: Instant::now(),
        })
    }

    async fn recycle(
        &self,
        conn: &mut IdleConn<D::Conn>,
        _metrics: &Metrics,
    ) -> RecycleResult<DaoError> {
        if conn.is_stale(self.idle_timeout) {
            debug!(
                idle_ms = conn.released_at.elapsed().as_millis() as u64,
                "discarding stale idle connection"
            );
            return Err(RecycleError::Message("idle timeout exceeded".into()));
        }
        Ok(())
    }
}

/// 缓存连接池
pub struct CachePool<D: Dialer> {
    pool: managed::Pool<PoolManager<D>>,
    settings: PoolSettings,
}

impl<D: Dialer> fmt::Debug for CachePool<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachePool")
            .field("settings", &self.settings)
            .field("status", &self.status())
            .finish()
    }
}

impl<D: Dialer> CachePool<D> {
    /// 创建连接池，不会发起任何网络连接
    pub fn new(dialer: D, settings: PoolSettings) -> DaoResult<Self> {
        if settings.max_active == 0 {
            return Err(DaoError::Config(
                "cache pool max_active must be greater than zero".to_string(),
            ));
        }

        let manager = PoolManager {
            dialer,
            idle_timeout: settings.idle_timeout,
        };
        // LIFO：优先复用最近归还的连接，旧连接自然老化回收
        let pool = managed::Pool::builder(manager)
            .max_size(settings.max_active)
            .queue_mode(QueueMode::Lifo)
            .wait_timeout(settings.wait_timeout)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| DaoError::Config(format!("failed to build cache pool: {e}")))?;

        Ok(Self { pool, settings })
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// 借出一条连接
    ///
    /// 优先复用未超时的空闲连接，否则拨号新建。达到 `max_active` 时阻塞，
    /// 直到有连接归还；配置了 `wait_timeout` 时超时返回 `DaoError::Connection`。
    pub async fn acquire(&self) -> DaoResult<PooledConnection<D>> {
        if self.pool.is_closed() {
            return Err(DaoError::PoolClosed);
        }

        let obj = self.pool.get().await.map_err(map_pool_error)?;
        Ok(PooledConnection {
            obj: Some(obj),
            broken: false,
            max_idle: self.settings.max_idle,
        })
    }

    /// 归还连接；标记为损坏的连接会被丢弃
    pub fn release(&self, conn: PooledConnection<D>) {
        conn.release();
    }

    /// 关闭连接池：关闭所有空闲连接，借出中的连接归还时直接关闭
    ///
    /// 重复调用无副作用。
    pub fn close(&self) -> DaoResult<()> {
        if self.pool.is_closed() {
            debug!("cache pool already closed");
            return Ok(());
        }

        let before = self.status();
        self.pool.close();
        info!(
            idle = before.idle,
            in_use = before.in_use,
            "cache pool closed"
        );
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// 回收超过空闲超时的连接，并把空闲连接裁剪到 `max_idle`，返回回收数量
    pub fn reap_idle(&self) -> usize {
        reap(&self.pool, self.settings.idle_timeout, self.settings.max_idle)
    }

    /// 启动后台回收任务
    ///
    /// 任务只持有连接池的弱引用，连接池关闭或释放后自动退出。
    /// 未配置空闲超时时不启动。
    pub fn spawn_idle_reaper(&self, interval: Duration) -> Option<JoinHandle<()>> {
        let idle_timeout = self.settings.idle_timeout?;
        let max_idle = self.settings.max_idle;
        let weak = self.pool.weak();

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else {
                    break;
                };
                if pool.is_closed() {
                    break;
                }
                reap(&pool, Some(idle_timeout), max_idle);
            }
            debug!("idle reaper stopped");
        }))
    }

    pub fn status(&self) -> PoolStatus {
        let status = self.pool.status();
        PoolStatus {
            max_active: status.max_size,
            total: status.size,
            idle: status.available,
            in_use: status.size.saturating_sub(status.available),
            waiting: status.waiting,
        }
    }
}

fn reap<D: Dialer>(
    pool: &managed::Pool<PoolManager<D>>,
    idle_timeout: Option<Duration>,
    max_idle: usize,
) -> usize {
    let mut surplus = pool.status().available.saturating_sub(max_idle);
    if idle_timeout.is_none() && surplus == 0 {
        return 0;
    }
    // 空闲队列头部是最早归还的连接，超额部分优先从头部淘汰
    let removed = pool
        .retain(|conn, _| {
            let remove = conn.is_stale(idle_timeout) || surplus > 0;
            if remove {
                surplus = surplus.saturating_sub(1);
            }
            !remove
        })
        .removed
        .len();
    if removed > 0 {
        debug!(removed, "reaped idle connections");
    }
    removed
}

fn map_pool_error(err: PoolError<DaoError>) -> DaoError {
    match err {
        PoolError::Backend(e) => e,
        PoolError::Closed => DaoError::PoolClosed,
        PoolError::Timeout(TimeoutType::Wait) => {
            DaoError::Connection("timed out waiting for an available connection".to_string())
        }
        PoolError::Timeout(kind) => DaoError::Timeout(format!("cache pool {kind:?} timeout")),
        PoolError::NoRuntimeSpecified => {
            DaoError::Config("cache pool has no runtime configured".to_string())
        }
        other => DaoError::Connection(other.to_string()),
    }
}

/// 借出的连接
///
/// 调用方独占使用，离开作用域时自动归还（包括出错与取消路径）：
/// - 标记为损坏的连接直接关闭，下次借出重新拨号
/// - 空闲连接已达 `max_idle` 时直接关闭
pub struct PooledConnection<D: Dialer> {
    obj: Option<Object<PoolManager<D>>>,
    broken: bool,
    max_idle: usize,
}

impl<D: Dialer> PooledConnection<D> {
    /// 标记连接损坏，归还时将被丢弃
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub(crate) fn set_broken(&mut self, broken: bool) {
        self.broken = broken;
    }

    /// 显式归还
    pub fn release(self) {
        drop(self);
    }
}

impl<D: Dialer> Deref for PooledConnection<D> {
    type Target = D::Conn;

    fn deref(&self) -> &D::Conn {
        &self.obj.as_ref().expect("pooled connection used after release").conn
    }
}

impl<D: Dialer> DerefMut for PooledConnection<D> {
    fn deref_mut(&mut self) -> &mut D::Conn {
        &mut self.obj.as_mut().expect("pooled connection used after release").conn
    }
}

impl<D: Dialer> Drop for PooledConnection<D> {
    fn drop(&mut self) {
        let Some(mut obj) = self.obj.take() else {
            return;
        };

        if self.broken {
            let _conn = Object::take(obj);
            debug!("discarded broken cache connection");
            return;
        }

        let idle = Object::pool(&obj).map(|pool| pool.status().available);
        match idle {
            Some(idle) if idle >= self.max_idle => {
                let _conn = Object::take(obj);
                debug!(idle, max_idle = self.max_idle, "idle set full, closing connection");
            }
            _ => {
                obj.released_at = Instant::now();
                drop(obj);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug)]
    struct FakeConn {
        id: usize,
    }

    #[derive(Clone, Default)]
    struct FakeDialer {
        dials: Arc<AtomicUsize>,
        fail: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Dialer for FakeDialer {
        type Conn = FakeConn;

        async fn dial(&self) -> DaoResult<FakeConn> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(DaoError::Connection("connection refused".to_string()));
            }
            let id = self.dials.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(FakeConn { id })
        }
    }

    fn settings(max_active: usize, max_idle: usize) -> PoolSettings {
        PoolSettings {
            max_active,
            max_idle,
            idle_timeout: None,
            wait_timeout: None,
        }
    }

    fn new_pool(settings: PoolSettings) -> (CachePool<FakeDialer>, FakeDialer) {
        let dialer = FakeDialer::default();
        let pool = CachePool::new(dialer.clone(), settings).unwrap();
        (pool, dialer)
    }

    #[tokio::test]
    async fn test_pool_is_lazy() {
        let (pool, dialer) = new_pool(settings(4, 2));
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 0);
        assert_eq!(pool.status().total, 0);
        pool.close().unwrap();
        assert_eq!(pool.status().idle, 0);
    }

    #[tokio::test]
    async fn test_zero_max_active_rejected() {
        let result = CachePool::new(FakeDialer::default(), settings(0, 0));
        assert!(matches!(result, Err(DaoError::Config(_))));
    }

    #[tokio::test]
    async fn test_released_connection_is_reused() {
        let (pool, dialer) = new_pool(settings(4, 2));
        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id, 1);
        pool.release(conn);
        assert_eq!(pool.status().idle, 1);

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id, 1);
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_broken_connection_is_discarded() {
        let (pool, dialer) = new_pool(settings(4, 2));
        let mut conn = pool.acquire().await.unwrap();
        conn.mark_broken();
        pool.release(conn);

        let status = pool.status();
        assert_eq!(status.idle, 0);
        assert_eq!(status.total, 0);

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id, 2);
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_third_acquirer_blocks_until_release() {
        let (pool, _dialer) = new_pool(settings(2, 1));
        let pool = Arc::new(pool);

        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();

        let waiter_pool = Arc::clone(&pool);
        let waiter = tokio::spawn(async move { waiter_pool.acquire().await.map(|c| c.id) });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "third acquire must block at the ceiling");
        assert_eq!(pool.status().total, 2);

        let first_id = first.id;
        drop(first);

        let id = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be woken by release")
            .unwrap()
            .unwrap();
        assert_eq!(id, first_id);
        drop(second);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_never_exceeds_max_active_under_load() {
        const MAX_ACTIVE: usize = 3;
        const WORKERS: usize = 12;

        let (pool, dialer) = new_pool(settings(MAX_ACTIVE, MAX_ACTIVE));
        let pool = Arc::new(pool);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(WORKERS);
        for _ in 0..WORKERS {
            let pool = Arc::clone(&pool);
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let conn = pool.acquire().await.unwrap();
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                drop(conn);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= MAX_ACTIVE);
        assert!(dialer.dials.load(Ordering::SeqCst) <= MAX_ACTIVE);
        assert!(pool.status().total <= MAX_ACTIVE);
    }

    #[tokio::test]
    async fn test_wait_timeout_fails_with_connection_error() {
        let mut s = settings(1, 1);
        s.wait_timeout = Some(Duration::from_millis(30));
        let (pool, _dialer) = new_pool(s);

        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, DaoError::Connection(_)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_fails_fast() {
        let (pool, _dialer) = new_pool(settings(2, 2));
        let conn = pool.acquire().await.unwrap();
        pool.release(conn);
        assert_eq!(pool.status().idle, 1);

        pool.close().unwrap();
        assert!(pool.is_closed());
        assert_eq!(pool.status().idle, 0);
        assert!(matches!(pool.acquire().await, Err(DaoError::PoolClosed)));
        pool.close().unwrap();
    }

    #[tokio::test]
    async fn test_in_flight_connection_not_pooled_after_close() {
        let (pool, _dialer) = new_pool(settings(2, 2));
        let conn = pool.acquire().await.unwrap();
        pool.close().unwrap();
        drop(conn);
        let status = pool.status();
        assert_eq!(status.total, 0);
        assert_eq!(status.idle, 0);
    }

    #[tokio::test]
    async fn test_stale_idle_connection_is_redialed() {
        let mut s = settings(2, 2);
        s.idle_timeout = Some(Duration::from_millis(20));
        let (pool, dialer) = new_pool(s);

        let conn = pool.acquire().await.unwrap();
        drop(conn);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id, 2);
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
        assert_eq!(pool.status().total, 1);
    }

    #[tokio::test]
    async fn test_max_idle_closes_surplus() {
        let (pool, _dialer) = new_pool(settings(3, 1));
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        drop(a);
        drop(b);
        drop(c);

        let status = pool.status();
        assert_eq!(status.idle, 1);
        assert_eq!(status.total, 1);
    }

    #[tokio::test]
    async fn test_reaper_trims_idle_surplus() {
        let (pool, _dialer) = new_pool(settings(3, 1));
        let mut held = Vec::new();
        for _ in 0..3 {
            let mut conn = pool.acquire().await.unwrap();
            // 模拟并发归还时各自看到空闲集合未满
            conn.max_idle = 3;
            held.push(conn);
        }
        drop(held);
        assert_eq!(pool.status().idle, 3);

        assert_eq!(pool.reap_idle(), 2);
        let status = pool.status();
        assert_eq!(status.idle, 1);
        assert_eq!(status.total, 1);
    }

    #[tokio::test]
    async fn test_idle_age_counts_from_release() {
        let mut s = settings(2, 2);
        s.idle_timeout = Some(Duration::from_millis(30));
        let (pool, dialer) = new_pool(s);

        let conn = pool.acquire().await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        drop(conn);

        // 借出时间超过空闲超时，但刚刚归还，仍可复用
        assert_eq!(pool.reap_idle(), 0);
        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id, 1);
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
        drop(conn);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(pool.reap_idle(), 1);
    }

    #[tokio::test]
    async fn test_reap_idle() {
        let mut s = settings(2, 2);
        s.idle_timeout = Some(Duration::from_millis(20));
        let (pool, _dialer) = new_pool(s);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.reap_idle(), 0);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(pool.reap_idle(), 2);
        assert_eq!(pool.status().idle, 0);
    }

    #[tokio::test]
    async fn test_idle_reaper_task() {
        let mut s = settings(2, 2);
        s.idle_timeout = Some(Duration::from_millis(20));
        let (pool, _dialer) = new_pool(s);

        let handle = pool
            .spawn_idle_reaper(Duration::from_millis(10))
            .expect("reaper starts when idle timeout is set");
        drop(pool.acquire().await.unwrap());
        assert_eq!(pool.status().idle, 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.status().idle, 0);

        pool.close().unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reaper exits after close")
            .unwrap();
    }

    #[tokio::test]
    async fn test_no_reaper_without_idle_timeout() {
        let (pool, _dialer) = new_pool(settings(1, 1));
        assert!(pool.spawn_idle_reaper(Duration::from_millis(10)).is_none());
    }

    #[tokio::test]
    async fn test_dial_failure_does_not_leak_slot() {
        let (pool, dialer) = new_pool(settings(1, 1));
        dialer.fail.store(true, Ordering::SeqCst);
        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, DaoError::Connection(_)));
        assert_eq!(pool.status().total, 0);

        dialer.fail.store(false, Ordering::SeqCst);
        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id, 1);
    }
}
