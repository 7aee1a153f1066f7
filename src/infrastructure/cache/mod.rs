pub mod pool;
pub mod redis;

pub use self::pool::{CachePool, Dialer, PoolSettings, PoolStatus, PooledConnection};
pub use self::redis::{
    CacheConnection, CommandKind, RedisConnection, RedisDialer, RedisPool, new_redis_pool,
};
