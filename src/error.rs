//! 统一错误类型
//!
//! - 启动期配置错误直接中止构造
//! - 连接、超时、发布、关闭错误原样返回给调用方，由调用方决定重试策略

use thiserror::Error;

/// 数据访问层错误类型
#[derive(Debug, Error)]
pub enum DaoError {
    /// 配置错误（启动期致命）
    #[error("Configuration error: {0}")]
    Config(String),

    /// 连接失败：拨号失败、等待连接池超时等
    #[error("Connection failure: {0}")]
    Connection(String),

    /// 截止时间到达、上下文取消或命令超时
    #[error("Timeout: {0}")]
    Timeout(String),

    /// 连接池已关闭，关闭后继续使用属于编程错误
    #[error("Cache pool is closed")]
    PoolClosed,

    /// Redis 返回了错误应答
    #[error("Cache command failed: {0}")]
    Command(#[from] redis::RedisError),

    /// 消息发布失败
    #[error("Publish failure: {0}")]
    Publish(String),

    /// 关闭资源时失败
    #[error("Shutdown error: {0}")]
    Shutdown(String),

    /// 编解码错误
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// 其他错误
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// 数据访问层结果类型
pub type DaoResult<T> = Result<T, DaoError>;

impl DaoError {
    /// 是否属于连接类故障（调用方可按需重试）
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            DaoError::Connection(_) | DaoError::Timeout(_) | DaoError::PoolClosed
        )
    }

    /// 是否为超时
    pub fn is_timeout(&self) -> bool {
        matches!(self, DaoError::Timeout(_))
    }
}
