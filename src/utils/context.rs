//! 请求上下文
//!
//! 携带截止时间与取消信号，用于健康检查等需要及时返回的操作。

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{DaoError, DaoResult};

/// 调用上下文：可选截止时间 + 取消令牌
#[derive(Debug, Clone)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// 无截止时间、不会被取消的上下文
    pub fn background() -> Self {
        Self {
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// 从当前时刻起 `timeout` 后到期
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancel: CancellationToken::new(),
        }
    }

    /// 使用外部取消令牌，截止时间保持不变
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// 派生子上下文：父上下文取消时子上下文随之取消，截止时间取两者较早者
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        let deadline = match (self.deadline, timeout.map(|t| Instant::now() + t)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            deadline,
            cancel: self.cancel.child_token(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 已取消或已过截止时间
    pub fn is_done(&self) -> bool {
        self.is_cancelled() || self.deadline.is_some_and(|d| d <= Instant::now())
    }

    /// 在上下文约束下执行 `fut`
    ///
    /// 上下文已结束时立即返回 `DaoError::Timeout`，不会轮询 `fut`；
    /// 执行过程中到期或被取消时丢弃 `fut` 并返回 `DaoError::Timeout`。
    pub async fn run<T, F>(&self, fut: F) -> DaoResult<T>
    where
        F: Future<Output = DaoResult<T>>,
    {
        if self.is_cancelled() {
            return Err(DaoError::Timeout("context cancelled".to_string()));
        }
        if let Some(deadline) = self.deadline {
            if deadline <= Instant::now() {
                return Err(DaoError::Timeout("context deadline exceeded".to_string()));
            }
        }

        let sleep = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                Err(DaoError::Timeout("context cancelled".to_string()))
            }
            _ = sleep => {
                Err(DaoError::Timeout("context deadline exceeded".to_string()))
            }
            result = fut => result,
        }
    }
}
