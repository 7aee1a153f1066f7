//! 工具函数模块

pub mod context;

pub use context::Context;

use chrono::Utc;

/// 获取当前时间戳（秒）
pub fn current_seconds() -> i64 {
    Utc::now().timestamp()
}
