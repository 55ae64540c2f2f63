//! 指数退避重试
//!
//! delay = base_delay * multiplier^(attempt-1)，上限 max_delay；最后一次仍失败时返回 None（哨兵值），
//! 由调用方自行兜底，而不是把底层错误继续向上传播。

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::Deserialize;

/// 重试策略，对应配置中的 [retry] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// 第 attempt 次（从 1 开始）失败后的等待时长
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let raw = self.base_delay_ms as f64 * self.multiplier.powi(exp);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// 带退避地重试异步操作；全部失败返回 None
pub async fn retry_async<T, E, F, Fut>(config: &RetryConfig, label: &str, mut op: F) -> Option<T>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = config.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        match op().await {
            Ok(v) => return Some(v),
            Err(e) if attempt == max_attempts => {
                tracing::warn!(op = label, attempts = max_attempts, error = %e, "max retry attempts reached");
            }
            Err(e) => {
                let delay = config.delay_for(attempt);
                tracing::warn!(
                    op = label,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
    None
}
