//! 只读请求的有界重试策略
//!
//! 下单接口不走这里，避免重复下单。
use crate::core::error::ExchangeError;
use std::time::Duration;
use tokio::time::sleep;

/// 重试策略配置
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// 最大重试次数
    pub max_retries: u32,
    /// 初始延迟（毫秒）
    pub initial_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
    /// 是否添加抖动
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 200,
            max_delay_ms: 2000,
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

/// 指数退避重试策略
#[derive(Debug, Clone)]
pub struct ExponentialBackoffRetry {
    config: RetryConfig,
}

impl Default for ExponentialBackoffRetry {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl ExponentialBackoffRetry {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay_ms: u64) -> Self {
        self.config.initial_delay_ms = delay_ms;
        self
    }

    /// 不重试
    pub fn disabled() -> Self {
        Self::default().with_max_retries(0)
    }

    /// 判断是否应该重试
    pub fn should_retry(&self, error: &ExchangeError, attempt: u32) -> bool {
        attempt < self.config.max_retries && error.is_retryable()
    }

    /// 计算重试延迟
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_delay =
            self.config.initial_delay_ms as f64 * self.config.backoff_factor.powi(attempt as i32);

        let mut delay_ms = base_delay.min(self.config.max_delay_ms as f64) as u64;

        // 添加抖动以避免雷同重试
        if self.config.jitter && delay_ms > 0 {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            let jitter = rng.gen_range(0..=delay_ms / 4);
            delay_ms = (delay_ms + jitter).min(self.config.max_delay_ms);
        }

        Duration::from_millis(delay_ms)
    }

    /// 执行带重试的操作
    pub async fn execute_with_retry<F, T, Fut>(
        &self,
        operation_name: &str,
        operation: F,
    ) -> Result<T, ExchangeError>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: std::future::Future<Output = Result<T, ExchangeError>> + Send,
        T: Send,
    {
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(result) => {
                    if attempt > 0 {
                        log::info!("✅ {} 在第{}次尝试后成功", operation_name, attempt + 1);
                    }
                    return Ok(result);
                }
                Err(error) => {
                    if !self.should_retry(&error, attempt) {
                        return Err(error);
                    }

                    let delay = self.calculate_delay(attempt);
                    log::warn!(
                        "⚠️ {} 失败，将在{:.2}秒后重试 (尝试 {}/{}): {}",
                        operation_name,
                        delay.as_secs_f64(),
                        attempt + 1,
                        self.config.max_retries,
                        error
                    );

                    attempt += 1;

                    sleep(delay).await;
                }
            }
        }
    }
}
