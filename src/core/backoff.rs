//! 指数退避重试
//!
//! 只记录失败次数（成功调用不计入）；延迟按 min(base × multiplier^n, max) 增长，
//! 可叠加抖动。`execute` 封装「失败 → 等待 → 重试」的完整循环，耗尽后抛出最后一次错误。

use std::time::Duration;

/// 退避参数
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// 最大重试次数；失败次数达到该值后不再重试
    pub max_retries: u32,
    /// 首次重试前的基准延迟
    pub base_delay: Duration,
    /// 延迟上限
    pub max_delay: Duration,
    /// 每次失败后的延迟倍率
    pub multiplier: f64,
    /// 抖动系数：0 表示精确延迟，0.2 表示最多上浮 20%
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }
}

/// 退避状态：失败计数 + 配置
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempts: 0 }
    }

    /// 已记录的失败次数
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// 失败次数未达上限时可继续重试
    pub fn should_retry(&self) -> bool {
        self.attempts < self.config.max_retries
    }

    /// 当前延迟：min(base × multiplier^attempts, max)，jitter > 0 时再上浮
    pub fn current_delay(&self) -> Duration {
        let exp = self.config.multiplier.powi(self.attempts as i32);
        let raw = self.config.base_delay.as_secs_f64() * exp;
        let capped = raw.min(self.config.max_delay.as_secs_f64());
        let jittered = if self.config.jitter > 0.0 {
            capped * (1.0 + self.config.jitter * clock_fraction())
        } else {
            capped
        };
        Duration::from_secs_f64(jittered)
    }

    /// 记一次失败
    pub fn record_failure(&mut self) {
        self.attempts += 1;
    }

    /// 清零失败计数（同一实例复用于下一轮任务时调用）
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// 执行操作：失败且允许重试时等待当前延迟、记一次失败后再试；
    /// 耗尽后抛出最后一次错误。成功返回时 `attempts()` 即此前的失败次数。
    pub async fn execute<T, E, F, Fut>(&mut self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !self.should_retry() {
                        return Err(err);
                    }
                    let delay = self.current_delay();
                    tokio::time::sleep(delay).await;
                    self.record_failure();
                }
            }
        }
    }
}

/// 伪随机抖动源：取系统时钟的亚秒纳秒位映射到 [0, 1)
fn clock_fraction() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    f64::from(nanos) / 1_000_000_000.0
}
