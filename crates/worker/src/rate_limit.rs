//! 按处理器的速率限制
//!
//! 每个处理器一个令牌桶，容量为 1，按 `rate_limit_per_minute` 匀速补充。
//! 出队后的任务在开始执行前等待令牌，等待期间任务仍占用队列槽位。

use std::collections::HashMap;
use std::time::Duration;

use snowcast_core::TaskCatalog;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// 令牌桶
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_second: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn per_minute(rate: u32, now: Instant) -> Self {
        Self {
            capacity: 1.0,
            tokens: 1.0,
            refill_per_second: f64::from(rate.max(1)) / 60.0,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
        self.last_refill = now;
    }

    /// 取出一个令牌；不足时返回还需等待的时长
    fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        let missing = 1.0 - self.tokens;
        Err(Duration::from_secs_f64(missing / self.refill_per_second))
    }
}

/// 按处理器名称分桶的限速器
pub struct HandlerRateLimiter {
    buckets: HashMap<String, Mutex<TokenBucket>>,
}

impl HandlerRateLimiter {
    /// 为目录中的每个处理器建立令牌桶
    pub fn from_catalog(catalog: &TaskCatalog) -> Self {
        let now = Instant::now();
        let buckets = catalog
            .specs()
            .map(|spec| {
                (
                    spec.name.clone(),
                    Mutex::new(TokenBucket::per_minute(spec.rate_limit_per_minute, now)),
                )
            })
            .collect();
        Self { buckets }
    }

    /// 尝试立即获取令牌，未知处理器不限速
    pub async fn try_acquire(&self, handler_name: &str) -> Result<(), Duration> {
        match self.buckets.get(handler_name) {
            Some(bucket) => bucket.lock().await.try_take(Instant::now()),
            None => Ok(()),
        }
    }

    /// 等待直到获取令牌，返回实际等待的时长
    pub async fn acquire(&self, handler_name: &str) -> Duration {
        let started = Instant::now();
        loop {
            match self.try_acquire(handler_name).await {
                Ok(()) => return started.elapsed(),
                Err(wait) => {
                    debug!("Rate limit reached for {}, waiting {:?}", handler_name, wait);
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}
