//! Per-module rate and concurrency policies
//!
//! Token-bucket throttling (`throttle_count` per `throttle_per_ms`) and a
//! concurrency semaphore (`concurrency`), both process-wide per module
//! name. Tokens are taken before the first attempt; concurrency permits
//! are held across retries and fallback evaluation and released on every
//! exit path (RAII).

use crate::executor::cancel::CancelToken;
use crate::ir::{BackoffStrategy, ModuleCallOptions};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Retry backoff cap; exponential growth stops here
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Delay before attempt `a` (0-based): `delay_ms` scaled by the strategy
pub fn backoff_delay(delay_ms: u64, strategy: BackoffStrategy, attempt: u32) -> Duration {
    let factor = match strategy {
        BackoffStrategy::Fixed => 1.0,
        BackoffStrategy::Linear => f64::from(attempt) + 1.0,
        BackoffStrategy::Exponential => 2f64.powi(attempt.min(30) as i32),
    };
    let millis = (delay_ms as f64 * factor).min(MAX_BACKOFF.as_millis() as f64);
    Duration::from_millis(millis as u64)
}

struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_ms: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(count: u32, per_ms: u64) -> Self {
        let capacity = f64::from(count.max(1));
        TokenBucket {
            capacity,
            tokens: capacity,
            refill_per_ms: capacity / per_ms.max(1) as f64,
            last_refill: Instant::now(),
        }
    }

    /// Take a token, or report how long until one is available
    fn try_take(&mut self) -> Result<(), Duration> {
        let now = Instant::now();
        let elapsed_ms = now.duration_since(self.last_refill).as_secs_f64() * 1000.0;
        self.tokens = (self.tokens + elapsed_ms * self.refill_per_ms).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            Err(Duration::from_millis(
                (deficit / self.refill_per_ms).ceil() as u64,
            ))
        }
    }
}

/// Rate/concurrency limiter for one module name
pub struct ModuleLimiter {
    semaphore: Option<Arc<Semaphore>>,
    bucket: Option<Mutex<TokenBucket>>,
}

impl ModuleLimiter {
    fn from_options(options: &ModuleCallOptions) -> Self {
        let semaphore = options
            .concurrency
            .filter(|limit| *limit > 0)
            .map(|limit| Arc::new(Semaphore::new(limit as usize)));
        let bucket = match (options.throttle_count, options.throttle_per_ms) {
            (Some(count), Some(per_ms)) if count > 0 => {
                Some(Mutex::new(TokenBucket::new(count, per_ms)))
            }
            _ => None,
        };
        ModuleLimiter { semaphore, bucket }
    }

    /// Wait for a throttle token; returns false when cancelled while
    /// waiting
    pub async fn acquire_token(&self, cancel: &CancelToken) -> bool {
        let Some(bucket) = &self.bucket else {
            return true;
        };
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            let wait = match bucket.lock().try_take() {
                Ok(()) => return true,
                Err(wait) => wait,
            };
            if !cancel.sleep(wait).await {
                return false;
            }
        }
    }

    /// Acquire the concurrency permit, held for the whole firing
    pub async fn acquire_permit(&self) -> Option<OwnedSemaphorePermit> {
        match &self.semaphore {
            Some(semaphore) => Arc::clone(semaphore).acquire_owned().await.ok(),
            None => None,
        }
    }
}

/// Process-wide limiter map, keyed by module name; the first call site's
/// options decide a module's limits
#[derive(Default)]
pub struct LimiterMap {
    limiters: DashMap<String, Arc<ModuleLimiter>>,
}

impl LimiterMap {
    pub fn new() -> Self {
        LimiterMap::default()
    }

    pub fn limiter_for(&self, module: &str, options: &ModuleCallOptions) -> Arc<ModuleLimiter> {
        Arc::clone(
            &self
                .limiters
                .entry(module.to_string())
                .or_insert_with(|| Arc::new(ModuleLimiter::from_options(options))),
        )
    }
}
