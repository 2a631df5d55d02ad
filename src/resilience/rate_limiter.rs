//! Token-bucket send-rate limiter.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::RateLimitPolicy;
use crate::context::{Interrupted, SendContext};

const MIN_WAIT: Duration = Duration::from_millis(1);

/// Token bucket refilled at `requests_per_minute / 60` tokens per second,
/// holding at most `burst` tokens. Starts full.
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(requests_per_minute: u32, burst: u32) -> Self {
        let capacity = burst.max(1) as f64;
        Self {
            capacity,
            tokens: capacity,
            refill_rate: rate_per_second(requests_per_minute),
            last_update: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_update = now;
    }

    fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_until_available(&mut self) -> Duration {
        self.refill();
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate)
        }
    }

    /// Applies new limits. Tokens accrued so far are kept; added capacity is
    /// granted immediately.
    fn reconfigure(&mut self, requests_per_minute: u32, burst: u32) {
        self.refill();
        let capacity = burst.max(1) as f64;
        if capacity > self.capacity {
            self.tokens += capacity - self.capacity;
        }
        self.capacity = capacity;
        self.tokens = self.tokens.min(capacity);
        self.refill_rate = rate_per_second(requests_per_minute);
    }
}

fn rate_per_second(requests_per_minute: u32) -> f64 {
    requests_per_minute.max(1) as f64 / 60.0
}

#[derive(Debug)]
struct LimiterState {
    enabled: bool,
    requests_per_minute: u32,
    burst: u32,
    bucket: TokenBucket,
}

/// Send-rate limiter shared by all sends of a client.
#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    /// Creates a limiter from a policy.
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                enabled: policy.enabled,
                requests_per_minute: policy.requests_per_minute,
                burst: policy.burst,
                bucket: TokenBucket::new(policy.requests_per_minute, policy.burst),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Waits for a token. Returns immediately when disabled.
    ///
    /// Fails fast with [`Interrupted::DeadlineExceeded`] when the context
    /// deadline falls before the next token, and with the context's
    /// interruption if it is cancelled while waiting.
    pub async fn wait(&self, ctx: &SendContext) -> Result<(), Interrupted> {
        loop {
            if let Some(err) = ctx.err() {
                return Err(err);
            }

            let delay = {
                let mut state = self.lock();
                if !state.enabled || state.bucket.try_consume() {
                    return Ok(());
                }
                state.bucket.time_until_available().max(MIN_WAIT)
            };

            if let Some(deadline) = ctx.deadline() {
                if Instant::now() + delay > deadline {
                    return Err(Interrupted::DeadlineExceeded);
                }
            }

            ctx.sleep(delay).await?;
        }
    }

    /// Takes a token if one is available. Always true when disabled.
    pub fn allow(&self) -> bool {
        let mut state = self.lock();
        !state.enabled || state.bucket.try_consume()
    }

    /// Turns limiting on or off.
    pub fn set_enabled(&self, enabled: bool) {
        self.lock().enabled = enabled;
    }

    /// Replaces the rate and burst. A zero burst is treated as one.
    pub fn update_limits(&self, requests_per_minute: u32, burst: u32) {
        let mut state = self.lock();
        state.requests_per_minute = requests_per_minute;
        state.burst = burst;
        state.bucket.reconfigure(requests_per_minute, burst);
    }

    /// Returns true if limiting is active.
    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    /// Current `(requests_per_minute, burst)`.
    pub fn limits(&self) -> (u32, u32) {
        let state = self.lock();
        (state.requests_per_minute, state.burst)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitPolicy::default())
    }
}
