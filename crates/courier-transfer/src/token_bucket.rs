//! Lazy-refill token bucket. One token covers roughly 1 KiB of payload in
//! the shaped transfer strategy, but the unit is the caller's choice.
//!
//! Not internally synchronised: each strategy owns its bucket and serialises
//! access inside its own send loop.

use std::time::{Duration, Instant};

use crate::error::TransferError;

#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    rate: f64,
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    /// A bucket starts full. `rate` is tokens per second.
    pub fn new(capacity: u64, rate: f64) -> Result<Self, TransferError> {
        if capacity == 0 {
            return Err(TransferError::Config("token bucket capacity must be positive".into()));
        }
        if !rate.is_finite() || rate <= 0.0 {
            return Err(TransferError::Config(format!(
                "token bucket rate {rate} must be a positive number"
            )));
        }
        Ok(TokenBucket {
            capacity: capacity as f64,
            rate,
            tokens: capacity as f64,
            last_update: Instant::now(),
        })
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
            self.last_update = now;
        }
    }

    /// Debit `tokens` if the (freshly refilled) bucket covers them;
    /// otherwise leave the bucket unchanged.
    pub fn try_consume(&mut self, tokens: u64) -> bool {
        self.refill();
        let needed = tokens as f64;
        if self.tokens >= needed {
            self.tokens -= needed;
            true
        } else {
            false
        }
    }

    /// How long until `tokens` would be available at the current rate.
    /// Zero when the bucket already covers them.
    pub fn wait_time_for(&mut self, tokens: u64) -> Duration {
        self.refill();
        let needed = tokens as f64;
        if self.tokens >= needed {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((needed - self.tokens) / self.rate)
    }

    /// Whole tokens currently available.
    pub fn available(&mut self) -> u64 {
        self.refill();
        self.tokens as u64
    }

    pub fn capacity(&self) -> u64 {
        self.capacity as u64
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
}
