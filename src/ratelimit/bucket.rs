//! Token bucket implementation.

use std::time::{Duration, Instant};

use crate::error::{GateError, Result};

/// A token bucket with continuous, refill-on-call accrual.
///
/// The bucket holds at most `capacity` whole tokens and gains `rate` tokens per
/// second of elapsed time. It starts full, so a burst of `capacity` requests is
/// admitted immediately.
///
/// This type is not synchronized; [`RateLimiter`](super::RateLimiter) owns it
/// behind a lock.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Tokens added per second
    rate: f64,
    /// Maximum tokens held
    capacity: u32,
    /// Currently available tokens, `0..=capacity`
    tokens: u32,
    /// When the last refill was computed
    last_refill: Instant,
    /// Keep fractional accrual between calls instead of discarding it
    carry_fraction: bool,
    /// Fractional token carried forward, always in `0.0..1.0`
    credit: f64,
}

impl TokenBucket {
    /// Create a full bucket.
    ///
    /// Fails if `rate` is negative, NaN or infinite.
    pub fn new(rate: f64, capacity: u32, now: Instant) -> Result<Self> {
        if !rate.is_finite() || rate < 0.0 {
            return Err(GateError::Config(format!(
                "refill rate must be a finite number >= 0, got {}",
                rate
            )));
        }

        Ok(Self {
            rate,
            capacity,
            tokens: capacity,
            last_refill: now,
            carry_fraction: false,
            credit: 0.0,
        })
    }

    /// Keep the fractional part of each refill instead of truncating it away.
    pub fn with_carry_fraction(mut self, carry: bool) -> Self {
        self.carry_fraction = carry;
        self
    }

    /// Refill for the time elapsed since the last call, then try to take a token.
    ///
    /// The refill clock is reset on every call, admitted or not.
    pub fn allow(&mut self, now: Instant) -> bool {
        self.refill(now);
        self.take()
    }

    /// Credit whole tokens for the time elapsed since the last refill.
    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;

        let mut accrued = self.rate * elapsed;
        if self.carry_fraction {
            accrued += self.credit;
        }

        // Float to int casts saturate and truncate toward zero.
        let whole = accrued as u64;
        self.add_tokens(whole);

        self.credit = if self.carry_fraction && self.tokens < self.capacity {
            accrued - whole as f64
        } else {
            0.0
        };
    }

    /// Take one token without refilling.
    pub fn take(&mut self) -> bool {
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Add whole tokens, clamped to capacity.
    pub fn top_up(&mut self, amount: u32) {
        self.add_tokens(u64::from(amount));
    }

    /// Advisory wait until the next whole token accrues.
    ///
    /// Returns `None` when the bucket can never refill on its own.
    pub fn retry_after(&self) -> Option<Duration> {
        if self.capacity == 0 || self.rate == 0.0 {
            return None;
        }
        let missing = if self.carry_fraction {
            1.0 - self.credit
        } else {
            1.0
        };
        Duration::try_from_secs_f64(missing / self.rate).ok()
    }

    /// Currently available tokens.
    pub fn tokens(&self) -> u32 {
        self.tokens
    }

    /// Maximum tokens held.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Tokens added per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    fn add_tokens(&mut self, amount: u64) {
        let total = u64::from(self.tokens).saturating_add(amount);
        self.tokens = total.min(u64::from(self.capacity)) as u32;
    }
}
