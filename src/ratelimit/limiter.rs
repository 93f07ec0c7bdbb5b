//! Core rate limiter implementation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::bucket::TokenBucket;
use super::clock::{Clock, SystemClock};
use crate::config::RateLimitingConfig;
use crate::error::{GateError, Result};

/// How the bucket regains tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum RefillMode {
    /// Refill from elapsed time on every decision.
    #[default]
    Lazy,
    /// A background task adds `tokens` every `every`; decisions never refill.
    Interval { every: Duration, tokens: u32 },
}

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// A token was taken.
    Admitted { limit: u32, remaining: u32 },
    /// No token was available.
    Rejected {
        limit: u32,
        /// Advisory wait before retrying, `None` if the bucket never refills.
        retry_after: Option<Duration>,
    },
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted { .. })
    }

    /// The configured capacity the decision was made against.
    pub fn limit(&self) -> u32 {
        match *self {
            Decision::Admitted { limit, .. } | Decision::Rejected { limit, .. } => limit,
        }
    }
}

/// Trait for admission policies.
///
/// The HTTP middleware is generic over this so it can gate on anything that
/// makes a synchronous admit/reject decision.
pub trait AdmissionPolicy: Send + Sync {
    /// Decide whether one request may proceed. Every call consumes at most one token.
    fn check(&self) -> Decision;
}

/// A single global token bucket shared by every request.
///
/// This struct is thread-safe and can be shared across multiple tasks. Each
/// decision holds the bucket lock for one clock read and one arithmetic update.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
    clock: Arc<dyn Clock>,
    refill: RefillMode,
    /// Set once the interval refill task has been spawned
    refill_started: AtomicBool,
}

impl RateLimiter {
    /// Create a lazily refilled limiter on the system clock.
    pub fn new(rate: f64, capacity: u32) -> Result<Self> {
        Self::with_clock(rate, capacity, Arc::new(SystemClock))
    }

    /// Create a lazily refilled limiter reading time from `clock`.
    pub fn with_clock(rate: f64, capacity: u32, clock: Arc<dyn Clock>) -> Result<Self> {
        let bucket = TokenBucket::new(rate, capacity, clock.now())?;
        Ok(Self {
            bucket: Mutex::new(bucket),
            clock,
            refill: RefillMode::Lazy,
            refill_started: AtomicBool::new(false),
        })
    }

    /// Build a limiter from configuration.
    pub fn from_config(config: &RateLimitingConfig) -> Result<Self> {
        Self::from_config_with_clock(config, Arc::new(SystemClock))
    }

    /// Build a limiter from configuration, reading time from `clock`.
    pub fn from_config_with_clock(
        config: &RateLimitingConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let limiter = Self::with_clock(config.rate, config.capacity, clock)?
            .with_carry_fraction(config.carry_fraction)
            .with_refill_mode(config.refill_mode())?;

        info!(
            rate = config.rate,
            capacity = config.capacity,
            refill = ?limiter.refill,
            carry_fraction = config.carry_fraction,
            "Rate limiter initialized"
        );

        Ok(limiter)
    }

    /// Keep fractional accrual between decisions.
    pub fn with_carry_fraction(mut self, carry: bool) -> Self {
        let bucket = self.bucket.get_mut();
        *bucket = bucket.clone().with_carry_fraction(carry);
        self
    }

    /// Change how the bucket regains tokens.
    ///
    /// An interval refill needs a non-zero period.
    pub fn with_refill_mode(mut self, refill: RefillMode) -> Result<Self> {
        if let RefillMode::Interval { every, .. } = refill {
            if every.is_zero() {
                return Err(GateError::Config(
                    "interval refill period must be greater than zero".to_string(),
                ));
            }
        }
        self.refill = refill;
        Ok(self)
    }

    /// Admit or reject one request.
    pub fn allow(&self) -> bool {
        self.check().is_admitted()
    }

    /// Add whole tokens, clamped to capacity.
    pub fn top_up(&self, tokens: u32) {
        let mut bucket = self.bucket.lock();
        bucket.top_up(tokens);
        trace!(added = tokens, tokens = bucket.tokens(), "Bucket topped up");
    }

    /// Currently available tokens.
    pub fn available(&self) -> u32 {
        self.bucket.lock().tokens()
    }

    /// Configured burst size.
    pub fn capacity(&self) -> u32 {
        self.bucket.lock().capacity()
    }

    pub fn refill_mode(&self) -> RefillMode {
        self.refill
    }

    /// Start the background refill task for [`RefillMode::Interval`].
    ///
    /// Returns `None` in lazy mode, and on every call after the first: one
    /// limiter runs at most one ticker. The task stops on its own once the
    /// limiter is dropped, or when the returned handle is aborted. Must be
    /// called from within a tokio runtime.
    pub fn spawn_interval_refill(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let RefillMode::Interval { every, tokens } = self.refill else {
            return None;
        };

        if self.refill_started.swap(true, Ordering::AcqRel) {
            warn!("Interval refill already running, not starting another");
            return None;
        }

        let limiter: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + every;
            let mut ticker = tokio::time::interval_at(start, every);

            loop {
                ticker.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                limiter.top_up(tokens);
                debug!(
                    added = tokens,
                    available = limiter.available(),
                    "Interval refill"
                );
            }
        });

        Some(handle)
    }

    fn retry_hint(&self, bucket: &TokenBucket) -> Option<Duration> {
        match self.refill {
            RefillMode::Lazy => bucket.retry_after(),
            RefillMode::Interval { every, tokens } => {
                (tokens > 0 && bucket.capacity() > 0).then_some(every)
            }
        }
    }
}

impl AdmissionPolicy for RateLimiter {
    fn check(&self) -> Decision {
        let decision = {
            let mut bucket = self.bucket.lock();
            let admitted = match self.refill {
                RefillMode::Lazy => {
                    let now = self.clock.now();
                    bucket.allow(now)
                }
                RefillMode::Interval { .. } => bucket.take(),
            };

            if admitted {
                Decision::Admitted {
                    limit: bucket.capacity(),
                    remaining: bucket.tokens(),
                }
            } else {
                Decision::Rejected {
                    limit: bucket.capacity(),
                    retry_after: self.retry_hint(&bucket),
                }
            }
        };

        match decision {
            Decision::Admitted { remaining, .. } => {
                trace!(remaining, "Request admitted");
            }
            Decision::Rejected { retry_after, .. } => {
                debug!(retry_after = ?retry_after, "Rate limit exceeded");
            }
        }

        decision
    }
}
