//! Rate limiting logic and state management.

mod bucket;
mod clock;
mod limiter;

pub use bucket::TokenBucket;
pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::{AdmissionPolicy, Decision, RateLimiter, RefillMode};
