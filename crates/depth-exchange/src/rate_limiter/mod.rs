//! REST 요청 가중치 rate limiter.

mod limiter;

pub use limiter::{ApiCallRegistration, WeightedRateLimiter, THROTTLE_FACTOR};
