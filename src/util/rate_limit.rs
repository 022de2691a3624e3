//! Rate limiting utilities

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Unkeyed in-memory governor limiter, one per connection
pub type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Token bucket refilled at `inputs_per_second` with a burst of the same size.
/// A rate of 0 is clamped to one input per second.
pub fn create_limiter(inputs_per_second: u32) -> Arc<Limiter> {
    let rate = NonZeroU32::new(inputs_per_second).unwrap_or(NonZeroU32::MIN);
    Arc::new(RateLimiter::direct(Quota::per_second(rate)))
}

/// Per-connection INPUT message limiter
#[derive(Clone)]
pub struct InputRateLimiter {
    limiter: Arc<Limiter>,
}

impl InputRateLimiter {
    /// `None` when `inputs_per_second` is 0, meaning unlimited
    pub fn new(inputs_per_second: u32) -> Option<Self> {
        (inputs_per_second > 0).then(|| Self {
            limiter: create_limiter(inputs_per_second),
        })
    }

    /// Takes one token. `false` means the input should be dropped.
    pub fn check(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

impl std::fmt::Debug for InputRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputRateLimiter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_means_unlimited() {
        assert!(InputRateLimiter::new(0).is_none());
    }

    #[test]
    fn test_burst_is_capped() {
        let limiter = InputRateLimiter::new(2).unwrap();
        assert!(limiter.check());
        assert!(limiter.check());
        assert!(!limiter.check());
    }

    #[test]
    fn test_zero_rate_clamps_to_one() {
        let limiter = create_limiter(0);
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_err());
    }
}
