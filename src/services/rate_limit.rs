use super::RateLimitDecision;
use governor::{
    DefaultKeyedRateLimiter, Quota, RateLimiter,
    clock::{Clock, DefaultClock},
};
use std::num::NonZeroU32;

/// Per-caller GCRA limiter kept in process memory
pub struct KeyedRateLimiter {
    limiter: DefaultKeyedRateLimiter<String>,
    clock: DefaultClock,
}

impl KeyedRateLimiter {
    pub fn per_minute(requests: u32) -> Self {
        let requests = NonZeroU32::new(requests).unwrap_or(NonZeroU32::MIN);

        Self {
            limiter: RateLimiter::keyed(Quota::per_minute(requests)),
            clock: DefaultClock::default(),
        }
    }
}

impl super::RateLimiter for KeyedRateLimiter {
    fn check(&self, key: &str) -> RateLimitDecision {
        match self.limiter.check_key(&key.to_string()) {
            Ok(()) => RateLimitDecision::Allowed,
            Err(not_until) => RateLimitDecision::Throttled {
                retry_after: not_until.wait_time_from(self.clock.now()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::RateLimiter as _;

    #[test]
    fn test_throttles_after_quota() {
        let limiter = KeyedRateLimiter::per_minute(2);

        assert_eq!(limiter.check("uid:u-1"), RateLimitDecision::Allowed);
        assert_eq!(limiter.check("uid:u-1"), RateLimitDecision::Allowed);
        assert!(matches!(
            limiter.check("uid:u-1"),
            RateLimitDecision::Throttled { retry_after } if !retry_after.is_zero()
        ));
    }

    #[test]
    fn test_keys_are_isolated() {
        let limiter = KeyedRateLimiter::per_minute(1);

        assert_eq!(limiter.check("uid:u-1"), RateLimitDecision::Allowed);
        assert_eq!(limiter.check("uid:u-2"), RateLimitDecision::Allowed);
        assert!(matches!(
            limiter.check("uid:u-1"),
            RateLimitDecision::Throttled { .. }
        ));
    }
}
