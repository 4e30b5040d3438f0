#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::time::Duration;

/// Lower bound for the resubscription delay.
pub const MIN_RETRY_DELAY: Duration = Duration::from_millis(10);
/// Upper bound for the resubscription delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(5 * 60);

#[serde_as]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before a failed or completed subscription is issued again.
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub delay: Duration,

    /// Maximum number of resubscriptions. `None` retries forever.
    pub max_retries: Option<u32>,

    /// Drop `new` notifications a fresh subscription emits.
    pub ignore_new: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1),
            max_retries: None,
            ignore_new: false,
        }
    }
}

impl RetryPolicy {
    pub fn clamp(self) -> Self {
        Self {
            delay: self.delay.clamp(MIN_RETRY_DELAY, MAX_RETRY_DELAY),
            ..self
        }
    }

    /// Whether another attempt is allowed after `retries` resubscriptions.
    pub fn allows(&self, retries: u32) -> bool {
        self.max_retries.is_none_or(|max| retries < max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn clamp_limits_delay(ms in 0u64..10_000_000) {
            let policy = RetryPolicy {
                delay: Duration::from_millis(ms),
                ..Default::default()
            }
            .clamp();
            prop_assert!(policy.delay >= MIN_RETRY_DELAY);
            prop_assert!(policy.delay <= MAX_RETRY_DELAY);
        }

        #[test]
        fn bounded_policy_allows_exactly_max(max in 0u32..64) {
            let policy = RetryPolicy { max_retries: Some(max), ..Default::default() };
            let allowed = (0..128).filter(|n| policy.allows(*n)).count();
            prop_assert_eq!(allowed, max as usize);
        }
    }

    #[test]
    fn unbounded_by_default() {
        assert!(RetryPolicy::default().allows(u32::MAX));
    }
}
