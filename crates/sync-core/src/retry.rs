use std::time::Duration;

/// Linear reconnect backoff with a bounded number of consecutive attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    base_delay_ms: u64,
    max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            base_delay_ms,
            max_attempts,
        }
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before reconnect number `attempt` (1-based): `attempt * base`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(u64::from(attempt)))
    }

    /// Whether another reconnect may be scheduled after `attempts`
    /// consecutive abnormal closures.
    pub fn allows_reconnect(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(1_000, 5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scales_linearly_with_attempts() {
        let policy = ReconnectPolicy::new(250, 5);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(1_000));
    }

    #[test]
    fn stops_allowing_reconnects_at_max_attempts() {
        let policy = ReconnectPolicy::new(100, 3);
        assert!(policy.allows_reconnect(2));
        assert!(!policy.allows_reconnect(3));
    }

    #[test]
    fn defaults_match_dashboard_expectations() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.base_delay_ms(), 1_000);
        assert_eq!(policy.max_attempts(), 5);
    }

    #[test]
    fn saturates_instead_of_overflowing() {
        let policy = ReconnectPolicy::new(u64::MAX, 5);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(u64::MAX));
    }
}
