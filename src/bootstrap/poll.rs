//! Bounded polling with exponential backoff.

use std::time::Duration;
use tokio::time::Instant;

/// Intervals used by every polling loop of the bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// First delay between attempts
    pub initial_interval: Duration,
    /// Upper bound for the doubled delay
    pub max_interval: Duration,
    /// Bound on a single liveness probe
    pub probe_timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(250),
            max_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

/// Doubling delay sequence capped at `max_interval`.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: &PollPolicy) -> Self {
        Self {
            next: policy.initial_interval,
            max: policy.max_interval.max(policy.initial_interval),
            attempts: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        self.attempts += 1;
        delay
    }

    /// Delays handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Sleep for the next delay, clipped to `deadline`.
    ///
    /// Returns `false` without sleeping once the deadline has passed.
    pub async fn wait(&mut self, deadline: Instant) -> bool {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        let wake = (now + self.next_delay()).min(deadline);
        tokio::time::sleep_until(wake).await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = PollPolicy {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(350),
            probe_timeout: Duration::from_millis(10),
        };
        let mut backoff = Backoff::new(&policy);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.attempts(), 4);
    }

    #[tokio::test]
    async fn test_wait_stops_at_deadline() {
        let policy = PollPolicy {
            initial_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(5),
            probe_timeout: Duration::from_millis(5),
        };
        let mut backoff = Backoff::new(&policy);
        let deadline = Instant::now() + Duration::from_millis(12);
        let mut waits = 0;
        while backoff.wait(deadline).await {
            waits += 1;
            assert!(waits < 100);
        }
        assert!(Instant::now() >= deadline);
    }
}
