use backon::{BackoffBuilder, ExponentialBuilder};
use std::time::Duration;

/// How the transport retries a dropped connection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failed attempts before the session is reported offline.
    /// Retrying continues past this point.
    pub offline_after: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            offline_after: 5,
        }
    }
}

impl ReconnectPolicy {
    /// min → 2×min → 4×min → ... capped at max, jittered, never exhausted.
    pub fn backoff(&self) -> impl Iterator<Item = Duration> + Send + use<> {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay.max(self.min_delay))
            .with_jitter()
            .without_max_times()
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_unbounded_and_capped() {
        let policy = ReconnectPolicy {
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            offline_after: 2,
        };

        let delays = policy.backoff().take(50).collect::<Vec<_>>();
        assert_eq!(delays.len(), 50);
        assert!(delays[0] >= Duration::from_millis(10));
    }
}
