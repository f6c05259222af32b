use std::time::Duration;

use crate::error::DownloadError;

/// Decision returned by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Escalate to a terminal failure of the whole download.
    GiveUp,
    /// Reset the chunk to `init`; it becomes eligible again after the delay.
    RestartAfter(Duration),
}

/// Per-chunk restart bound with exponential backoff between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Restarts allowed per chunk (not counting the first attempt).
    pub max_restarts: u32,
    /// Base delay for backoff.
    pub base_delay: Duration,
    /// Upper bound on backoff delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// `restart_count` is the number of restarts the chunk has already used.
    pub fn decide(&self, restart_count: u32, err: &DownloadError) -> RetryDecision {
        if !err.kind().is_retryable() || restart_count >= self.max_restarts {
            return RetryDecision::GiveUp;
        }
        // base * 2^restart_count, capped.
        let exp = 1u32 << restart_count.min(8);
        let delay = self.base_delay.saturating_mul(exp).min(self.max_delay);
        RetryDecision::RestartAfter(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reset() -> DownloadError {
        DownloadError::network("https://example.com/f", "connection reset")
    }

    #[test]
    fn no_restart_for_terminal_errors() {
        let p = RetryPolicy::default();
        let html = DownloadError::DownloadIsHtml {
            url: "https://example.com".into(),
        };
        assert_eq!(p.decide(0, &html), RetryDecision::GiveUp);
        assert_eq!(p.decide(0, &DownloadError::UserCanceled), RetryDecision::GiveUp);
        let forbidden = DownloadError::Http {
            url: "https://example.com".into(),
            status: 403,
        };
        assert_eq!(p.decide(0, &forbidden), RetryDecision::GiveUp);
    }

    #[test]
    fn exponential_backoff_grows_and_is_capped() {
        let p = RetryPolicy {
            max_restarts: 20,
            ..RetryPolicy::default()
        };
        let d0 = match p.decide(0, &reset()) {
            RetryDecision::RestartAfter(d) => d,
            other => panic!("expected restart, got {other:?}"),
        };
        let d1 = match p.decide(1, &reset()) {
            RetryDecision::RestartAfter(d) => d,
            other => panic!("expected restart, got {other:?}"),
        };
        assert_eq!(d0, p.base_delay);
        assert_eq!(d1, p.base_delay * 2);

        match p.decide(15, &reset()) {
            RetryDecision::RestartAfter(d) => assert_eq!(d, p.max_delay),
            other => panic!("expected restart, got {other:?}"),
        }
    }

    #[test]
    fn respects_max_restarts() {
        let p = RetryPolicy {
            max_restarts: 2,
            ..RetryPolicy::default()
        };
        assert!(matches!(p.decide(0, &reset()), RetryDecision::RestartAfter(_)));
        assert!(matches!(p.decide(1, &reset()), RetryDecision::RestartAfter(_)));
        assert_eq!(p.decide(2, &reset()), RetryDecision::GiveUp);
    }

    #[test]
    fn zero_restarts_gives_up_immediately() {
        let p = RetryPolicy {
            max_restarts: 0,
            ..RetryPolicy::default()
        };
        assert_eq!(p.decide(0, &reset()), RetryDecision::GiveUp);
    }
}
