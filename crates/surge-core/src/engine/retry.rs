//! Retry policy for segment fetches
//!
//! Exponential backoff with a cap and a bounded number of attempts.
//! Errors are first classified; only transport-level failures and a few
//! HTTP statuses are ever retried.

use crate::error::SurgeError;
use std::time::Duration;
use surge_types::RetrySettings;

/// High-level classification of an error for retry purposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Timeouts, resets and truncated bodies
    Transport,
    /// Server asked us to slow down (429, 503)
    Throttled,
    /// Other retryable statuses (408, 5xx)
    Http(u16),
    /// Never retried: range rejections, client errors, storage failures
    Fatal,
}

/// Decision returned by the retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    NoRetry,
    RetryAfter(Duration),
}

/// Exponential backoff policy with caps
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Decide whether attempt number `attempt` (1-based) should be followed by another.
    pub fn decide(&self, attempt: u32, kind: ErrorKind) -> RetryDecision {
        if kind == ErrorKind::Fatal || attempt >= self.max_attempts {
            return RetryDecision::NoRetry;
        }

        // base * 2^(attempt-1), capped
        let exp = 1u32 << attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(exp).min(self.max_delay);
        RetryDecision::RetryAfter(delay)
    }
}

/// Classify an engine error for retry decisions
pub fn classify(error: &SurgeError) -> ErrorKind {
    match error {
        SurgeError::Transport(_) => ErrorKind::Transport,
        SurgeError::HttpStatus { status: 429 | 503 } => ErrorKind::Throttled,
        SurgeError::HttpStatus { status } if *status == 408 || *status >= 500 => {
            ErrorKind::Http(*status)
        }
        _ => ErrorKind::Fatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::TransportError;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        }
    }

    #[test]
    fn backoff_doubles_and_is_capped() {
        let p = policy(20);
        let delays: Vec<Duration> = (1..=6)
            .map(|attempt| match p.decide(attempt, ErrorKind::Transport) {
                RetryDecision::RetryAfter(d) => d,
                RetryDecision::NoRetry => panic!("expected retry"),
            })
            .collect();
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[2], Duration::from_millis(400));
        assert_eq!(delays[3], Duration::from_millis(800));
        assert_eq!(delays[4], Duration::from_millis(1000));
        assert_eq!(delays[5], Duration::from_millis(1000));
    }

    #[test]
    fn respects_max_attempts() {
        let p = policy(3);
        assert!(matches!(p.decide(1, ErrorKind::Throttled), RetryDecision::RetryAfter(_)));
        assert!(matches!(p.decide(2, ErrorKind::Throttled), RetryDecision::RetryAfter(_)));
        assert_eq!(p.decide(3, ErrorKind::Throttled), RetryDecision::NoRetry);
    }

    #[test]
    fn fatal_errors_are_never_retried() {
        let p = policy(10);
        let range = SurgeError::RangeNotSatisfiable {
            start: 0,
            end: "9".into(),
        };
        assert_eq!(classify(&range), ErrorKind::Fatal);
        assert_eq!(p.decide(1, classify(&range)), RetryDecision::NoRetry);
        assert_eq!(classify(&SurgeError::HttpStatus { status: 404 }), ErrorKind::Fatal);
    }

    #[test]
    fn classifies_retryable_errors() {
        assert_eq!(
            classify(&SurgeError::Transport(TransportError::Timeout)),
            ErrorKind::Transport
        );
        assert_eq!(
            classify(&SurgeError::HttpStatus { status: 503 }),
            ErrorKind::Throttled
        );
        assert_eq!(
            classify(&SurgeError::HttpStatus { status: 502 }),
            ErrorKind::Http(502)
        );
    }
}
