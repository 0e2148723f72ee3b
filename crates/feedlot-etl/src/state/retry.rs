//! Failure classification and retry scheduling.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Permanent,
    RateLimited,
    Resource,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Resource => "resource",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            FailureKind::Transient | FailureKind::RateLimited | FailureKind::Resource => true,
            FailureKind::Permanent => false,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(FailureKind::Transient),
            "permanent" => Ok(FailureKind::Permanent),
            "rate_limited" => Ok(FailureKind::RateLimited),
            "resource" => Ok(FailureKind::Resource),
            other => Err(format!("Unknown failure kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 30_000,
            multiplier: 2.0,
            max_delay_ms: 15 * 60 * 1000,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule retry number `attempt` (1-based) after `delay`.
    Retry { attempt: u32, delay: Duration },
    DeadLetter { max_retries_exceeded: bool },
}

impl RetryConfig {
    /// `base × multiplier^retries_so_far`, plus up to 10% jitter, capped at
    /// `max_delay_ms`.
    pub fn delay_for(&self, retries_so_far: u32) -> Duration {
        let exponent = i32::try_from(retries_so_far).unwrap_or(i32::MAX);
        let raw = (self.base_delay_ms as f64) * self.multiplier.max(1.0).powi(exponent);
        let mut delay_ms = if raw.is_finite() {
            raw.min(self.max_delay_ms as f64) as u64
        } else {
            self.max_delay_ms
        };
        if self.jitter {
            delay_ms += rand::thread_rng().gen_range(0..=delay_ms / 10);
        }
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }

    /// Decides what happens after a failure of a run that was itself retry
    /// number `retries_so_far`.
    pub fn decide(&self, kind: FailureKind, retries_so_far: u32) -> RetryDecision {
        if !kind.is_retryable() {
            return RetryDecision::DeadLetter {
                max_retries_exceeded: false,
            };
        }
        if retries_so_far >= self.max_retries {
            return RetryDecision::DeadLetter {
                max_retries_exceeded: true,
            };
        }
        RetryDecision::Retry {
            attempt: retries_so_far + 1,
            delay: self.delay_for(retries_so_far),
        }
    }
}

/// One failed run, as recorded in a dead-letter entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub run_id: String,
    pub run_number: u32,
    pub retry_count: u32,
    pub kind: Option<FailureKind>,
    pub message: Option<String>,
    pub failed_at: DateTime<Utc>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 5_000,
            jitter: false,
        }
    }

    #[test]
    fn test_exponential_delay_capped() {
        let config = config();
        assert_eq!(config.delay_for(0), Duration::from_millis(1_000));
        assert_eq!(config.delay_for(1), Duration::from_millis(2_000));
        assert_eq!(config.delay_for(2), Duration::from_millis(4_000));
        assert_eq!(config.delay_for(3), Duration::from_millis(5_000));
        assert_eq!(config.delay_for(40), Duration::from_millis(5_000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = RetryConfig {
            jitter: true,
            ..config()
        };
        for _ in 0..20 {
            let delay = config.delay_for(1);
            assert!(delay >= Duration::from_millis(2_000));
            assert!(delay <= Duration::from_millis(2_200));
        }
    }

    #[test]
    fn test_jitter_spreads_simultaneous_failures() {
        let config = RetryConfig {
            jitter: true,
            base_delay_ms: 100_000,
            max_delay_ms: 1_000_000,
            ..config()
        };
        let delays: std::collections::HashSet<Duration> =
            (0..32).map(|_| config.delay_for(0)).collect();
        assert!(delays.len() > 1);
    }

    #[test]
    fn test_permanent_goes_straight_to_dead_letter() {
        assert_eq!(
            config().decide(FailureKind::Permanent, 0),
            RetryDecision::DeadLetter {
                max_retries_exceeded: false
            }
        );
    }

    #[test]
    fn test_retries_until_exhausted() {
        let config = config();
        for retries in 0..3 {
            match config.decide(FailureKind::Transient, retries) {
                RetryDecision::Retry { attempt, .. } => assert_eq!(attempt, retries + 1),
                other => panic!("expected retry, got {:?}", other),
            }
        }
        assert_eq!(
            config.decide(FailureKind::RateLimited, 3),
            RetryDecision::DeadLetter {
                max_retries_exceeded: true
            }
        );
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            FailureKind::Transient,
            FailureKind::Permanent,
            FailureKind::RateLimited,
            FailureKind::Resource,
        ] {
            assert_eq!(kind.as_str().parse::<FailureKind>().unwrap(), kind);
        }
    }
}
