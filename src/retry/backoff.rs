//! Delay growth between retry attempts.

use crate::config::Properties;
use crate::error::Result;
use std::time::Duration;

/// Exponential backoff: the delay after attempt `n` (0-indexed) is
/// `first × factor^n`, capped at `max`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    pub first: Duration,
    pub max: Duration,
    /// Growth per attempt. `1.0` keeps the delay constant.
    pub factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_secs(1),
            max: Duration::from_secs(60),
            factor: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// No delay at all. Useful in tests.
    pub fn none() -> Self {
        Self {
            first: Duration::ZERO,
            max: Duration::ZERO,
            factor: 1.0,
        }
    }

    /// Read `retry_backoff_ms`, `retry_backoff_max_ms` and
    /// `retry_backoff_factor`, falling back to the defaults.
    pub fn from_properties(props: &Properties) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            first: props.millis_or("retry_backoff_ms", defaults.first)?,
            max: props.millis_or("retry_backoff_max_ms", defaults.max)?,
            factor: props.parse_or("retry_backoff_factor", defaults.factor)?,
        })
    }

    pub fn next(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_then_caps() {
        let policy = BackoffPolicy {
            first: Duration::from_millis(100),
            max: Duration::from_secs(1),
            factor: 2.0,
        };
        assert_eq!(policy.next(0), Duration::from_millis(100));
        assert_eq!(policy.next(1), Duration::from_millis(200));
        assert_eq!(policy.next(3), Duration::from_millis(800));
        assert_eq!(policy.next(4), Duration::from_secs(1));
        assert_eq!(policy.next(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn first_above_max_is_capped() {
        let policy = BackoffPolicy {
            first: Duration::from_secs(10),
            max: Duration::from_secs(5),
            factor: 1.0,
        };
        assert_eq!(policy.next(0), Duration::from_secs(5));
    }

    #[test]
    fn reads_properties() {
        let props: Properties = [("retry_backoff_ms", "250"), ("retry_backoff_factor", "1.5")]
            .into_iter()
            .collect();
        let policy = BackoffPolicy::from_properties(&props).unwrap();
        assert_eq!(policy.first, Duration::from_millis(250));
        assert_eq!(policy.factor, 1.5);
        assert_eq!(policy.max, Duration::from_secs(60));
    }
}
