//! Retry, repeat and continue-on policies

use std::time::Duration;

use serde::{Deserialize, Serialize};

use dagforge_common::retry::BackoffPolicy;

use crate::condition::Condition;

/// Retry policy for a step
///
/// Delay for attempt `k` is `min(interval * backoff^(k-1), max_interval)`.
/// `limit_str` / `interval_sec_str` are template forms evaluated at step
/// setup, overriding the numeric fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryPolicy {
    pub limit: u32,
    pub interval_sec: f64,
    pub backoff: f64,
    pub max_interval_sec: f64,
    /// When non-empty, only these exit codes retry; otherwise any non-zero.
    pub exit_codes: Vec<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_str: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_sec_str: Option<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: 0,
            interval_sec: 0.0,
            backoff: 1.0,
            max_interval_sec: 0.0,
            exit_codes: Vec::new(),
            limit_str: None,
            interval_sec_str: None,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.limit > 0 || self.limit_str.is_some()
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_sec.max(0.0))
    }

    #[must_use]
    pub fn max_interval(&self) -> Option<Duration> {
        if self.max_interval_sec > 0.0 {
            Some(Duration::from_secs_f64(self.max_interval_sec))
        } else {
            None
        }
    }

    /// Whether a failure with this exit code is eligible for retry.
    #[must_use]
    pub fn should_retry(&self, exit_code: i32) -> bool {
        if self.exit_codes.is_empty() {
            exit_code != 0
        } else {
            self.exit_codes.contains(&exit_code)
        }
    }

    /// Delay before the given 1-based retry attempt.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff_policy().delay(attempt)
    }

    #[must_use]
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            limit: self.limit,
            interval: self.interval(),
            backoff: if self.backoff > 1.0 { self.backoff } else { 1.0 },
            max_interval: self.max_interval(),
        }
    }
}

/// Repeat mode for a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
    /// Loop while the condition holds or the exit code matches.
    While,
    /// Loop until the condition holds.
    Until,
}

/// Repeat policy for a step
///
/// Deserialization accepts the legacy boolean `repeat` field: `true` maps
/// to `while`; `false` (or absent) with an expected-valued condition maps
/// to `until`; with a bare condition or exit codes it maps to `while`;
/// otherwise there is no repeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeatPolicy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat_mode: Option<RepeatMode>,
    pub limit: u32,
    pub interval_sec: f64,
    pub backoff: f64,
    pub max_interval_sec: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    pub exit_code: Vec<i32>,
}

impl RepeatPolicy {
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.repeat_mode.is_some()
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_sec.max(0.0))
    }

    /// Delay before the given 1-based repeat iteration.
    #[must_use]
    pub fn delay(&self, iteration: u32) -> Duration {
        let policy = BackoffPolicy {
            limit: self.limit,
            interval: self.interval(),
            backoff: if self.backoff > 1.0 { self.backoff } else { 1.0 },
            max_interval: if self.max_interval_sec > 0.0 {
                Some(Duration::from_secs_f64(self.max_interval_sec))
            } else {
                None
            },
        };
        policy.delay(iteration)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RepeatPolicyRaw {
    repeat: Option<serde_json::Value>,
    repeat_mode: Option<RepeatMode>,
    limit: u32,
    interval_sec: f64,
    backoff: f64,
    max_interval_sec: f64,
    condition: Option<Condition>,
    exit_code: Vec<i32>,
}

impl<'de> Deserialize<'de> for RepeatPolicy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = RepeatPolicyRaw::deserialize(deserializer)?;

        let explicit = raw.repeat_mode.or_else(|| match &raw.repeat {
            Some(serde_json::Value::String(s)) => match s.as_str() {
                "while" => Some(RepeatMode::While),
                "until" => Some(RepeatMode::Until),
                _ => None,
            },
            Some(serde_json::Value::Bool(true)) => Some(RepeatMode::While),
            _ => None,
        });

        let inferred = explicit.or_else(|| {
            match (&raw.condition, raw.exit_code.is_empty()) {
                (Some(cond), _) if cond.has_expected() => Some(RepeatMode::Until),
                (Some(_), _) => Some(RepeatMode::While),
                (None, false) => Some(RepeatMode::While),
                (None, true) => None,
            }
        });

        Ok(RepeatPolicy {
            repeat_mode: inferred,
            limit: raw.limit,
            interval_sec: raw.interval_sec,
            backoff: raw.backoff,
            max_interval_sec: raw.max_interval_sec,
            condition: raw.condition,
            exit_code: raw.exit_code,
        })
    }
}

/// Policy allowing the scheduler to treat a failed or skipped step as
/// proceedable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ContinueOn {
    pub failure: bool,
    pub skipped: bool,
    pub exit_code: Vec<i32>,
    /// Stdout patterns; a `regexp:` prefix switches substring match to
    /// regex match.
    pub output: Vec<String>,
    /// Re-classify a continued failure as success for aggregation.
    pub mark_success: bool,
}

impl ContinueOn {
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.failure
            || self.skipped
            || !self.exit_code.is_empty()
            || !self.output.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_follows_backoff_curve() {
        let policy = RetryPolicy {
            limit: 5,
            interval_sec: 1.0,
            backoff: 2.0,
            max_interval_sec: 5.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(4), Duration::from_secs(5));
    }

    #[test]
    fn retry_exit_code_filter() {
        let any = RetryPolicy {
            limit: 1,
            ..RetryPolicy::default()
        };
        assert!(any.should_retry(1));
        assert!(any.should_retry(127));
        assert!(!any.should_retry(0));

        let filtered = RetryPolicy {
            limit: 1,
            exit_codes: vec![42, 43],
            ..RetryPolicy::default()
        };
        assert!(filtered.should_retry(42));
        assert!(!filtered.should_retry(1));
    }

    #[test]
    fn legacy_repeat_true_maps_to_while() {
        let policy: RepeatPolicy = serde_json::from_str(r#"{"repeat": true}"#).unwrap();
        assert_eq!(policy.repeat_mode, Some(RepeatMode::While));
    }

    #[test]
    fn legacy_repeat_false_with_expected_condition_maps_to_until() {
        let policy: RepeatPolicy = serde_json::from_str(
            r#"{"repeat": false, "condition": {"condition": "echo state", "expected": "done"}}"#,
        )
        .unwrap();
        assert_eq!(policy.repeat_mode, Some(RepeatMode::Until));
    }

    #[test]
    fn bare_condition_or_exit_codes_map_to_while() {
        let policy: RepeatPolicy =
            serde_json::from_str(r#"{"condition": {"condition": "check"}}"#).unwrap();
        assert_eq!(policy.repeat_mode, Some(RepeatMode::While));

        let policy: RepeatPolicy = serde_json::from_str(r#"{"exitCode": [1]}"#).unwrap();
        assert_eq!(policy.repeat_mode, Some(RepeatMode::While));
    }

    #[test]
    fn no_hints_means_no_repeat() {
        let policy: RepeatPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy.repeat_mode, None);
        assert!(!policy.enabled());
    }

    #[test]
    fn explicit_mode_wins_over_inference() {
        let policy: RepeatPolicy = serde_json::from_str(
            r#"{"repeatMode": "while", "condition": {"condition": "c", "expected": "x"}}"#,
        )
        .unwrap();
        assert_eq!(policy.repeat_mode, Some(RepeatMode::While));
    }

    #[test]
    fn continue_on_is_set() {
        assert!(!ContinueOn::default().is_set());
        let continue_on = ContinueOn {
            exit_code: vec![2],
            ..ContinueOn::default()
        };
        assert!(continue_on.is_set());
    }
}
