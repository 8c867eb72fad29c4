//! Compact duration strings for schedule windows
//!
//! Accepts one or more `<digits><unit>` groups where the unit is `m`
//! (minutes), `h` (hours) or `d` (days), e.g. `90m`, `1h30m`, `2d12h`.
//! Empty input, trailing digits without a unit, unknown units and
//! zero-sum values are all rejected.

use std::time::Duration;

use crate::error::{Error, Result};

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// Parse a compact duration string into a [`Duration`].
pub fn parse_duration(input: &str) -> Result<Duration> {
    if input.is_empty() {
        return Err(Error::Validation("empty duration".to_string()));
    }

    let mut total: u64 = 0;
    let mut digits = String::new();
    for ch in input.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        if digits.is_empty() {
            return Err(Error::Validation(format!(
                "invalid duration {input:?}: unit {ch:?} without a value"
            )));
        }
        let value: u64 = digits.parse().map_err(|_| {
            Error::Validation(format!("invalid duration {input:?}: value out of range"))
        })?;
        let unit = match ch {
            'm' => MINUTE,
            'h' => HOUR,
            'd' => DAY,
            other => {
                return Err(Error::Validation(format!(
                    "invalid duration {input:?}: unknown unit {other:?}"
                )))
            }
        };
        total = total.saturating_add(value.saturating_mul(unit));
        digits.clear();
    }

    if !digits.is_empty() {
        return Err(Error::Validation(format!(
            "invalid duration {input:?}: trailing value without a unit"
        )));
    }
    if total == 0 {
        return Err(Error::Validation(format!(
            "invalid duration {input:?}: must be greater than zero"
        )));
    }
    Ok(Duration::from_secs(total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_single_units() {
        assert_eq!(parse_duration("90m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
    }

    #[test]
    fn parses_compound_values() {
        assert_eq!(
            parse_duration("1h30m").unwrap(),
            Duration::from_secs(5400)
        );
        assert_eq!(
            parse_duration("2d12h").unwrap(),
            Duration::from_secs(2 * 86400 + 12 * 3600)
        );
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("90").is_err());
        assert!(parse_duration("m").is_err());
        assert!(parse_duration("10s").is_err());
        assert!(parse_duration("0m").is_err());
        assert!(parse_duration("0h0m").is_err());
    }

    proptest! {
        #[test]
        fn total_on_valid_grammar(groups in prop::collection::vec((1u64..1000, prop::sample::select(vec!['m', 'h', 'd'])), 1..4)) {
            let input: String = groups
                .iter()
                .map(|(n, u)| format!("{n}{u}"))
                .collect();
            let parsed = parse_duration(&input).unwrap();
            prop_assert!(parsed > Duration::ZERO);
        }

        #[test]
        fn never_panics(input in ".*") {
            let _ = parse_duration(&input);
        }
    }
}
