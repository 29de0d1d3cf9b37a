//! Human-readable durations for job timeouts.
//!
//! Accepts `<number><unit>` parts, optionally separated by whitespace, where
//! the unit is one of `h`, `m`, `s` (or none, meaning seconds): `"90"`,
//! `"10m"`, `"1h 30m"`, `"1h30m"`.

use crate::{ConfigError, ConfigResult};
use std::time::Duration;

pub fn parse_duration(input: &str) -> ConfigResult<Duration> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::invalid("timeout", "empty duration"));
    }

    let mut total = 0u64;
    for part in trimmed.split_whitespace() {
        let mut rest = part;
        while !rest.is_empty() {
            let digits_end = rest
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(rest.len());
            let unit_end = rest[digits_end..]
                .find(|c: char| c.is_ascii_digit())
                .map_or(rest.len(), |i| digits_end + i);
            let (digits, unit) = (&rest[..digits_end], &rest[digits_end..unit_end]);
            rest = &rest[unit_end..];

            let value: u64 = digits.parse().map_err(|_| {
                ConfigError::invalid("timeout", format!("invalid duration '{}'", input))
            })?;
            let multiplier = match unit {
                "" | "s" | "sec" => 1,
                "m" | "min" => 60,
                "h" | "hr" => 3600,
                other => {
                    return Err(ConfigError::invalid(
                        "timeout",
                        format!("unknown unit '{}' in '{}'", other, input),
                    ));
                }
            };
            total = value
                .checked_mul(multiplier)
                .and_then(|secs| total.checked_add(secs))
                .ok_or_else(|| {
                    ConfigError::invalid("timeout", format!("'{}' is too large", input))
                })?;
        }
    }

    Ok(Duration::from_secs(total))
}

/// Format a duration the way [`parse_duration`] reads it.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let mut parts = Vec::new();
    if h > 0 {
        parts.push(format!("{}h", h));
    }
    if m > 0 {
        parts.push(format!("{}m", m));
    }
    if s > 0 || parts.is_empty() {
        parts.push(format!("{}s", s));
    }
    parts.join(" ")
}
