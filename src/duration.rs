use std::time::Duration;

use crate::error::{EngineError, Result};

/// Parses durations written the way blueprints write them: `50ms`, `2s`,
/// `1m30s`, `1h`, `1d`, or a bare integer number of milliseconds.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(EngineError::IllegalArgument("Duration must not be blank".into()));
    }
    if let Ok(ms) = s.parse::<u64>() {
        return Ok(Duration::from_millis(ms));
    }

    let invalid = || EngineError::IllegalArgument(format!("Invalid duration '{}'", input));
    let too_long = || EngineError::IllegalArgument(format!("Duration '{}' is out of range", input));
    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        rest = rest.trim_start();
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if digits == 0 {
            return Err(invalid());
        }
        let amount: f64 = rest[..digits].parse().map_err(|_| invalid())?;
        if !amount.is_finite() {
            return Err(invalid());
        }
        rest = rest[digits..].trim_start();

        let unit_len = rest
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let millis_per_unit = match unit {
            "ms" | "millis" | "milliseconds" => 1.0,
            "s" | "sec" | "secs" | "second" | "seconds" => 1_000.0,
            "m" | "min" | "mins" | "minute" | "minutes" => 60_000.0,
            "h" | "hr" | "hrs" | "hour" | "hours" => 3_600_000.0,
            "d" | "day" | "days" => 86_400_000.0,
            _ => return Err(invalid()),
        };
        let part = Duration::try_from_secs_f64(amount * millis_per_unit / 1_000.0)
            .map_err(|_| too_long())?;
        total = total.checked_add(part).ok_or_else(too_long)?;
    }
    Ok(total)
}

pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms % 1_000 != 0 || ms == 0 {
        format!("{}ms", ms)
    } else if ms % 60_000 != 0 {
        format!("{}s", ms / 1_000)
    } else {
        format!("{}m", ms / 60_000)
    }
}
