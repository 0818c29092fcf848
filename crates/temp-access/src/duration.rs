//! Parsing of expiration literals such as `15m`, `1h` or `1h30m`.

use chrono::Duration;

use crate::error::{AccessError, Result};

/// Parses a duration literal made of one or more `<integer><unit>` segments.
///
/// Units are `h`, `m` and `s`. A bare number, a sign, a fraction or an
/// unknown unit is rejected.
///
/// # Errors
///
/// Returns [`AccessError::InvalidDuration`] if the literal does not follow
/// the grammar or overflows.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let invalid = |reason: String| AccessError::InvalidDuration {
        input: input.to_string(),
        reason,
    };

    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(invalid("empty duration".to_string()));
    }

    let mut total_seconds: i64 = 0;
    let mut current_num = String::new();

    for c in trimmed.chars() {
        if c.is_ascii_digit() {
            current_num.push(c);
            continue;
        }

        if current_num.is_empty() {
            return Err(invalid(format!("expected a number before '{c}'")));
        }
        let num: i64 = current_num
            .parse()
            .map_err(|_| invalid(format!("number {current_num} is too large")))?;
        current_num.clear();

        let unit_seconds = match c {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            _ => return Err(invalid(format!("unknown unit '{c}'"))),
        };

        total_seconds = num
            .checked_mul(unit_seconds)
            .and_then(|secs| total_seconds.checked_add(secs))
            .ok_or_else(|| invalid("duration overflows".to_string()))?;
    }

    if !current_num.is_empty() {
        return Err(invalid(format!("missing unit after {current_num}")));
    }

    Duration::try_seconds(total_seconds).ok_or_else(|| invalid("duration overflows".to_string()))
}

/// Renders a duration back into the shortest `h`/`m`/`s` literal.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let mut secs = duration.num_seconds();
    if secs <= 0 {
        return "0s".to_string();
    }

    let mut out = String::new();
    for (unit, size) in [('h', 3600), ('m', 60), ('s', 1)] {
        if secs >= size {
            out.push_str(&format!("{}{unit}", secs / size));
            secs %= size;
        }
    }
    out
}
