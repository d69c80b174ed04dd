//! Parsing of retention interval strings like `"minute"` or `"3 years"`.

use chrono::Duration;

use crate::error::{codes, ErrorKind, SundialError, SundialResult};

/// Returns the duration of a single unit, without any multiplier applied.
///
/// Month and year are fixed at 30 and 365 days; retention buckets do not
/// track calendar boundaries.
fn unit_duration(unit: &str) -> Option<Duration> {
    Some(match unit {
        "second" => Duration::seconds(1),
        "minute" => Duration::minutes(1),
        "hour" => Duration::hours(1),
        "day" => Duration::days(1),
        "week" => Duration::weeks(1),
        "month" => Duration::days(30),
        "year" => Duration::days(365),
        _ => return None,
    })
}

fn invalid(interval: &str) -> Box<SundialError> {
    SundialError::new(
        ErrorKind::InvalidInput,
        "Could not parse interval, expected `[<count> ]<unit>` with a unit of second, minute, hour, day, week, month or year.",
    )
    .attach_context("interval", interval)
    .attach_error_code(codes::INVALID_INTERVAL)
}

/// Parses an interval string into a duration.
///
/// The grammar is `[<count> ]<unit>`, where the count defaults to `1` and the
/// unit accepts an optional plural `s`. Parsing is strict: an unknown unit or
/// a non-positive count is an error, it never falls back to a default
/// duration.
///
/// # Arguments
///
/// * `interval` - The interval string to parse.
///
/// # Errors
///
/// * If the unit is unknown or the count is not a positive integer.
pub fn parse_interval(interval: &str) -> SundialResult<Duration> {
    let trimmed = interval.trim();

    let (count, unit) = match trimmed.split_once(' ') {
        Some((count, unit)) => {
            let count: i64 = count.trim().parse().map_err(|_| invalid(interval))?;
            (count, unit.trim())
        }
        None => (1, trimmed),
    };

    if count < 1 {
        return Err(invalid(interval));
    }

    let unit = unit.strip_suffix('s').unwrap_or(unit);
    let duration = unit_duration(unit).ok_or_else(|| invalid(interval))?;

    duration
        .checked_mul(i32::try_from(count).map_err(|_| invalid(interval))?)
        .ok_or_else(|| invalid(interval))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("1 hour", Duration::hours(1))]
    #[case("minute", Duration::minutes(1))]
    #[case("3 years", Duration::days(3 * 365))]
    #[case("second", Duration::seconds(1))]
    #[case("10 minutes", Duration::minutes(10))]
    #[case("2 weeks", Duration::weeks(2))]
    #[case("month", Duration::days(30))]
    #[case(" day ", Duration::days(1))]
    #[case("hours", Duration::hours(1))]
    fn parses_valid_intervals(#[case] input: &str, #[case] expected: Duration) {
        assert_eq!(parse_interval(input).unwrap(), expected);
    }

    #[rstest]
    #[case("asdfadsf")]
    #[case("")]
    #[case("s")]
    #[case("0 hours")]
    #[case("-1 day")]
    #[case("1.5 hours")]
    #[case("two minutes")]
    #[case("5 fortnights")]
    fn rejects_invalid_intervals(#[case] input: &str) {
        let err = parse_interval(input).unwrap_err();
        assert!(err.is_code(crate::error::codes::INVALID_INTERVAL));
    }
}
