//! Duration string parsing.
//!
//! Accepts the same grammar as the stdlib duration strings this format was
//! borrowed from: a sequence of `<number><unit>` pairs (`"1h30m"`,
//! `"500ms"`, `"5s"`), where unit is one of `ns`, `us`/`µs`, `ms`, `s`, `m`,
//! `h`. An empty string parses to a zero duration (B1).

use std::time::Duration;

use crate::error::{Error, Result};

pub fn parse_duration(input: &str) -> Result<Duration> {
    if input.is_empty() {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    let mut saw_component = false;

    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| Error::Template(format!("malformed duration {input:?}")))?;
        if digits_end == 0 {
            return Err(Error::Template(format!("malformed duration {input:?}")));
        }
        let (number, tail) = rest.split_at(digits_end);
        let value: f64 = number
            .parse()
            .map_err(|_| Error::Template(format!("malformed duration {input:?}")))?;

        let (unit, tail) = split_unit(tail)
            .ok_or_else(|| Error::Template(format!("unknown duration unit in {input:?}")))?;

        let nanos_per_unit: f64 = match unit {
            "ns" => 1.0,
            "us" | "\u{b5}s" => 1_000.0,
            "ms" => 1_000_000.0,
            "s" => 1_000_000_000.0,
            "m" => 60.0 * 1_000_000_000.0,
            "h" => 3_600.0 * 1_000_000_000.0,
            other => {
                return Err(Error::Template(format!(
                    "unknown duration unit {other:?} in {input:?}"
                )));
            }
        };

        total += Duration::from_nanos((value * nanos_per_unit).round() as u64);
        saw_component = true;
        rest = tail;
    }

    if !saw_component {
        return Err(Error::Template(format!("malformed duration {input:?}")));
    }
    Ok(total)
}

/// Splits the longest known unit prefix off the front of `s`.
fn split_unit(s: &str) -> Option<(&str, &str)> {
    const UNITS: &[&str] = &["ns", "us", "\u{b5}s", "ms", "s", "m", "h"];
    UNITS
        .iter()
        .filter(|u| s.starts_with(**u))
        .max_by_key(|u| u.len())
        .map(|u| s.split_at(u.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_is_zero() {
        assert_eq!(parse_duration("").unwrap(), Duration::ZERO);
    }

    #[test]
    fn simple_units() {
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_duration("200ms").unwrap(), Duration::from_millis(200));
    }

    #[test]
    fn compound_duration() {
        assert_eq!(
            parse_duration("1h30m").unwrap(),
            Duration::from_secs(3600 + 30 * 60)
        );
    }

    #[test]
    fn rejects_unknown_unit() {
        assert!(parse_duration("5x").is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_duration("abc").is_err());
    }
}
