//! Parsing of Go-style duration strings (`10s`, `250ms`, `1h30m`), the
//! format used by the mesh's timeout and retry annotations.

use std::time::Duration;

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ParseError {
    #[error("invalid unit: {}", EXPECTED_UNITS)]
    InvalidUnit,

    #[error("missing a unit: {}", EXPECTED_UNITS)]
    NoUnit,

    #[error("invalid floating-point number: {}", .0)]
    NotANumber(#[from] std::num::ParseFloatError),

    #[error("durations must not be negative")]
    Negative,
}

const EXPECTED_UNITS: &str = "expected one of 'ns', 'us', '\u{00b5}s', 'ms', 's', 'm', or 'h'";

/// Parses a duration in the format accepted by Go's `time.ParseDuration`: a
/// sequence of decimal numbers with optional fractions, each followed by a
/// unit suffix. Negative durations are rejected.
pub fn parse(mut s: &str) -> Result<Duration, ParseError> {
    fn duration_from_units(val: f64, unit: &str) -> Result<Duration, ParseError> {
        const MINUTE: Duration = Duration::from_secs(60);
        let base = match unit {
            "ns" => Duration::from_nanos(1),
            // U+00B5 is the "micro sign" while U+03BC is "Greek letter mu"
            "us" | "\u{00b5}s" | "\u{03bc}s" => Duration::from_micros(1),
            "ms" => Duration::from_millis(1),
            "s" => Duration::from_secs(1),
            "m" => MINUTE,
            "h" => MINUTE * 60,
            _ => return Err(ParseError::InvalidUnit),
        };
        Ok(base.mul_f64(val))
    }

    if s.starts_with('-') {
        return Err(ParseError::Negative);
    }
    s = s.trim_start_matches('+');

    let mut total = Duration::from_secs(0);
    while !s.is_empty() {
        if let Some(unit_start) = s.find(|c: char| c.is_alphabetic()) {
            let (val, rest) = s.split_at(unit_start);
            let val = val.parse::<f64>()?;
            let unit = if let Some(next_numeric_start) = rest.find(|c: char| !c.is_alphabetic()) {
                let (unit, rest) = rest.split_at(next_numeric_start);
                s = rest;
                unit
            } else {
                s = "";
                rest
            };
            total += duration_from_units(val, unit)?;
        } else if s == "0" {
            return Ok(Duration::from_secs(0));
        } else {
            return Err(ParseError::NoUnit);
        }
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_go_format() {
        const MINUTE: Duration = Duration::from_secs(60);
        const HOUR: Duration = Duration::from_secs(60 * 60);

        let cases: &[(&str, Duration)] = &[
            ("0", Duration::from_secs(0)),
            ("5s", Duration::from_secs(5)),
            ("30s", Duration::from_secs(30)),
            ("1478s", Duration::from_secs(1478)),
            ("+5s", Duration::from_secs(5)),
            ("5.6s", Duration::from_secs(5) + Duration::from_millis(600)),
            ("5.s", Duration::from_secs(5)),
            (".5s", Duration::from_millis(500)),
            ("1.004s", Duration::from_secs(1) + Duration::from_millis(4)),
            ("10ns", Duration::from_nanos(10)),
            ("11us", Duration::from_micros(11)),
            ("12µs", Duration::from_micros(12)),
            ("13ms", Duration::from_millis(13)),
            ("15m", 15 * MINUTE),
            ("16h", 16 * HOUR),
            ("3h30m", 3 * HOUR + 30 * MINUTE),
            (
                "10.5s4m",
                4 * MINUTE + Duration::from_secs(10) + Duration::from_millis(500),
            ),
            (
                "1h2m3s4ms5us6ns",
                HOUR + 2 * MINUTE
                    + Duration::from_secs(3)
                    + Duration::from_millis(4)
                    + Duration::from_micros(5)
                    + Duration::from_nanos(6),
            ),
            ("52763797000ns", Duration::from_nanos(52763797000)),
            ("0.3333333333333333333h", 20 * MINUTE),
        ];

        for (input, expected) in cases {
            let parsed = parse(input).unwrap();
            assert_eq!(parsed, *expected, "{input}");
        }
    }

    #[test]
    fn rejects_negative() {
        assert_eq!(parse("-5s"), Err(ParseError::Negative));
        assert_eq!(parse("-0"), Err(ParseError::Negative));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse("10"), Err(ParseError::NoUnit));
        assert_eq!(parse("10y"), Err(ParseError::InvalidUnit));
        assert!(matches!(parse("xs"), Err(ParseError::NotANumber(_))));
    }
}
