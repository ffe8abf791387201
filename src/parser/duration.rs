//! Duration-string grammar: `(<num><unit>)+` with units `h`, `m`, `s`, `ms`.
//!
//! `ms` is tried before `m` in the alternation — `"500ms"` must not be read
//! as `"500m" + "s"`.

use std::sync::OnceLock;

use regex::Regex;

fn pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+\.?\d*)\s*(ms|h|m|s)").unwrap())
}

/// Parses a Go-style duration string such as `"1m37.535505102s"` into total
/// seconds. Falls back to parsing the whole string as a bare float (seconds)
/// when no unit suffix is found. Returns `None` for genuinely unparseable
/// input.
pub fn parse_duration_to_seconds(input: &str) -> Option<f64> {
    let input = input.trim();

    let mut total = 0.0_f64;
    let mut matched_any = false;
    for caps in pattern().captures_iter(input) {
        matched_any = true;
        let value: f64 = caps[1].parse().ok()?;
        total += match &caps[2] {
            "h" => value * 3600.0,
            "m" => value * 60.0,
            "s" => value,
            "ms" => value / 1000.0,
            _ => unreachable!("pattern only captures h|m|s|ms"),
        };
    }

    if matched_any {
        Some(total)
    } else {
        input.parse::<f64>().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_seconds_float() {
        assert_eq!(parse_duration_to_seconds("42.281"), Some(42.281));
    }

    #[test]
    fn minutes_and_seconds() {
        let got = parse_duration_to_seconds("1m37.535505102s").unwrap();
        assert!((got - 97.535505102).abs() < 1e-9);
    }

    #[test]
    fn milliseconds_before_minutes() {
        assert_eq!(parse_duration_to_seconds("500ms"), Some(0.5));
    }

    #[test]
    fn hours_minutes_seconds_milliseconds() {
        let got = parse_duration_to_seconds("2h15m30s500ms").unwrap();
        assert!((got - 8130.5).abs() < 1e-9);
    }

    #[test]
    fn unparseable_returns_none() {
        assert_eq!(parse_duration_to_seconds("not-a-duration"), None);
    }

    #[test]
    fn empty_string_returns_none() {
        assert_eq!(parse_duration_to_seconds(""), None);
    }
}
