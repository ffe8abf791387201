//! Size-string parsing (§4.2.3) and size bucketing (§4.2.4).

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::OnceLock;

/// Parses a human-readable size string ("1 KiB", "100 MB", "1024") into a
/// byte count.
///
/// Disambiguation rule: a unit token containing `i` (case-insensitively) is
/// binary (powers of 1024); otherwise it's decimal (powers of 1000). An
/// unrecognized unit letter is treated as bytes of the numeric portion.
/// Unparseable input returns 0.
pub fn parse_size_to_bytes(input: &str) -> i64 {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return 0;
    }

    let value_str: String = trimmed.chars().filter(|c| c.is_ascii_digit() || *c == '.').collect();
    let unit_str: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_uppercase();

    let Ok(value) = value_str.parse::<f64>() else {
        return 0;
    };

    if unit_str.is_empty() || unit_str == "B" {
        return value as i64;
    }

    let binary = unit_str.contains('I');
    let prefix = unit_str.chars().next().unwrap_or('B');

    let exponent: u32 = match prefix {
        'K' => 1,
        'M' => 2,
        'G' => 3,
        'T' => 4,
        'P' => 5,
        'B' => 0,
        _ => return value as i64, // unknown unit: numeric portion as bytes
    };

    let base: f64 = if binary { 1024.0 } else { 1000.0 };
    (value * base.powi(exponent as i32)) as i64
}

/// Pre-computed size bucket thresholds, smallest first. The label for a size
/// `s` is the first threshold strictly greater than `s`; anything at or
/// above the last threshold is `"> 1 MB"`.
const SIZE_BUCKET_THRESHOLDS: &[(i64, &str)] = &[
    (1024, "< 1 KB"),
    (4096, "1-4 KB"),
    (16384, "4-16 KB"),
    (65536, "16-64 KB"),
    (262144, "64-256 KB"),
    (1_048_576, "256 KB - 1 MB"),
];

const SIZE_BUCKET_CACHE_CAP: usize = 10_000;

fn bucket_cache() -> &'static Mutex<HashMap<i64, &'static str>> {
    static CACHE: OnceLock<Mutex<HashMap<i64, &'static str>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Classifies a byte count into one of the fixed size buckets, memoizing the
/// result. Negative sizes clamp to `"< 1 KB"` (§9 Open Question resolution).
pub fn get_size_bucket(size_in_bytes: i64) -> &'static str {
    if size_in_bytes < 0 {
        return "< 1 KB";
    }

    let cache = bucket_cache();
    if let Some(found) = cache.lock().unwrap().get(&size_in_bytes) {
        return found;
    }

    let bucket = SIZE_BUCKET_THRESHOLDS
        .iter()
        .find(|(threshold, _)| size_in_bytes < *threshold)
        .map(|(_, label)| *label)
        .unwrap_or("> 1 MB");

    let mut guard = cache.lock().unwrap();
    if guard.len() < SIZE_BUCKET_CACHE_CAP {
        guard.insert(size_in_bytes, bucket);
    }
    bucket
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_units_are_powers_of_1024() {
        assert_eq!(parse_size_to_bytes("1 KiB"), 1024);
        assert_eq!(parse_size_to_bytes("1 MiB"), 1024 * 1024);
        assert_eq!(parse_size_to_bytes("1 GiB"), 1024 * 1024 * 1024);
        assert_eq!(parse_size_to_bytes("1 TiB"), 1024_i64.pow(4));
    }

    #[test]
    fn decimal_units_are_powers_of_1000() {
        assert_eq!(parse_size_to_bytes("1 KB"), 1000);
        assert_eq!(parse_size_to_bytes("100 MB"), 100_000_000);
    }

    #[test]
    fn bare_number_is_bytes() {
        assert_eq!(parse_size_to_bytes("1024"), 1024);
    }

    #[test]
    fn invalid_input_is_zero() {
        assert_eq!(parse_size_to_bytes("garbage"), 0);
        assert_eq!(parse_size_to_bytes(""), 0);
    }

    #[test]
    fn bucket_boundaries() {
        assert_eq!(get_size_bucket(1023), "< 1 KB");
        assert_eq!(get_size_bucket(1024), "1-4 KB");
        assert_eq!(get_size_bucket(1_048_575), "256 KB - 1 MB");
        assert_eq!(get_size_bucket(1_048_576), "> 1 MB");
    }

    #[test]
    fn negative_size_clamps_to_smallest_bucket() {
        assert_eq!(get_size_bucket(-5), "< 1 KB");
    }
}
