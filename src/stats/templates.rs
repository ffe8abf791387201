//! Error-template compression (§4.5): collapses `error_reason` strings that
//! differ only in an embedded IP address or number into one template, so
//! the dashboard can show "context canceled near 1.2.3.(1..40)" instead of
//! forty nearly-identical rows.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

fn ip_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b").unwrap())
}

fn numeric_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").unwrap())
}

/// Replaces every IP-like or numeric token with `#`, yielding a template
/// key that groups similar error reasons together.
pub fn template_key(reason: &str) -> String {
    let without_ips = ip_pattern().replace_all(reason, "#");
    numeric_pattern().replace_all(&without_ips, "#").into_owned()
}

#[derive(Debug, Clone, Default)]
enum Observed {
    #[default]
    None,
    Addresses(std::collections::BTreeSet<String>),
    Numbers {
        min: i64,
        max: i64,
    },
}

#[derive(Debug, Default)]
struct TemplateEntry {
    count: u64,
    observed: Observed,
}

/// Tracks occurrence counts and the concrete values seen per error
/// template, rendering the top N on demand.
#[derive(Debug, Default)]
pub struct ErrorTemplateTracker {
    entries: HashMap<String, TemplateEntry>,
}

impl ErrorTemplateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, reason: &str) {
        let key = template_key(reason);
        let entry = self.entries.entry(key).or_default();
        entry.count += 1;

        if let Some(ip) = ip_pattern().find(reason) {
            match &mut entry.observed {
                Observed::Addresses(set) => {
                    set.insert(ip.as_str().to_string());
                }
                _ => {
                    let mut set = std::collections::BTreeSet::new();
                    set.insert(ip.as_str().to_string());
                    entry.observed = Observed::Addresses(set);
                }
            }
        } else if let Some(num) = numeric_pattern().find(reason) {
            if let Ok(n) = num.as_str().parse::<i64>() {
                match &mut entry.observed {
                    Observed::Numbers { min, max } => {
                        *min = (*min).min(n);
                        *max = (*max).max(n);
                    }
                    _ => entry.observed = Observed::Numbers { min: n, max: n },
                }
            }
        }
    }

    /// Renders the top `limit` templates by occurrence, most frequent first.
    pub fn top(&self, limit: usize) -> Vec<String> {
        let mut entries: Vec<(&String, &TemplateEntry)> = self.entries.iter().collect();
        entries.sort_by(|a, b| b.1.count.cmp(&a.1.count));
        entries
            .into_iter()
            .take(limit)
            .map(|(key, entry)| {
                let detail = match &entry.observed {
                    Observed::None => String::new(),
                    Observed::Addresses(set) if set.len() == 1 => {
                        format!(" [{}]", set.iter().next().unwrap())
                    }
                    Observed::Addresses(set) => format!(" [{} unique addresses]", set.len()),
                    Observed::Numbers { min, max } if min == max => format!(" ({min})"),
                    Observed::Numbers { min, max } => format!(" ({min}..{max})"),
                };
                format!("{key}{detail} x{}", entry.count)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_addresses_collapse_to_one_template() {
        let key1 = template_key("dial tcp 1.2.3.4:28967: connect: connection refused");
        let key2 = template_key("dial tcp 1.2.3.99:28967: connect: connection refused");
        assert_eq!(key1, key2);
    }

    #[test]
    fn numeric_tokens_collapse() {
        let key1 = template_key("context deadline exceeded after 30 retries");
        let key2 = template_key("context deadline exceeded after 12 retries");
        assert_eq!(key1, key2);
    }

    #[test]
    fn top_orders_by_frequency() {
        let mut tracker = ErrorTemplateTracker::new();
        for _ in 0..5 {
            tracker.record("context canceled");
        }
        tracker.record("unknown error");
        let top = tracker.top(1);
        assert_eq!(top.len(), 1);
        assert!(top[0].starts_with("context canceled"));
        assert!(top[0].ends_with("x5"));
    }

    #[test]
    fn tracks_numeric_range_across_observations() {
        let mut tracker = ErrorTemplateTracker::new();
        tracker.record("retry in 3 seconds");
        tracker.record("retry in 45 seconds");
        let top = tracker.top(1);
        assert!(top[0].contains("(3..45)"));
    }
}
