//! Minimal query-string parsing shared by the HTTP surfaces.

use std::collections::HashMap;

/// Splits a raw query string into key/value pairs. A key without `=` maps to
/// an empty value, so flag-style parameters (`?sizeonly`) are plain lookups.
pub(crate) fn parse_query(raw: &str) -> HashMap<String, String> {
    let mut query = HashMap::new();
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        query.insert(key.to_string(), value.to_string());
    }
    query
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pairs_and_flags() {
        let query = parse_query("codename=alpha&confirm&port=9000");
        assert_eq!(query.get("codename").map(String::as_str), Some("alpha"));
        assert_eq!(query.get("confirm").map(String::as_str), Some(""));
        assert_eq!(query.get("port").map(String::as_str), Some("9000"));
        assert!(!query.contains_key("absent"));
    }

    #[test]
    fn empty_query_yields_empty_map() {
        assert!(parse_query("").is_empty());
    }
}
