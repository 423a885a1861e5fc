//! Dotted-key filter matching with `*` (single-segment) and `>` (tail)
//! wildcards.

/// Returns `true` if `key` (a dotted attribute name) matches `filter`.
///
/// Both are split on `.`; the shorter of the two is conceptually padded with
/// empty segments so the walk always compares `len = max(key_segs,
/// filter_segs)` positions. `>` matches immediately (it must be the last
/// meaningful segment to matter, but nothing after it is inspected either
/// way). `*` matches exactly one segment. A literal segment must equal the
/// corresponding key segment. An empty filter or empty key never matches.
pub fn matches(key: &str, filter: &str) -> bool {
    if key.is_empty() || filter.is_empty() {
        return false;
    }

    let key_segs: Vec<&str> = key.split('.').collect();
    let filter_segs: Vec<&str> = filter.split('.').collect();
    let len = key_segs.len().max(filter_segs.len());

    for i in 0..len {
        let f = filter_segs.get(i).copied().unwrap_or("");
        if f == ">" {
            return true;
        }
        if f == "*" {
            continue;
        }
        let k = key_segs.get(i).copied().unwrap_or("");
        if f != k {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_wildcard_matches_everything_remaining() {
        assert!(matches("a.b.c", ">"));
        assert!(matches("a.b.c.d", "a.>"));
    }

    #[test]
    fn single_segment_wildcard_skips_one_segment() {
        assert!(matches("a.b.c", "a.*.c"));
        assert!(!matches("a.b.c.d", "a.*.c"));
    }

    #[test]
    fn shorter_key_does_not_match_longer_literal_filter() {
        assert!(!matches("a.b", "a.b.c"));
    }

    #[test]
    fn literal_mismatch_fails() {
        assert!(!matches("led.0", "gpio.0"));
    }

    #[test]
    fn exact_literal_match() {
        assert!(matches("led.0", "led.0"));
    }

    #[test]
    fn empty_filter_or_key_never_matches() {
        assert!(!matches("", ">"));
        assert!(!matches("a.b", ""));
        assert!(!matches("", ""));
    }

    #[test]
    fn bare_tail_wildcard_matches_any_nonempty_key() {
        assert!(matches("x", ">"));
        assert!(matches("a.b.c.d.e", ">"));
    }

    #[test]
    fn subscription_scoped_filter_used_by_fleet_bus() {
        // Bus keys are prefixed `<device_id>.<attr>`.
        assert!(matches("esp-7fe02c.led.0", "esp-7fe02c.led.0"));
        assert!(matches("esp-7fe02c.led.0", "*.led.0"));
        assert!(matches("esp-7fe02c.@event", "*.@event"));
    }
}
