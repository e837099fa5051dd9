//! Time literal helpers
//!
//! A RillQL time literal is a run of `<amount> <unit>` components in any
//! order; the builder sums them into a single millisecond value. Amounts
//! may carry the long suffix (`5L min`).

/// Millisecond multiplier for a time unit spelling, or `None` for an
/// unknown unit. Months are 30 days, years 365 days.
pub fn unit_to_millis(unit: &str) -> Option<i64> {
    let millis = match unit.to_ascii_lowercase().as_str() {
        "millisec" | "millisecond" | "milliseconds" => 1,
        "sec" | "second" | "seconds" => 1_000,
        "min" | "minute" | "minutes" => 60_000,
        "hour" | "hours" => 3_600_000,
        "day" | "days" => 86_400_000,
        "week" | "weeks" => 604_800_000,
        "month" | "months" => 2_592_000_000,
        "year" | "years" => 31_536_000_000,
        _ => return None,
    };
    Some(millis)
}

/// Strip a trailing `l`/`L` long suffix from a numeric literal.
pub fn strip_long_suffix(text: &str) -> &str {
    text.strip_suffix(['l', 'L']).unwrap_or(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_multipliers() {
        assert_eq!(unit_to_millis("sec"), Some(1_000));
        assert_eq!(unit_to_millis("Minutes"), Some(60_000));
        assert_eq!(unit_to_millis("hour"), Some(3_600_000));
        assert_eq!(unit_to_millis("week"), Some(604_800_000));
        assert_eq!(unit_to_millis("year"), Some(31_536_000_000));
        assert_eq!(unit_to_millis("fortnight"), None);
    }

    #[test]
    fn long_suffix() {
        assert_eq!(strip_long_suffix("42L"), "42");
        assert_eq!(strip_long_suffix("42l"), "42");
        assert_eq!(strip_long_suffix("42"), "42");
    }
}
