//! Parses the compact `1h23m45s`-style duration strings the upstream's
//! video objects report (§3 VideoInfo, §8 testable property 7).

use tracker_core::error::Error;

/// Parses a duration string matching `(Nh)?(Nm)?(Ns)?` with at least one
/// component present, e.g. `"1h23m45s"`, `"45m"`, `"30s"`.
///
/// This is a bijection over that grammar: every string it accepts has a
/// canonical rendering (hours, then minutes, then seconds, each only
/// present when non-zero) and `render_duration` round-trips it.
pub fn parse_duration(raw: &str) -> Result<u64, Error> {
    let mut rest = raw;
    let mut seen_component = false;
    let mut total_secs: u64 = 0;

    for (unit, multiplier) in [('h', 3600u64), ('m', 60), ('s', 1)] {
        if let Some(idx) = rest.find(unit) {
            let (digits, remainder) = rest.split_at(idx);
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(malformed(raw));
            }
            let value: u64 = digits.parse().map_err(|_| malformed(raw))?;
            total_secs += value * multiplier;
            seen_component = true;
            rest = &remainder[1..];
        }
    }

    if !seen_component || !rest.is_empty() {
        return Err(malformed(raw));
    }

    Ok(total_secs)
}

/// Renders a whole-second duration back into the canonical `NhNmNs` form,
/// omitting any unit whose value is zero (except when the whole duration
/// is zero, which renders as `"0s"`).
pub fn render_duration(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if minutes > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    if seconds > 0 || out.is_empty() {
        out.push_str(&format!("{seconds}s"));
    }
    out
}

fn malformed(raw: &str) -> Error {
    Error::Internal {
        reason: format!("malformed duration string: {raw:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_form() {
        assert_eq!(parse_duration("1h23m45s").unwrap(), 3600 + 23 * 60 + 45);
    }

    #[test]
    fn parses_partial_forms() {
        assert_eq!(parse_duration("45m").unwrap(), 45 * 60);
        assert_eq!(parse_duration("30s").unwrap(), 30);
        assert_eq!(parse_duration("2h").unwrap(), 7200);
    }

    #[test]
    fn rejects_empty_and_componentless_strings() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
    }

    #[test]
    fn rejects_out_of_order_components() {
        assert!(parse_duration("45s1h").is_err());
    }

    #[test]
    fn round_trips_through_render() {
        for secs in [0u64, 1, 59, 60, 61, 3600, 3661, 86399] {
            let rendered = render_duration(secs);
            assert_eq!(parse_duration(&rendered).unwrap(), secs, "round-trip failed for {secs}");
        }
    }
}
