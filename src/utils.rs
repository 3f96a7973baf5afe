/// Joins the non-empty parts with `separator`.
pub fn combine<'a>(separator: &str, parts: impl IntoIterator<Item = &'a str>) -> String {
    parts
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(separator)
}

/// Wraps `value` in `prefix`/`suffix`, or yields an empty string for an empty value.
pub fn surround(prefix: &str, value: &str, suffix: &str) -> String {
    if value.trim().is_empty() {
        String::new()
    } else {
        format!("{}{}{}", prefix, value, suffix)
    }
}

/// Compares dotted numeric versions (`1.2.10` > `1.2.9`). Non-numeric segments count as zero.
pub fn is_newer_version(candidate: &str, current: &str) -> bool {
    fn parts(v: &str) -> Vec<u64> {
        v.trim()
            .trim_start_matches('v')
            .split(['.', '-', '+'])
            .take(3)
            .map(|p| p.parse::<u64>().unwrap_or(0))
            .collect()
    }
    let (mut a, mut b) = (parts(candidate), parts(current));
    let len = a.len().max(b.len());
    a.resize(len, 0);
    b.resize(len, 0);
    a > b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_skips_empty_parts() {
        assert_eq!(combine(": ", ["Office", "", "ON"]), "Office: ON");
        assert_eq!(combine(" ", ["", " "]), "");
    }

    #[test]
    fn surround_only_non_empty() {
        assert_eq!(surround("[", "EC1 5", "]"), "[EC1 5]");
        assert_eq!(surround("[", "", "]"), "");
    }

    #[test]
    fn version_ordering_is_numeric() {
        assert!(is_newer_version("1.2.10", "1.2.9"));
        assert!(is_newer_version("v0.2.0", "0.1.7"));
        assert!(!is_newer_version("0.1.0", "0.1.0"));
        assert!(!is_newer_version("0.1", "0.1.0"));
        assert!(!is_newer_version("0.0.9", "0.1.0"));
    }
}
