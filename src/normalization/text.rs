//! String rules shared by the extractor, merger and writer.

/// Trimmed, non-empty copy of `raw`.
pub fn normalize_string(raw: Option<&str>) -> Option<String> {
    let trimmed = raw?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Upper-cased trimmed code, `None` when blank. Used for stored codes
/// (series, products, pedigree references).
pub fn normalize_code(raw: Option<&str>) -> Option<String> {
    normalize_string(raw).map(|s| s.to_uppercase())
}

/// Comparison key for codes. Two codes refer to the same animal when their
/// keys are equal; the original spelling is never replaced by the key in
/// exported data.
pub fn code_key(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// `male` / `female`, anything else becomes `None`.
pub fn normalize_sex(raw: Option<&str>) -> Option<String> {
    let lower = normalize_string(raw)?.to_lowercase();
    match lower.as_str() {
        "male" | "female" => Some(lower),
        _ => None,
    }
}

/// Character-boundary safe truncation.
pub fn truncate_chars(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

/// Upper-case, collapse every run of non `[A-Z0-9]` into one dash, strip
/// leading/trailing dashes and cap at 96 chars.
pub fn sanitize_code_fragment(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut pending_dash = false;
    for ch in value.chars().flat_map(char::to_uppercase) {
        if ch.is_ascii_uppercase() || ch.is_ascii_digit() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch);
        } else {
            pending_dash = true;
        }
    }
    truncate_chars(&out, 96).trim_end_matches('-').to_string()
}

const KNOWN_EVENT_TYPES: [&str; 3] = ["mating", "egg", "change_mate"];

/// Lower-cased event type; unknown types are kept (truncated to 40 chars),
/// blanks become `legacy_event`.
pub fn normalize_event_type(raw: Option<&str>) -> String {
    let Some(lower) = normalize_string(raw).map(|s| s.to_lowercase()) else {
        return "legacy_event".to_string();
    };
    if KNOWN_EVENT_TYPES.contains(&lower.as_str()) {
        return lower;
    }
    truncate_chars(&lower, 40)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_compare_case_insensitively_after_trim() {
        assert_eq!(code_key("  gh-f02 "), code_key("GH-F02"));
        assert_eq!(normalize_code(Some(" gh-f02")), Some("GH-F02".to_string()));
        assert_eq!(normalize_code(Some("   ")), None);
        assert_eq!(normalize_code(None), None);
    }

    #[test]
    fn sex_only_accepts_two_values() {
        assert_eq!(normalize_sex(Some(" Male ")), Some("male".into()));
        assert_eq!(normalize_sex(Some("FEMALE")), Some("female".into()));
        assert_eq!(normalize_sex(Some("unknown")), None);
        assert_eq!(normalize_sex(Some("")), None);
    }

    #[test]
    fn sanitizes_series_names() {
        assert_eq!(sanitize_code_fragment("Golden head / 2024"), "GOLDEN-HEAD-2024");
        assert_eq!(sanitize_code_fragment("--abc--"), "ABC");
        assert_eq!(sanitize_code_fragment("金头"), "");
        assert_eq!(sanitize_code_fragment(&"x".repeat(200)).len(), 96);
    }

    #[test]
    fn event_types() {
        assert_eq!(normalize_event_type(Some("Mating")), "mating");
        assert_eq!(normalize_event_type(Some("CHANGE_MATE")), "change_mate");
        assert_eq!(normalize_event_type(None), "legacy_event");
        assert_eq!(normalize_event_type(Some("  ")), "legacy_event");
        assert_eq!(normalize_event_type(Some(&"Z".repeat(60))).len(), 40);
    }
}
