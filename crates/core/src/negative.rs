//! Negative-prompt composition.
//!
//! The base negative prompt (explicit override or workflow default) may
//! be extended with an "always append" suffix for specific row
//! categories. The suffix source distinguishes unset (use the default)
//! from set-but-empty (appending disabled).

/// Suffix appended when no override is configured.
pub const DEFAULT_APPEND_NEGATIVE: &str = "nsfw, nipples, pussy, nude,";

/// X-row `info.type` value that triggers the append suffix.
pub const APPEND_TRIGGER_INFO_TYPE: &str = "normal";

/// Join a base negative prompt with an append suffix.
///
/// Both sides are trimmed; leading commas/spaces on the suffix are
/// stripped. A base that already ends with a comma joins with a single
/// space, otherwise with `", "`.
pub fn append_negative_prompt(base: Option<&str>, append: Option<&str>) -> String {
    let base = base.unwrap_or("").trim();
    let append = append.unwrap_or("").trim();

    let strip_leading = |s: &str| s.trim_start_matches([',', ' ']).to_string();

    if base.is_empty() {
        return strip_leading(append);
    }
    if append.is_empty() {
        return base.to_string();
    }

    let cleaned = strip_leading(append);
    if cleaned.is_empty() {
        return base.to_string();
    }

    let delimiter = if base.ends_with(',') { " " } else { ", " };
    format!("{base}{delimiter}{cleaned}")
}

/// Resolve the configured append suffix.
///
/// `None` (unset) yields the default suffix; a blank value disables
/// appending; anything else is used trimmed.
pub fn resolve_append_negative(raw: Option<&str>) -> Option<String> {
    match raw {
        None => Some(DEFAULT_APPEND_NEGATIVE.to_string()),
        Some(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_base_returns_cleaned_suffix() {
        assert_eq!(append_negative_prompt(None, Some(", ,bad hands,")), "bad hands,");
        assert_eq!(append_negative_prompt(Some("  "), Some("bad hands")), "bad hands");
    }

    #[test]
    fn empty_suffix_returns_base() {
        assert_eq!(append_negative_prompt(Some("lowres,"), None), "lowres,");
        assert_eq!(append_negative_prompt(Some("lowres,"), Some("  ")), "lowres,");
    }

    #[test]
    fn suffix_of_only_commas_returns_base() {
        assert_eq!(append_negative_prompt(Some("lowres"), Some(", ,")), "lowres");
    }

    #[test]
    fn base_ending_with_comma_joins_with_space() {
        assert_eq!(
            append_negative_prompt(Some("lowres,"), Some("bad hands,")),
            "lowres, bad hands,"
        );
    }

    #[test]
    fn base_without_comma_joins_with_comma_space() {
        assert_eq!(
            append_negative_prompt(Some("lowres"), Some("bad hands")),
            "lowres, bad hands"
        );
    }

    #[test]
    fn unset_suffix_resolves_to_default() {
        assert_eq!(
            resolve_append_negative(None).as_deref(),
            Some(DEFAULT_APPEND_NEGATIVE)
        );
    }

    #[test]
    fn blank_suffix_disables_appending() {
        assert_eq!(resolve_append_negative(Some("   ")), None);
        assert_eq!(resolve_append_negative(Some("")), None);
    }

    #[test]
    fn explicit_suffix_is_trimmed() {
        assert_eq!(
            resolve_append_negative(Some("  extra,  ")).as_deref(),
            Some("extra,")
        );
    }
}
