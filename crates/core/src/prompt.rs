//! Positive-prompt rendering, normalization, fingerprinting, and seed
//! derivation.
//!
//! The fingerprint is computed over a whitespace/comma-normalized form of
//! the prompt so that cosmetic edits to a tag file do not invalidate
//! resumable work. Seeds are derived deterministically from the base seed
//! and the grid coordinate.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::CoreError;
use crate::hashing::sha256_hex;
use crate::tags::XRow;

/// Upper bound (exclusive) for derived sampler seeds.
pub const MAX_SEED: u64 = 18_446_744_073_709_519_872;

/// Canonical segment order of the positive prompt.
pub const PROMPT_SEGMENT_ORDER: [&str; 7] = [
    "gender",
    "characters",
    "series",
    "rating",
    "y",
    "general",
    "quality",
];

/// Default prompt template: every segment, canonical order.
pub const DEFAULT_TEMPLATE: &str = "{gender}{characters}{series}{rating}{y}{general}{quality}";

static TEMPLATE_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([a-z_]+)\}").expect("template token regex"));
static WHITESPACE_RUN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex"));
static COMMA_SPACING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*,\s*").expect("comma spacing regex"));

/// Render the positive prompt in canonical segment order.
///
/// Each segment is trimmed, skipped when empty, and terminated with a
/// comma before concatenation.
pub fn render_positive_prompt(x_row: &XRow, y_value: &str) -> String {
    let mut rendered = String::new();
    for key in PROMPT_SEGMENT_ORDER {
        let segment = if key == "y" {
            y_value
        } else {
            x_row.segment(key).unwrap_or("")
        };
        push_segment(&mut rendered, segment);
    }
    rendered
}

/// Render the positive prompt through a user-supplied template.
///
/// The template may only consist of `{placeholder}` tokens drawn from the
/// canonical segment set; any other character (or an unknown placeholder)
/// is a validation error. The default template short-circuits to
/// [`render_positive_prompt`].
pub fn render_prompt_by_template(
    template: &str,
    x_row: &XRow,
    y_value: &str,
) -> Result<String, CoreError> {
    if template == DEFAULT_TEMPLATE {
        return Ok(render_positive_prompt(x_row, y_value));
    }

    let stripped = TEMPLATE_TOKEN_RE.replace_all(template, "");
    if !stripped.trim().is_empty() {
        return Err(CoreError::Validation(format!(
            "template may only contain placeholder tokens, e.g. {{gender}}{{y}}{{quality}}: {template}"
        )));
    }

    let mut rendered = String::new();
    for capture in TEMPLATE_TOKEN_RE.captures_iter(template) {
        let key = &capture[1];
        let segment = if key == "y" {
            y_value
        } else {
            x_row.segment(key).ok_or_else(|| {
                CoreError::Validation(format!("template contains unknown placeholder: {{{key}}}"))
            })?
        };
        push_segment(&mut rendered, segment);
    }
    Ok(rendered)
}

fn push_segment(rendered: &mut String, segment: &str) {
    let trimmed = segment.trim();
    if trimmed.is_empty() {
        return;
    }
    rendered.push_str(trimmed);
    if !trimmed.ends_with(',') {
        rendered.push(',');
    }
}

/// Normalize a prompt for fingerprinting: trim, collapse whitespace runs
/// to single spaces, and normalize comma spacing to `", "`.
pub fn normalize_prompt(prompt: &str) -> String {
    let collapsed = WHITESPACE_RUN_RE.replace_all(prompt.trim(), " ");
    COMMA_SPACING_RE.replace_all(&collapsed, ", ").into_owned()
}

/// SHA-256 hex fingerprint of the normalized prompt.
pub fn compute_prompt_hash(prompt: &str) -> String {
    sha256_hex(normalize_prompt(prompt).as_bytes())
}

/// Derive the sampler seed for one grid cell.
///
/// `sha256("{base_seed}:{x}:{y}")`, first 16 hex digits as an integer,
/// reduced modulo [`MAX_SEED`]. Pure: identical inputs always produce
/// identical seeds.
pub fn derive_seed(base_seed: u64, x_index: usize, y_index: usize) -> u64 {
    let digest = sha256_hex(format!("{base_seed}:{x_index}:{y_index}").as_bytes());
    let raw = u64::from_str_radix(&digest[..16], 16).expect("sha256 digest is valid hex");
    raw % MAX_SEED
}
