//! Tag asset files for the X (subject) and Y (style) axes.
//!
//! Both axes are JSON documents of the form
//! `{"schema": "...", "items": [...]}` where each item carries weighted
//! tags, an `info` block, and (for X items) a bilingual description.
//! Readers flatten the weighted tags back into comma-terminated prompt
//! segments, re-applying `(`..`)` / `[`..`]` nesting from the stored
//! weights.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Weight applied per `(`..`)` nesting level.
const UP_BASE: f64 = 1.1;
/// Weight applied per `[`..`]` nesting level.
const DOWN_BASE: f64 = 0.9;

/// One prompt token with its emphasis weight.
///
/// A weight of `1.0` renders as the bare text; weights above/below `1.0`
/// are rendered by wrapping the text in the nearest whole number of
/// parenthesis/bracket levels.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WeightedTag {
    pub text: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

/// Bilingual description attached to an X item.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Description {
    #[serde(default)]
    pub zh: String,
    #[serde(default)]
    pub en: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ItemInfo {
    #[serde(rename = "type", default)]
    type_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct XTagGroups {
    #[serde(default)]
    gender: Vec<WeightedTag>,
    #[serde(default)]
    characters: Vec<WeightedTag>,
    #[serde(default)]
    series: Vec<WeightedTag>,
    #[serde(default)]
    rating: Vec<WeightedTag>,
    #[serde(default)]
    general: Vec<WeightedTag>,
    #[serde(default)]
    quality: Vec<WeightedTag>,
}

#[derive(Debug, Deserialize)]
struct XItem {
    #[serde(default)]
    tags: XTagGroups,
    #[serde(default)]
    info: Option<ItemInfo>,
    #[serde(default)]
    description: Option<Description>,
}

#[derive(Debug, Deserialize)]
struct YItem {
    #[serde(default)]
    tags: Vec<WeightedTag>,
}

#[derive(Debug, Deserialize)]
struct TagFile<T> {
    items: Vec<T>,
}

/// One flattened X-axis row: six prompt segments plus the item type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct XRow {
    pub gender: String,
    pub characters: String,
    pub series: String,
    pub rating: String,
    pub general: String,
    pub quality: String,
    /// `info.type` from the asset, `None` when absent or blank.
    pub info_type: Option<String>,
}

impl XRow {
    /// Look up a prompt segment by its template key.
    pub fn segment(&self, key: &str) -> Option<&str> {
        match key {
            "gender" => Some(&self.gender),
            "characters" => Some(&self.characters),
            "series" => Some(&self.series),
            "rating" => Some(&self.rating),
            "general" => Some(&self.general),
            "quality" => Some(&self.quality),
            _ => None,
        }
    }
}

/// Render a weighted tag list into a comma-joined, comma-terminated
/// prompt segment. Empty lists render as the empty string.
pub fn flatten_weighted_tags(tags: &[WeightedTag]) -> String {
    let rendered: Vec<String> = tags
        .iter()
        .filter(|tag| !tag.text.trim().is_empty())
        .map(render_weighted)
        .collect();
    if rendered.is_empty() {
        return String::new();
    }
    let mut joined = rendered.join(",");
    joined.push(',');
    joined
}

fn render_weighted(tag: &WeightedTag) -> String {
    let text = tag.text.trim();
    let weight = tag.weight;
    if weight <= 0.0 || (weight - 1.0).abs() < 1e-9 {
        return text.to_string();
    }
    if weight > 1.0 {
        let depth = nesting_depth(weight, UP_BASE);
        format!("{}{}{}", "(".repeat(depth), text, ")".repeat(depth))
    } else {
        let depth = nesting_depth(weight, DOWN_BASE);
        format!("{}{}{}", "[".repeat(depth), text, "]".repeat(depth))
    }
}

/// Nearest whole nesting depth such that `base^depth` matches the weight.
fn nesting_depth(weight: f64, base: f64) -> usize {
    let depth = (weight.ln() / base.ln()).round();
    depth.max(1.0) as usize
}

/// Read the X-axis asset into ordered rows of flattened segments.
pub fn read_x_rows(path: &Path) -> Result<Vec<XRow>, CoreError> {
    let file: TagFile<XItem> = read_tag_file(path)?;
    Ok(file
        .items
        .into_iter()
        .map(|item| XRow {
            gender: flatten_weighted_tags(&item.tags.gender),
            characters: flatten_weighted_tags(&item.tags.characters),
            series: flatten_weighted_tags(&item.tags.series),
            rating: flatten_weighted_tags(&item.tags.rating),
            general: flatten_weighted_tags(&item.tags.general),
            quality: flatten_weighted_tags(&item.tags.quality),
            info_type: item.info.and_then(|info| {
                let trimmed = info.type_name.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }),
        })
        .collect())
}

/// Read the per-row descriptions of the X-axis asset, in file order.
/// Items without a description yield an empty one so indices line up.
pub fn read_x_descriptions(path: &Path) -> Result<Vec<Description>, CoreError> {
    let file: TagFile<XItem> = read_tag_file(path)?;
    Ok(file
        .items
        .into_iter()
        .map(|item| item.description.unwrap_or_default())
        .collect())
}

/// Read the Y-axis asset into ordered flattened style strings.
pub fn read_y_rows(path: &Path) -> Result<Vec<String>, CoreError> {
    let file: TagFile<YItem> = read_tag_file(path)?;
    Ok(file
        .items
        .iter()
        .map(|item| flatten_weighted_tags(&item.tags))
        .collect())
}

fn read_tag_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<TagFile<T>, CoreError> {
    let contents = std::fs::read_to_string(path).map_err(|source| CoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|e| CoreError::InvalidAsset {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
