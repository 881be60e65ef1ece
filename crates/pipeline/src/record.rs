//! The terminal per-cell metadata record.
//!
//! One record is appended per cell per run attempt; records are never
//! mutated. Deserialization is tolerant: only the status and the grid
//! coordinate are required, so records written by older versions still
//! load for resume decisions.

use serde::{Deserialize, Serialize};

use gridgen_comfyui::{ClientError, ImageRef};
use gridgen_core::tags::{Description, XRow};

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Terminal outcome of one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Success,
    Failed,
    Skipped,
}

/// Why a cell was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    ResumeHit,
    DryRun,
}

/// The six X-axis prompt segments, as rendered into the prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct XFields {
    #[serde(default)]
    pub gender: String,
    #[serde(default)]
    pub characters: String,
    #[serde(default)]
    pub series: String,
    #[serde(default)]
    pub rating: String,
    #[serde(default)]
    pub general: String,
    #[serde(default)]
    pub quality: String,
}

impl From<&XRow> for XFields {
    fn from(row: &XRow) -> Self {
        Self {
            gender: row.gender.clone(),
            characters: row.characters.clone(),
            series: row.series.clone(),
            rating: row.rating.clone(),
            general: row.general.clone(),
            quality: row.quality.clone(),
        }
    }
}

/// Structured error descriptor persisted with `failed` records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub context: serde_json::Value,
}

impl ErrorInfo {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            context: serde_json::Value::Null,
        }
    }
}

impl From<&ClientError> for ErrorInfo {
    fn from(error: &ClientError) -> Self {
        Self {
            kind: error.kind.as_str().to_string(),
            message: error.message.clone(),
            context: serde_json::json!(error.context),
        }
    }
}

/// Effective generation parameters for one cell, after resolving the
/// explicit-override-over-workflow-default precedence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default)]
    pub seed: u64,
    pub negative_prompt: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub batch_size: Option<u32>,
    pub steps: Option<u32>,
    pub cfg: Option<f64>,
    pub denoise: Option<f64>,
    pub sampler_name: Option<String>,
    pub scheduler: Option<String>,
}

/// The terminal, persisted outcome of one grid cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub status: RecordStatus,
    pub x_index: usize,
    pub y_index: usize,
    #[serde(default)]
    pub x_fields: XFields,
    #[serde(default)]
    pub x_info_type: Option<String>,
    #[serde(default)]
    pub y_value: String,
    #[serde(default)]
    pub positive_prompt: String,
    #[serde(default)]
    pub prompt_hash: String,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub generation_params: GenerationParams,
    #[serde(default)]
    pub workflow_hash: String,
    /// Workflow hash key written by earlier versions; consulted when
    /// `workflow_hash` is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_json_sha256: Option<String>,
    #[serde(default)]
    pub comfyui_prompt_id: Option<String>,
    #[serde(default)]
    pub remote_images: Option<Vec<ImageRef>>,
    #[serde(default)]
    pub local_image_path: Option<String>,
    #[serde(default)]
    pub local_image_paths: Option<Vec<String>>,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_description: Option<Description>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
}

impl MetadataRecord {
    /// The workflow hash to compare against on resume, falling back to
    /// the legacy key.
    pub fn effective_workflow_hash(&self) -> Option<&str> {
        if !self.workflow_hash.is_empty() {
            return Some(&self.workflow_hash);
        }
        self.workflow_json_sha256.as_deref().filter(|h| !h.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_reason_serializes_snake_case() {
        let json = serde_json::to_value(SkipReason::ResumeHit).unwrap();
        assert_eq!(json, "resume_hit");
    }

    #[test]
    fn minimal_record_deserializes_with_defaults() {
        let record: MetadataRecord =
            serde_json::from_str(r#"{"status": "success", "x_index": 2, "y_index": 5}"#).unwrap();
        assert_eq!(record.status, RecordStatus::Success);
        assert_eq!(record.x_index, 2);
        assert_eq!(record.workflow_hash, "");
        assert!(record.local_image_paths.is_none());
    }

    #[test]
    fn legacy_workflow_hash_key_is_honoured() {
        let record: MetadataRecord = serde_json::from_str(
            r#"{"status": "success", "x_index": 0, "y_index": 0, "workflow_json_sha256": "abc"}"#,
        )
        .unwrap();
        assert_eq!(record.effective_workflow_hash(), Some("abc"));

        let record: MetadataRecord = serde_json::from_str(
            r#"{"status": "success", "x_index": 0, "y_index": 0, "workflow_hash": "def", "workflow_json_sha256": "abc"}"#,
        )
        .unwrap();
        assert_eq!(record.effective_workflow_hash(), Some("def"));
    }

    #[test]
    fn client_error_converts_to_error_info() {
        use gridgen_comfyui::ErrorKind;
        let error = ClientError::new(ErrorKind::JobTimeout, "job timeout while waiting prompt p-1")
            .with_context("prompt_id", "p-1");
        let info = ErrorInfo::from(&error);
        assert_eq!(info.kind, "job_timeout");
        assert_eq!(info.context["prompt_id"], "p-1");
    }
}
