//! Run directory layout and the once-written run manifest.

use std::path::{Path, PathBuf};

use serde::Serialize;

use gridgen_core::hashing::sha256_file;
use gridgen_core::selection::SelectedRow;
use gridgen_core::tags::{Description, XRow};

use crate::config::RunConfig;
use crate::error::PipelineError;
use crate::plan::{WorkflowContext, WORKFLOW_NOT_LOADED};
use crate::record::Timestamp;

/// How seeds are derived; recorded so a ledger can be interpreted
/// without the code that wrote it.
const SEED_STRATEGY: &str = "sha256(base_seed:x_index:y_index)[:16] mod 18446744073709519872";

/// Filesystem layout of one run directory.
#[derive(Debug, Clone)]
pub struct RunArtifacts {
    pub run_dir: PathBuf,
    pub images_dir: PathBuf,
    pub run_json_path: PathBuf,
    pub metadata_path: PathBuf,
}

/// Create (or adopt) the run directory and derive the artifact paths.
pub fn prepare_run_artifacts(
    run_dir: Option<&Path>,
    out_root: &Path,
) -> Result<RunArtifacts, PipelineError> {
    let run_dir = match run_dir {
        Some(dir) => dir.to_path_buf(),
        None => {
            let timestamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
            out_root.join(format!("run-{timestamp}"))
        }
    };
    std::fs::create_dir_all(&run_dir).map_err(PipelineError::io(&run_dir))?;

    Ok(RunArtifacts {
        images_dir: run_dir.join("images"),
        run_json_path: run_dir.join("run.json"),
        metadata_path: run_dir.join("metadata.jsonl"),
        run_dir,
    })
}

/// Generate a fresh run id: UTC timestamp plus a short random suffix.
pub fn new_run_id() -> String {
    let timestamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{timestamp}-{}", &suffix[..8])
}

/// Config snapshot, input content hashes, and selection summary.
/// Written once at run start; never updated as cells complete.
#[derive(Debug, Serialize)]
pub struct RunManifest {
    pub run_id: String,
    pub created_at: Timestamp,
    pub dry_run: bool,
    pub run_dir: String,
    pub x_json_path: String,
    pub y_json_path: String,
    pub x_json_sha256: String,
    pub y_json_sha256: String,
    pub template: String,
    pub base_seed: u64,
    pub seed_strategy: String,
    pub workflow_json_path: Option<String>,
    pub workflow_json_sha256: String,
    pub workflow_status: String,
    pub selected_ksampler_node_id: Option<String>,
    pub comfyui_base_url: String,
    pub request_timeout_s: f64,
    pub job_timeout_s: f64,
    pub concurrency: usize,
    pub client_id: String,
    pub selection: SelectionSummary,
    pub generation_overrides: crate::config::GenerationOverrides,
}

#[derive(Debug, Serialize)]
pub struct SelectionSummary {
    pub x_indexes: Vec<usize>,
    pub y_indexes: Vec<usize>,
    pub x_count: usize,
    pub y_count: usize,
    pub total_cells: usize,
    pub x_columns: Vec<XColumnSummary>,
    pub x_limit: Option<usize>,
    pub y_limit: Option<usize>,
    pub x_indexes_raw: Option<String>,
    pub y_indexes_raw: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct XColumnSummary {
    pub x_index: usize,
    #[serde(rename = "type")]
    pub info_type: Option<String>,
    pub description: Description,
}

impl RunManifest {
    /// Assemble the manifest for a run about to start.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        config: &RunConfig,
        run_id: String,
        run_dir: &Path,
        x_selected: &[SelectedRow<XRow>],
        y_selected: &[SelectedRow<String>],
        x_descriptions: &[Description],
        workflow: Option<&WorkflowContext>,
    ) -> Result<Self, PipelineError> {
        let workflow_json_path = match workflow {
            Some(ctx) => Some(ctx.path.display().to_string()),
            None => config
                .workflow_json
                .as_ref()
                .map(|p| p.display().to_string()),
        };

        Ok(Self {
            run_id,
            created_at: chrono::Utc::now(),
            dry_run: config.dry_run,
            run_dir: run_dir.display().to_string(),
            x_json_path: config.x_json.display().to_string(),
            y_json_path: config.y_json.display().to_string(),
            x_json_sha256: sha256_file(&config.x_json)?,
            y_json_sha256: sha256_file(&config.y_json)?,
            template: config.template.clone(),
            base_seed: config.base_seed,
            seed_strategy: SEED_STRATEGY.to_string(),
            workflow_json_path,
            workflow_json_sha256: workflow
                .map(|ctx| ctx.hash.clone())
                .unwrap_or_else(|| WORKFLOW_NOT_LOADED.to_string()),
            workflow_status: (if workflow.is_some() { "loaded" } else { "not_loaded" }).to_string(),
            selected_ksampler_node_id: workflow.map(|ctx| ctx.sampler_id.clone()),
            comfyui_base_url: config.base_url.clone(),
            request_timeout_s: config.request_timeout.as_secs_f64(),
            job_timeout_s: config.job_timeout.as_secs_f64(),
            concurrency: config.concurrency,
            client_id: config.client_id.clone(),
            selection: SelectionSummary {
                x_indexes: x_selected.iter().map(|item| item.index).collect(),
                y_indexes: y_selected.iter().map(|item| item.index).collect(),
                x_count: x_selected.len(),
                y_count: y_selected.len(),
                total_cells: x_selected.len() * y_selected.len(),
                x_columns: x_selected
                    .iter()
                    .map(|item| XColumnSummary {
                        x_index: item.index,
                        info_type: item.value.info_type.clone(),
                        description: x_descriptions
                            .get(item.index)
                            .cloned()
                            .unwrap_or_default(),
                    })
                    .collect(),
                x_limit: config.x_limit,
                y_limit: config.y_limit,
                x_indexes_raw: config.x_indexes.clone(),
                y_indexes_raw: config.y_indexes.clone(),
            },
            generation_overrides: config.overrides.clone(),
        })
    }

    /// Write the manifest, pretty-printed, exactly once.
    pub fn write(&self, path: &Path) -> Result<(), PipelineError> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents).map_err(PipelineError::io(path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_unique_and_timestamped() {
        let a = new_run_id();
        let b = new_run_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), "20260101T000000Z-".len() + 8);
        assert!(a.contains('T'));
    }

    #[test]
    fn artifacts_use_a_fresh_run_directory_under_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = prepare_run_artifacts(None, dir.path()).unwrap();
        assert!(artifacts.run_dir.starts_with(dir.path()));
        assert!(artifacts.run_dir.is_dir());
        assert!(artifacts
            .run_dir
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("run-"));
        assert_eq!(artifacts.metadata_path.file_name().unwrap(), "metadata.jsonl");
    }

    #[test]
    fn explicit_run_directory_is_adopted() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = dir.path().join("resume-me");
        let artifacts = prepare_run_artifacts(Some(&explicit), dir.path()).unwrap();
        assert_eq!(artifacts.run_dir, explicit);
        assert!(explicit.is_dir());
    }
}
