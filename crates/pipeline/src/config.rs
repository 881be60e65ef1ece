//! Run configuration and pre-flight validation.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::error::PipelineError;

pub const DEFAULT_X_JSON: &str = "data/prompts/X/common_prompts.json";
pub const DEFAULT_Y_JSON: &str = "data/prompts/Y/300_NAI_Styles_Table-test.json";
pub const DEFAULT_WORKFLOW_JSON: &str = "data/comfyui-flow/CKNOOBRF.json";
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8188";
pub const DEFAULT_RUN_ROOT: &str = "comfyui_api_outputs";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(600);

/// Explicit per-run generation overrides. `None` defers to the
/// workflow's own defaults.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerationOverrides {
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

/// Everything one grid run needs to know.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub x_json: PathBuf,
    pub y_json: PathBuf,
    pub template: String,
    pub base_seed: u64,
    pub workflow_json: Option<PathBuf>,
    pub sampler_node_id: Option<String>,
    pub x_limit: Option<usize>,
    pub y_limit: Option<usize>,
    pub x_indexes: Option<String>,
    pub y_indexes: Option<String>,
    /// Explicit run directory; otherwise one is created under `out_root`.
    pub run_dir: Option<PathBuf>,
    pub out_root: PathBuf,
    pub dry_run: bool,
    pub base_url: String,
    pub request_timeout: Duration,
    pub job_timeout: Duration,
    pub concurrency: usize,
    pub client_id: String,
    pub overrides: GenerationOverrides,
    /// Resolved "always append" negative-prompt suffix; `None` disables
    /// appending entirely.
    pub append_negative_prompt: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            x_json: PathBuf::from(DEFAULT_X_JSON),
            y_json: PathBuf::from(DEFAULT_Y_JSON),
            template: gridgen_core::prompt::DEFAULT_TEMPLATE.to_string(),
            base_seed: 0,
            workflow_json: Some(PathBuf::from(DEFAULT_WORKFLOW_JSON)),
            sampler_node_id: None,
            x_limit: None,
            y_limit: None,
            x_indexes: None,
            y_indexes: None,
            run_dir: None,
            out_root: PathBuf::from(DEFAULT_RUN_ROOT),
            dry_run: false,
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            job_timeout: DEFAULT_JOB_TIMEOUT,
            concurrency: 1,
            client_id: uuid::Uuid::new_v4().to_string(),
            overrides: GenerationOverrides::default(),
            append_negative_prompt: Some(
                gridgen_core::negative::DEFAULT_APPEND_NEGATIVE.to_string(),
            ),
        }
    }
}

impl RunConfig {
    /// Pre-flight validation; every violation is fatal before any
    /// dispatch happens.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.request_timeout.is_zero() {
            return Err(PipelineError::Config(
                "request timeout must be greater than 0".to_string(),
            ));
        }
        if self.job_timeout.is_zero() {
            return Err(PipelineError::Config(
                "job timeout must be greater than 0".to_string(),
            ));
        }
        if self.concurrency == 0 {
            return Err(PipelineError::Config(
                "concurrency must be greater than 0".to_string(),
            ));
        }
        if self.client_id.trim().is_empty() {
            return Err(PipelineError::Config("client id must not be empty".to_string()));
        }
        if !self.dry_run && self.workflow_json.is_none() {
            return Err(PipelineError::Config(
                "a workflow file is required unless --dry-run is set".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(RunConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let config = RunConfig {
            job_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RunConfig {
            request_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = RunConfig {
            concurrency: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn workflow_required_unless_dry_run() {
        let config = RunConfig {
            workflow_json: None,
            dry_run: false,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RunConfig {
            workflow_json: None,
            dry_run: true,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
