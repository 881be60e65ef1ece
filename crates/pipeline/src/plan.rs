//! Per-cell planning: the loaded workflow context, effective generation
//! parameters, and the immutable cell plan handed to a generation task.

use std::path::PathBuf;

use gridgen_core::hashing::sha256_file;
use gridgen_core::negative::{append_negative_prompt, APPEND_TRIGGER_INFO_TYPE};
use gridgen_core::prompt::{compute_prompt_hash, derive_seed, render_prompt_by_template};
use gridgen_core::selection::SelectedRow;
use gridgen_core::tags::{Description, XRow};
use gridgen_core::workflow::{WorkflowDefaults, WorkflowGraph, WorkflowOverrides};

use crate::config::RunConfig;
use crate::error::PipelineError;
use crate::record::GenerationParams;

/// Workflow hash placeholder when no workflow is loaded (dry runs).
pub const WORKFLOW_NOT_LOADED: &str = "not_loaded";

/// The workflow file loaded once per run, with everything derived from it.
#[derive(Debug)]
pub struct WorkflowContext {
    pub graph: WorkflowGraph,
    pub path: PathBuf,
    pub hash: String,
    pub sampler_id: String,
    pub default_negative_prompt: String,
    pub defaults: WorkflowDefaults,
}

impl WorkflowContext {
    /// Load and validate the run's workflow.
    ///
    /// Beyond parsing, this runs a probe patch so a graph whose
    /// sampler/text-encode/latent wiring does not match the expected
    /// shape fails at startup instead of on the first cell.
    pub fn load(config: &RunConfig) -> Result<Self, PipelineError> {
        let path = config
            .workflow_json
            .as_ref()
            .ok_or_else(|| PipelineError::Config("workflow path is missing".to_string()))?;
        if !path.is_file() {
            return Err(PipelineError::Config(format!(
                "workflow file does not exist: {}",
                path.display()
            )));
        }

        let graph = WorkflowGraph::load(path)?;
        let hash = sha256_file(path)?;
        let sampler_id = graph.find_sampler(config.sampler_node_id.as_deref())?;
        let defaults = graph.extract_defaults(&sampler_id)?;
        let default_negative_prompt = defaults.negative_prompt.clone().unwrap_or_default();

        let probe = WorkflowOverrides {
            seed: Some(0),
            ..Default::default()
        };
        graph
            .patch(
                "__workflow_validation_positive__",
                &default_negative_prompt,
                &probe,
                &sampler_id,
                None,
            )
            .map_err(|e| {
                PipelineError::Config(format!(
                    "workflow graph does not match the expected sampler wiring: {e}"
                ))
            })?;

        Ok(Self {
            graph,
            path: path.clone(),
            hash,
            sampler_id,
            default_negative_prompt,
            defaults,
        })
    }
}

/// One (x, y) cell resolved into everything a generation needs.
/// Immutable once constructed.
#[derive(Debug, Clone)]
pub struct CellPlan {
    pub x_index: usize,
    pub y_index: usize,
    pub x_row: XRow,
    pub x_description: Description,
    pub y_value: String,
    pub positive_prompt: String,
    pub prompt_hash: String,
    pub seed: u64,
    pub generation_params: GenerationParams,
    pub workflow_hash: String,
    pub save_image_prefix: String,
}

/// Build the plan for one cell.
pub fn build_cell_plan(
    config: &RunConfig,
    workflow: Option<&WorkflowContext>,
    run_id: &str,
    x_item: &SelectedRow<XRow>,
    y_item: &SelectedRow<String>,
    x_descriptions: &[Description],
    workflow_hash: &str,
) -> Result<CellPlan, PipelineError> {
    let x_index = x_item.index;
    let y_index = y_item.index;
    let positive_prompt = render_prompt_by_template(&config.template, &x_item.value, &y_item.value)
        .map_err(|e| PipelineError::Config(e.to_string()))?;
    let prompt_hash = compute_prompt_hash(&positive_prompt);
    let seed = derive_seed(config.base_seed, x_index, y_index);

    Ok(CellPlan {
        x_index,
        y_index,
        x_row: x_item.value.clone(),
        x_description: x_descriptions.get(x_index).cloned().unwrap_or_default(),
        y_value: y_item.value.clone(),
        positive_prompt,
        prompt_hash: prompt_hash.clone(),
        seed,
        generation_params: effective_generation_params(config, workflow, &x_item.value, seed),
        workflow_hash: workflow_hash.to_string(),
        save_image_prefix: format!("{run_id}/x{x_index}-y{y_index}-s{seed}-{}", &prompt_hash[..8]),
    })
}

/// Base negative prompt: explicit override first, then the workflow's
/// default. `None` when neither source exists.
pub fn effective_negative_prompt(
    config: &RunConfig,
    workflow: Option<&WorkflowContext>,
) -> Option<String> {
    if let Some(explicit) = &config.overrides.negative_prompt {
        return Some(explicit.clone());
    }
    workflow.map(|ctx| ctx.default_negative_prompt.clone())
}

/// Final negative prompt for one X row: the base, extended with the
/// "always append" suffix when the row's type triggers it.
pub fn final_negative_prompt_for_row(
    config: &RunConfig,
    workflow: Option<&WorkflowContext>,
    x_row: &XRow,
) -> Option<String> {
    let base = effective_negative_prompt(config, workflow)?;
    if x_row.info_type.as_deref() != Some(APPEND_TRIGGER_INFO_TYPE) {
        return Some(base);
    }
    Some(append_negative_prompt(
        Some(&base),
        config.append_negative_prompt.as_deref(),
    ))
}

/// Resolve the effective generation parameters for a cell: explicit
/// per-run override wins, the workflow default fills the rest.
pub fn effective_generation_params(
    config: &RunConfig,
    workflow: Option<&WorkflowContext>,
    x_row: &XRow,
    seed: u64,
) -> GenerationParams {
    let defaults = workflow.map(|ctx| &ctx.defaults);
    let overrides = &config.overrides;

    fn pick<T: Clone>(explicit: &Option<T>, default: Option<&Option<T>>) -> Option<T> {
        explicit
            .clone()
            .or_else(|| default.and_then(|d| d.clone()))
    }

    GenerationParams {
        seed,
        negative_prompt: final_negative_prompt_for_row(config, workflow, x_row),
        width: pick(&overrides.width, defaults.map(|d| &d.width)),
        height: pick(&overrides.height, defaults.map(|d| &d.height)),
        batch_size: pick(&overrides.batch_size, defaults.map(|d| &d.batch_size)),
        steps: pick(&overrides.steps, defaults.map(|d| &d.steps)),
        cfg: pick(&overrides.cfg, defaults.map(|d| &d.cfg)),
        denoise: pick(&overrides.denoise, defaults.map(|d| &d.denoise)),
        sampler_name: pick(&overrides.sampler_name, defaults.map(|d| &d.sampler_name)),
        scheduler: pick(&overrides.scheduler, defaults.map(|d| &d.scheduler)),
    }
}

/// The overrides handed to the workflow patcher for one cell: the raw
/// per-run overrides plus the derived seed. Workflow defaults are left
/// to the graph itself.
pub fn sampler_overrides(config: &RunConfig, seed: u64) -> WorkflowOverrides {
    let overrides = &config.overrides;
    WorkflowOverrides {
        seed: Some(seed),
        steps: overrides.steps,
        cfg: overrides.cfg,
        denoise: overrides.denoise,
        sampler_name: overrides.sampler_name.clone(),
        scheduler: overrides.scheduler.clone(),
        width: overrides.width,
        height: overrides.height,
        batch_size: overrides.batch_size,
    }
}
