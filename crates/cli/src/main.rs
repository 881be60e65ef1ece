//! Command-line entry point: walk the X/Y prompt grid, generate one
//! image per cell against a ComfyUI instance, and record a durable
//! per-cell audit trail that makes the run safely resumable.
//!
//! Every flag can also be supplied through a `COMFYUI_*` environment
//! variable (a local `.env` file is loaded first), so unattended runs
//! need no argument list.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gridgen_core::negative::resolve_append_negative;
use gridgen_pipeline::config::{
    DEFAULT_BASE_URL, DEFAULT_RUN_ROOT, DEFAULT_WORKFLOW_JSON, DEFAULT_X_JSON, DEFAULT_Y_JSON,
};
use gridgen_pipeline::{GenerationOverrides, GridRunner, RunConfig, RunEvent};

#[derive(Debug, Parser)]
#[command(
    name = "gridgen",
    about = "Walk an X/Y prompt grid, generate one image per cell via ComfyUI, and record a resumable metadata ledger."
)]
struct Cli {
    /// X-axis (subject) tag asset.
    #[arg(long, env = "COMFYUI_X_JSON", default_value = DEFAULT_X_JSON)]
    x_json: PathBuf,

    /// Y-axis (style) tag asset.
    #[arg(long, env = "COMFYUI_Y_JSON", default_value = DEFAULT_Y_JSON)]
    y_json: PathBuf,

    /// Prompt template; placeholder tokens only.
    #[arg(long, env = "COMFYUI_TEMPLATE", default_value = gridgen_core::prompt::DEFAULT_TEMPLATE)]
    template: String,

    /// Base seed for per-cell seed derivation.
    #[arg(long, env = "COMFYUI_BASE_SEED", default_value_t = 0)]
    base_seed: u64,

    /// API-format workflow file.
    #[arg(long, env = "COMFYUI_WORKFLOW_JSON", default_value = DEFAULT_WORKFLOW_JSON)]
    workflow_json: PathBuf,

    /// Sampler node id when the workflow has more than one KSampler.
    #[arg(long, env = "COMFYUI_KSAMPLER_NODE_ID")]
    ksampler_node_id: Option<String>,

    /// Take only the first N selected X rows.
    #[arg(long, env = "COMFYUI_X_LIMIT")]
    x_limit: Option<usize>,

    /// Take only the first N selected Y rows.
    #[arg(long, env = "COMFYUI_Y_LIMIT")]
    y_limit: Option<usize>,

    /// Comma-separated X row indexes to run.
    #[arg(long, env = "COMFYUI_X_INDEXES")]
    x_indexes: Option<String>,

    /// Comma-separated Y row indexes to run.
    #[arg(long, env = "COMFYUI_Y_INDEXES")]
    y_indexes: Option<String>,

    /// Reuse (or create) this run directory instead of a fresh one.
    #[arg(long, env = "COMFYUI_RUN_DIR")]
    run_dir: Option<PathBuf>,

    /// Root under which fresh run directories are created.
    #[arg(long, env = "COMFYUI_OUT_DIR", default_value = DEFAULT_RUN_ROOT)]
    out_root: PathBuf,

    /// Plan and record every cell without contacting the backend.
    #[arg(long, env = "COMFYUI_DRY_RUN")]
    dry_run: bool,

    /// ComfyUI base URL.
    #[arg(long, env = "COMFYUI_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Per-request timeout in seconds.
    #[arg(long, env = "COMFYUI_REQUEST_TIMEOUT_S", default_value_t = 30.0)]
    request_timeout_s: f64,

    /// Hard per-job wall-clock deadline in seconds.
    #[arg(long, env = "COMFYUI_JOB_TIMEOUT_S", default_value_t = 600.0)]
    job_timeout_s: f64,

    /// Worker-pool size for generation and download, each.
    #[arg(long, env = "COMFYUI_CONCURRENCY", default_value_t = 1)]
    concurrency: usize,

    /// Stable client id prefix; a random one is generated when absent.
    #[arg(long, env = "COMFYUI_CLIENT_ID")]
    client_id: Option<String>,

    /// Negative prompt override (otherwise the workflow default is used).
    #[arg(long, env = "COMFYUI_NEGATIVE_PROMPT")]
    negative_prompt: Option<String>,

    /// Suffix appended to the negative prompt for "normal" rows.
    /// Set to the empty string to disable appending.
    #[arg(long, env = "COMFYUI_APPEND_NEGATIVE_PROMPT")]
    append_negative_prompt: Option<String>,

    #[arg(long, env = "COMFYUI_WIDTH")]
    width: Option<u32>,

    #[arg(long, env = "COMFYUI_HEIGHT")]
    height: Option<u32>,

    #[arg(long, env = "COMFYUI_BATCH_SIZE")]
    batch_size: Option<u32>,

    #[arg(long, env = "COMFYUI_STEPS")]
    steps: Option<u32>,

    #[arg(long, env = "COMFYUI_CFG")]
    cfg: Option<f64>,

    #[arg(long, env = "COMFYUI_DENOISE")]
    denoise: Option<f64>,

    #[arg(long, env = "COMFYUI_SAMPLER_NAME")]
    sampler_name: Option<String>,

    #[arg(long, env = "COMFYUI_SCHEDULER")]
    scheduler: Option<String>,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<RunConfig> {
        if !(self.request_timeout_s.is_finite() && self.request_timeout_s > 0.0) {
            anyhow::bail!("--request-timeout-s must be greater than 0");
        }
        if !(self.job_timeout_s.is_finite() && self.job_timeout_s > 0.0) {
            anyhow::bail!("--job-timeout-s must be greater than 0");
        }

        Ok(RunConfig {
            x_json: self.x_json,
            y_json: self.y_json,
            template: self.template,
            base_seed: self.base_seed,
            workflow_json: Some(self.workflow_json),
            sampler_node_id: self.ksampler_node_id,
            x_limit: self.x_limit,
            y_limit: self.y_limit,
            x_indexes: self.x_indexes,
            y_indexes: self.y_indexes,
            run_dir: self.run_dir,
            out_root: self.out_root,
            dry_run: self.dry_run,
            base_url: self.base_url.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs_f64(self.request_timeout_s),
            job_timeout: Duration::from_secs_f64(self.job_timeout_s),
            concurrency: self.concurrency,
            client_id: self
                .client_id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            overrides: GenerationOverrides {
                negative_prompt: self.negative_prompt,
                width: self.width,
                height: self.height,
                batch_size: self.batch_size,
                steps: self.steps,
                cfg: self.cfg,
                denoise: self.denoise,
                sampler_name: self.sampler_name,
                scheduler: self.scheduler,
            },
            append_negative_prompt: resolve_append_negative(self.append_negative_prompt.as_deref()),
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gridgen=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(false) => ExitCode::SUCCESS,
        Ok(true) => ExitCode::from(1),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    let config = cli.into_config()?;
    tracing::debug!(?config, "Resolved run configuration");
    let runner = GridRunner::new(config);

    let events = runner.subscribe();
    let progress = tokio::spawn(render_progress(events));

    let outcome = runner.run().await?;

    let _ = progress.await;
    println!(
        "Results: success={}, skipped={}, failed={}, resume_hit={}",
        outcome.stats.success,
        outcome.stats.skipped,
        outcome.stats.failed,
        outcome.stats.resume_hit,
    );

    Ok(outcome.any_failed)
}

/// Render run events as a progress bar with live counters.
async fn render_progress(mut events: tokio::sync::broadcast::Receiver<RunEvent>) {
    let mut bar: Option<ProgressBar> = None;

    loop {
        match events.recv().await {
            Ok(RunEvent::Started { total_cells, run_dir }) => {
                let pb = ProgressBar::new(total_cells);
                pb.set_style(
                    ProgressStyle::with_template(
                        "{bar:40.cyan/blue} {pos}/{len} cells [{elapsed_precise}] {msg}",
                    )
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
                );
                pb.println(format!("Run directory: {}", run_dir.display()));
                bar = Some(pb);
            }
            Ok(RunEvent::CellRecorded { stats, completed, .. }) => {
                if let Some(pb) = &bar {
                    pb.set_position(completed);
                    pb.set_message(format!(
                        "ok {} skip {} fail {} resume {}",
                        stats.success, stats.skipped, stats.failed, stats.resume_hit,
                    ));
                }
            }
            Ok(RunEvent::Finished { .. }) => break,
            // Skipped events only affect the counter display; the next
            // event carries up-to-date totals.
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }

    if let Some(pb) = bar {
        pb.finish();
    }
}
