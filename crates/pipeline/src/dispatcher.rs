//! The grid dispatcher: walks the (x, y) cross product, decides per
//! cell between resume-skip, dry-run, and dispatch, and coordinates the
//! generation and download worker pools.
//!
//! Two bounded mpsc queues feed fixed pools of worker tasks; results
//! come back on one merged completion channel, so the dispatch loop
//! always handles whichever task finishes first. Workers never touch
//! shared state: every outcome travels through its completion value,
//! and only the dispatch loop appends to the ledger. A failure inside a
//! cell becomes a `failed` record; it never aborts the run.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::Instant;

use gridgen_comfyui::api::collect_remote_images;
use gridgen_comfyui::download::DownloadError;
use gridgen_comfyui::wait::wait_prompt_done_with_fallback;
use gridgen_comfyui::{BaseUrl, ClientError, ComfyApi, ComfyClient, ImageRef};
use gridgen_core::selection::select_rows;
use gridgen_core::tags::{read_x_descriptions, read_x_rows, read_y_rows};
use gridgen_core::workflow::WorkflowError;

use crate::config::RunConfig;
use crate::error::PipelineError;
use crate::ledger::{load_latest_records, LedgerWriter};
use crate::manifest::{new_run_id, prepare_run_artifacts, RunManifest};
use crate::plan::{build_cell_plan, sampler_overrides, CellPlan, WorkflowContext, WORKFLOW_NOT_LOADED};
use crate::record::{ErrorInfo, MetadataRecord, RecordStatus, SkipReason, Timestamp, XFields};
use crate::resume::{extract_local_image_path, extract_local_image_paths, should_resume_skip};

/// Broadcast channel capacity for run events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Poll interval while waiting for the history output listing.
const HISTORY_IMAGES_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(250);

/// Live per-run counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub success: u64,
    pub skipped: u64,
    pub failed: u64,
    pub resume_hit: u64,
}

/// Progress events broadcast while a run executes.
///
/// Receivers that lag or disappear never block the run.
#[derive(Debug, Clone)]
pub enum RunEvent {
    Started {
        total_cells: u64,
        run_dir: PathBuf,
    },
    CellRecorded {
        x_index: usize,
        y_index: usize,
        status: RecordStatus,
        skip_reason: Option<SkipReason>,
        completed: u64,
        total: u64,
        stats: RunStats,
    },
    Finished {
        stats: RunStats,
    },
}

/// Final result of a completed run.
#[derive(Debug)]
pub struct RunOutcome {
    pub stats: RunStats,
    pub any_failed: bool,
    pub run_dir: PathBuf,
}

/// One run of the grid.
pub struct GridRunner {
    config: RunConfig,
    event_tx: broadcast::Sender<RunEvent>,
}

// ---------------------------------------------------------------------------
// Worker plumbing
// ---------------------------------------------------------------------------

/// Read-only state shared by all worker tasks.
struct WorkerShared {
    api: ComfyApi,
    base: BaseUrl,
    config: RunConfig,
    workflow: Arc<WorkflowContext>,
    run_dir: PathBuf,
}

/// Hand-off from a finished generation to the download pool.
struct DownloadRequest {
    plan: CellPlan,
    prompt_id: String,
    started_at: Timestamp,
    started: Instant,
}

/// What a generation task produced.
enum GenOutcome {
    /// The cell failed before any outputs existed; terminal record.
    Failed(Box<MetadataRecord>),
    /// The job completed; outputs await download.
    Awaiting(DownloadRequest),
}

/// Merged completion message from either pool.
enum TaskDone {
    Generation(GenOutcome),
    Download(Box<MetadataRecord>),
}

/// Everything that can fail inside one cell's generation or download.
#[derive(Debug, thiserror::Error)]
enum CellError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error("history returned no downloadable images")]
    EmptyHistory,

    #[error("negative prompt could not be resolved")]
    MissingNegativePrompt,
}

impl CellError {
    fn into_error_info(self) -> ErrorInfo {
        match self {
            Self::Client(error) => ErrorInfo::from(&error),
            Self::Download(DownloadError::Client(error)) => ErrorInfo::from(&error),
            Self::Download(io @ DownloadError::Io { .. }) => {
                ErrorInfo::new("io_error", io.to_string())
            }
            Self::Workflow(error) => ErrorInfo::new("workflow_error", error.to_string()),
            Self::EmptyHistory => {
                ErrorInfo::new("empty_history", "history returned no downloadable images")
            }
            Self::MissingNegativePrompt => ErrorInfo::new(
                "invalid_configuration",
                "negative prompt could not be resolved",
            ),
        }
    }
}

impl GridRunner {
    pub fn new(config: RunConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { config, event_tx }
    }

    /// Subscribe to run events (progress display, logging).
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.event_tx.subscribe()
    }

    /// Execute the whole grid.
    ///
    /// Returns `Ok` as long as the run itself completed; per-cell
    /// failures are reported through [`RunOutcome::any_failed`] and the
    /// ledger, not as an error.
    pub async fn run(&self) -> Result<RunOutcome, PipelineError> {
        let config = &self.config;
        config.validate()?;

        let x_rows = read_x_rows(&config.x_json)?;
        let y_rows = read_y_rows(&config.y_json)?;
        let x_descriptions = read_x_descriptions(&config.x_json)?;

        let x_selected = select_rows(&x_rows, config.x_limit, config.x_indexes.as_deref(), "x")?;
        let y_selected = select_rows(&y_rows, config.y_limit, config.y_indexes.as_deref(), "y")?;

        let artifacts = prepare_run_artifacts(config.run_dir.as_deref(), &config.out_root)?;
        std::fs::create_dir_all(&artifacts.images_dir)
            .map_err(PipelineError::io(&artifacts.images_dir))?;

        let workflow = if config.dry_run {
            None
        } else {
            Some(Arc::new(WorkflowContext::load(config)?))
        };
        let workflow_hash = workflow
            .as_ref()
            .map(|ctx| ctx.hash.clone())
            .unwrap_or_else(|| WORKFLOW_NOT_LOADED.to_string());

        let run_id = new_run_id();
        RunManifest::build(
            config,
            run_id.clone(),
            &artifacts.run_dir,
            &x_selected,
            &y_selected,
            &x_descriptions,
            workflow.as_deref(),
        )?
        .write(&artifacts.run_json_path)?;

        let latest = load_latest_records(&artifacts.metadata_path)?;
        let writer = LedgerWriter::open(&artifacts.metadata_path)?;

        let total_cells = x_selected.len() * y_selected.len();
        let _ = self.event_tx.send(RunEvent::Started {
            total_cells: total_cells as u64,
            run_dir: artifacts.run_dir.clone(),
        });
        tracing::info!(
            total_cells,
            dry_run = config.dry_run,
            run_dir = %artifacts.run_dir.display(),
            "Starting grid run",
        );

        let concurrency = config.concurrency;
        let (gen_tx, gen_rx) = mpsc::channel::<CellPlan>(concurrency);
        let (dl_tx, dl_rx) = mpsc::channel::<DownloadRequest>(concurrency);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<TaskDone>();

        let mut worker_handles = Vec::new();
        if let Some(workflow) = &workflow {
            let base = BaseUrl::parse(&config.base_url)
                .map_err(|e| PipelineError::Config(e.to_string()))?;
            let shared = Arc::new(WorkerShared {
                api: ComfyApi::new(base.clone(), config.request_timeout),
                base,
                config: config.clone(),
                workflow: Arc::clone(workflow),
                run_dir: artifacts.run_dir.clone(),
            });
            let gen_rx = Arc::new(Mutex::new(gen_rx));
            let dl_rx = Arc::new(Mutex::new(dl_rx));
            for _ in 0..concurrency {
                worker_handles.push(tokio::spawn(generation_worker(
                    Arc::clone(&shared),
                    Arc::clone(&gen_rx),
                    done_tx.clone(),
                )));
                worker_handles.push(tokio::spawn(download_worker(
                    Arc::clone(&shared),
                    Arc::clone(&dl_rx),
                    done_tx.clone(),
                )));
            }
        }
        drop(done_tx);

        let mut ctx = RunContext {
            writer,
            latest,
            stats: RunStats::default(),
            has_failed: false,
            completed: 0,
            total: total_cells as u64,
            event_tx: &self.event_tx,
        };

        let y_len = y_selected.len();
        let mut next_cell = 0usize;
        let mut gen_in_flight = 0usize;
        let mut dl_in_flight = 0usize;

        loop {
            // Refill generation slots with classified cells.
            while next_cell < total_cells && gen_in_flight < concurrency {
                let x_item = &x_selected[next_cell / y_len];
                let y_item = &y_selected[next_cell % y_len];
                next_cell += 1;

                let plan = build_cell_plan(
                    config,
                    workflow.as_deref(),
                    &run_id,
                    x_item,
                    y_item,
                    &x_descriptions,
                    &workflow_hash,
                )?;

                let prior = ctx.latest.get(&(plan.x_index, plan.y_index));
                if should_resume_skip(
                    prior,
                    &artifacts.run_dir,
                    &plan.prompt_hash,
                    plan.seed,
                    &plan.workflow_hash,
                ) {
                    let record = resume_hit_record(&plan, prior);
                    ctx.record(record)?;
                    continue;
                }

                if config.dry_run {
                    ctx.record(dry_run_record(&plan))?;
                    continue;
                }

                gen_tx
                    .send(plan)
                    .await
                    .map_err(|_| PipelineError::Internal("generation queue closed".to_string()))?;
                gen_in_flight += 1;
            }

            if next_cell >= total_cells && gen_in_flight == 0 && dl_in_flight == 0 {
                break;
            }

            // First-completed-wins across both pools.
            let done = done_rx
                .recv()
                .await
                .ok_or_else(|| PipelineError::Internal("completion channel closed".to_string()))?;
            match done {
                TaskDone::Generation(GenOutcome::Failed(record)) => {
                    gen_in_flight -= 1;
                    ctx.record(*record)?;
                }
                TaskDone::Generation(GenOutcome::Awaiting(request)) => {
                    gen_in_flight -= 1;
                    dl_tx.send(request).await.map_err(|_| {
                        PipelineError::Internal("download queue closed".to_string())
                    })?;
                    dl_in_flight += 1;
                }
                TaskDone::Download(record) => {
                    dl_in_flight -= 1;
                    ctx.record(*record)?;
                }
            }
        }

        drop(gen_tx);
        drop(dl_tx);
        for handle in worker_handles {
            let _ = handle.await;
        }

        let stats = ctx.stats;
        let any_failed = ctx.has_failed;
        let _ = self.event_tx.send(RunEvent::Finished { stats });
        tracing::info!(
            success = stats.success,
            skipped = stats.skipped,
            failed = stats.failed,
            resume_hit = stats.resume_hit,
            "Grid run complete",
        );

        Ok(RunOutcome {
            stats,
            any_failed,
            run_dir: artifacts.run_dir,
        })
    }
}

// ---------------------------------------------------------------------------
// Run context: the single writer of ledger, index, and counters
// ---------------------------------------------------------------------------

struct RunContext<'a> {
    writer: LedgerWriter,
    latest: std::collections::HashMap<(usize, usize), MetadataRecord>,
    stats: RunStats,
    has_failed: bool,
    completed: u64,
    total: u64,
    event_tx: &'a broadcast::Sender<RunEvent>,
}

impl RunContext<'_> {
    /// Append a terminal record, update the resume index and counters,
    /// and broadcast progress.
    fn record(&mut self, record: MetadataRecord) -> Result<(), PipelineError> {
        self.writer.append(&record)?;

        match record.status {
            RecordStatus::Success => self.stats.success += 1,
            RecordStatus::Failed => {
                self.stats.failed += 1;
                self.has_failed = true;
            }
            RecordStatus::Skipped => {
                self.stats.skipped += 1;
                if record.skip_reason == Some(SkipReason::ResumeHit) {
                    self.stats.resume_hit += 1;
                }
            }
        }
        self.completed += 1;

        let _ = self.event_tx.send(RunEvent::CellRecorded {
            x_index: record.x_index,
            y_index: record.y_index,
            status: record.status,
            skip_reason: record.skip_reason,
            completed: self.completed,
            total: self.total,
            stats: self.stats,
        });

        self.latest
            .insert((record.x_index, record.y_index), record);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Record builders
// ---------------------------------------------------------------------------

fn base_record(status: RecordStatus, plan: &CellPlan) -> MetadataRecord {
    MetadataRecord {
        status,
        x_index: plan.x_index,
        y_index: plan.y_index,
        x_fields: XFields::from(&plan.x_row),
        x_info_type: plan.x_row.info_type.clone(),
        y_value: plan.y_value.clone(),
        positive_prompt: plan.positive_prompt.clone(),
        prompt_hash: plan.prompt_hash.clone(),
        seed: plan.seed,
        generation_params: plan.generation_params.clone(),
        workflow_hash: plan.workflow_hash.clone(),
        workflow_json_sha256: None,
        comfyui_prompt_id: None,
        remote_images: None,
        local_image_path: None,
        local_image_paths: None,
        error: None,
        skip_reason: None,
        x_description: Some(plan.x_description.clone()),
        started_at: None,
        finished_at: None,
        elapsed_ms: None,
    }
}

fn resume_hit_record(plan: &CellPlan, prior: Option<&MetadataRecord>) -> MetadataRecord {
    let mut record = base_record(RecordStatus::Skipped, plan);
    record.skip_reason = Some(SkipReason::ResumeHit);
    if let Some(prior) = prior {
        let single = extract_local_image_path(prior).map(str::to_string);
        record.local_image_paths =
            extract_local_image_paths(prior).or_else(|| single.clone().map(|path| vec![path]));
        record.local_image_path = single;
    }
    record
}

fn dry_run_record(plan: &CellPlan) -> MetadataRecord {
    let mut record = base_record(RecordStatus::Skipped, plan);
    record.skip_reason = Some(SkipReason::DryRun);
    record
}

fn failed_record(
    plan: &CellPlan,
    prompt_id: Option<String>,
    started_at: Timestamp,
    started: Instant,
    error: CellError,
) -> MetadataRecord {
    let mut record = base_record(RecordStatus::Failed, plan);
    record.comfyui_prompt_id = prompt_id;
    record.started_at = Some(started_at);
    record.finished_at = Some(chrono::Utc::now());
    record.elapsed_ms = Some(started.elapsed().as_millis() as u64);
    record.error = Some(error.into_error_info());
    record
}

// ---------------------------------------------------------------------------
// Generation pool
// ---------------------------------------------------------------------------

async fn generation_worker(
    shared: Arc<WorkerShared>,
    jobs: Arc<Mutex<mpsc::Receiver<CellPlan>>>,
    done_tx: mpsc::UnboundedSender<TaskDone>,
) {
    loop {
        let plan = { jobs.lock().await.recv().await };
        let Some(plan) = plan else {
            break;
        };
        let outcome = run_generation(&shared, plan).await;
        if done_tx.send(TaskDone::Generation(outcome)).is_err() {
            break;
        }
    }
}

async fn run_generation(shared: &WorkerShared, plan: CellPlan) -> GenOutcome {
    let started_at = chrono::Utc::now();
    let started = Instant::now();
    let mut prompt_id: Option<String> = None;

    match try_generation(shared, &plan, &mut prompt_id).await {
        Ok(prompt_id) => GenOutcome::Awaiting(DownloadRequest {
            plan,
            prompt_id,
            started_at,
            started,
        }),
        Err(error) => {
            tracing::error!(
                x_index = plan.x_index,
                y_index = plan.y_index,
                error = %error,
                "Generation failed",
            );
            GenOutcome::Failed(Box::new(failed_record(
                &plan, prompt_id, started_at, started, error,
            )))
        }
    }
}

/// Submit one cell's patched workflow and wait for completion.
async fn try_generation(
    shared: &WorkerShared,
    plan: &CellPlan,
    prompt_id_slot: &mut Option<String>,
) -> Result<String, CellError> {
    let negative_prompt = plan
        .generation_params
        .negative_prompt
        .clone()
        .ok_or(CellError::MissingNegativePrompt)?;

    let patched = shared.workflow.graph.patch(
        &plan.positive_prompt,
        &negative_prompt,
        &sampler_overrides(&shared.config, plan.seed),
        &shared.workflow.sampler_id,
        Some(&plan.save_image_prefix),
    )?;

    // Per-cell client id: events for concurrent jobs stay separable.
    let client_id = format!(
        "{}-{}",
        shared.config.client_id,
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    );

    let prompt_id = shared.api.submit(&patched.to_value(), &client_id).await?;
    *prompt_id_slot = Some(prompt_id.clone());

    let ws_client = ComfyClient::new(shared.base.clone(), client_id);
    wait_prompt_done_with_fallback(
        &shared.api,
        &ws_client,
        &prompt_id,
        shared.config.request_timeout,
        shared.config.job_timeout,
    )
    .await?;

    Ok(prompt_id)
}

// ---------------------------------------------------------------------------
// Download pool
// ---------------------------------------------------------------------------

async fn download_worker(
    shared: Arc<WorkerShared>,
    jobs: Arc<Mutex<mpsc::Receiver<DownloadRequest>>>,
    done_tx: mpsc::UnboundedSender<TaskDone>,
) {
    loop {
        let request = { jobs.lock().await.recv().await };
        let Some(request) = request else {
            break;
        };
        let record = run_download(&shared, request).await;
        if done_tx.send(TaskDone::Download(Box::new(record))).is_err() {
            break;
        }
    }
}

async fn run_download(shared: &WorkerShared, request: DownloadRequest) -> MetadataRecord {
    let mut remote_images: Option<Vec<ImageRef>> = None;
    let mut local_image_paths: Option<Vec<String>> = None;

    let result =
        try_download(shared, &request, &mut remote_images, &mut local_image_paths).await;

    let mut record = match result {
        Ok(()) => base_record(RecordStatus::Success, &request.plan),
        Err(error) => {
            tracing::error!(
                x_index = request.plan.x_index,
                y_index = request.plan.y_index,
                error = %error,
                "Download failed",
            );
            let mut record = base_record(RecordStatus::Failed, &request.plan);
            record.error = Some(error.into_error_info());
            record
        }
    };

    record.comfyui_prompt_id = Some(request.prompt_id.clone());
    record.remote_images = remote_images;
    record.local_image_path = local_image_paths
        .as_ref()
        .and_then(|paths| paths.first().cloned());
    record.local_image_paths = local_image_paths;
    record.started_at = Some(request.started_at);
    record.finished_at = Some(chrono::Utc::now());
    record.elapsed_ms = Some(request.started.elapsed().as_millis() as u64);
    record
}

async fn try_download(
    shared: &WorkerShared,
    request: &DownloadRequest,
    remote_images: &mut Option<Vec<ImageRef>>,
    local_image_paths: &mut Option<Vec<String>>,
) -> Result<(), CellError> {
    let images = fetch_remote_images(shared, &request.prompt_id).await?;
    if images.is_empty() {
        return Err(CellError::EmptyHistory);
    }

    let paths = build_local_image_paths(request.plan.x_index, request.plan.y_index, &images);
    *remote_images = Some(images.clone());
    *local_image_paths = Some(paths.clone());

    for (image, relative) in images.iter().zip(&paths) {
        shared
            .api
            .download_to_path(image, &shared.run_dir.join(relative))
            .await?;
    }
    Ok(())
}

/// Poll history until the output listing materializes.
///
/// The job already completed, so outputs normally appear at once; the
/// window only covers listing lag. Returns an empty list if the window
/// closes without outputs.
async fn fetch_remote_images(
    shared: &WorkerShared,
    prompt_id: &str,
) -> Result<Vec<ImageRef>, CellError> {
    let budget = shared.config.job_timeout.clamp(
        std::time::Duration::from_secs(1),
        std::time::Duration::from_secs(10),
    );
    let deadline = Instant::now() + budget;

    loop {
        let history_item = shared.api.history(prompt_id).await?;
        let images = collect_remote_images(&history_item);
        if !images.is_empty() {
            return Ok(images);
        }
        if Instant::now() >= deadline {
            return Ok(Vec::new());
        }
        tokio::time::sleep(HISTORY_IMAGES_POLL_INTERVAL).await;
    }
}

/// Relative save paths, one per remote image, unique within the run.
fn build_local_image_paths(x_index: usize, y_index: usize, images: &[ImageRef]) -> Vec<String> {
    images
        .iter()
        .enumerate()
        .map(|(i, image)| {
            let ext = infer_image_extension(image);
            if i == 0 {
                format!("images/x{x_index}-y{y_index}{ext}")
            } else {
                format!("images/x{x_index}-y{y_index}-{i}{ext}")
            }
        })
        .collect()
}

fn infer_image_extension(image: &ImageRef) -> String {
    Path::new(&image.filename)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
        .unwrap_or_else(|| ".png".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(filename: &str) -> ImageRef {
        ImageRef {
            filename: filename.to_string(),
            subfolder: None,
            image_type: None,
        }
    }

    #[test]
    fn local_paths_number_extra_images() {
        let paths = build_local_image_paths(2, 5, &[image("a.png"), image("b.PNG"), image("c")]);
        assert_eq!(
            paths,
            vec![
                "images/x2-y5.png".to_string(),
                "images/x2-y5-1.png".to_string(),
                "images/x2-y5-2.png".to_string(),
            ]
        );
    }

    #[test]
    fn extension_follows_the_remote_filename() {
        assert_eq!(infer_image_extension(&image("cell.webp")), ".webp");
        assert_eq!(infer_image_extension(&image("noext")), ".png");
    }

    #[test]
    fn cell_error_kinds_map_into_error_info() {
        use gridgen_comfyui::ErrorKind;

        let info = CellError::Client(ClientError::new(ErrorKind::JobTimeout, "timed out"))
            .into_error_info();
        assert_eq!(info.kind, "job_timeout");

        let info = CellError::EmptyHistory.into_error_info();
        assert_eq!(info.kind, "empty_history");

        let info = CellError::MissingNegativePrompt.into_error_info();
        assert_eq!(info.kind, "invalid_configuration");
    }
}
