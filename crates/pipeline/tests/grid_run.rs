//! Dispatcher integration tests: dry runs, a full submit/wait/download
//! pass against a mock server, resume idempotence, and per-cell failure
//! capture.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;

use gridgen_pipeline::ledger::load_latest_records;
use gridgen_pipeline::{GridRunner, RecordStatus, RunConfig, SkipReason};

#[derive(Default)]
struct MockState {
    submits: AtomicUsize,
}

async fn start_server(state: Arc<MockState>) -> SocketAddr {
    let app = Router::new()
        .route("/prompt", post(prompt_handler))
        .route("/history/{prompt_id}", get(history_handler))
        .route("/view", get(|| async { "image-bytes" }))
        .route("/ws", get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn prompt_handler(State(state): State<Arc<MockState>>) -> Response {
    state.submits.fetch_add(1, Ordering::SeqCst);
    axum::Json(serde_json::json!({"prompt_id": "p-1", "number": 1})).into_response()
}

async fn history_handler() -> Response {
    axum::Json(serde_json::json!({
        "p-1": {"outputs": {"9": {"images": [{"filename": "remote.png", "type": "output"}]}}}
    }))
    .into_response()
}

async fn ws_handler(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|mut socket| async move {
        let frame = r#"{"type":"executing","data":{"node":null,"prompt_id":"p-1"}}"#;
        let _ = socket.send(WsMessage::Text(frame.into())).await;
    })
}

fn write_fixtures(dir: &Path, x_count: usize, y_count: usize) -> (std::path::PathBuf, std::path::PathBuf, std::path::PathBuf) {
    let x_items: Vec<serde_json::Value> = (0..x_count)
        .map(|i| {
            serde_json::json!({
                "tags": {
                    "gender": [{"text": "1girl", "weight": 1.0}],
                    "general": [{"text": format!("pose-{i}"), "weight": 1.0}],
                    "quality": [{"text": "masterpiece", "weight": 1.0}]
                },
                "info": {"index": i, "type": "normal"},
                "description": {"zh": "角色", "en": "subject"}
            })
        })
        .collect();
    let y_items: Vec<serde_json::Value> = (0..y_count)
        .map(|i| {
            serde_json::json!({
                "tags": [{"text": format!("artist-{i}"), "weight": 1.0}],
                "info": {"index": i, "type": "artists"}
            })
        })
        .collect();

    let x_json = dir.join("x.json");
    let y_json = dir.join("y.json");
    std::fs::write(
        &x_json,
        serde_json::json!({"schema": "prompt-x-table/v1", "items": x_items}).to_string(),
    )
    .unwrap();
    std::fs::write(
        &y_json,
        serde_json::json!({"schema": "prompt-y-table/v2", "items": y_items}).to_string(),
    )
    .unwrap();

    let workflow = dir.join("workflow.json");
    std::fs::write(
        &workflow,
        serde_json::json!({
            "3": {
                "class_type": "KSampler",
                "inputs": {
                    "seed": 1, "steps": 20, "cfg": 7.0, "denoise": 1.0,
                    "sampler_name": "euler", "scheduler": "normal",
                    "positive": ["6", 0], "negative": ["7", 0], "latent_image": ["5", 0]
                }
            },
            "5": {"class_type": "EmptyLatentImage", "inputs": {"width": 832, "height": 1216, "batch_size": 1}},
            "6": {"class_type": "CLIPTextEncode", "inputs": {"text": ""}},
            "7": {"class_type": "CLIPTextEncode", "inputs": {"text": "lowres,"}},
            "9": {"class_type": "SaveImage", "inputs": {"filename_prefix": "ComfyUI", "images": ["8", 0]}}
        })
        .to_string(),
    )
    .unwrap();

    (x_json, y_json, workflow)
}

fn base_config(dir: &Path, x_count: usize, y_count: usize) -> RunConfig {
    let (x_json, y_json, workflow) = write_fixtures(dir, x_count, y_count);
    RunConfig {
        x_json,
        y_json,
        workflow_json: Some(workflow),
        run_dir: Some(dir.join("run")),
        out_root: dir.join("out"),
        client_id: "test-client".to_string(),
        request_timeout: Duration::from_secs(5),
        job_timeout: Duration::from_secs(10),
        concurrency: 1,
        ..Default::default()
    }
}

#[tokio::test]
async fn dry_run_records_every_cell_without_dispatching() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path(), 2, 3);
    config.dry_run = true;
    config.workflow_json = None;
    // Unroutable on purpose: a dry run must not open connections.
    config.base_url = "http://127.0.0.1:9".to_string();

    let outcome = GridRunner::new(config).run().await.unwrap();

    assert_eq!(outcome.stats.skipped, 6);
    assert_eq!(outcome.stats.success, 0);
    assert!(!outcome.any_failed);

    let records = load_latest_records(&outcome.run_dir.join("metadata.jsonl")).unwrap();
    assert_eq!(records.len(), 6);
    let record = &records[&(1, 2)];
    assert_eq!(record.status, RecordStatus::Skipped);
    assert_eq!(record.skip_reason, Some(SkipReason::DryRun));
    assert_eq!(record.workflow_hash, "not_loaded");
    // Parameters are fully resolved even though nothing was submitted.
    assert!(record.generation_params.negative_prompt.is_none());
    assert!(record.positive_prompt.contains("artist-2"));
    assert!(outcome.run_dir.join("run.json").is_file());
}

#[tokio::test]
async fn full_run_then_resume_skips_without_network_calls() {
    let state = Arc::new(MockState::default());
    let addr = start_server(Arc::clone(&state)).await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path(), 1, 2);
    config.base_url = format!("http://{addr}");

    let outcome = GridRunner::new(config.clone()).run().await.unwrap();
    assert_eq!(outcome.stats.success, 2);
    assert!(!outcome.any_failed);
    assert_eq!(state.submits.load(Ordering::SeqCst), 2);

    for rel in ["images/x0-y0.png", "images/x0-y1.png"] {
        let path = outcome.run_dir.join(rel);
        assert_eq!(std::fs::read(&path).unwrap(), b"image-bytes");
    }

    let records = load_latest_records(&outcome.run_dir.join("metadata.jsonl")).unwrap();
    let record = &records[&(0, 1)];
    assert_eq!(record.status, RecordStatus::Success);
    assert_eq!(record.comfyui_prompt_id.as_deref(), Some("p-1"));
    assert_eq!(
        record.local_image_paths.as_deref(),
        Some(&["images/x0-y1.png".to_string()][..])
    );
    // The append suffix applies to "normal" rows on top of the
    // workflow's default negative prompt.
    let negative = record.generation_params.negative_prompt.as_deref().unwrap();
    assert!(negative.starts_with("lowres,"));
    assert!(negative.contains("nsfw"));

    // Same inputs, same run dir: every cell is a resume hit and the
    // backend sees no further traffic.
    let resumed = GridRunner::new(config.clone()).run().await.unwrap();
    assert_eq!(resumed.stats.resume_hit, 2);
    assert_eq!(resumed.stats.skipped, 2);
    assert_eq!(resumed.stats.success, 0);
    assert_eq!(state.submits.load(Ordering::SeqCst), 2);

    // Deleting an output invalidates exactly that cell's resume hit.
    std::fs::remove_file(outcome.run_dir.join("images/x0-y1.png")).unwrap();
    let repaired = GridRunner::new(config.clone()).run().await.unwrap();
    assert_eq!(repaired.stats.resume_hit, 1);
    assert_eq!(repaired.stats.success, 1);
    assert_eq!(state.submits.load(Ordering::SeqCst), 3);

    // A different base seed changes every derived seed: full re-dispatch.
    config.base_seed = 7;
    let reseeded = GridRunner::new(config).run().await.unwrap();
    assert_eq!(reseeded.stats.resume_hit, 0);
    assert_eq!(reseeded.stats.success, 2);
    assert_eq!(state.submits.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn backend_failures_become_failed_records_not_a_crashed_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path(), 1, 2);
    // Nothing listens here: every submit fails at the transport level.
    config.base_url = "http://127.0.0.1:9".to_string();

    let outcome = GridRunner::new(config).run().await.unwrap();

    assert!(outcome.any_failed);
    assert_eq!(outcome.stats.failed, 2);
    assert_eq!(outcome.stats.success, 0);

    let records = load_latest_records(&outcome.run_dir.join("metadata.jsonl")).unwrap();
    assert_eq!(records.len(), 2);
    for record in records.values() {
        assert_eq!(record.status, RecordStatus::Failed);
        let error = record.error.as_ref().unwrap();
        assert!(!error.kind.is_empty());
        assert!(!error.message.is_empty());
        assert!(record.elapsed_ms.is_some());
    }
}

#[tokio::test]
async fn concurrent_run_completes_every_cell() {
    let state = Arc::new(MockState::default());
    let addr = start_server(Arc::clone(&state)).await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path(), 2, 3);
    config.base_url = format!("http://{addr}");
    config.concurrency = 3;

    let runner = GridRunner::new(config);
    let mut events = runner.subscribe();
    let outcome = runner.run().await.unwrap();

    assert_eq!(outcome.stats.success, 6);
    assert_eq!(state.submits.load(Ordering::SeqCst), 6);

    // Every cell produced exactly one progress event plus start/finish.
    let mut recorded = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, gridgen_pipeline::RunEvent::CellRecorded { .. }) {
            recorded += 1;
        }
    }
    assert_eq!(recorded, 6);
}
