//! Completion waiting: stream-first with history-poll fallback.
//!
//! The primary path reads execution events off the WebSocket stream
//! until a terminal event for the prompt arrives. If the stream cannot
//! be established, or fails mid-wait, the waiter falls back to polling
//! the history endpoint for the *remaining* deadline budget; the start
//! time is never reset. Backend-reported execution failures surface
//! immediately on either path; they are job failures, not transport
//! failures.

use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

use crate::api::{history_has_images, ComfyApi};
use crate::client::ComfyClient;
use crate::error::{ClientError, ErrorKind};
use crate::messages::{parse_message, ComfyMessage, ExecutionFailureData};

/// Sleep between history polls on the fallback path.
pub const HISTORY_FALLBACK_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Wait on an event stream until `prompt_id` reaches a terminal state.
///
/// Generic over the frame stream so tests can feed recorded frames.
/// `started` anchors the deadline: a waiter that already spent part of
/// its budget connecting keeps only the remainder.
///
/// Terminal success is an `executing` event with a null node for this
/// prompt, or an explicit `execution_success`. Frames that are not
/// valid JSON objects, unknown message types, and events for other
/// prompts are skipped. Per-read timeouts are retried silently up to
/// the overall deadline.
pub async fn wait_prompt_done<S, E>(
    stream: &mut S,
    prompt_id: &str,
    per_read_timeout: Duration,
    job_timeout: Duration,
    started: Instant,
) -> Result<(), ClientError>
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    validate_job_timeout(job_timeout)?;

    loop {
        let elapsed = started.elapsed();
        if elapsed >= job_timeout {
            return Err(job_timeout_error(prompt_id, job_timeout, elapsed, None));
        }

        let frame = match tokio::time::timeout(per_read_timeout, stream.next()).await {
            // Per-read timeout: loop back and re-check the deadline.
            Err(_) => continue,
            Ok(None) => {
                return Err(ClientError::new(
                    ErrorKind::StreamReceiveFailed,
                    "websocket stream ended",
                )
                .with_context("prompt_id", prompt_id));
            }
            Ok(Some(Err(e))) => {
                return Err(ClientError::new(
                    ErrorKind::StreamReceiveFailed,
                    "websocket receive failed",
                )
                .with_context("prompt_id", prompt_id)
                .with_context("detail", e.to_string()));
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let Message::Text(text) = frame else {
            // Binary frames carry preview images; pings are handled by
            // the transport.
            continue;
        };

        let message = match parse_message(&text) {
            Ok(message) => message,
            Err(e) => {
                tracing::trace!(error = %e, "Skipping unparseable frame");
                continue;
            }
        };

        match message {
            ComfyMessage::ExecutionError(data) if is_for_prompt(&data, prompt_id) => {
                return Err(execution_failure(
                    ErrorKind::ExecutionError,
                    "execution_error",
                    prompt_id,
                    &data,
                ));
            }
            ComfyMessage::ExecutionInterrupted(data) if is_for_prompt(&data, prompt_id) => {
                return Err(execution_failure(
                    ErrorKind::ExecutionInterrupted,
                    "execution_interrupted",
                    prompt_id,
                    &data,
                ));
            }
            ComfyMessage::Executing(data) => {
                if data.prompt_id.as_deref() == Some(prompt_id) && data.node.is_none() {
                    return Ok(());
                }
            }
            ComfyMessage::ExecutionSuccess(data) => {
                if data.prompt_id.as_deref() == Some(prompt_id) {
                    return Ok(());
                }
            }
            ComfyMessage::Progress(data) => {
                tracing::debug!(value = data.value, max = data.max, "Generation progress");
            }
            ComfyMessage::Status(data) => {
                tracing::debug!(
                    queue_remaining = data.status.exec_info.queue_remaining,
                    "ComfyUI queue status",
                );
            }
            _ => {}
        }
    }
}

/// Two-tier wait: stream first, history polling for the remaining
/// budget when the stream is unavailable.
pub async fn wait_prompt_done_with_fallback(
    api: &ComfyApi,
    client: &ComfyClient,
    prompt_id: &str,
    request_timeout: Duration,
    job_timeout: Duration,
) -> Result<(), ClientError> {
    validate_job_timeout(job_timeout)?;

    let started = Instant::now();

    let stream_result = match client.connect().await {
        Ok(mut ws) => {
            wait_prompt_done(&mut ws, prompt_id, request_timeout, job_timeout, started).await
        }
        Err(e) => Err(e),
    };

    match stream_result {
        Ok(()) => return Ok(()),
        Err(e) if matches!(e.kind, ErrorKind::StreamConnectFailed | ErrorKind::StreamReceiveFailed) => {
            tracing::warn!(
                prompt_id,
                stream_error = e.kind.as_str(),
                "Event stream unavailable, falling back to history polling",
            );
        }
        Err(e) => return Err(e),
    }

    loop {
        let elapsed = started.elapsed();
        if elapsed >= job_timeout {
            return Err(job_timeout_error(
                prompt_id,
                job_timeout,
                elapsed,
                Some("history_poll"),
            ));
        }

        let history_item = api.history(prompt_id).await?;
        if history_has_images(&history_item) {
            return Ok(());
        }

        let remaining = job_timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            continue;
        }
        tokio::time::sleep(HISTORY_FALLBACK_POLL_INTERVAL.min(remaining)).await;
    }
}

fn validate_job_timeout(job_timeout: Duration) -> Result<(), ClientError> {
    if job_timeout.is_zero() {
        return Err(
            ClientError::new(ErrorKind::InvalidConfiguration, "job timeout must be positive")
                .with_context("job_timeout_s", job_timeout.as_secs_f64()),
        );
    }
    Ok(())
}

fn job_timeout_error(
    prompt_id: &str,
    job_timeout: Duration,
    elapsed: Duration,
    wait_mode: Option<&str>,
) -> ClientError {
    let mut error = ClientError::new(
        ErrorKind::JobTimeout,
        format!("job timeout while waiting prompt {prompt_id}"),
    )
    .with_context("prompt_id", prompt_id)
    .with_context("job_timeout_s", job_timeout.as_secs_f64())
    .with_context("elapsed_s", (elapsed.as_secs_f64() * 1000.0).round() / 1000.0);
    if let Some(mode) = wait_mode {
        error = error.with_context("wait_mode", mode);
    }
    error
}

fn is_for_prompt(data: &ExecutionFailureData, prompt_id: &str) -> bool {
    data.prompt_id.as_deref() == Some(prompt_id)
}

fn execution_failure(
    kind: ErrorKind,
    message_type: &str,
    prompt_id: &str,
    data: &ExecutionFailureData,
) -> ClientError {
    let message = match data.exception_message.as_deref().filter(|m| !m.is_empty()) {
        Some(detail) => format!("prompt {prompt_id} {message_type}: {detail}"),
        None => format!("prompt {prompt_id} {message_type}"),
    };

    let mut error = ClientError::new(kind, message).with_context("prompt_id", prompt_id);
    for (key, value) in [
        ("node_id", &data.node_id),
        ("node_type", &data.node_type),
        ("exception_type", &data.exception_type),
        ("exception_message", &data.exception_message),
    ] {
        if let Some(value) = value {
            error = error.with_context(key, value.as_str());
        }
    }
    error
}
