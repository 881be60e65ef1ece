//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps workflow submission and history retrieval using [`reqwest`].
//! History fetches are retried with backoff on transient statuses;
//! submission is a single attempt (the caller decides whether a cell is
//! re-run). Output downloads live in [`crate::download`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use gridgen_core::retry::{retry, RetryError, RetryPolicy};

use crate::base_url::BaseUrl;
use crate::error::{ClientError, ErrorKind};

/// Retry bounds for `GET /history/{id}`.
pub const HISTORY_RETRY_MAX_ATTEMPTS: u32 = 5;
pub const HISTORY_RETRY_DEADLINE: Duration = Duration::from_secs(10);

/// Retry bounds for `GET /view` downloads.
pub const VIEW_RETRY_MAX_ATTEMPTS: u32 = 5;
pub const VIEW_RETRY_DEADLINE: Duration = Duration::from_secs(15);

/// Backoff shape shared by both retried GETs.
pub(crate) const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);
pub(crate) const RETRY_MAX_DELAY_PER_ATTEMPT: Duration = Duration::from_secs(5);

/// Statuses retried beyond the generic 5xx rule.
const RETRYABLE_STATUSES: [u16; 4] = [429, 502, 503, 504];

/// One remote output descriptor from a history listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageRef {
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subfolder: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub image_type: Option<String>,
}

/// HTTP client for a single ComfyUI instance.
#[derive(Debug, Clone)]
pub struct ComfyApi {
    pub(crate) client: reqwest::Client,
    pub(crate) base: BaseUrl,
}

impl ComfyApi {
    /// Create a new API client with a per-request timeout.
    pub fn new(base: BaseUrl, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .expect("Failed to build reqwest HTTP client");
        Self { client, base }
    }

    /// Create an API client reusing an existing [`reqwest::Client`]
    /// (useful for connection pooling across call sites).
    pub fn with_client(client: reqwest::Client, base: BaseUrl) -> Self {
        Self { client, base }
    }

    pub fn base(&self) -> &BaseUrl {
        &self.base
    }

    /// Submit a patched workflow for execution.
    ///
    /// Sends `POST /prompt` with `{"prompt": graph, "client_id": id}`.
    /// The job id is accepted under either of the two key spellings the
    /// server has used historically (`prompt_id`, `promptId`).
    pub async fn submit(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<String, ClientError> {
        let url = self.base.http_endpoint("prompt");
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("POST", url.as_str(), &e))?;
        let response = ensure_success(response, false).await?;
        let body = response_json_object(response, "/prompt").await?;

        for key in ["prompt_id", "promptId"] {
            if let Some(id) = body.get(key).and_then(|v| v.as_str()) {
                if !id.is_empty() {
                    return Ok(id.to_string());
                }
            }
        }

        let mut keys: Vec<&str> = body.keys().map(String::as_str).collect();
        keys.sort_unstable();
        Err(
            ClientError::new(ErrorKind::SubmitMissingId, "submit response missing prompt id")
                .with_context("response_keys", serde_json::json!(keys)),
        )
    }

    /// Retrieve the history item for one prompt, retrying transient
    /// failures (429/5xx, connect/timeout) within a bounded budget.
    ///
    /// The server returns either `{<prompt_id>: {...}}` or the item
    /// directly; both shapes are accepted.
    pub async fn history(&self, prompt_id: &str) -> Result<serde_json::Value, ClientError> {
        let url = self.base.http_endpoint(&format!("history/{prompt_id}"));
        let policy = RetryPolicy {
            max_attempts: Some(HISTORY_RETRY_MAX_ATTEMPTS),
            deadline: Some(HISTORY_RETRY_DEADLINE),
            base_delay: RETRY_BASE_DELAY,
            max_delay_per_attempt: RETRY_MAX_DELAY_PER_ATTEMPT,
        };

        let response = retry(&policy, ClientError::is_transient, || {
            // Each attempt owns its handles so the future does not
            // borrow through the retry closure.
            let client = self.client.clone();
            let url = url.clone();
            async move {
                let response = client
                    .get(url.clone())
                    .send()
                    .await
                    .map_err(|e| transport_error("GET", url.as_str(), &e))?;
                ensure_success(response, false).await
            }
        })
        .await
        .map_err(flatten_retry_error)?;

        let body = response_json_object(response, "/history/{prompt_id}").await?;
        match body.get(prompt_id) {
            Some(serde_json::Value::Object(wrapped)) => {
                Ok(serde_json::Value::Object(wrapped.clone()))
            }
            _ => Ok(serde_json::Value::Object(body)),
        }
    }

    /// Fetch the raw bytes of one output, single attempt.
    pub async fn download_bytes(&self, image: &ImageRef) -> Result<Vec<u8>, ClientError> {
        let url = self.base.http_endpoint("view");
        let params = build_view_params(image)?;

        let response = self
            .client
            .get(url.clone())
            .query(&params)
            .send()
            .await
            .map_err(|e| transport_error("GET", url.as_str(), &e))?;
        let response = ensure_success(response, true).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error("GET", url.as_str(), &e))?;
        Ok(bytes.to_vec())
    }
}

/// Build the `/view` query parameters for an output descriptor.
///
/// The filename is required; `type` defaults to `"output"`.
pub fn build_view_params(image: &ImageRef) -> Result<Vec<(&'static str, String)>, ClientError> {
    if image.filename.is_empty() {
        return Err(ClientError::new(
            ErrorKind::InvalidConfiguration,
            "image filename is required",
        ));
    }

    let mut params = vec![("filename", image.filename.clone())];
    if let Some(subfolder) = image.subfolder.as_deref().filter(|s| !s.is_empty()) {
        params.push(("subfolder", subfolder.to_string()));
    }
    let image_type = image
        .image_type
        .as_deref()
        .filter(|s| !s.is_empty())
        .unwrap_or("output");
    params.push(("type", image_type.to_string()));
    Ok(params)
}

/// Whether a history item's output listing contains at least one
/// non-empty image array.
pub fn history_has_images(history_item: &serde_json::Value) -> bool {
    let Some(outputs) = history_item.get("outputs").and_then(|v| v.as_object()) else {
        return false;
    };
    outputs.values().any(|output| {
        output
            .get("images")
            .and_then(|v| v.as_array())
            .is_some_and(|images| !images.is_empty())
    })
}

/// Collect all downloadable output descriptors from a history item.
/// Entries without a non-empty string filename are skipped.
pub fn collect_remote_images(history_item: &serde_json::Value) -> Vec<ImageRef> {
    let Some(outputs) = history_item.get("outputs").and_then(|v| v.as_object()) else {
        return Vec::new();
    };

    let mut images = Vec::new();
    for output in outputs.values() {
        let Some(node_images) = output.get("images").and_then(|v| v.as_array()) else {
            continue;
        };
        for item in node_images {
            let Some(filename) = item.get("filename").and_then(|v| v.as_str()) else {
                continue;
            };
            if filename.is_empty() {
                continue;
            }
            let string_field = |key: &str| {
                item.get(key)
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            };
            images.push(ImageRef {
                filename: filename.to_string(),
                subfolder: string_field("subfolder"),
                image_type: string_field("type"),
            });
        }
    }
    images
}

// ---- shared request helpers ----

/// Map a reqwest transport failure (no HTTP status) to a classified error.
pub(crate) fn transport_error(method: &str, url: &str, error: &reqwest::Error) -> ClientError {
    let kind = if error.is_connect() || error.is_timeout() {
        ErrorKind::TransientHttp
    } else {
        ErrorKind::NonTransientHttp
    };
    ClientError::new(kind, "http request failed")
        .with_context("method", method)
        .with_context("url", url)
        .with_context("detail", error.to_string())
}

/// Classify a non-success response status and return the response
/// unchanged on success. `view_request` additionally treats 404 as
/// transient (the artifact may not be materialized yet).
pub(crate) async fn ensure_success(
    response: reqwest::Response,
    view_request: bool,
) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let code = status.as_u16();
    let transient = RETRYABLE_STATUSES.contains(&code)
        || status.is_server_error()
        || (view_request && code == 404);
    let kind = if transient {
        ErrorKind::TransientHttp
    } else {
        ErrorKind::NonTransientHttp
    };

    let url = response.url().to_string();
    Err(ClientError::new(kind, "http request failed")
        .with_context("status_code", code)
        .with_context("url", url))
}

/// Parse a successful response body into a JSON object.
pub(crate) async fn response_json_object(
    response: reqwest::Response,
    endpoint: &str,
) -> Result<serde_json::Map<String, serde_json::Value>, ClientError> {
    let body: serde_json::Value = response.json().await.map_err(|e| {
        ClientError::new(ErrorKind::InvalidResponseShape, "invalid json response")
            .with_context("endpoint", endpoint)
            .with_context("detail", e.to_string())
    })?;
    match body {
        serde_json::Value::Object(map) => Ok(map),
        _ => Err(
            ClientError::new(ErrorKind::InvalidResponseShape, "json response must be an object")
                .with_context("endpoint", endpoint),
        ),
    }
}

/// Collapse the retry wrapper into the plain client error.
pub(crate) fn flatten_retry_error(error: RetryError<ClientError>) -> ClientError {
    match error {
        RetryError::InvalidPolicy(reason) => {
            ClientError::new(ErrorKind::InvalidConfiguration, reason)
        }
        RetryError::Operation(error) => error,
    }
}
