//! Client error type with an explicit transient-vs-fatal kind.
//!
//! Every failure carries a `kind`, a human-readable message, and a small
//! structured context map. The kind drives retry and fallback decisions;
//! the whole triple is persisted into the run's metadata records, so
//! context values are bounded in size.

use std::collections::BTreeMap;

use serde::Serialize;

/// Longest context string persisted before truncation.
const MAX_CONTEXT_VALUE_LEN: usize = 200;

/// Classification of a client failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad caller-side input (base URL, timeouts, missing filename).
    InvalidConfiguration,
    /// The submit response carried no job id under either known key.
    SubmitMissingId,
    /// The event stream could not be established.
    StreamConnectFailed,
    /// The event stream failed mid-wait.
    StreamReceiveFailed,
    /// The per-job wall-clock deadline elapsed.
    JobTimeout,
    /// The backend reported the job failed.
    ExecutionError,
    /// The backend reported the job was interrupted.
    ExecutionInterrupted,
    /// Retryable HTTP failure (429/5xx, connect/timeout, 404 on view).
    TransientHttp,
    /// Non-retryable HTTP failure.
    NonTransientHttp,
    /// The response body was not the expected JSON shape.
    InvalidResponseShape,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidConfiguration => "invalid_configuration",
            Self::SubmitMissingId => "submit_missing_id",
            Self::StreamConnectFailed => "stream_connect_failed",
            Self::StreamReceiveFailed => "stream_receive_failed",
            Self::JobTimeout => "job_timeout",
            Self::ExecutionError => "execution_error",
            Self::ExecutionInterrupted => "execution_interrupted",
            Self::TransientHttp => "transient_http",
            Self::NonTransientHttp => "non_transient_http",
            Self::InvalidResponseShape => "invalid_response_shape",
        }
    }
}

/// A classified client failure with bounded structured context.
#[derive(Debug, Clone, thiserror::Error, Serialize)]
#[error("{message}")]
pub struct ClientError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, serde_json::Value>,
}

impl ClientError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: BTreeMap::new(),
        }
    }

    /// Attach a context entry; string values longer than the bound are
    /// truncated with an explicit marker.
    pub fn with_context(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.context
            .insert(key.to_string(), compact_value(value.into()));
        self
    }

    /// Whether a retry loop may reasonably try again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::StreamConnectFailed | ErrorKind::StreamReceiveFailed | ErrorKind::TransientHttp
        )
    }

    /// Serialize to the `{kind, message, context}` shape stored in
    /// metadata records.
    pub fn metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": self.kind.as_str(),
            "message": self.message,
            "context": self.context,
        })
    }
}

/// Bound a context value: long strings are truncated, everything else
/// passes through unchanged.
pub(crate) fn compact_value(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) if s.chars().count() > MAX_CONTEXT_VALUE_LEN => {
            let truncated: String = s.chars().take(MAX_CONTEXT_VALUE_LEN).collect();
            serde_json::Value::String(format!("{truncated}...(truncated)"))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds() {
        assert!(ClientError::new(ErrorKind::TransientHttp, "x").is_transient());
        assert!(ClientError::new(ErrorKind::StreamConnectFailed, "x").is_transient());
        assert!(ClientError::new(ErrorKind::StreamReceiveFailed, "x").is_transient());
        assert!(!ClientError::new(ErrorKind::JobTimeout, "x").is_transient());
        assert!(!ClientError::new(ErrorKind::ExecutionError, "x").is_transient());
        assert!(!ClientError::new(ErrorKind::NonTransientHttp, "x").is_transient());
    }

    #[test]
    fn long_context_strings_are_truncated() {
        let long = "a".repeat(300);
        let err = ClientError::new(ErrorKind::ExecutionError, "boom").with_context("detail", long);
        let stored = err.context["detail"].as_str().unwrap();
        assert!(stored.ends_with("...(truncated)"));
        assert_eq!(stored.chars().count(), 200 + "...(truncated)".len());
    }

    #[test]
    fn short_context_values_pass_through() {
        let err = ClientError::new(ErrorKind::TransientHttp, "x")
            .with_context("status_code", 503)
            .with_context("url", "http://host/view");
        assert_eq!(err.context["status_code"], 503);
        assert_eq!(err.context["url"], "http://host/view");
    }

    #[test]
    fn metadata_shape() {
        let err = ClientError::new(ErrorKind::JobTimeout, "job timeout").with_context("elapsed_s", 12.5);
        let meta = err.metadata();
        assert_eq!(meta["kind"], "job_timeout");
        assert_eq!(meta["message"], "job timeout");
        assert_eq!(meta["context"]["elapsed_s"], 12.5);
    }
}
