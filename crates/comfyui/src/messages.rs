//! ComfyUI WebSocket message types and parser.
//!
//! ComfyUI sends JSON messages over WebSocket with the shape
//! `{"type": "<kind>", "data": {...}}`. This module deserializes them
//! into a strongly-typed [`ComfyMessage`] enum. Unknown types and
//! malformed frames parse as `Err`; the wait loop logs and skips them.

use serde::Deserialize;

/// All ComfyUI WebSocket message types the waiter cares about.
///
/// Deserialized via the internally-tagged `"type"` field with
/// associated `"data"` content.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ComfyMessage {
    /// Server status broadcast (queue depth, etc.).
    #[serde(rename = "status")]
    Status(StatusData),

    /// A prompt has started executing.
    #[serde(rename = "execution_start")]
    ExecutionStart(ExecutionStartData),

    /// A specific node is executing; `node: null` means the prompt is done.
    #[serde(rename = "executing")]
    Executing(ExecutingData),

    /// Progress update from a long-running node (e.g. KSampler).
    #[serde(rename = "progress")]
    Progress(ProgressData),

    /// A node has finished and produced output.
    #[serde(rename = "executed")]
    Executed(ExecutedData),

    /// Explicit terminal success for a prompt.
    #[serde(rename = "execution_success")]
    ExecutionSuccess(ExecutionSuccessData),

    /// Execution failed with an error.
    #[serde(rename = "execution_error")]
    ExecutionError(ExecutionFailureData),

    /// Execution was interrupted.
    #[serde(rename = "execution_interrupted")]
    ExecutionInterrupted(ExecutionFailureData),
}

/// Queue status information.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
}

/// Current queue state.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

/// Execution queue statistics.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: i64,
}

/// Payload for `execution_start` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionStartData {
    pub prompt_id: String,
}

/// Payload for `executing` messages.
///
/// When `node` is `None`, execution of the prompt has completed.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

/// Payload for `progress` messages (step-level progress within a node).
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    pub value: i64,
    pub max: i64,
}

/// Payload for `executed` messages (node output).
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    pub node: String,
    pub output: serde_json::Value,
    pub prompt_id: String,
}

/// Payload for `execution_success` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionSuccessData {
    #[serde(default)]
    pub prompt_id: Option<String>,
}

/// Payload for `execution_error` / `execution_interrupted` messages.
///
/// All fields besides `prompt_id` are optional: interrupted prompts in
/// particular omit the exception details.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionFailureData {
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_type: Option<String>,
    #[serde(default)]
    pub exception_type: Option<String>,
    #[serde(default)]
    pub exception_message: Option<String>,
}

/// Parse a ComfyUI WebSocket text message into a typed enum.
///
/// Returns `Err` for malformed JSON or unknown `type` values.
/// Callers should log unknown types and continue.
pub fn parse_message(text: &str) -> Result<ComfyMessage, serde_json::Error> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_status_message() {
        let json = r#"{"type":"status","data":{"status":{"exec_info":{"queue_remaining":3}}}}"#;
        match parse_message(json).unwrap() {
            ComfyMessage::Status(data) => {
                assert_eq!(data.status.exec_info.queue_remaining, 3);
            }
            other => panic!("Expected Status, got {other:?}"),
        }
    }

    #[test]
    fn parse_executing_with_node() {
        let json = r#"{"type":"executing","data":{"node":"42","prompt_id":"xyz"}}"#;
        match parse_message(json).unwrap() {
            ComfyMessage::Executing(data) => {
                assert_eq!(data.node.as_deref(), Some("42"));
                assert_eq!(data.prompt_id.as_deref(), Some("xyz"));
            }
            other => panic!("Expected Executing, got {other:?}"),
        }
    }

    #[test]
    fn parse_executing_finished() {
        let json = r#"{"type":"executing","data":{"node":null,"prompt_id":"xyz"}}"#;
        match parse_message(json).unwrap() {
            ComfyMessage::Executing(data) => assert!(data.node.is_none()),
            other => panic!("Expected Executing, got {other:?}"),
        }
    }

    #[test]
    fn parse_execution_success() {
        let json = r#"{"type":"execution_success","data":{"prompt_id":"abc"}}"#;
        match parse_message(json).unwrap() {
            ComfyMessage::ExecutionSuccess(data) => {
                assert_eq!(data.prompt_id.as_deref(), Some("abc"));
            }
            other => panic!("Expected ExecutionSuccess, got {other:?}"),
        }
    }

    #[test]
    fn parse_execution_error_with_full_details() {
        let json = r#"{"type":"execution_error","data":{"prompt_id":"abc","node_id":"5","exception_message":"out of memory","exception_type":"RuntimeError"}}"#;
        match parse_message(json).unwrap() {
            ComfyMessage::ExecutionError(data) => {
                assert_eq!(data.prompt_id.as_deref(), Some("abc"));
                assert_eq!(data.node_id.as_deref(), Some("5"));
                assert_eq!(data.exception_message.as_deref(), Some("out of memory"));
                assert_eq!(data.exception_type.as_deref(), Some("RuntimeError"));
            }
            other => panic!("Expected ExecutionError, got {other:?}"),
        }
    }

    #[test]
    fn parse_execution_interrupted_without_details() {
        let json = r#"{"type":"execution_interrupted","data":{"prompt_id":"abc"}}"#;
        match parse_message(json).unwrap() {
            ComfyMessage::ExecutionInterrupted(data) => {
                assert_eq!(data.prompt_id.as_deref(), Some("abc"));
                assert!(data.exception_message.is_none());
            }
            other => panic!("Expected ExecutionInterrupted, got {other:?}"),
        }
    }

    #[test]
    fn parse_progress_message() {
        let json = r#"{"type":"progress","data":{"value":5,"max":20}}"#;
        match parse_message(json).unwrap() {
            ComfyMessage::Progress(data) => {
                assert_eq!(data.value, 5);
                assert_eq!(data.max, 20);
            }
            other => panic!("Expected Progress, got {other:?}"),
        }
    }

    #[test]
    fn parse_unknown_type_returns_error() {
        assert!(parse_message(r#"{"type":"unknown_thing","data":{}}"#).is_err());
    }

    #[test]
    fn parse_invalid_json_returns_error() {
        assert!(parse_message("not json at all").is_err());
    }

    #[test]
    fn parse_non_object_returns_error() {
        assert!(parse_message(r#"["executing"]"#).is_err());
    }
}
