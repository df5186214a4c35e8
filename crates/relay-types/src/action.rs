use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error taxonomy shared by every layer that reports a failure to the client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidArguments,
    HandlerError,
    StreamError,
    NetworkError,
    UnknownError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidArguments => "INVALID_ARGUMENTS",
            ErrorCode::HandlerError => "HANDLER_ERROR",
            ErrorCode::StreamError => "STREAM_ERROR",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionError {
    pub code: ErrorCode,
    pub message: String,
}

impl ActionError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Name, description and JSON schema of an action as advertised to backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSchema {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "jsonSchema", alias = "input_schema")]
    pub parameters: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GuardrailsStatus {
    Allowed,
    Denied,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardrailsVerdict {
    pub status: GuardrailsStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl GuardrailsVerdict {
    pub fn allowed() -> Self {
        Self {
            status: GuardrailsStatus::Allowed,
            reason: None,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            status: GuardrailsStatus::Denied,
            reason: Some(reason.into()),
        }
    }

    pub fn is_denied(&self) -> bool {
        self.status == GuardrailsStatus::Denied
    }
}

/// Maps a streamed tool call (optionally one of its arguments) onto a key of
/// the agent state while the call is still being generated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmitStateConfig {
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_argument: Option<String>,
    pub state_key: String,
}
