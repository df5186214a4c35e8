use relay_types::{ActionError, ErrorCode};

/// Structured failure carried by a bus terminal and by tool-call results.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RuntimeError {
    pub code: ErrorCode,
    pub message: String,
}

impl RuntimeError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn stream(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::StreamError, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NetworkError, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnknownError, message)
    }

    pub fn cancelled() -> Self {
        Self::unknown("run cancelled")
    }

    /// Keeps a `RuntimeError` found anywhere in the chain, otherwise classifies
    /// the rendered message.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        Self::from_anyhow_or(err, ErrorCode::UnknownError)
    }

    /// Like [`RuntimeError::from_anyhow`] with `fallback` used for errors that
    /// are neither structured nor transport failures.
    pub fn from_anyhow_or(err: &anyhow::Error, fallback: ErrorCode) -> Self {
        if let Some(structured) = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<RuntimeError>())
        {
            return structured.clone();
        }
        let message = format!("{err:#}");
        if is_network_message(&message) {
            return Self::network(message);
        }
        Self::new(fallback, message)
    }

    pub fn to_action_error(&self) -> ActionError {
        ActionError::new(self.code, self.message.clone())
    }
}

impl From<ActionError> for RuntimeError {
    fn from(value: ActionError) -> Self {
        Self::new(value.code, value.message)
    }
}

const NETWORK_MARKERS: &[&str] = &[
    "fetch failed",
    "econnrefused",
    "connection refused",
    "econnreset",
    "connection reset",
    "enotfound",
    "etimedout",
    "timed out",
    "terminated",
    "other side closed",
    "und_err_socket",
    "socket hang up",
    "broken pipe",
    "error sending request",
    "dns error",
];

/// True when `message` looks like a dropped or refused transport connection.
pub fn is_network_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    NETWORK_MARKERS.iter().any(|marker| lower.contains(marker))
}
