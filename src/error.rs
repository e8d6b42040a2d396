use crate::model::{Action, StepId, StepStatus};
use thiserror::Error;

/// Failure of a single backend call. The client never retries; callers decide.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// Transport failure or non-2xx status.
    #[error("network error on {endpoint}: {reason}")]
    Network {
        endpoint: &'static str,
        reason: String,
    },

    /// Well-formed envelope with `success: false`.
    #[error("{endpoint} rejected the request: {}", message.as_deref().unwrap_or("no message"))]
    Protocol {
        endpoint: &'static str,
        message: Option<String>,
    },

    /// Body could not be read as the expected envelope.
    #[error("malformed response from {endpoint}: {reason}")]
    MalformedResponse {
        endpoint: &'static str,
        reason: String,
    },
}

impl ApiError {
    pub fn endpoint(&self) -> &'static str {
        match self {
            ApiError::Network { endpoint, .. }
            | ApiError::Protocol { endpoint, .. }
            | ApiError::MalformedResponse { endpoint, .. } => endpoint,
        }
    }

    /// False when no successful HTTP response came back at all.
    pub fn reached_backend(&self) -> bool {
        !matches!(self, ApiError::Network { .. })
    }

    /// Message supplied by the backend, if any.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            ApiError::Protocol { message, .. } => message.as_deref(),
            _ => None,
        }
    }

    /// Human-readable text: the backend's message when present, otherwise `fallback`.
    pub fn user_message(&self, fallback: &str) -> String {
        if let Some(m) = self.server_message().filter(|m| !m.trim().is_empty()) {
            return m.to_string();
        }
        match self {
            ApiError::Protocol { .. } => fallback.to_string(),
            ApiError::Network { reason, .. } | ApiError::MalformedResponse { reason, .. } => {
                format!("{fallback}: {reason}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    #[error("cannot {op} step {step} while it is {from:?}")]
    InvalidTransition {
        step: StepId,
        op: &'static str,
        from: StepStatus,
    },

    #[error("progress of {step} cannot go from {current} back to {requested}")]
    ProgressRegression {
        step: StepId,
        current: u8,
        requested: u8,
    },

    #[error("progress {0} is out of range 0-100")]
    OutOfRange(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    #[error("{current} is still in progress")]
    Busy { current: Action },

    #[error("no Emby Server path selected")]
    NoPathSelected,

    #[error("shutdown in progress, operations are disabled")]
    ShuttingDown,

    #[error("FFMPEG is already compatible with your system")]
    AlreadyCompatible,

    /// The stop step failed; nothing after it was attempted.
    #[error("shutdown sequence aborted: {0}")]
    SequenceAborted(#[source] ApiError),

    #[error(transparent)]
    Step(#[from] StepError),
}

impl OrchestratorError {
    /// Text for the user, preferring what the backend said.
    pub fn user_message(&self) -> String {
        match self {
            OrchestratorError::SequenceAborted(e) => {
                e.user_message(Action::StopProcess.fallback_error())
            }
            other => other.to_string(),
        }
    }
}
