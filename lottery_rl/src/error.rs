// src/error.rs
//
// Error type shared by the environment, the agents, persistence and the
// manager. Transient numeric failures are converted into `Computation` and
// handled locally by the training loops; everything else is surfaced.

use std::fmt;

/// Result alias used across the crate.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur while training, evaluating or persisting agents.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// History is shorter than the window plus lookback needed.
    DataInsufficient { required: usize, available: usize },
    /// A configuration record failed validation.
    InvalidConfig { field: String, message: String },
    /// An action violates the configured sizes/ranges or is malformed.
    InvalidAction { message: String },
    /// `step` was called before `reset` (or after the episode finished).
    EnvironmentNotReset,
    /// A single numeric computation failed (tensor op, NaN, shape mismatch).
    Computation { message: String },
    /// Saving or loading a model blob failed.
    Persistence { path: String, message: String },
    /// A background training job was cancelled before any episode finished.
    Cancelled,
}

impl EngineError {
    pub fn invalid_config(field: &str, message: impl Into<String>) -> Self {
        EngineError::InvalidConfig {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub fn invalid_action(message: impl Into<String>) -> Self {
        EngineError::InvalidAction {
            message: message.into(),
        }
    }

    pub fn computation(message: impl Into<String>) -> Self {
        EngineError::Computation {
            message: message.into(),
        }
    }

    pub fn persistence(path: impl AsRef<std::path::Path>, message: impl Into<String>) -> Self {
        EngineError::Persistence {
            path: path.as_ref().display().to_string(),
            message: message.into(),
        }
    }

    /// True for failures a training loop may swallow and replace with a default.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Computation { .. } | EngineError::InvalidAction { .. }
        )
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::DataInsufficient {
                required,
                available,
            } => write!(
                f,
                "Insufficient draw history: need at least {} draws, got {}",
                required, available
            ),
            EngineError::InvalidConfig { field, message } => {
                write!(f, "Invalid configuration '{}': {}", field, message)
            }
            EngineError::InvalidAction { message } => write!(f, "Invalid action: {}", message),
            EngineError::EnvironmentNotReset => {
                write!(f, "Environment step called before reset")
            }
            EngineError::Computation { message } => write!(f, "Computation failed: {}", message),
            EngineError::Persistence { path, message } => {
                write!(f, "Persistence failure for '{}': {}", path, message)
            }
            EngineError::Cancelled => write!(f, "Training cancelled before any episode completed"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<candle_core::Error> for EngineError {
    fn from(err: candle_core::Error) -> Self {
        EngineError::computation(err.to_string())
    }
}
