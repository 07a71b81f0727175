//! Error types for the engine side of a display client.

use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Engine is disconnected")]
    Disconnected,
}

pub type EngineResult<T = ()> = std::result::Result<T, EngineError>;

/// Why an incoming `set` did not become a control change.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControlError {
    #[error("unknown control key '{0}'")]
    UnknownKey(String),

    #[error("'{key}' needs a finite number, got {value}")]
    NotFinite { key: String, value: Value },
}
