//! Error types for the hub process.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<toml::de::Error> for HubError {
    fn from(e: toml::de::Error) -> Self {
        HubError::InvalidConfig(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HubError>;
