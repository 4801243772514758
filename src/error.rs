//! Error handling for the installer.
//!
//! Lower layers (topology reader, command runner, marker engine) return these
//! errors to their caller. The step pipeline is the first layer that turns one
//! into a user-visible update.

use std::path::PathBuf;
use thiserror::Error;

use crate::markers::MarkerError;

/// Main error type for the installer
#[derive(Error, Debug)]
pub enum InstallError {
    /// IO errors (file operations, pipes, sysfs reads)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON decoding errors (lsblk output, config files)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Device topology could not be read
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// A template file carried a bad or unknown marker
    #[error("applying {}: {source}", path.display())]
    Marker {
        path: PathBuf,
        #[source]
        source: MarkerError,
    },

    /// A subprocess could not be started
    #[error("failed to start {program}: {source}")]
    CommandSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A subprocess exited unsuccessfully
    #[error("{command} failed (exit code {}){}", code.map_or_else(|| "none".to_string(), |c| c.to_string()), fmt_output(output))]
    CommandFailed {
        command: String,
        code: Option<i32>,
        output: String,
    },

    /// The target disk cannot hold the requested layout
    #[error("Layout error: {0}")]
    Layout(String),

    /// Configuration errors (loading, validation, disk resolution)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Run state machine transition errors
    #[error("Run transition error: {0}")]
    RunTransition(String),

    /// General errors (catch-all for edge cases)
    #[error("{0}")]
    General(String),
}

fn fmt_output(output: &str) -> String {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {}", trimmed)
    }
}

/// Result type alias for installer operations
pub type Result<T> = std::result::Result<T, InstallError>;

impl InstallError {
    /// Create a discovery error
    pub fn discovery(msg: impl Into<String>) -> Self {
        Self::Discovery(msg.into())
    }

    /// Create a layout error
    pub fn layout(msg: impl Into<String>) -> Self {
        Self::Layout(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a general error
    pub fn general(msg: impl Into<String>) -> Self {
        Self::General(msg.into())
    }

    /// Wrap a marker error with the file it occurred in
    pub fn marker(path: impl Into<PathBuf>, source: MarkerError) -> Self {
        Self::Marker {
            path: path.into(),
            source,
        }
    }
}
