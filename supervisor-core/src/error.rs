//! The error taxonomy surfaced by control operations.
//!
//! Background loops never propagate these. They log and continue. Only
//! [`SupervisorError::FatalStartup`] is allowed to terminate the process.

use std::path::PathBuf;

/// A single error kind returned by a control operation.
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("unknown process {name:?}")]
    Unknown { name: String },

    #[error("process {name:?} already exists")]
    AlreadyExists { name: String },

    #[error("build failed for {name:?}: {output}")]
    BuildFailed { name: String, output: String },

    #[error("failed to spawn {name:?}: {source}")]
    SpawnFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("io error on {}: {source}", path.display())]
    IoFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no running process for {name:?}")]
    NoProcess { name: String },

    #[error("fatal startup error: {0}")]
    FatalStartup(String),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
