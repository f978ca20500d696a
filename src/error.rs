//! Error types for subprocess spawning and supervision

use thiserror::Error;

/// Errors surfaced synchronously by the spawner-side API.
///
/// Anything that can be detected before the subprocess exists (bad
/// configuration, unknown entry point, OS refusing to start the process) is
/// reported through this type. Once the subprocess is running, failures are
/// observable only through its exit status and logs; callers needing finer
/// detail must inspect its stdout/stderr themselves.
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Entry point error: {0}")]
    EntryPoint(String),

    #[error("Failed to spawn process: {0}")]
    ProcessSpawn(String),

    #[error("Failed to signal process: {0}")]
    ProcessSignal(String),

    #[error("Failed to wait for process: {0}")]
    ProcessWait(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SpawnError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            SpawnError::Configuration(_) => "SPAWN001",
            SpawnError::EntryPoint(_) => "SPAWN002",
            SpawnError::ProcessSpawn(_) => "SPAWN003",
            SpawnError::ProcessSignal(_) => "SPAWN004",
            SpawnError::ProcessWait(_) => "SPAWN005",
            SpawnError::Io(_) => "SPAWN006",
        }
    }
}

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, SpawnError>;
