//! Error types for the LessonLab environment and engine boundary.

use thiserror::Error;

/// Errors that can surface at the engine boundary.
///
/// None of these ever propagate into the host as a panic: the engine turns
/// them into contract-violation log lines and keeps accepting commands.
#[derive(Debug, Error)]
pub enum SimError {
    /// No module with this id is registered
    #[error("Unknown module: {0}")]
    UnknownModule(String),

    /// The mounted module has no action with this name
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    /// An operation needed a mounted module but none was mounted
    #[error("No module mounted")]
    NotMounted,

    /// Module code panicked during init, transition or an action
    #[error("Module panicked: {0}")]
    ModulePanicked(String),

    /// Module returned an invalid or unserializable state
    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),

    /// A module or engine configuration was rejected
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// File export failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SimError {
    /// Creates an invalid-config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Creates an invalid-snapshot error.
    pub fn snapshot(msg: impl std::fmt::Display) -> Self {
        Self::InvalidSnapshot(msg.to_string())
    }
}
