//! Error taxonomy for supervisor operations

use crate::process::ProcessRole;
use std::path::PathBuf;

/// Broad class of a supervisor failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing installation path or invalid setting; nothing was spawned
    Validation,
    /// Port still bound after cleanup; the user must free it
    ResourceConflict,
    /// A process failed to launch or exited immediately
    Spawn,
    /// Automatic recovery exhausted; manual restart required
    Fatal,
    /// Supervisor plumbing failure (control loop gone, file write failed)
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::ResourceConflict => "RESOURCE_CONFLICT",
            ErrorKind::Spawn => "SPAWN",
            ErrorKind::Fatal => "FATAL",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{what} not found at {}", path.display())]
    MissingPath { what: &'static str, path: PathBuf },

    #[error("port {port} is in use by another application")]
    PortConflict { port: u16 },

    #[error("{role} failed to start: {reason}")]
    Spawn { role: ProcessRole, reason: String },

    #[error("could not prepare {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("supervisor is in the failed state: {0}")]
    Failed(String),

    #[error("supervisor control loop is not running")]
    LoopClosed,
}

impl SupervisorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SupervisorError::InvalidConfig(_) | SupervisorError::MissingPath { .. } => {
                ErrorKind::Validation
            }
            SupervisorError::PortConflict { .. } => ErrorKind::ResourceConflict,
            SupervisorError::Spawn { .. } => ErrorKind::Spawn,
            SupervisorError::Failed(_) => ErrorKind::Fatal,
            SupervisorError::Filesystem { .. } | SupervisorError::LoopClosed => {
                ErrorKind::Internal
            }
        }
    }
}
