//! Engine error types

use crashtrace_sdk::{DecodeError, VmHandle};
use thiserror::Error;

use crate::config::ConfigError;

/// Errors returned by the detector's attach/detach and loading paths
#[derive(Debug, Error)]
pub enum DetectError {
    /// The VM instance already has diagnostics installed
    #[error("{0} is already attached")]
    AlreadyAttached(VmHandle),

    /// The VM instance was never attached, or was already detached
    #[error("{0} is not attached")]
    NotAttached(VmHandle),

    /// Debug information could not be decoded
    #[error("Invalid debug information: {0}")]
    DebugInfo(#[from] DecodeError),

    /// Reading a module file failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be loaded
    #[error(transparent)]
    Config(#[from] ConfigError),
}
