//! Error types for PimmsLink

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Hot-folder staging step that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingStep {
    CreateLogsDir,
    CopyBattery,
    DeleteOutputClip,
    CopySampleVideo,
    PromoteCapture,
    DeleteCapture,
    CopyVideoInf,
}

impl fmt::Display for StagingStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StagingStep::CreateLogsDir => "create logs folder",
            StagingStep::CopyBattery => "copy battery placeholder",
            StagingStep::DeleteOutputClip => "delete output clip",
            StagingStep::CopySampleVideo => "copy sample video",
            StagingStep::PromoteCapture => "promote capture",
            StagingStep::DeleteCapture => "delete capture",
            StagingStep::CopyVideoInf => "copy video metadata",
        };
        f.write_str(name)
    }
}

/// PimmsLink error types
#[derive(Error, Debug)]
pub enum Error {
    /// An IP address, port or port range could not be parsed/validated
    #[error("Address configuration error: {0}")]
    AddressConfig(String),

    /// Bind or connect failure
    #[error("Connection error ({addr}): {source}")]
    Connection {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Write failure on an established connection
    #[error("Send error ({addr}): {source}")]
    Send {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Hot-folder copy/delete/create failure
    #[error("File staging error: {step} {path:?}: {source}")]
    FileStaging {
        step: StagingStep,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an address configuration error
    pub fn address(msg: impl Into<String>) -> Self {
        Self::AddressConfig(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a connection error for the given endpoint description
    pub fn connection(addr: impl fmt::Display, source: std::io::Error) -> Self {
        Self::Connection {
            addr: addr.to_string(),
            source,
        }
    }

    /// Create a staging error
    pub fn staging(step: StagingStep, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileStaging {
            step,
            path: path.into(),
            source,
        }
    }
}
