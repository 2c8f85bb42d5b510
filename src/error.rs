//! Error types for the migration engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while extracting, merging or persisting pages
#[derive(Error, Debug)]
pub enum Error {
    /// No boundary containers were found in the scanned scope
    #[error("No page containers found in {scope} ({checked} containers checked)")]
    NoContainersFound { scope: String, checked: usize },

    /// A section's isolated rendering context did not finish loading in time
    #[error("Section '{section}' did not load within {timeout_ms}ms")]
    SectionTimeout { section: String, timeout_ms: u64 },

    /// One visual could not be rasterized (recorded, never fatal)
    #[error("Visual {key} ({kind}) could not be converted: {reason}")]
    VisualConversionFailed { key: String, kind: String, reason: String },

    /// The content store rejected or could not accept an upload
    #[error("Content store unavailable: {0}")]
    StorageUnavailable(String),

    /// The caller selected nothing to migrate
    #[error("No pages selected ({available} extracted pages available)")]
    NoPagesSelected { available: usize },

    /// The destination document does not exist
    #[error("Target document not found: {0}")]
    TargetNotFound(String),

    /// A produced document broke the page/order invariants
    #[error("Invariant violation in section '{section}': {detail}")]
    InvariantViolation { section: String, detail: String },

    /// The run was abandoned before merging started
    #[error("Migration cancelled during {0}")]
    Cancelled(String),

    /// Failed to read from the rendering substrate
    #[error("Rendering failed: {0}")]
    RenderError(String),

    /// Failed to load a section
    #[error("Failed to load section: {0}")]
    LoadError(String),

    /// Network error
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Invalid configuration or request
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// Document (de)serialization failed
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Filesystem error from a bundled store
    #[error("I/O error: {0}")]
    Io(String),

    /// CDP-specific error
    #[cfg(feature = "cdp")]
    #[error("CDP error: {0}")]
    CdpError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Structural failures abort a run; everything else is recorded and skipped.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Error::NoContainersFound { .. }
                | Error::NoPagesSelected { .. }
                | Error::TargetNotFound(_)
                | Error::InvariantViolation { .. }
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(feature = "cdp")]
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::CdpError(err.to_string())
    }
}
