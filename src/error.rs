//! Error types for the chunk cache

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the chunk cache
///
/// Only [`Error::Config`] (and its file/duration relatives) is ever fatal.
/// Everything else is raised by a single tier and absorbed by the
/// [`TieredCache`](crate::cache::TieredCache), which downgrades it to a miss
/// or a skipped persistence side effect.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Persistent Store Errors
    // =========================================================================
    /// Directory creation, write, sync or rename failed
    #[error("Storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The index claimed an entry whose backing file could not be read
    #[error("Index/disk divergence at {path}: {source}")]
    IndexDivergence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration file: {0}")]
    ConfigFile(#[from] serde_yaml::Error),
}

impl Error {
    /// Wrap an I/O failure that happened while touching `path`
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    /// True if the error came from configuration rather than storage
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::DurationParse(_) | Error::ConfigFile(_)
        )
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display_includes_path() {
        let err = Error::storage(
            "/cache/ab/cd/ef",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/cache/ab/cd/ef"));
        assert!(msg.contains("denied"));
        assert!(!err.is_config());
    }

    #[test]
    fn test_config_errors_are_classified() {
        assert!(Error::Config("zero capacity".into()).is_config());
        assert!(Error::DurationParse("bad".into()).is_config());
        assert!(!Error::Io(std::io::Error::other("oops")).is_config());
    }

    #[test]
    fn test_io_error_converts() {
        fn fails() -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(Error::Io(_))));
    }
}
