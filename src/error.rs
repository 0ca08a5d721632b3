//! Error types for vtrie

use thiserror::Error;

/// Result type alias for vtrie operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in vtrie operations
///
/// Absent keys, values and nodes are not errors; reads return `Option`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "sqlite")]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Invalid hash: {0}")]
    InvalidHash(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid database file: {0}")]
    InvalidFile(String),

    #[error("Format version mismatch: expected {expected}, found {found}")]
    FormatVersion { expected: u32, found: u32 },

    #[error("Version conflict: version {version} is not above latest committed {latest:?}")]
    VersionConflict { version: u64, latest: Option<u64> },

    #[error("A commit for version {0} is already in flight")]
    VersionInFlight(u64),

    #[error("Invalid batch operation: {0}")]
    InvalidBatch(String),

    #[error("Commit batch for version {0} has no root hash")]
    MissingRootHash(u64),

    #[error("Invalid proof: {0}")]
    InvalidProof(String),

    #[error("Invalid namespace: {0}")]
    InvalidNamespace(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl Error {
    /// True for errors a caller can fix by retrying with another version
    pub fn is_version_conflict(&self) -> bool {
        matches!(
            self,
            Error::VersionConflict { .. } | Error::VersionInFlight(_)
        )
    }
}
