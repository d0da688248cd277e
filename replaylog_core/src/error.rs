//! Unified error handling for replaylog
//!
//! One error type covers the codec, the index cache, the per-stream indices and
//! the aligner. Only the index cache check downgrades an error (`InvalidIndex`)
//! into a rebuild; everything else is surfaced to the caller.

use thiserror::Error;

/// Problems with the prologue of a physical segment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    /// Empty file or wrong magic token
    #[error("missing or invalid prologue")]
    MissingPrologue,

    /// Written by an older format revision
    #[error("obsolete format version {found} (supported: {supported})")]
    ObsoleteFormat { found: u32, supported: u32 },

    /// Written by a newer format revision
    #[error("unsupported format version {found} (supported: {supported})")]
    UnsupportedFormat { found: u32, supported: u32 },

    /// Block kind byte that this implementation does not know
    #[error("unknown block kind {0}")]
    UnknownBlockKind(u8),
}

/// Why a persisted index cache could not be used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidIndexKind {
    #[error("no index file")]
    Missing,

    #[error("index file has no valid prologue")]
    MissingPrologue,

    #[error("index version {found} does not match {expected}")]
    ObsoleteVersion { found: u32, expected: u32 },

    #[error("index was built for a source of {expected_size} bytes (mtime {expected_mtime}), found {actual_size} bytes (mtime {actual_mtime})")]
    SourceMismatch {
        expected_size: u64,
        expected_mtime: u64,
        actual_size: u64,
        actual_mtime: u64,
    },

    #[error("corrupt index contents: {0}")]
    Corrupt(String),
}

/// Main error type for replaylog operations
#[derive(Debug, Error)]
pub enum ReplayError {
    /// I/O related errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Bad magic or unsupported segment version
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    /// The segment ends before the amount of data a header announced
    #[error("Truncated data: {0}")]
    TruncatedData(String),

    /// The index cache is unusable and must be rebuilt
    #[error("Invalid index: {0}")]
    InvalidIndex(InvalidIndexKind),

    /// Seek target outside the addressable range
    #[error("Out of range: {0}")]
    OutOfRange(String),

    /// Sample ordinal outside `[0, size)`
    #[error("Index {index} out of bounds (size {size})")]
    IndexOutOfBounds { index: usize, size: usize },

    /// An append would make position or time go backward
    #[error("Monotonicity violation: {0}")]
    Monotonicity(String),

    /// Contradicting stream declarations, or data for an undeclared stream
    #[error("Inconsistent log: {0}")]
    Inconsistent(String),

    /// Compressor/decompressor failure
    #[error("Compression error: {0}")]
    Compression(String),

    /// Configuration parsing or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// No stream with this name, or a stream that is not part of an aligner
    #[error("Unknown stream: {0}")]
    UnknownStream(String),

    /// Invalid input/argument errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Convenience type alias for Results using ReplayError
pub type ReplayResult<T> = Result<T, ReplayError>;

impl From<InvalidIndexKind> for ReplayError {
    fn from(kind: InvalidIndexKind) -> Self {
        ReplayError::InvalidIndex(kind)
    }
}

impl From<toml::de::Error> for ReplayError {
    fn from(err: toml::de::Error) -> Self {
        ReplayError::Config(format!("TOML parse error: {}", err))
    }
}

impl From<toml::ser::Error> for ReplayError {
    fn from(err: toml::ser::Error) -> Self {
        ReplayError::Config(format!("TOML serialization error: {}", err))
    }
}

impl From<serde_yaml::Error> for ReplayError {
    fn from(err: serde_yaml::Error) -> Self {
        ReplayError::Inconsistent(format!("metadata YAML error: {}", err))
    }
}

// Helper methods
impl ReplayError {
    /// Create a truncated data error
    pub fn truncated<S: Into<String>>(msg: S) -> Self {
        ReplayError::TruncatedData(msg.into())
    }

    /// Create an out of range error
    pub fn out_of_range<S: Into<String>>(msg: S) -> Self {
        ReplayError::OutOfRange(msg.into())
    }

    /// Create a monotonicity error
    pub fn monotonicity<S: Into<String>>(msg: S) -> Self {
        ReplayError::Monotonicity(msg.into())
    }

    /// Create an inconsistency error
    pub fn inconsistent<S: Into<String>>(msg: S) -> Self {
        ReplayError::Inconsistent(msg.into())
    }

    /// Create a corrupt index error
    pub fn corrupt_index<S: Into<String>>(msg: S) -> Self {
        ReplayError::InvalidIndex(InvalidIndexKind::Corrupt(msg.into()))
    }

    /// Create an invalid input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        ReplayError::InvalidInput(msg.into())
    }

    /// Check if this error only means the index cache has to be rebuilt
    pub fn is_invalid_index(&self) -> bool {
        matches!(self, ReplayError::InvalidIndex(_))
    }

    /// Check if this is a seek/ordinal range error
    pub fn is_out_of_range(&self) -> bool {
        matches!(
            self,
            ReplayError::OutOfRange(_) | ReplayError::IndexOutOfBounds { .. }
        )
    }

    /// Check if this is a truncated data error
    pub fn is_truncated(&self) -> bool {
        matches!(self, ReplayError::TruncatedData(_))
    }
}
