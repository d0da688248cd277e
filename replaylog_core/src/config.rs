//! Configuration for writing, indexing and reading logs

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ReplayError, ReplayResult};

/// Extension used for index cache files
pub const INDEX_EXT: &str = "idx";

/// Extension used for log segments
pub const SEGMENT_EXT: &str = "log";

/// When sample payloads are stored compressed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Payloads smaller than this many bytes are always stored raw
    pub min_size: usize,
    /// Minimum relative size reduction (`1 - compressed / raw`) to keep the
    /// compressed form
    pub min_ratio: f64,
    /// gzip level, 0-9
    pub level: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            min_size: 500 * 1024,
            min_ratio: 0.3,
            level: 6,
        }
    }
}

impl CompressionConfig {
    /// Never compress
    pub fn disabled() -> Self {
        Self {
            min_size: usize::MAX,
            ..Default::default()
        }
    }
}

/// Log configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub compression: CompressionConfig,
    /// Start a new physical segment once the current one would grow past this
    pub max_segment_size: Option<u64>,
    /// Directory for index caches (default: next to each segment)
    pub index_dir: Option<PathBuf>,
    /// Read-ahead buffer of the block codec
    pub read_buffer_size: usize,
    /// Persist rebuilt indices
    pub write_index_cache: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            compression: CompressionConfig::default(),
            max_segment_size: None,
            index_dir: None,
            read_buffer_size: 64 * 1024,
            write_index_cache: true,
        }
    }
}

impl LogConfig {
    /// Parse a TOML document
    pub fn from_toml_str(text: &str) -> ReplayResult<Self> {
        let config: LogConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> ReplayResult<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> ReplayResult<String> {
        Ok(toml::to_string(self)?)
    }

    pub fn with_max_segment_size(mut self, size: u64) -> Self {
        self.max_segment_size = Some(size);
        self
    }

    pub fn with_compression(mut self, compression: CompressionConfig) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_index_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.index_dir = Some(dir.into());
        self
    }

    pub fn validate(&self) -> ReplayResult<()> {
        let ratio = self.compression.min_ratio;
        if !(0.0..1.0).contains(&ratio) {
            return Err(ReplayError::Config(format!(
                "compression.min_ratio must be in [0, 1), got {}",
                ratio
            )));
        }
        if self.read_buffer_size == 0 {
            return Err(ReplayError::Config(
                "read_buffer_size must not be zero".to_string(),
            ));
        }
        if self.max_segment_size == Some(0) {
            return Err(ReplayError::Config(
                "max_segment_size must not be zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Path of the index cache belonging to a segment
    pub fn index_path(&self, segment: &Path) -> PathBuf {
        let file_name = segment.with_extension(INDEX_EXT);
        match (&self.index_dir, file_name.file_name()) {
            (Some(dir), Some(name)) => dir.join(name),
            _ => file_name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(LogConfig::default().validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let config = LogConfig::from_toml_str(
            r#"
            max_segment_size = 4096
            index_dir = "/var/cache/logs"

            [compression]
            min_size = 128
            min_ratio = 0.5
            "#,
        )
        .unwrap();

        assert_eq!(config.max_segment_size, Some(4096));
        assert_eq!(config.compression.min_size, 128);
        assert_eq!(config.compression.level, 6);
        assert_eq!(config.read_buffer_size, 64 * 1024);
        assert_eq!(
            config.index_path(Path::new("/data/run.0.log")),
            PathBuf::from("/var/cache/logs/run.0.idx")
        );
    }

    #[test]
    fn test_invalid_ratio_rejected() {
        let err = LogConfig::from_toml_str("[compression]\nmin_ratio = 1.5\n").unwrap_err();
        assert!(matches!(err, ReplayError::Config(_)));
    }

    #[test]
    fn test_index_path_next_to_segment() {
        let config = LogConfig::default();
        assert_eq!(
            config.index_path(Path::new("logs/run.3.log")),
            PathBuf::from("logs/run.3.idx")
        );
    }
}
