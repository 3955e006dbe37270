use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{TlfKeysError, TlfKeysResult};
use crate::types::MetadataVersion;

/// Top-level configuration (loaded from tlfkeys.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlfKeysConfig {
    pub metadata: MetadataConfig,
    pub rekey: RekeyConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Format version for newly created folders (default: 3)
    pub default_version: u8,
    /// Newest format a successor revision may be up-converted to (default: 3)
    pub latest_version: u8,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            default_version: MetadataVersion::LATEST.get(),
            latest_version: MetadataVersion::LATEST.get(),
        }
    }
}

impl MetadataConfig {
    pub fn default_version(&self) -> TlfKeysResult<MetadataVersion> {
        MetadataVersion::new(self.default_version)
    }

    pub fn latest_version(&self) -> TlfKeysResult<MetadataVersion> {
        MetadataVersion::new(self.latest_version)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RekeyConfig {
    /// Split keys for many devices on the rayon pool (default: true)
    pub parallel_split: bool,
    /// Minimum number of missing devices before splitting goes parallel
    pub parallel_split_threshold: usize,
}

impl Default for RekeyConfig {
    fn default() -> Self {
        Self {
            parallel_split: true,
            parallel_split_threshold: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl TlfKeysConfig {
    /// Parse a TOML document and validate the metadata versions it names.
    pub fn from_toml_str(content: &str) -> TlfKeysResult<Self> {
        let config: TlfKeysConfig =
            toml::from_str(content).map_err(|e| TlfKeysError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> TlfKeysResult<Self> {
        if !path.exists() {
            tracing::warn!(
                "config file not found: {}  (using defaults)",
                path.display()
            );
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
            .map_err(|e| TlfKeysError::Config(format!("{}: {e}", path.display())))
    }

    fn validate(&self) -> TlfKeysResult<()> {
        let default = self
            .metadata
            .default_version()
            .map_err(|e| TlfKeysError::Config(format!("metadata.default_version: {e}")))?;
        let latest = self
            .metadata
            .latest_version()
            .map_err(|e| TlfKeysError::Config(format!("metadata.latest_version: {e}")))?;
        if default > latest {
            return Err(TlfKeysError::Config(format!(
                "metadata.default_version {default} is newer than latest_version {latest}"
            )));
        }
        if !matches!(self.logging.format.as_str(), "json" | "text") {
            return Err(TlfKeysError::Config(format!(
                "logging.format must be \"json\" or \"text\", got {:?}",
                self.logging.format
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = TlfKeysConfig::default();
        assert_eq!(
            config.metadata.default_version().unwrap(),
            MetadataVersion::SEGREGATED_KEY_BUNDLES
        );
        assert!(config.rekey.parallel_split);
        assert_eq!(config.rekey.parallel_split_threshold, 8);
        assert_eq!(config.logging.format, "text");
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = TlfKeysConfig::from_toml_str(
            r#"
            [rekey]
            parallel_split_threshold = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.rekey.parallel_split_threshold, 2);
        assert!(config.rekey.parallel_split);
        assert_eq!(config.metadata.latest_version, 3);
    }

    #[test]
    fn test_rejects_unsupported_version() {
        let err = TlfKeysConfig::from_toml_str("[metadata]\ndefault_version = 9\n").unwrap_err();
        assert!(matches!(err, TlfKeysError::Config(_)));
    }

    #[test]
    fn test_rejects_default_newer_than_latest() {
        let err = TlfKeysConfig::from_toml_str(
            "[metadata]\ndefault_version = 3\nlatest_version = 2\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("newer than latest_version"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[logging]\nlevel = \"debug\"\nformat = \"json\"").unwrap();
        let config = TlfKeysConfig::load(file.path()).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = TlfKeysConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.logging.level, "info");
    }
}
