//! Graph configuration, loadable from TOML.
//!
//! ```toml
//! storage_mode = "always-stream"
//! cache_high_water_mark = 50000
//! stream_dir = "/var/lib/neurograph/stream"
//!
//! [index]
//! kinds = ["int", "text"]
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::neuron::ScalarKind;

/// How aggressively resident entities are evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageMode {
    /// Everything stays resident. Suited to small graphs.
    #[default]
    InMemory,
    /// Clean entities are evicted past the high-water mark; dirty ones are
    /// flushed to per-entity stream files first.
    AlwaysStream,
}

impl std::fmt::Display for StorageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageMode::InMemory => write!(f, "in-memory"),
            StorageMode::AlwaysStream => write!(f, "always-stream"),
        }
    }
}

/// Secondary scalar index settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Whether lookups may use the index at all.
    #[serde(default = "default_index_enabled")]
    pub enabled: bool,
    /// Scalar kinds that are indexed. Lookups for other kinds are misses.
    #[serde(default = "default_index_kinds")]
    pub kinds: Vec<ScalarKind>,
}

fn default_index_enabled() -> bool {
    true
}
fn default_index_kinds() -> Vec<ScalarKind> {
    vec![ScalarKind::Int, ScalarKind::Double, ScalarKind::Text]
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            enabled: default_index_enabled(),
            kinds: default_index_kinds(),
        }
    }
}

impl IndexConfig {
    pub fn supports(&self, kind: ScalarKind) -> bool {
        self.enabled && self.kinds.contains(&kind)
    }
}

/// Configuration for a [`Graph`](crate::graph::Graph) instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    #[serde(default)]
    pub storage_mode: StorageMode,
    /// Resident entity count above which eviction starts (stream mode only).
    #[serde(default = "default_high_water_mark")]
    pub cache_high_water_mark: usize,
    /// Directory for per-entity stream files. Required in stream mode.
    #[serde(default)]
    pub stream_dir: Option<PathBuf>,
    /// Maximum number of memoized in-link lists.
    #[serde(default = "default_links_in_capacity")]
    pub links_in_cache_capacity: usize,
    #[serde(default)]
    pub index: IndexConfig,
}

fn default_high_water_mark() -> usize {
    100_000
}
fn default_links_in_capacity() -> usize {
    65_536
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            storage_mode: StorageMode::default(),
            cache_high_water_mark: default_high_water_mark(),
            stream_dir: None,
            links_in_cache_capacity: default_links_in_capacity(),
            index: IndexConfig::default(),
        }
    }
}

impl GraphConfig {
    /// Stream-mode config writing per-entity files under `dir`.
    pub fn streaming(dir: impl Into<PathBuf>, high_water_mark: usize) -> Self {
        Self {
            storage_mode: StorageMode::AlwaysStream,
            cache_high_water_mark: high_water_mark,
            stream_dir: Some(dir.into()),
            ..Default::default()
        }
    }

    /// Check field consistency.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.cache_high_water_mark == 0 {
            return Err(ConfigError::Invalid {
                message: "cache_high_water_mark must be > 0".into(),
            });
        }
        if self.links_in_cache_capacity == 0 {
            return Err(ConfigError::Invalid {
                message: "links_in_cache_capacity must be > 0".into(),
            });
        }
        if self.storage_mode == StorageMode::AlwaysStream && self.stream_dir.is_none() {
            return Err(ConfigError::Invalid {
                message: "always-stream mode requires stream_dir".into(),
            });
        }
        Ok(())
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> ConfigResult<Self> {
        Self::parse(source, "<inline>")
    }

    /// Read, parse and validate a TOML file.
    pub fn from_toml_file(path: &Path) -> ConfigResult<Self> {
        let source = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::parse(&source, &path.display().to_string())
    }

    fn parse(source: &str, origin: &str) -> ConfigResult<Self> {
        let config: GraphConfig = toml::from_str(source).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize back to TOML.
    pub fn to_toml_string(&self) -> ConfigResult<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid {
            message: format!("cannot serialize config: {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid_and_in_memory() {
        let config = GraphConfig::default();
        config.validate().unwrap();
        assert_eq!(config.storage_mode, StorageMode::InMemory);
        assert_eq!(config.cache_high_water_mark, 100_000);
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config = GraphConfig::from_toml_str("").unwrap();
        assert_eq!(config.links_in_cache_capacity, 65_536);
        assert!(config.index.supports(ScalarKind::Text));
    }

    #[test]
    fn parses_stream_mode() {
        let config = GraphConfig::from_toml_str(
            r#"
            storage_mode = "always-stream"
            cache_high_water_mark = 10
            stream_dir = "/tmp/ng"

            [index]
            kinds = ["int"]
            "#,
        )
        .unwrap();
        assert_eq!(config.storage_mode, StorageMode::AlwaysStream);
        assert_eq!(config.cache_high_water_mark, 10);
        assert!(config.index.supports(ScalarKind::Int));
        assert!(!config.index.supports(ScalarKind::Text));
    }

    #[test]
    fn stream_mode_without_dir_is_rejected() {
        let err = GraphConfig::from_toml_str(r#"storage_mode = "always-stream""#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn zero_high_water_mark_is_rejected() {
        let err = GraphConfig::from_toml_str("cache_high_water_mark = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn bad_syntax_is_a_parse_error() {
        let err = GraphConfig::from_toml_str("storage_mode = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn disabled_index_supports_nothing() {
        let config = GraphConfig::from_toml_str("[index]\nenabled = false").unwrap();
        assert!(!config.index.supports(ScalarKind::Int));
    }

    #[test]
    fn toml_round_trip() {
        let config = GraphConfig::streaming("/tmp/x", 5);
        let text = config.to_toml_string().unwrap();
        let back = GraphConfig::from_toml_str(&text).unwrap();
        assert_eq!(back.storage_mode, StorageMode::AlwaysStream);
        assert_eq!(back.cache_high_water_mark, 5);
    }
}
