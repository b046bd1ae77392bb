use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Filesystem layout: every artifact the engine owns lives under `data_root`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_root: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_root: "data/memory".to_string(),
        }
    }
}

/// Which embedding discipline the vector store enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VectorStoreMode {
    /// All vectors must be supplied by the caller; a default embedder is
    /// refused at load time.
    ExternalOnly,
    /// The index is empty, or may fall back to a backend-provided default
    /// embedding when none is supplied.
    DefaultBacked,
}

impl Default for VectorStoreMode {
    fn default() -> Self {
        VectorStoreMode::ExternalOnly
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HippocampusConfig {
    /// Number of buffered chunks that triggers a slow-loop extraction pass.
    pub threshold: usize,
    /// Near-neighbour search k when probing for duplicate facts.
    pub dedup_k: usize,
    /// Cosine-distance threshold below which a neighbour counts as "near".
    pub dedup_threshold: f32,
    /// Minimum fact count before a reflection pass is attempted.
    pub reflection_min_facts: usize,
    /// Recent fact window size fed into reflection.
    pub reflection_window: usize,
    /// Cosine-distance threshold used to suppress duplicate reflections.
    pub reflection_dedup_threshold: f32,
    /// Facts at or above this importance are copied into the user profile.
    pub profile_importance_floor: u8,
}

impl Default for HippocampusConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            dedup_k: 3,
            dedup_threshold: 0.5,
            reflection_min_facts: 5,
            reflection_window: 10,
            reflection_dedup_threshold: 0.3,
            profile_importance_floor: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgetterConfig {
    pub page_size: usize,
    pub delete_below: f32,
    pub downgrade_below: f32,
    pub summarize_min_group: usize,
    pub summarize_min_age_days: f64,
    pub summary_importance: u8,
}

impl Default for ForgetterConfig {
    fn default() -> Self {
        Self {
            page_size: 1000,
            delete_below: 0.2,
            downgrade_below: 0.4,
            summarize_min_group: 5,
            summarize_min_age_days: 30.0,
            summary_importance: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShortTermConfig {
    pub max_memory_length: usize,
}

impl Default for ShortTermConfig {
    fn default() -> Self {
        Self {
            max_memory_length: 40,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorConfig {
    pub mode: VectorStoreMode,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            mode: VectorStoreMode::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub storage: StorageConfig,
    pub vector: VectorConfig,
    pub hippocampus: HippocampusConfig,
    pub forgetter: ForgetterConfig,
    pub short_term: ShortTermConfig,
    pub telemetry: TelemetryConfig,
}

impl EngineConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("PALIMPSEST_DATA_ROOT") {
            if !value.is_empty() {
                config.storage.data_root = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    pub fn chat_memory_path(&self) -> std::path::PathBuf {
        Path::new(&self.storage.data_root).join("chat_memory.json")
    }

    pub fn core_memory_path(&self) -> std::path::PathBuf {
        Path::new(&self.storage.data_root).join("core.txt")
    }

    pub fn core_vector_map_path(&self) -> std::path::PathBuf {
        Path::new(&self.storage.data_root).join("core_vector_map.json")
    }

    pub fn user_profiles_path(&self) -> std::path::PathBuf {
        Path::new(&self.storage.data_root).join("user_profiles.json")
    }

    pub fn vector_db_path(&self) -> std::path::PathBuf {
        Path::new(&self.storage.data_root).join("vector_db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let config = EngineConfig::default();
        let rendered = toml::to_string_pretty(&config).unwrap();
        let parsed: EngineConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.hippocampus.threshold, config.hippocampus.threshold);
        assert_eq!(parsed.vector.mode, config.vector.mode);
    }

    #[test]
    fn load_from_missing_path_uses_defaults() {
        let config = EngineConfig::load_from("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config.storage.data_root, "data/memory");
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        let mut config = EngineConfig::default();
        config.hippocampus.threshold = 9;
        config.save_to(&path).unwrap();

        let loaded = EngineConfig::load_from(&path).unwrap();
        assert_eq!(loaded.hippocampus.threshold, 9);
    }

    #[test]
    fn derived_paths_are_relative_to_data_root() {
        let mut config = EngineConfig::default();
        config.storage.data_root = "foo/bar".to_string();
        assert_eq!(config.chat_memory_path(), Path::new("foo/bar/chat_memory.json"));
        assert_eq!(config.vector_db_path(), Path::new("foo/bar/vector_db"));
    }
}
