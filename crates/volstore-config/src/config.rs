//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name used inside the config directory.
const CONFIG_FILE: &str = "config.ron";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Initial volume coverage and expansion limits.
    pub tree: TreeConfig,
    /// Per-attribute LOD tuning applied when the registry is built.
    pub attributes: AttributeConfig,
    /// Edit script replay settings.
    pub replay: ReplayConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Initial tree coverage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TreeConfig {
    /// Minimum corner of the root cube.
    pub minimum: [f32; 3],
    /// Edge length of the root cube. Must be positive.
    pub size: f32,
    /// Upper bound on root doublings performed for a single edit.
    pub max_expansions: u32,
}

/// LOD threshold multipliers for the built-in attributes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AttributeConfig {
    /// Multiplier of the set-valued `spanners` attribute. Controls how deep
    /// spanner voxelization descends.
    pub spanner_lod_threshold: f32,
    /// Multiplier of the `color` attribute. Stored on the descriptor but
    /// reserved: only the `spanners` multiplier drives voxelization.
    pub color_lod_threshold: f32,
    /// Multiplier of the `material` attribute. Reserved, see `color_lod_threshold`.
    pub material_lod_threshold: f32,
    /// Multiplier of the `density` attribute. Reserved, see `color_lod_threshold`.
    pub density_lod_threshold: f32,
}

/// Edit script replay settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReplayConfig {
    /// Script to replay when none is given on the command line.
    pub script: Option<PathBuf>,
    /// Print a tree summary after every applied edit instead of only at the end.
    pub summary_per_edit: bool,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Verify the coalescing invariant after every applied edit.
    pub check_invariants: bool,
}

// --- Default implementations ---

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            minimum: [0.0; 3],
            size: 1.0,
            max_expansions: 32,
        }
    }
}

impl Default for AttributeConfig {
    fn default() -> Self {
        Self {
            spanner_lod_threshold: 32.0,
            color_lod_threshold: 1.0,
            material_lod_threshold: 1.0,
            density_lod_threshold: 1.0,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            check_invariants: false,
        }
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Platform config directory for the volume store tools.
    pub fn default_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join("volstore"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join(CONFIG_FILE);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}
