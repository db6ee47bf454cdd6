use std::fs;
use std::path::{Path, PathBuf};

use conversion_engine::EngineConfig;
use engine_logging::{engine_info, engine_warn};
use serde::{Deserialize, Serialize};

/// Settings for one batch run, read from a RON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Defaults to `diagnostic-report.json` in the engine's log directory.
    pub report_path: Option<PathBuf>,
    /// Declared source recorded on every conversion.
    pub source: String,
    pub engine: EngineConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("input"),
            output_dir: PathBuf::from("output"),
            report_path: None,
            source: "local".to_string(),
            engine: EngineConfig::default(),
        }
    }
}

/// Load `path`, falling back to defaults (with a warning) when the file is
/// missing or does not parse.
pub fn load(path: &Path) -> AppConfig {
    let content = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            engine_warn!("No config at {:?}; using defaults", path);
            return AppConfig::default();
        }
        Err(err) => {
            engine_warn!("Failed to read config from {:?}: {}", path, err);
            return AppConfig::default();
        }
    };

    match ron::from_str(&content) {
        Ok(config) => {
            engine_info!("Loaded config from {:?}", path);
            config
        }
        Err(err) => {
            engine_warn!("Failed to parse config from {:?}: {}", path, err);
            AppConfig::default()
        }
    }
}
