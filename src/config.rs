use crate::pricing::{ModelRate, PricingTable};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from `config.toml`.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct MetricsConfig {
    pub project: ProjectConfig,
    pub store: StoreConfig,
    pub xp: XpConfig,
    pub pricing: PricingConfig,
    pub serve: ServeConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Explicit store file; defaults to `metrics.json` inside the data dir.
    pub path: Option<PathBuf>,
    pub max_events: usize,
    pub max_sessions: usize,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct XpConfig {
    /// XP granted for a successful delegation before streak bonuses.
    pub base_success: u64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct PricingConfig {
    pub default: Option<ModelRate>,
    pub models: BTreeMap<String, ModelRate>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    pub bind: String,
    pub port: u16,
}

// --- Default implementations ---

impl Default for ProjectConfig {
    fn default() -> Self {
        let name = std::env::current_dir()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "unknown".to_string());
        Self { name }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_events: 500,
            max_sessions: 50,
        }
    }
}

impl Default for XpConfig {
    fn default() -> Self {
        Self { base_success: 10 }
    }
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8420,
        }
    }
}

impl PricingConfig {
    /// Built-in pricing with this section's overrides applied.
    pub fn table(&self) -> PricingTable {
        PricingTable::builtin().with_overrides(self.default, &self.models)
    }
}

impl MetricsConfig {
    /// Store file path, resolving the default against `data_dir`.
    pub fn store_path(&self, data_dir: &Path) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| data_dir.join("metrics.json"))
    }
}

/// Load config from `path`, falling back to defaults if it is missing or
/// does not parse.
pub fn load_config(path: &Path) -> MetricsConfig {
    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config, using defaults"
                );
                MetricsConfig::default()
            }
        },
        Err(_) => MetricsConfig::default(),
    }
}
