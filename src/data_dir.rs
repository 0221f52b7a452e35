use std::io::Write;
use std::path::{Path, PathBuf};

/// Manages the `.agent-metrics/` directory layout.
///
/// The store file and its config live side by side under one root.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the JSON metrics store.
    pub fn store(&self) -> PathBuf {
        self.root.join("metrics.json")
    }

    /// Path to `config.toml`.
    pub fn config(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    const DEFAULT_CONFIG: &str = "\
# agent-metrics configuration

[store]
max_events = 500
max_sessions = 50

[xp]
base_success = 10

# Per-model rates in USD per million tokens.
# [pricing.models.\"my-model\"]
# input_per_mtok = 3.0
# output_per_mtok = 15.0

[serve]
bind = \"127.0.0.1\"
port = 8420
";

    /// Create the root and a default `config.toml` if missing.
    /// Returns `Ok(true)` when the root did not exist before.
    pub fn init(&self) -> std::io::Result<bool> {
        let created = !self.root.exists();
        std::fs::create_dir_all(&self.root)?;
        let config_path = self.config();
        if !config_path.exists() {
            std::fs::write(&config_path, Self::DEFAULT_CONFIG)?;
        }
        Ok(created)
    }

    /// `init`, then make sure the root is git-ignored. The store holds
    /// usage and cost data that should not be committed.
    pub fn ensure_initialized(&self) -> std::io::Result<bool> {
        let created = self.init()?;
        self.update_gitignore()?;
        Ok(created)
    }

    /// Append the root to an existing `.gitignore` next to it. Never creates one.
    pub fn update_gitignore(&self) -> std::io::Result<()> {
        let gitignore_path = self
            .root
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(".gitignore");
        if !gitignore_path.exists() {
            return Ok(());
        }

        let dir_name = self
            .root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.root.to_string_lossy().into_owned());
        let entry = format!("{dir_name}/");

        let contents = std::fs::read_to_string(&gitignore_path)?;
        if contents
            .lines()
            .map(str::trim)
            .any(|line| line == entry || line == dir_name)
        {
            return Ok(());
        }

        let sep = if contents.is_empty() || contents.ends_with('\n') {
            ""
        } else {
            "\n"
        };
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&gitignore_path)?;
        writeln!(file, "{sep}{entry}")
    }
}
