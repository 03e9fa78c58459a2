use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Error;
use crate::matcher::PathMatcher;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub sync: SyncConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub source_root: PathBuf,
    pub destination_root: PathBuf,
    #[serde(default = "default_sync_excludes")]
    pub exclude_patterns: Vec<String>,
    #[serde(default = "default_true")]
    pub verify_after_copy: bool,
    #[serde(default)]
    pub schedule_interval_seconds: Option<u64>,
    /// Remove destination files that have no counterpart in the source.
    #[serde(default)]
    pub delete_orphans: bool,
    /// Leave destination files alone when they are newer than the source.
    #[serde(default)]
    pub preserve_newer: bool,
    #[serde(default = "default_true")]
    pub checkpoint_stores: bool,
    /// How long a store checkpoint waits on a busy database.
    #[serde(default = "default_checkpoint_timeout_ms")]
    pub checkpoint_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_index_excludes")]
    pub exclude_patterns: Vec<String>,
    #[serde(default = "default_text_extensions")]
    pub text_extensions: Vec<String>,
    #[serde(default = "default_max_indexed_chars")]
    pub max_indexed_chars: usize,
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_run_history_limit")]
    pub run_history_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            source_root: PathBuf::new(),
            destination_root: PathBuf::new(),
            exclude_patterns: default_sync_excludes(),
            verify_after_copy: true,
            schedule_interval_seconds: None,
            delete_orphans: false,
            preserve_newer: false,
            checkpoint_stores: true,
            checkpoint_timeout_ms: default_checkpoint_timeout_ms(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            exclude_patterns: default_index_excludes(),
            text_extensions: default_text_extensions(),
            max_indexed_chars: default_max_indexed_chars(),
            preview_chars: default_preview_chars(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            run_history_limit: default_run_history_limit(),
        }
    }
}

impl SyncConfig {
    pub fn new(source_root: impl Into<PathBuf>, destination_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            destination_root: destination_root.into(),
            ..Self::default()
        }
    }

    pub fn schedule_interval(&self) -> Option<Duration> {
        self.schedule_interval_seconds.map(Duration::from_secs)
    }

    pub fn checkpoint_timeout(&self) -> Duration {
        Duration::from_millis(self.checkpoint_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.source_root.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("sync.source_root is empty".into()));
        }
        if self.destination_root.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("sync.destination_root is empty".into()));
        }
        if roots_overlap(&self.source_root, &self.destination_root) {
            return Err(Error::InvalidConfig(format!(
                "source '{}' and destination '{}' overlap",
                self.source_root.display(),
                self.destination_root.display()
            )));
        }
        if self.schedule_interval_seconds == Some(0) {
            return Err(Error::InvalidConfig(
                "sync.schedule_interval_seconds must be greater than zero".into(),
            ));
        }
        PathMatcher::new(&self.exclude_patterns)?;
        Ok(())
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), Error> {
        self.sync.validate()?;
        PathMatcher::new(&self.index.exclude_patterns)?;
        if self.storage.run_history_limit == 0 {
            return Err(Error::InvalidConfig(
                "storage.run_history_limit must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Load `Config.toml` (optional) overlaid with `PROJSYNC__SECTION__KEY` environment variables.
pub fn load_configuration() -> Result<AppConfig, ConfigError> {
    let builder = Config::builder()
        .add_source(ConfigFile::with_name("Config").required(false))
        .add_source(
            Environment::with_prefix("PROJSYNC")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("sync.exclude_patterns")
                .with_list_parse_key("index.exclude_patterns")
                .with_list_parse_key("index.text_extensions")
                .try_parsing(true),
        )
        .build()?;
    builder.try_deserialize::<AppConfig>()
}

/// Compare two roots lexically after making them absolute; true if either contains the other.
pub fn roots_overlap(a: &Path, b: &Path) -> bool {
    let a = absolutize(a);
    let b = absolutize(b);
    a.starts_with(&b) || b.starts_with(&a)
}

fn absolutize(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

fn default_true() -> bool {
    true
}

fn default_sync_excludes() -> Vec<String> {
    [
        "__pycache__",
        ".git",
        ".svn",
        "dist",
        "build",
        "*.pyc",
        "*.pyo",
        "*.egg-info",
        ".eggs",
        "venv",
        ".venv",
        "env",
        ".env",
        "node_modules",
        ".idea",
        ".vscode",
        "*.log",
        "*.tmp",
        "*.bak",
        "Thumbs.db",
        ".DS_Store",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_checkpoint_timeout_ms() -> u64 {
    5_000
}

fn default_index_excludes() -> Vec<String> {
    ["__pycache__", ".git", "node_modules", "venv", ".venv", "dist", "build"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_text_extensions() -> Vec<String> {
    [
        "py", "rs", "txt", "md", "json", "xml", "html", "css", "js", "ts", "yml", "yaml", "ini",
        "cfg", "conf", "toml", "rst", "csv", "sql", "sh", "bat", "ps1",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_max_indexed_chars() -> usize {
    10_000
}

fn default_preview_chars() -> usize {
    200
}

fn default_database_path() -> PathBuf {
    PathBuf::from("projsync.db")
}

fn default_run_history_limit() -> usize {
    50
}
