//! Configuration for cardsync, read from `.cardsync/cardsync.toml`.
//!
//! Layering is file → environment → CLI. Every field has a default, so a
//! missing file is the same as an empty one.
//!
//! # Configuration File Format
//!
//! ```toml
//! [store]
//! db_path = ".cardsync/cardsync.db"
//! tables = ["applicants", "cards", "attachments"]
//!
//! [sync]
//! reconcile = "patch_from_payload"   # or "reload"
//! load_retry = { retries = 2, base_ms = 200, max_ms = 2000 }
//! mutation_retry = { retries = 0 }
//!
//! [autosave]
//! debounce_ms = 800
//! retry = { retries = 3, base_ms = 250, max_ms = 4000 }
//!
//! [uploads]
//! blob_dir = ".cardsync/blobs"
//! allowed_types = ["application/pdf", "image/*"]
//! max_bytes = 10485760
//! signed_url_ttl_secs = 300
//! signing_secret = "change-me"
//!
//! [server]
//! port = 3141
//! dev = false
//!
//! [logging]
//! level = "info"
//! format = "text"   # or "json"
//! dir = ".cardsync/logs"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain;
use crate::store::blob::{UploadPolicy, default_allowed_types};
use crate::sync::autosave::AutosaveOptions;
use crate::sync::{HookOptions, ReconcileMode, RetryPolicy};

pub const CONFIG_DIR: &str = ".cardsync";
pub const CONFIG_FILE: &str = "cardsync.toml";

pub const ENV_DB_PATH: &str = "CARDSYNC_DB_PATH";
pub const ENV_PORT: &str = "CARDSYNC_PORT";
pub const ENV_SIGNING_SECRET: &str = "CARDSYNC_SIGNING_SECRET";

/// Retry settings as written in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub retries: u32,
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
}

fn default_base_ms() -> u64 {
    200
}

fn default_max_ms() -> u64 {
    2_000
}

impl RetryConfig {
    pub fn new(retries: u32, base_ms: u64, max_ms: u64) -> Self {
        Self {
            retries,
            base_ms,
            max_ms,
        }
    }

    /// Exponential backoff from `base_ms`, capped at `max_ms`.
    pub fn to_policy(&self) -> RetryPolicy {
        if self.retries == 0 {
            return RetryPolicy::none();
        }
        RetryPolicy::exponential(
            self.retries,
            Duration::from_millis(self.base_ms),
            Duration::from_millis(self.max_ms.max(self.base_ms)),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Tables provisioned by `init` and `serve`.
    #[serde(default = "default_tables")]
    pub tables: Vec<String>,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("cardsync.db")
}

fn default_tables() -> Vec<String> {
    domain::TABLES.iter().map(|t| t.to_string()).collect()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            tables: default_tables(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub reconcile: ReconcileMode,
    #[serde(default = "default_load_retry")]
    pub load_retry: RetryConfig,
    #[serde(default = "default_mutation_retry")]
    pub mutation_retry: RetryConfig,
    #[serde(default = "default_realtime")]
    pub realtime: bool,
}

fn default_load_retry() -> RetryConfig {
    RetryConfig::new(2, 200, 2_000)
}

fn default_mutation_retry() -> RetryConfig {
    RetryConfig::new(0, default_base_ms(), default_max_ms())
}

fn default_realtime() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reconcile: ReconcileMode::default(),
            load_retry: default_load_retry(),
            mutation_retry: default_mutation_retry(),
            realtime: default_realtime(),
        }
    }
}

impl SyncConfig {
    pub fn hook_options(&self) -> HookOptions {
        HookOptions {
            reconcile: self.reconcile,
            load_retry: self.load_retry.to_policy(),
            mutation_retry: self.mutation_retry.to_policy(),
            realtime: self.realtime,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutosaveConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_autosave_retry")]
    pub retry: RetryConfig,
}

fn default_debounce_ms() -> u64 {
    800
}

fn default_autosave_retry() -> RetryConfig {
    RetryConfig::new(3, 250, 4_000)
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            retry: default_autosave_retry(),
        }
    }
}

impl AutosaveConfig {
    pub fn options(&self) -> AutosaveOptions {
        AutosaveOptions {
            debounce: Duration::from_millis(self.debounce_ms),
            retry: self.retry.to_policy(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadsConfig {
    #[serde(default = "default_blob_dir")]
    pub blob_dir: PathBuf,
    #[serde(default = "default_allowed_types")]
    pub allowed_types: Vec<String>,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_signed_url_ttl_secs")]
    pub signed_url_ttl_secs: u64,
    /// Secret for signing download URLs. Falls back to `CARDSYNC_SIGNING_SECRET`.
    #[serde(default)]
    pub signing_secret: Option<String>,
}

fn default_blob_dir() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("blobs")
}

fn default_max_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_signed_url_ttl_secs() -> u64 {
    300
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            blob_dir: default_blob_dir(),
            allowed_types: default_allowed_types(),
            max_bytes: default_max_bytes(),
            signed_url_ttl_secs: default_signed_url_ttl_secs(),
            signing_secret: None,
        }
    }
}

impl UploadsConfig {
    pub fn policy(&self) -> UploadPolicy {
        UploadPolicy {
            allowed_types: self.allowed_types.clone(),
            max_bytes: self.max_bytes,
        }
    }

    pub fn signed_url_ttl(&self) -> Duration {
        Duration::from_secs(self.signed_url_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Permissive CORS for a local frontend dev server.
    #[serde(default)]
    pub dev: bool,
}

fn default_port() -> u16 {
    3141
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            dev: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: text, json", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Also write daily-rotated log files here.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
            dir: None,
        }
    }
}

/// Contents of `cardsync.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CardsyncToml {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub autosave: AutosaveConfig,
    #[serde(default)]
    pub uploads: UploadsConfig,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl CardsyncToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse cardsync.toml")
    }

    /// Load `<dir>/cardsync.toml`, or defaults when the file does not exist.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize cardsync.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides. `lookup` is `std::env::var` in
    /// production.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(path) = lookup(ENV_DB_PATH).filter(|v| !v.is_empty()) {
            self.store.db_path = PathBuf::from(path);
        }
        if let Some(port) = lookup(ENV_PORT).filter(|v| !v.is_empty()) {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid {}: '{}'", ENV_PORT, port))?;
        }
        if let Some(secret) = lookup(ENV_SIGNING_SECRET).filter(|v| !v.is_empty()) {
            self.uploads.signing_secret = Some(secret);
        }
        Ok(())
    }

    /// Problems worth telling the user about; none of them are fatal.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for table in &self.store.tables {
            if !domain::TABLES.contains(&table.as_str()) {
                warnings.push(format!("store.tables: '{}' is not used by any entity", table));
            }
        }
        for table in domain::TABLES {
            if !self.store.tables.iter().any(|t| t == table)
                && !domain::OPTIONAL_TABLES.contains(&table)
            {
                warnings.push(format!("store.tables: required table '{}' is missing", table));
            }
        }
        if self.uploads.allowed_types.is_empty() {
            warnings.push("uploads.allowed_types is empty; every upload will be rejected".into());
        }
        if self.uploads.signing_secret.is_none() {
            warnings.push(format!(
                "uploads.signing_secret is not set (nor {}); a random secret is used per run",
                ENV_SIGNING_SECRET
            ));
        }
        if self.autosave.debounce_ms == 0 {
            warnings.push("autosave.debounce_ms is 0; every keystroke is written".into());
        }
        warnings
    }
}

/// Resolved configuration for one project directory.
#[derive(Debug, Clone)]
pub struct CardsyncConfig {
    pub project_dir: PathBuf,
    pub config_dir: PathBuf,
    pub toml: CardsyncToml,
}

impl CardsyncConfig {
    /// Load from `<project_dir>/.cardsync/` and apply environment overrides.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let config_dir = project_dir.join(CONFIG_DIR);
        let mut toml = CardsyncToml::load_or_default(&config_dir)?;
        toml.apply_env(|name| std::env::var(name).ok())?;
        Ok(Self {
            project_dir,
            config_dir,
            toml,
        })
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.resolve(&self.toml.store.db_path)
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.resolve(&self.toml.uploads.blob_dir)
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.toml.logging.dir.as_deref().map(|d| self.resolve(d))
    }

    /// Write a default `cardsync.toml` unless one exists. Returns whether a
    /// file was written.
    pub fn write_default(&self) -> Result<bool> {
        std::fs::create_dir_all(&self.config_dir).with_context(|| {
            format!("Failed to create {}", self.config_dir.display())
        })?;
        let path = self.config_file();
        if path.exists() {
            return Ok(false);
        }
        CardsyncToml::default().save(&path)?;
        Ok(true)
    }
}
