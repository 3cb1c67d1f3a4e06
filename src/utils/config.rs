use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::backup::supervisor::EscalationTimings;
use crate::backup::DeletionGate;

const ENV_PREFIX: &str = "MIRROR_GUARD";
const CONFIG_PATH_VAR: &str = "MIRROR_GUARD_CONFIG";
const LOCAL_CONFIG: &str = "mirror-guard.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server port
    pub port: u16,

    /// Database URL
    pub database_url: String,

    /// rsync executable, looked up on PATH when relative
    pub rsync_path: PathBuf,

    /// Rsync exclude patterns
    pub rsync_excludes: Vec<String>,

    /// Deletions below this count never need confirmation
    pub deletion_threshold_count: u64,

    /// Deletions below this share of the source (percent) never need confirmation
    pub deletion_threshold_percent: f64,

    /// Wait after SIGTERM before SIGKILL
    pub terminate_grace_ms: u64,

    /// Wait after SIGKILL before giving up on the process
    pub kill_grace_ms: u64,

    /// Time allowed for trailing output after exit
    pub drain_grace_ms: u64,

    /// Output channel capacity per stream, in chunks
    pub stream_buffer_chunks: usize,

    /// Lines kept in the run report
    pub report_max_lines: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8888,
            database_url: "sqlite://mirror_guard.db".to_string(),
            rsync_path: PathBuf::from("rsync"),
            rsync_excludes: vec![
                ".DS_Store".to_string(),
                ".Spotlight-V100".to_string(),
                ".Trashes".to_string(),
                ".fseventsd".to_string(),
                ".TemporaryItems".to_string(),
                ".DocumentRevisions-V100".to_string(),
                ".cache".to_string(),
                "*.tmp".to_string(),
                "*.swp".to_string(),
            ],
            deletion_threshold_count: 5,
            deletion_threshold_percent: 10.0,
            terminate_grace_ms: 500,
            kill_grace_ms: 1000,
            drain_grace_ms: 250,
            stream_buffer_chunks: 64,
            report_max_lines: 10_000,
        }
    }
}

impl Config {
    /// Load config from defaults, the config file and the environment
    pub fn load() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!("Loaded environment from {}", path.display());
        }
        Self::load_from(config_file().as_deref())
    }

    pub fn load_from(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(file) = file {
            info!("Reading configuration from {}", file.display());
            builder = builder.add_source(config::File::from(file).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("rsync_excludes"),
        );

        let config: Config = builder
            .build()
            .context("failed to read configuration")?
            .try_deserialize()
            .context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.deletion_threshold_percent) {
            anyhow::bail!(
                "deletion_threshold_percent must be between 0 and 100, got {}",
                self.deletion_threshold_percent
            );
        }
        if self.stream_buffer_chunks == 0 {
            anyhow::bail!("stream_buffer_chunks must be at least 1");
        }
        Ok(())
    }

    pub fn deletion_gate(&self) -> DeletionGate {
        DeletionGate::from_percent(self.deletion_threshold_count, self.deletion_threshold_percent)
    }

    pub fn escalation(&self) -> EscalationTimings {
        EscalationTimings {
            terminate_grace: Duration::from_millis(self.terminate_grace_ms),
            kill_grace: Duration::from_millis(self.kill_grace_ms),
            stream_buffer: self.stream_buffer_chunks,
        }
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}

/// Explicit path, then the working directory, then the user config dir.
fn config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_PATH_VAR) {
        return Some(PathBuf::from(path));
    }
    let local = PathBuf::from(LOCAL_CONFIG);
    if local.exists() {
        return Some(local);
    }
    dirs::config_dir()
        .map(|dir| dir.join("mirror-guard").join("config.toml"))
        .filter(|path| path.exists())
}

pub fn load_config() -> Result<Config> {
    Config::load()
}
