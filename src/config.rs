// src/config.rs
//! Orchestrator configuration: one TOML file plus a handful of env overrides.
//!
//! Lookup order for the file:
//! 1) $EPG_CONFIG_PATH
//! 2) config/orchestrator.toml
//!
//! Everything is validated up front; a config that fails validation stops the
//! process before any task is spawned.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::backoff::Backoff;
use crate::merge::SourcePriority;
use crate::scheduler::ScheduleConfig;
use crate::sources::command::OUTPUT_PLACEHOLDER;
use crate::supervisor::{ProxyCommand, SupervisorConfig};

pub const ENV_CONFIG_PATH: &str = "EPG_CONFIG_PATH";
pub const ENV_GUIDE_PATH: &str = "EPG_GUIDE_PATH";
pub const ENV_REFRESH_INTERVAL: &str = "EPG_REFRESH_INTERVAL_SECS";
pub const ENV_SOURCE_PRIORITY: &str = "EPG_SOURCE_PRIORITY";
pub const ENV_STATUS_LISTEN: &str = "EPG_STATUS_LISTEN";
pub const DEFAULT_CONFIG_PATH: &str = "config/orchestrator.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{var}={value:?} is not valid")]
    InvalidEnv { var: &'static str, value: String },
    #[error("no sources configured")]
    NoSources,
    #[error("source id {0:?} must be non-empty and use only [A-Za-z0-9_-]")]
    InvalidSourceId(String),
    #[error("duplicate source id {0:?}")]
    DuplicateSource(String),
    #[error("priority names unknown source {0:?}")]
    UnknownPriority(String),
    #[error("priority lists {0:?} more than once")]
    DuplicatePriority(String),
    #[error("source {0:?}: timeout must be greater than zero")]
    ZeroTimeout(String),
    #[error("source {0:?}: args must contain {{output}} unless stdout or output_path is set")]
    MissingOutputPlaceholder(String),
    #[error("source {0:?}: url must start with http:// or https://")]
    InvalidUrl(String),
    #[error("refresh interval must be greater than zero")]
    ZeroInterval,
    #[error("backoff ({backoff:?}) must not exceed the refresh interval ({interval:?})")]
    BackoffExceedsInterval { backoff: Duration, interval: Duration },
    #[error("guide path {0:?} has no file name")]
    InvalidGuidePath(PathBuf),
    #[error("work dir {0:?} must not be the guide's directory")]
    WorkDirIsGuideDir(PathBuf),
    #[error("proxy program is empty")]
    EmptyProxyProgram,
    #[error("proxy probe_failure_threshold must be at least 1")]
    ZeroProbeThreshold,
    #[error("proxy probe_interval_secs must be greater than zero")]
    ZeroProbeInterval,
    #[error("proxy probe_timeout_secs must be greater than zero")]
    ZeroProbeTimeout,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    pub guide_path: PathBuf,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default)]
    pub priority: Vec<String>,
    #[serde(default)]
    pub schedule: ScheduleSection,
    #[serde(default)]
    pub proxy: Option<ProxySection>,
    #[serde(default)]
    pub status: StatusSection,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleSection {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
    #[serde(default = "default_true")]
    pub run_on_start: bool,
}

impl Default for ScheduleSection {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            backoff_secs: default_backoff_secs(),
            run_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusSection {
    /// `host:port`; the status server is off when unset.
    #[serde(default)]
    pub listen: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxySection {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub current_dir: Option<PathBuf>,
    #[serde(default)]
    pub health_url: Option<String>,
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_probe_failure_threshold")]
    pub probe_failure_threshold: u32,
    #[serde(default = "default_restart_initial_ms")]
    pub restart_initial_ms: u64,
    #[serde(default = "default_restart_max_secs")]
    pub restart_max_secs: u64,
    #[serde(default = "default_stable_after_secs")]
    pub stable_after_secs: u64,
    #[serde(default = "default_persistent_failure_after")]
    pub persistent_failure_after: u32,
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    #[serde(default = "default_source_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(flatten)]
    pub kind: SourceKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceKind {
    Command(CommandSourceConfig),
    Openwebif(OpenWebifConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandSourceConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub current_dir: Option<PathBuf>,
    #[serde(default)]
    pub version_args: Option<Vec<String>>,
    /// Fixed path the tool always writes to.
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    /// Tool prints XMLTV on stdout.
    #[serde(default)]
    pub stdout: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenWebifConfig {
    pub url: String,
    #[serde(default)]
    pub bouquet: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("epg-orchestrator")
}
fn default_interval_secs() -> u64 {
    24 * 60 * 60
}
fn default_backoff_secs() -> u64 {
    5 * 60
}
fn default_true() -> bool {
    true
}
fn default_source_timeout_secs() -> u64 {
    15 * 60
}
fn default_probe_interval_secs() -> u64 {
    30
}
fn default_probe_timeout_secs() -> u64 {
    5
}
fn default_probe_failure_threshold() -> u32 {
    3
}
fn default_restart_initial_ms() -> u64 {
    1_000
}
fn default_restart_max_secs() -> u64 {
    60
}
fn default_stable_after_secs() -> u64 {
    60
}
fn default_persistent_failure_after() -> u32 {
    10
}
fn default_grace_period_secs() -> u64 {
    10
}

impl OrchestratorConfig {
    /// Parse only; no env overrides, no validation.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Read `path`, apply process env overrides and validate.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let mut cfg = Self::from_toml_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        cfg.apply_env_overrides(|k| std::env::var(k).ok())?;
        cfg.validate()
            .with_context(|| format!("validating {}", path.display()))?;
        Ok(cfg)
    }

    /// Load using `$EPG_CONFIG_PATH`, falling back to `config/orchestrator.toml`.
    pub fn load_default() -> Result<Self> {
        let path = std::env::var(ENV_CONFIG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&path)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_GUIDE_PATH).filter(|v| !v.trim().is_empty()) {
            self.guide_path = PathBuf::from(v.trim());
        }
        if let Some(v) = lookup(ENV_REFRESH_INTERVAL) {
            self.schedule.interval_secs =
                v.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                    var: ENV_REFRESH_INTERVAL,
                    value: v.clone(),
                })?;
        }
        if let Some(v) = lookup(ENV_SOURCE_PRIORITY) {
            self.priority = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = lookup(ENV_STATUS_LISTEN) {
            let v = v.trim();
            self.status.listen = (!v.is_empty()).then(|| v.to_string());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::NoSources);
        }

        let mut ids = HashSet::new();
        for src in &self.sources {
            let id_ok = !src.id.is_empty()
                && src
                    .id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
            if !id_ok {
                return Err(ConfigError::InvalidSourceId(src.id.clone()));
            }
            if !ids.insert(src.id.as_str()) {
                return Err(ConfigError::DuplicateSource(src.id.clone()));
            }
            if src.timeout_secs == 0 {
                return Err(ConfigError::ZeroTimeout(src.id.clone()));
            }
            match &src.kind {
                SourceKind::Command(c) => {
                    let captures_elsewhere = c.stdout || c.output_path.is_some();
                    if !captures_elsewhere
                        && !c.args.iter().any(|a| a.contains(OUTPUT_PLACEHOLDER))
                    {
                        return Err(ConfigError::MissingOutputPlaceholder(src.id.clone()));
                    }
                }
                SourceKind::Openwebif(o) => {
                    if !(o.url.starts_with("http://") || o.url.starts_with("https://")) {
                        return Err(ConfigError::InvalidUrl(src.id.clone()));
                    }
                }
            }
        }

        let mut listed = HashSet::new();
        for p in &self.priority {
            if !ids.contains(p.as_str()) {
                return Err(ConfigError::UnknownPriority(p.clone()));
            }
            if !listed.insert(p.as_str()) {
                return Err(ConfigError::DuplicatePriority(p.clone()));
            }
        }

        let interval = Duration::from_secs(self.schedule.interval_secs);
        let backoff = Duration::from_secs(self.schedule.backoff_secs);
        if interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        if backoff > interval {
            return Err(ConfigError::BackoffExceedsInterval { backoff, interval });
        }

        if self.guide_path.file_name().is_none() {
            return Err(ConfigError::InvalidGuidePath(self.guide_path.clone()));
        }
        let guide_dir = self
            .guide_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        if guide_dir == self.work_dir.as_path() {
            return Err(ConfigError::WorkDirIsGuideDir(self.work_dir.clone()));
        }

        if let Some(proxy) = &self.proxy {
            if proxy.program.trim().is_empty() {
                return Err(ConfigError::EmptyProxyProgram);
            }
            if proxy.probe_failure_threshold == 0 {
                return Err(ConfigError::ZeroProbeThreshold);
            }
            if proxy.probe_interval_secs == 0 {
                return Err(ConfigError::ZeroProbeInterval);
            }
            if proxy.probe_timeout_secs == 0 {
                return Err(ConfigError::ZeroProbeTimeout);
            }
        }
        Ok(())
    }

    pub fn source_priority(&self) -> SourcePriority {
        SourcePriority::new(self.priority.iter().cloned())
    }

    pub fn schedule_config(&self) -> ScheduleConfig {
        let interval = Duration::from_secs(self.schedule.interval_secs);
        ScheduleConfig {
            interval,
            backoff: Backoff::new(Duration::from_secs(self.schedule.backoff_secs), interval),
            run_on_start: self.schedule.run_on_start,
        }
    }
}

impl ProxySection {
    pub fn command(&self) -> ProxyCommand {
        ProxyCommand {
            program: self.program.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            current_dir: self.current_dir.clone(),
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            health_url: self.health_url.clone(),
            probe_interval: Duration::from_secs(self.probe_interval_secs),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            probe_failure_threshold: self.probe_failure_threshold,
            backoff: Backoff::new(
                Duration::from_millis(self.restart_initial_ms),
                Duration::from_secs(self.restart_max_secs),
            ),
            stable_after: Duration::from_secs(self.stable_after_secs),
            persistent_failure_after: self.persistent_failure_after,
            grace_period: Duration::from_secs(self.grace_period_secs),
        }
    }
}
