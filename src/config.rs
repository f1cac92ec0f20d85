//! Configuration for gs3d.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (GS3D_HOME, GS3D_ARTIFACTS, GS3D_EXECUTOR)
//! 2. Config file (.gs3d/config.yaml)
//! 3. Defaults (~/.gs3d)
//!
//! Config file discovery:
//! - Searches current directory and parents for .gs3d/config.yaml
//! - Paths in config file are relative to the .gs3d/ directory

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::RetryPolicy;
use crate::domain::Stage;
use crate::executors::CommandSpec;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const DEFAULT_STAGE_TIMEOUT_SECONDS: u64 = 300;

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub executor: Option<ExecutorMode>,
    /// Per-stage overrides keyed by stage name (e.g. `scene_generation`)
    #[serde(default)]
    pub stages: HashMap<String, StageConfig>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .gs3d/)
    pub home: Option<String>,
    /// Artifact store root (relative to .gs3d/)
    pub artifacts: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StageConfig {
    pub timeout_seconds: Option<u64>,
    pub simulated_delay_ms: Option<u64>,
    pub command: Option<CommandSpec>,
}

/// How stage executors are built
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorMode {
    /// Fixed-delay placeholders
    #[default]
    Simulated,

    /// External programs, for stages that configure a command
    Command,
}

impl std::str::FromStr for ExecutorMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simulated" => Ok(Self::Simulated),
            "command" => Ok(Self::Command),
            other => anyhow::bail!("Unknown executor mode '{}'", other),
        }
    }
}

/// Effective settings for one stage
#[derive(Debug, Clone, PartialEq)]
pub struct StageSettings {
    /// Deadline after which the stage counts as failed
    pub timeout_seconds: u64,
    /// Delay used by the simulated executor
    pub simulated_delay_ms: u64,
    /// External program, used in command mode
    pub command: Option<CommandSpec>,
}

impl StageSettings {
    /// Defaults for a stage
    pub fn for_stage(stage: Stage) -> Self {
        let simulated_delay_ms = match stage {
            Stage::Ingest => 0,
            Stage::FrameExtraction => 1000,
            Stage::SceneGeneration => 2000,
            Stage::StyleTransfer => 1500,
        };

        Self {
            timeout_seconds: DEFAULT_STAGE_TIMEOUT_SECONDS,
            simulated_delay_ms,
            command: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn simulated_delay(&self) -> Duration {
        Duration::from_millis(self.simulated_delay_ms)
    }

    fn apply(&mut self, overrides: &StageConfig) {
        if let Some(timeout) = overrides.timeout_seconds {
            self.timeout_seconds = timeout;
        }
        if let Some(delay) = overrides.simulated_delay_ms {
            self.simulated_delay_ms = delay;
        }
        if let Some(ref command) = overrides.command {
            self.command = Some(command.clone());
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// State directory (job journals live under `jobs/`)
    pub home: PathBuf,
    /// Artifact store root
    pub artifacts_dir: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub executor_mode: ExecutorMode,
    pub stages: HashMap<Stage, StageSettings>,
    /// Caller-side retry policy used by `gs3d run`
    pub retry: RetryPolicy,
}

impl ResolvedConfig {
    /// Defaults rooted at `home`
    pub fn with_home(home: PathBuf) -> Self {
        let stages = Stage::ALL
            .into_iter()
            .map(|s| (s, StageSettings::for_stage(s)))
            .collect();

        Self {
            artifacts_dir: home.join("artifacts"),
            home,
            config_file: None,
            executor_mode: ExecutorMode::default(),
            stages,
            retry: RetryPolicy::default(),
        }
    }

    /// Settings for a stage (defaults if not configured)
    pub fn stage(&self, stage: Stage) -> StageSettings {
        self.stages
            .get(&stage)
            .cloned()
            .unwrap_or_else(|| StageSettings::for_stage(stage))
    }

    /// Per-stage deadlines
    pub fn stage_timeouts(&self) -> HashMap<Stage, Duration> {
        Stage::EXECUTABLE
            .into_iter()
            .map(|s| (s, self.stage(s).timeout()))
            .collect()
    }

    /// Directory holding per-job journals
    pub fn jobs_dir(&self) -> PathBuf {
        self.home.join("jobs")
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".gs3d").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge a parsed config file into defaults
fn apply_config_file(
    resolved: &mut ResolvedConfig,
    config: &ConfigFile,
    config_dir: &Path,
) -> Result<()> {
    if let Some(ref home) = config.paths.home {
        resolved.home = resolve_path(config_dir, home);
        resolved.artifacts_dir = resolved.home.join("artifacts");
    }
    if let Some(ref artifacts) = config.paths.artifacts {
        resolved.artifacts_dir = resolve_path(config_dir, artifacts);
    }
    if let Some(mode) = config.executor {
        resolved.executor_mode = mode;
    }
    if let Some(ref retry) = config.retry {
        resolved.retry = retry.clone();
    }

    for (key, overrides) in &config.stages {
        let stage = Stage::ALL
            .into_iter()
            .find(|s| s.key() == key)
            .with_context(|| format!("Unknown stage '{}' in config file", key))?;
        resolved
            .stages
            .entry(stage)
            .or_insert_with(|| StageSettings::for_stage(stage))
            .apply(overrides);
    }

    Ok(())
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".gs3d");

    let mut resolved = ResolvedConfig::with_home(default_home);

    let config_file = find_config_file();
    if let Some(ref config_path) = config_file {
        let config = load_config_file(config_path)?;
        let config_dir = config_path.parent().unwrap_or(Path::new("."));
        apply_config_file(&mut resolved, &config, config_dir)?;
    }
    resolved.config_file = config_file;

    if let Ok(env_home) = std::env::var("GS3D_HOME") {
        resolved.home = PathBuf::from(env_home);
        resolved.artifacts_dir = resolved.home.join("artifacts");
    }
    if let Ok(env_artifacts) = std::env::var("GS3D_ARTIFACTS") {
        resolved.artifacts_dir = PathBuf::from(env_artifacts);
    }
    if let Ok(env_mode) = std::env::var("GS3D_EXECUTOR") {
        resolved.executor_mode = env_mode.parse()?;
    }

    Ok(resolved)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}
