use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, anyhow};
use clap::Parser;
use serde::Deserialize;

use crate::error::ConfigError;

const DEFAULT_CHILD_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const DEFAULT_MEMORY_POLL_INTERVAL: MilliSecond = MilliSecond(20);

#[derive(Parser)]
#[command(name = "runbox", version = "0.1", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: PathBuf,

    /// Language of the submitted sources
    #[arg(long = "language", short = 'l')]
    pub language: String,

    /// File fed to the standard input of every submission
    #[arg(long = "stdin", short = 'i')]
    pub stdin_path: Option<PathBuf>,

    /// Source files to execute, one submission each
    #[arg(required = true)]
    pub sources: Vec<PathBuf>,
}

impl CliArgs {
    /// Load the configuration from the specified file
    pub fn to_config(&self) -> anyhow::Result<Config> {
        Config::from_file(&self.config_path)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub limits: ResourceLimits,
    #[serde(default)]
    pub compile_limits: Option<ResourceLimits>,
    pub scheduler: SchedulerConfig,
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub governor: GovernorConfig,
    /// `PATH` handed to compile and run steps
    #[serde(default = "default_child_path")]
    pub path: String,
    pub languages: Vec<LanguageConfig>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open config file {}", path.display()))?;
        let reader = std::io::BufReader::new(file);
        let config: Config = serde_json::from_reader(reader)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.limits.validate("limits")?;
        if let Some(limits) = &self.compile_limits {
            limits.validate("compile_limits")?;
        }
        if self.scheduler.max_concurrent_jobs == 0 {
            return Err(ConfigError::Zero("scheduler.max_concurrent_jobs"));
        }
        if self.scheduler.max_queue_depth == 0 {
            return Err(ConfigError::Zero("scheduler.max_queue_depth"));
        }
        if self.governor.memory_poll_interval_ms.0 == 0 {
            return Err(ConfigError::Zero("governor.memory_poll_interval_ms"));
        }

        let mut seen = HashSet::new();
        for language in &self.languages {
            if language.run.is_empty() {
                return Err(ConfigError::EmptyRunCommand(language.name.clone()));
            }
            if language.compile.as_ref().is_some_and(Vec::is_empty) {
                return Err(ConfigError::EmptyCompileCommand(language.name.clone()));
            }
            for name in std::iter::once(&language.name).chain(&language.aliases) {
                if !seen.insert(name.to_lowercase()) {
                    return Err(ConfigError::DuplicateLanguage(name.clone()));
                }
            }
        }
        Ok(())
    }

    /// Limits for the build step; falls back to the run limits
    pub fn compile_limits(&self) -> ResourceLimits {
        self.compile_limits.unwrap_or(self.limits)
    }
}

fn default_child_path() -> String {
    DEFAULT_CHILD_PATH.to_string()
}

/// Ceilings the governor enforces on one step of a job
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub max_wall_time_ms: MilliSecond,
    pub max_memory_bytes: ByteSize,
    pub max_output_bytes: ByteSize,
}

impl ResourceLimits {
    fn validate(&self, section: &'static str) -> Result<(), ConfigError> {
        let zero = |field: &'static str| ConfigError::ZeroLimit { section, field };
        if self.max_wall_time_ms.0 == 0 {
            return Err(zero("max_wall_time_ms"));
        }
        if self.max_memory_bytes.0 == 0 {
            return Err(zero("max_memory_bytes"));
        }
        if self.max_output_bytes.0 == 0 {
            return Err(zero("max_output_bytes"));
        }
        Ok(())
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent_jobs: usize,
    pub max_queue_depth: usize,
}

#[derive(Deserialize, Debug, Clone)]
pub struct WorkspaceConfig {
    /// Directory holding every workspace; defaults to the user cache dir
    #[serde(default)]
    pub root: Option<PathBuf>,
    pub orphan_staleness_threshold_ms: MilliSecond,
}

impl WorkspaceConfig {
    pub fn root_dir(&self) -> anyhow::Result<PathBuf> {
        if let Some(root) = &self.root {
            return Ok(root.clone());
        }

        use directories::ProjectDirs;

        let proj_dirs = ProjectDirs::from("", "", "runbox")
            .ok_or_else(|| anyhow!("Unable to find user directory"))?;
        Ok(proj_dirs.cache_dir().join("workspaces"))
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct GovernorConfig {
    #[serde(default = "default_memory_poll_interval")]
    pub memory_poll_interval_ms: MilliSecond,
    /// Bar supervised processes from leaving their process group
    #[serde(default = "default_lock_sessions")]
    pub lock_sessions: bool,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            memory_poll_interval_ms: DEFAULT_MEMORY_POLL_INTERVAL,
            lock_sessions: true,
        }
    }
}

fn default_lock_sessions() -> bool {
    true
}

fn default_memory_poll_interval() -> MilliSecond {
    DEFAULT_MEMORY_POLL_INTERVAL
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MilliSecond(pub u64);

impl From<MilliSecond> for Duration {
    fn from(value: MilliSecond) -> Self {
        Duration::from_millis(value.0)
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub fn as_usize(self) -> usize {
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }
}

/// Compile and run templates for one language
///
/// Command templates understand `%INPUT%` (source file name), `%OUTPUT%`
/// (artifact name), `%ENTRY%` (entry symbol) and `%DIR%` (workspace root).
#[derive(Deserialize, Debug, Clone)]
pub struct LanguageConfig {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub extension: String,
    #[serde(default)]
    pub entry: EntryRule,
    #[serde(default)]
    pub compile: Option<Vec<String>>,
    pub run: Vec<String>,
    /// File the build step must leave behind, e.g. `%ENTRY%.class`
    #[serde(default)]
    pub artifact: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Treat any compiler stderr as a failed build
    #[serde(default)]
    pub fail_on_diagnostics: bool,
}

/// How the entry symbol (and thus the source file name) is chosen
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryRule {
    Fixed { name: String },
    Class { fallback: String },
}

impl Default for EntryRule {
    fn default() -> Self {
        Self::Fixed {
            name: "main".to_string(),
        }
    }
}
