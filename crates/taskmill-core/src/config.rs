use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Scheduling constants shared by every interval policy.
pub const MINIMUM_INTERVAL_TIME: i64 = 5; // floor for fixed intervals, seconds
pub const PREVIOUS_MIN_TIME: i64 = 300; // a PROGRESS record older than this is stale
pub const DEFAULT_TICK_SECS: u64 = 60; // daemon cadence, one tick per minute

/// Top-level config (taskmill.toml + TASKMILL_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskmillConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Command tasks registered by the CLI, in declaration order.
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Which record store the scheduler persists to.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StoreKind {
    /// Process-local map; records vanish when the process exits.
    Local,
    /// SQLite `task_scheduler` table at `database.path`.
    #[default]
    Entity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub store: StoreKind,
    /// Seconds between ticks when running as a daemon.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            store: StoreKind::default(),
            tick_secs: DEFAULT_TICK_SECS,
        }
    }
}

/// Interval as written in config: either plain seconds or a cron expression.
///
/// A numeric string (`"90"`) is treated the same as the integer form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum IntervalSpec {
    Seconds(u64),
    Expression(String),
}

impl std::fmt::Display for IntervalSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntervalSpec::Seconds(secs) => write!(f, "{secs}s"),
            IntervalSpec::Expression(expr) => f.write_str(expr),
        }
    }
}

/// A shell command run on a schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Primary key of the persisted record: lowercase `[a-z0-9_]+`.
    pub identity: String,
    /// Display name; falls back to the identity.
    pub name: Option<String>,
    pub interval: IntervalSpec,
    /// Program to execute. Run through `sh -c` when `args` is empty.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Allow a new run while the previous one is still marked in progress.
    #[serde(default)]
    pub force_run_in_progress: bool,
    /// Override for the stale-progress threshold, in seconds.
    pub stale_after_secs: Option<u64>,
}

impl TaskConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.identity)
    }
}

fn default_tick_secs() -> u64 {
    DEFAULT_TICK_SECS
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.taskmill/taskmill.db", home)
}

impl TaskmillConfig {
    /// Load config from a TOML file with TASKMILL_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.taskmill/taskmill.toml
    ///
    /// Nested keys use a double underscore: `TASKMILL_SCHEDULER__TICK_SECS=30`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        tracing::debug!(%path, "loading config");

        Self::extract(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed("TASKMILL_").split("__")),
        )
    }

    /// Parse config from an in-memory TOML document (no env overrides).
    pub fn from_toml_str(toml: &str) -> crate::error::Result<Self> {
        Self::extract(Figment::new().merge(Toml::string(toml)))
    }

    fn extract(figment: Figment) -> crate::error::Result<Self> {
        let config: TaskmillConfig = figment
            .extract()
            .map_err(|e| crate::error::TaskmillError::Config(e.to_string()))?;

        if config.scheduler.tick_secs == 0 {
            return Err(crate::error::TaskmillError::Config(
                "scheduler.tick_secs must be greater than zero".to_string(),
            ));
        }
        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.taskmill/taskmill.toml", home)
}
