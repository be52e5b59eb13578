#[cfg(feature = "live")]
use std::sync::mpsc::RecvError;

use camino::Utf8PathBuf;
use thiserror::Error;

pub use crate::styles::CompileError;

/// A malformed pipeline definition. Always raised before any task runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Task '{0}' is declared more than once")]
    DuplicateTask(String),

    #[error("Task '{task}' depends on unknown task '{missing}'")]
    UnknownPredecessor { task: String, missing: String },

    #[error("Cycle detected in task graph at task '{0}'")]
    Cycle(String),

    #[error("Stage plan '{plan}' references unknown task '{task}'")]
    UnknownTask { plan: String, task: String },

    #[error("Stage plan '{plan}' schedules task '{task}' more than once")]
    RepeatedTask { plan: String, task: String },

    #[error("Task '{task}' requires '{predecessor}', which is not part of stage plan '{plan}'")]
    MissingPredecessor {
        plan: String,
        task: String,
        predecessor: String,
    },

    #[error("Task '{task}' requires '{predecessor}' to run in an earlier stage group of '{plan}'")]
    PredecessorNotEarlier {
        plan: String,
        task: String,
        predecessor: String,
    },

    #[error("No stage plan registered for mode '{0}'")]
    UnknownMode(String),

    #[error("Subscription refers to unknown task '{0}'")]
    UnknownSubscriber(String),

    #[error("Couldn't compile glob pattern.\n{0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("Couldn't read config file '{0}'.\n{1}")]
    Read(Utf8PathBuf, std::io::Error),

    #[error("Couldn't parse config file.\n{0}")]
    Parse(#[from] toml::de::Error),
}

/// Why a single module could not be bundled.
#[derive(Debug, Error)]
pub enum BundleCause {
    #[error("couldn't read source.\n{0}")]
    Read(#[from] std::io::Error),

    #[error("source is not valid UTF-8")]
    Encoding,

    #[error("couldn't resolve import '{0}'")]
    Resolve(String),

    #[error("compilation failed.\n{0:#}")]
    Compile(anyhow::Error),
}

/// A module failed to resolve or compile. The module graph cache keeps its
/// last-known-good state when this is returned.
#[derive(Debug, Error)]
#[error("Module '{module}': {cause}")]
pub struct BundleError {
    pub module: Utf8PathBuf,
    pub cause: BundleCause,
}

impl BundleError {
    pub(crate) fn new(module: impl Into<Utf8PathBuf>, cause: impl Into<BundleCause>) -> Self {
        Self {
            module: module.into(),
            cause: cause.into(),
        }
    }
}

/// A task that did not complete, together with the reason.
#[derive(Debug)]
pub struct FailedTask {
    pub name: String,
    pub cause: anyhow::Error,
}

impl std::fmt::Display for FailedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Task '{}':\n{:#}", self.name, self.cause)
    }
}

#[derive(Debug, Error)]
pub enum TaskFailure {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Stage plan '{0}' is already running")]
    Busy(String),

    #[error("{} task(s) failed:\n{}", .0.len(), format_failed(.0))]
    Tasks(Vec<FailedTask>),
}

impl TaskFailure {
    /// Names of the tasks that failed, empty for configuration errors.
    pub fn failed_tasks(&self) -> Vec<&str> {
        match self {
            TaskFailure::Tasks(failed) => failed.iter().map(|f| f.name.as_str()).collect(),
            _ => vec![],
        }
    }
}

fn format_failed(failed: &[FailedTask]) -> String {
    failed
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(feature = "live")]
#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Notify(#[from] notify::Error),

    #[error(transparent)]
    Recv(#[from] RecvError),
}

#[derive(Debug, Error)]
pub enum TsumikiError {
    #[error("Invalid pipeline configuration.\n{0}")]
    Config(#[from] ConfigError),

    #[error("Build failed.\n{0}")]
    Task(#[from] TaskFailure),

    #[cfg(feature = "live")]
    #[error("Error while watching for file changes.\n{0}")]
    Watch(#[from] WatchError),

    #[error("Server stopped with an error.\n{0:#}")]
    Server(anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
