#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod assets;
mod blueprint;
pub mod bundle;
mod config;
mod core;
pub mod engine;
mod error;
pub mod lint;
mod pipeline;
mod reload;
#[cfg(feature = "server")]
mod server;
mod styles;
mod tasks;
mod utils;
mod watch;

pub use crate::blueprint::{Blueprint, TaskDef, TaskGraph};
pub use crate::config::{
    BundleConfig, CONFIG_FILE, Config, CopyConfig, LintConfig, ServerConfig, StylesConfig,
    TestConfig, VendorConfig, WatchConfig,
};
pub use crate::core::{Environment, Hash32, Mode, TaskContext};
pub use crate::engine::{Concurrency, Executor, Outcome, Report, StagePlan, TaskName, TaskRun};
pub use crate::error::*;
pub use crate::pipeline::Pipeline;
pub use crate::reload::ReloadNotifier;
#[cfg(feature = "live")]
pub use crate::reload::WebSocketReload;
pub use crate::tasks::{plans, subscriptions};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
pub use crate::watch::{ChangeKind, ChangeWatcher, Subscription};
