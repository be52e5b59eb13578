use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use camino::Utf8PathBuf;

use crate::blueprint::TaskGraph;
use crate::bundle::normalize_path;
use crate::config::Config;
use crate::core::{Environment, Mode};
use crate::engine::{Executor, Outcome, Report, StagePlan, TaskName};
use crate::error::{TaskFailure, TsumikiError};
use crate::reload::ReloadNotifier;
use crate::tasks::{self, Services};
use crate::watch::{ChangeKind, ChangeWatcher};

/// The configured build pipeline of one invocation.
///
/// Construction validates the whole definition, so a pipeline that exists
/// can't fail with a configuration error at run time. Running it executes
/// the stage plan of the selected mode and, when watching, keeps mapping
/// file changes to task re-runs until the process is stopped.
pub struct Pipeline {
    graph: TaskGraph,
    executor: Executor,
    env: Environment,
    services: Arc<Services>,
    watcher: Mutex<ChangeWatcher>,
    notifier: Option<Arc<dyn ReloadNotifier>>,
}

impl Pipeline {
    pub fn new(config: Config, mode: Mode, watch: bool) -> Result<Self, TsumikiError> {
        let mut env = Environment::new(mode, config);
        env.watch = watch;

        let services = Arc::new(Services::new(&env.config));
        let graph = tasks::blueprint(&services).finish()?;
        graph.plan(mode)?;

        let watcher = tasks::subscriptions(&env.config)?;
        watcher.validate(&graph)?;

        #[allow(unused_mut)]
        let mut notifier: Option<Arc<dyn ReloadNotifier>> = None;

        #[cfg(feature = "live")]
        if watch {
            let socket = crate::reload::WebSocketReload::start(env.config.server.reload_port)?;
            env.reload_port = Some(socket.port());
            notifier = Some(Arc::new(socket));
        }

        Ok(Self {
            graph,
            executor: Executor::new(),
            env,
            services,
            watcher: Mutex::new(watcher),
            notifier,
        })
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    /// Replaces the reload channel signalled after watched rebuilds.
    pub fn with_notifier(mut self, notifier: impl ReloadNotifier + 'static) -> Self {
        self.notifier = Some(Arc::new(notifier));
        self
    }

    /// Generation of the bundler's module graph cache. It only moves when the
    /// cache is written.
    pub fn cache_generation(&self) -> u64 {
        self.services.bundler.lock().unwrap().cache().generation()
    }

    /// Runs the plan of the selected mode, then either watches for changes or
    /// waits for the HTTP server.
    pub fn run(&self) -> Result<(), TsumikiError> {
        self.initial_build()?;

        if self.env.watch && self.services.watching.load(Ordering::SeqCst) {
            return self.watch();
        }

        #[cfg(feature = "server")]
        {
            let server = self.services.server.lock().unwrap().take();
            if let Some(server) = server {
                tracing::info!("serving, press Ctrl+C to stop");
                return server.join().map_err(TsumikiError::Server);
            }
        }

        Ok(())
    }

    /// Runs the plan of the selected mode once.
    ///
    /// When watching, a failed build doesn't end the session: the tasks that
    /// were skipped because of it (the server and the watcher among them) are
    /// started anyway, and the next edit gets a chance to repair the output.
    fn initial_build(&self) -> Result<(), TsumikiError> {
        let plan = self.graph.plan(self.env.mode)?;

        let failure = match self.run_plan(plan) {
            Ok(_) => return Ok(()),
            Err(failure @ TaskFailure::Tasks(_)) if self.env.watch => failure,
            Err(failure) => return Err(failure.into()),
        };
        tracing::error!("initial build failed, watching for a fix.\n{failure}");

        let skipped: BTreeSet<TaskName> = self
            .executor
            .last_report()
            .map(|report| {
                report
                    .runs()
                    .iter()
                    .filter(|(_, run)| run.outcome == Outcome::Skipped)
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default();

        if !skipped.is_empty()
            && let Err(e) = self.executor.rerun(&self.graph, &skipped, &self.env, &[])
        {
            tracing::error!("couldn't start the remaining tasks.\n{e}");
        }

        Ok(())
    }

    /// Runs a single stage plan against this pipeline's tasks.
    pub fn run_plan(&self, plan: &StagePlan) -> Result<Report, TaskFailure> {
        let report = self.executor.run_stage(&self.graph, plan, &self.env, &[]);

        if let Some(report) = self.executor.last_report() {
            tracing::debug!("{}", report.render_mermaid(&self.graph));
        }

        report
    }

    /// Handles one batch of changes, together with earlier collapsed changes
    /// whose debounce window has passed. Returns `None` when nothing had to
    /// run.
    ///
    /// A failed rebuild is logged and returned; the previous output stays in
    /// place and the reload channel is not signalled.
    pub fn on_changes(
        &self,
        events: &[(Utf8PathBuf, ChangeKind)],
        now: Instant,
    ) -> Option<Result<Report, TaskFailure>> {
        let mut tasks: BTreeSet<TaskName> = BTreeSet::new();
        let mut changed = vec![];

        {
            let mut watcher = self.watcher.lock().unwrap();
            for (path, kind) in events {
                let triggered = watcher.on_filesystem_event(path, *kind, now);
                if !triggered.is_empty() {
                    changed.push(normalize_path(path));
                    tasks.extend(triggered);
                }
            }
            for (path, triggered) in watcher.flush(now) {
                changed.push(path);
                tasks.extend(triggered);
            }
        }

        if tasks.is_empty() {
            return None;
        }

        changed.sort();
        changed.dedup();

        tracing::info!(tasks = ?tasks, "change detected, re-running tasks...");
        let result = self.executor.rerun(&self.graph, &tasks, &self.env, &changed);

        match &result {
            Ok(_) => {
                if let Some(notifier) = &self.notifier {
                    notifier.reload();
                }
                tracing::info!("rebuild complete, watching for changes...");
            }
            Err(e) => tracing::error!("rebuild failed, keeping the last good build.\n{e}"),
        }

        Some(result)
    }

    #[cfg(feature = "live")]
    fn watch(&self) -> Result<(), TsumikiError> {
        let (roots, debounce) = {
            let watcher = self.watcher.lock().unwrap();
            (watcher.roots(), watcher.debounce())
        };

        tracing::info!("initial build completed, now watching for changes...");
        crate::watch::listen(&self.env.config.root, &roots, debounce, |changes, now| {
            self.on_changes(&changes, now);
        })?;

        Ok(())
    }

    #[cfg(not(feature = "live"))]
    fn watch(&self) -> Result<(), TsumikiError> {
        tracing::warn!("tsumiki was built without the `live` feature, not watching");
        Ok(())
    }
}
