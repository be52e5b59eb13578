use std::collections::BTreeSet;
use std::sync::mpsc::channel;
use std::sync::{Mutex, TryLockError};
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::blueprint::TaskGraph;
use crate::engine::{Concurrency, Outcome, Report, StagePlan, TaskName, TaskNode, TaskRun};
use crate::error::{FailedTask, TaskFailure};
use crate::utils::{STYLE_STAGE, STYLE_TASK};
use crate::{Environment, TaskContext};

/// Runs stage plans over a [`TaskGraph`].
///
/// Groups run strictly in sequence. The members of a group are spawned on
/// the rayon pool and awaited together, so a later group never observes an
/// unfinished earlier one. Only one run can be in flight at a time.
#[derive(Debug, Default)]
pub struct Executor {
    running: Mutex<()>,
    last: Mutex<Option<Report>>,
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs every group of `plan`. The plan is validated against the graph
    /// before any task starts.
    pub fn run_stage(
        &self,
        graph: &TaskGraph,
        plan: &StagePlan,
        env: &Environment,
        changed: &[Utf8PathBuf],
    ) -> Result<Report, TaskFailure> {
        graph.validate(plan)?;
        self.run_groups(graph, plan, env, changed)
    }

    /// Runs only the given tasks, grouped so that the graph ordering between
    /// them holds. Used for watched rebuilds, where the predecessors of a
    /// task have already run during the initial build.
    pub fn rerun(
        &self,
        graph: &TaskGraph,
        tasks: &BTreeSet<TaskName>,
        env: &Environment,
        changed: &[Utf8PathBuf],
    ) -> Result<Report, TaskFailure> {
        let plan = graph.layers("rebuild", tasks)?;
        self.run_groups(graph, &plan, env, changed)
    }

    /// The report of the most recent run, including runs that failed.
    pub fn last_report(&self) -> Option<Report> {
        self.last.lock().unwrap().clone()
    }

    fn run_groups(
        &self,
        graph: &TaskGraph,
        plan: &StagePlan,
        env: &Environment,
        changed: &[Utf8PathBuf],
    ) -> Result<Report, TaskFailure> {
        let _guard = match self.running.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(TaskFailure::Busy(plan.name().to_string())),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        let start = Instant::now();
        let mut report = Report::new(plan.name());
        let mut failed = vec![];

        let root_span = tracing::span!(Level::INFO, "stage", plan = plan.name());
        root_span.pb_set_length(plan.len() as u64);
        root_span.pb_set_style(&STYLE_STAGE);
        root_span.pb_set_message(&format!("Running {}...", plan.name()));
        let _enter = root_span.enter();

        for group in plan.groups() {
            if !failed.is_empty() {
                for name in group {
                    report.push(name.clone(), skipped());
                }
                continue;
            }

            let (exclusive, parallel): (Vec<&TaskNode>, Vec<&TaskNode>) = group
                .iter()
                .filter_map(|name| graph.node(name))
                .partition(|node| node.concurrency == Concurrency::Exclusive);

            let mut results = vec![];

            for node in exclusive {
                results.push(run_task(node, env, changed));
                root_span.pb_inc(1);
            }

            let (sender, receiver) = channel();
            rayon::scope(|s| {
                for node in parallel {
                    let sender = sender.clone();
                    let root_span = &root_span;
                    s.spawn(move |_| {
                        let result = run_task(node, env, changed);
                        root_span.pb_inc(1);
                        // The receiver outlives the scope.
                        let _ = sender.send(result);
                    });
                }
            });
            drop(sender);
            results.extend(receiver);

            // Completion order within a group must not leak into the report.
            results.sort_by(|a, b| a.0.cmp(&b.0));

            for (name, result, run) in results {
                match result {
                    Ok(()) => report.push(name, run),
                    Err(cause) => {
                        tracing::error!(task = %name, "{cause:#}");
                        report.push(name.clone(), TaskRun { outcome: Outcome::Failed, ..run });
                        failed.push(FailedTask {
                            name: name.to_string(),
                            cause,
                        });
                    }
                }
            }
        }

        report.finish(start.elapsed());
        *self.last.lock().unwrap() = Some(report.clone());

        if !failed.is_empty() {
            return Err(TaskFailure::Tasks(failed));
        }

        tracing::info!(
            "Finished {} in {:.2?}",
            plan.name(),
            report.total()
        );
        Ok(report)
    }
}

fn skipped() -> TaskRun {
    TaskRun {
        start: Instant::now(),
        duration: Duration::ZERO,
        outcome: Outcome::Skipped,
    }
}

fn run_task(
    node: &TaskNode,
    env: &Environment,
    changed: &[Utf8PathBuf],
) -> (TaskName, anyhow::Result<()>, TaskRun) {
    let span = tracing::span!(Level::INFO, "task", name = %node.name);
    span.pb_set_style(&STYLE_TASK);
    span.pb_set_message(&format!("Running {}", node.name));
    let _enter = span.enter();

    let ctx = TaskContext {
        env,
        changed,
        span: span.clone(),
    };

    let start = Instant::now();

    // A panicking action only poisons its own task, everything it touches is
    // either borrowed immutably or guarded by a mutex.
    let result = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| node.execute(&ctx))) {
        Ok(result) => result,
        Err(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("Task panicked: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("Task panicked: {s}")
            } else {
                String::from("Task panicked with unknown payload")
            };

            Err(anyhow::anyhow!(msg))
        }
    };

    let run = TaskRun {
        start,
        duration: start.elapsed(),
        outcome: Outcome::Done,
    };

    (node.name.clone(), result, run)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    use crate::blueprint::Blueprint;
    use crate::config::Config;
    use crate::core::Mode;

    fn env() -> Environment {
        Environment::new(Mode::Dev, Config::default())
    }

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn logging(blueprint: &mut Blueprint, log: &Log, name: &'static str) {
        let log = log.clone();
        blueprint.task(name).run(move |_| {
            log.lock().unwrap().push(name);
            Ok(())
        });
    }

    #[test]
    fn groups_run_in_sequence() {
        let log = Log::default();
        let mut blueprint = Blueprint::new();
        for name in ["a", "b", "c", "d"] {
            logging(&mut blueprint, &log, name);
        }
        let graph = blueprint.finish().unwrap();
        let plan = StagePlan::new("dev").then(["a", "b"]).then(["c"]).then(["d"]);

        let report = Executor::new().run_stage(&graph, &plan, &env(), &[]).unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 4);
        assert!(log[..2].contains(&"a") && log[..2].contains(&"b"));
        assert_eq!(&log[2..], &["c", "d"]);
        assert_eq!(report.completed(), vec!["a", "b", "c", "d"]);
        assert!(report.is_success());
    }

    #[test]
    fn failure_awaits_siblings_and_aborts_later_groups() {
        let log = Log::default();
        let mut blueprint = Blueprint::new();
        logging(&mut blueprint, &log, "lint");
        logging(&mut blueprint, &log, "server");
        blueprint
            .task("bundle-dev")
            .run(|_| Err(anyhow::anyhow!("unexpected token")));
        let graph = blueprint.finish().unwrap();
        let plan = StagePlan::new("dev")
            .then(["bundle-dev", "lint"])
            .then(["server"]);

        let executor = Executor::new();
        let err = executor.run_stage(&graph, &plan, &env(), &[]).unwrap_err();

        assert_eq!(err.failed_tasks(), vec!["bundle-dev"]);
        assert_eq!(*log.lock().unwrap(), vec!["lint"]);

        let report = executor.last_report().unwrap();
        assert_eq!(report.get("bundle-dev").unwrap().outcome, Outcome::Failed);
        assert_eq!(report.get("lint").unwrap().outcome, Outcome::Done);
        assert_eq!(report.get("server").unwrap().outcome, Outcome::Skipped);
    }

    #[test]
    fn panics_become_task_failures() {
        let mut blueprint = Blueprint::new();
        blueprint.task("styles-dev").run(|_| panic!("boom"));
        let graph = blueprint.finish().unwrap();
        let plan = StagePlan::new("dev").then(["styles-dev"]);

        let err = Executor::new().run_stage(&graph, &plan, &env(), &[]).unwrap_err();

        let TaskFailure::Tasks(failed) = err else {
            panic!("expected task failure");
        };
        assert_eq!(failed[0].name, "styles-dev");
        assert!(failed[0].cause.to_string().contains("Task panicked: boom"));
    }

    #[test]
    fn invalid_plan_fails_before_anything_runs() {
        let log = Log::default();
        let mut blueprint = Blueprint::new();
        logging(&mut blueprint, &log, "copy-index");
        let log_server = log.clone();
        blueprint.task("server").after(["copy-index"]).run(move |_| {
            log_server.lock().unwrap().push("server");
            Ok(())
        });
        let graph = blueprint.finish().unwrap();

        let plan = StagePlan::new("prod").then(["server", "copy-index"]);
        let err = Executor::new().run_stage(&graph, &plan, &env(), &[]).unwrap_err();

        assert!(matches!(err, TaskFailure::Config(_)));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn exclusive_tasks_run_first_and_alone() {
        let log = Log::default();
        let mut blueprint = Blueprint::new();
        logging(&mut blueprint, &log, "lint");
        logging(&mut blueprint, &log, "checkstyle");
        let log_clean = log.clone();
        blueprint.task("clean-dev").exclusive().run(move |_| {
            log_clean.lock().unwrap().push("clean-dev");
            Ok(())
        });
        let graph = blueprint.finish().unwrap();
        let plan = StagePlan::new("dev").then(["lint", "clean-dev", "checkstyle"]);

        Executor::new().run_stage(&graph, &plan, &env(), &[]).unwrap();

        assert_eq!(log.lock().unwrap()[0], "clean-dev");
    }

    #[test]
    fn overlapping_runs_are_rejected() {
        let (started_tx, started_rx) = channel();
        let (release_tx, release_rx) = channel::<()>();
        let started_tx = Mutex::new(started_tx);
        let release_rx = Mutex::new(release_rx);

        let mut blueprint = Blueprint::new();
        blueprint.task("test").run(move |_| {
            started_tx.lock().unwrap().send(()).unwrap();
            release_rx.lock().unwrap().recv().unwrap();
            Ok(())
        });
        let graph = blueprint.finish().unwrap();
        let plan = StagePlan::new("test").then(["test"]);
        let env = env();
        let executor = Executor::new();

        std::thread::scope(|s| {
            let first = s.spawn(|| executor.run_stage(&graph, &plan, &env, &[]));
            started_rx.recv().unwrap();

            let second = executor.run_stage(&graph, &plan, &env, &[]);
            assert!(matches!(second, Err(TaskFailure::Busy(name)) if name == "test"));

            release_tx.send(()).unwrap();
            assert!(first.join().unwrap().is_ok());
        });

        // The lock is free again once the first run is done.
        release_tx.send(()).unwrap();
        assert!(executor.run_stage(&graph, &plan, &env, &[]).is_ok());
    }

    #[test]
    fn rerun_only_runs_selected_tasks_in_order() {
        let log = Log::default();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut blueprint = Blueprint::new();
        logging(&mut blueprint, &log, "bundle-dev");
        logging(&mut blueprint, &log, "styles-dev");
        let log_watch = log.clone();
        let count = counter.clone();
        blueprint
            .task("watch")
            .after(["bundle-dev", "styles-dev"])
            .run(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                log_watch.lock().unwrap().push("watch");
                Ok(())
            });
        let graph = blueprint.finish().unwrap();

        let tasks: BTreeSet<TaskName> = ["styles-dev".into()].into_iter().collect();
        let changed = vec![Utf8PathBuf::from("js/app/app.scss")];
        let report = Executor::new().rerun(&graph, &tasks, &env(), &changed).unwrap();

        assert_eq!(report.plan(), "rebuild");
        assert_eq!(*log.lock().unwrap(), vec!["styles-dev"]);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
