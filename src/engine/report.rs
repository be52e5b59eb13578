use std::time::{Duration, Instant};

use crate::blueprint::{TaskGraph, escape};
use crate::engine::TaskName;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Failed,
    /// Not started because an earlier group failed.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct TaskRun {
    pub start: Instant,
    pub duration: Duration,
    pub outcome: Outcome,
}

/// What happened to every task of one stage plan run.
#[derive(Debug, Clone)]
pub struct Report {
    plan: String,
    runs: Vec<(TaskName, TaskRun)>,
    total: Duration,
}

impl Report {
    pub(crate) fn new(plan: &str) -> Self {
        Self {
            plan: plan.to_string(),
            runs: vec![],
            total: Duration::ZERO,
        }
    }

    pub(crate) fn push(&mut self, name: TaskName, run: TaskRun) {
        self.runs.push((name, run));
    }

    pub(crate) fn finish(&mut self, total: Duration) {
        self.total = total;
    }

    pub fn plan(&self) -> &str {
        &self.plan
    }

    /// Runs in group order. Within a group they are sorted by name.
    pub fn runs(&self) -> &[(TaskName, TaskRun)] {
        &self.runs
    }

    pub fn get(&self, name: &str) -> Option<&TaskRun> {
        self.runs
            .iter()
            .find(|(task, _)| task == name)
            .map(|(_, run)| run)
    }

    /// Names of the tasks that completed successfully.
    pub fn completed(&self) -> Vec<&str> {
        self.runs
            .iter()
            .filter(|(_, run)| run.outcome == Outcome::Done)
            .map(|(name, _)| name.as_ref())
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.runs.iter().all(|(_, run)| run.outcome == Outcome::Done)
    }

    pub fn total(&self) -> Duration {
        self.total
    }

    /// Renders the whole task graph as Mermaid, each task coloured by how
    /// long it took relative to the others in this run. Tasks that were not
    /// part of the run are light blue, failed ones red.
    pub fn render_mermaid(&self, graph: &TaskGraph) -> String {
        use std::fmt::Write;

        let mut f = String::new();
        writeln!(f, "graph LR").unwrap();

        let mut min_time = f64::MAX;
        let mut max_time = f64::MIN;

        for (_, run) in &self.runs {
            if run.outcome != Outcome::Done {
                continue;
            }
            let secs = run.duration.as_secs_f64();
            min_time = min_time.min(secs);
            max_time = max_time.max(secs);
        }

        if min_time > max_time {
            min_time = 0.0;
            max_time = 0.0;
        }

        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        for index in graph.graph.node_indices() {
            let name = &graph.graph[index].name;

            let (label, color) = match self.get(name) {
                Some(run) if run.outcome == Outcome::Done => {
                    let t = (run.duration.as_secs_f64() - min_time) / (max_time - min_time);
                    (format!("{:.2?}", run.duration), gradient(t))
                }
                Some(run) if run.outcome == Outcome::Failed => ("Failed".to_string(), "#FF6961".to_string()),
                Some(_) => ("Skipped".to_string(), "#ADD8E6".to_string()),
                None => ("Cached".to_string(), "#ADD8E6".to_string()),
            };

            writeln!(f, "    {}[\"{}\\n{}\"]", index.index(), escape(name), label).unwrap();
            writeln!(f, "    style {} fill:{}", index.index(), color).unwrap();
        }

        for edge in graph.graph.raw_edges() {
            writeln!(f, "    {} --> {}", edge.source().index(), edge.target().index()).unwrap();
        }

        f
    }
}

/// Green at 0.0, yellow at 0.5, red at 1.0.
fn gradient(t: f64) -> String {
    let (r, g, b) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255, 0)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8, 0)
    };

    format!("#{r:02X}{g:02X}{b:02X}")
}
