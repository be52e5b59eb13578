mod report;
mod runner;

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use crate::TaskContext;

pub use crate::engine::report::{Outcome, Report, TaskRun};
pub use crate::engine::runner::Executor;

/// Tasks are identified by name across the graph, stage plans and watch
/// subscriptions.
pub type TaskName = Cow<'static, str>;

/// The side effect of a task. Actions must be idempotent, the same task can
/// run many times over the lifetime of a watch session.
pub type Action = Arc<dyn Fn(&TaskContext<'_>) -> anyhow::Result<()> + Send + Sync>;

/// How a task may share its stage group with other tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Concurrency {
    /// Runs alone, before the parallel members of its group.
    Exclusive,
    /// Runs alongside the other parallel members of its group.
    #[default]
    Parallel,
}

/// A named build step in the task graph.
#[derive(Clone)]
pub struct TaskNode {
    pub name: TaskName,
    /// Tasks that must have completed in an earlier stage group.
    pub predecessors: Vec<TaskName>,
    pub concurrency: Concurrency,
    pub(crate) action: Action,
}

impl TaskNode {
    pub(crate) fn execute(&self, ctx: &TaskContext<'_>) -> anyhow::Result<()> {
        (self.action)(ctx)
    }
}

impl fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNode")
            .field("name", &self.name)
            .field("predecessors", &self.predecessors)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

/// An ordered list of stage groups. Groups run strictly one after another,
/// the tasks inside a group run concurrently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    name: TaskName,
    groups: Vec<Vec<TaskName>>,
}

impl StagePlan {
    pub fn new(name: impl Into<TaskName>) -> Self {
        Self {
            name: name.into(),
            groups: vec![],
        }
    }

    /// Appends a stage group.
    pub fn then<I, S>(mut self, group: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskName>,
    {
        self.groups.push(group.into_iter().map(Into::into).collect());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn groups(&self) -> &[Vec<TaskName>] {
        &self.groups
    }

    /// Number of tasks scheduled over all groups.
    pub fn len(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn from_groups(name: impl Into<TaskName>, groups: Vec<Vec<TaskName>>) -> Self {
        Self {
            name: name.into(),
            groups,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_keeps_group_order() {
        let plan = StagePlan::new("dev")
            .then(["clean-dev", "lint"])
            .then(["bundle-dev"])
            .then(["server", "watch"]);

        assert_eq!(plan.name(), "dev");
        assert_eq!(plan.len(), 5);
        assert_eq!(plan.groups()[1], vec![TaskName::from("bundle-dev")]);
        assert!(StagePlan::new("empty").is_empty());
    }
}
