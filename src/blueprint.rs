use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{self, Write};
use std::sync::Arc;

use petgraph::Graph;
use petgraph::graph::NodeIndex;

use crate::TaskContext;
use crate::core::Mode;
use crate::engine::{Concurrency, StagePlan, TaskName, TaskNode};
use crate::error::ConfigError;

/// The blueprint for a build pipeline.
///
/// `Blueprint` collects task definitions and the stage plan of every mode.
/// Nothing is checked while tasks are being added; [`Blueprint::finish`]
/// validates the whole definition at once and turns it into a [`TaskGraph`].
///
/// # Example
///
/// ```rust
/// use tsumiki::{Blueprint, Mode, StagePlan};
///
/// let mut blueprint = Blueprint::new();
/// blueprint.task("clean").exclusive().run(|_| Ok(()));
/// blueprint.task("bundle").after(["clean"]).run(|_| Ok(()));
/// blueprint.plan(Mode::Dev, StagePlan::new("dev").then(["clean"]).then(["bundle"]));
///
/// let graph = blueprint.finish().unwrap();
/// assert!(graph.node("bundle").is_some());
/// ```
#[derive(Default)]
pub struct Blueprint {
    nodes: Vec<TaskNode>,
    plans: BTreeMap<Mode, StagePlan>,
}

impl Blueprint {
    /// Creates a new, empty blueprint.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the definition of a task.
    pub fn task(&mut self, name: impl Into<TaskName>) -> TaskDef<'_> {
        TaskDef {
            blueprint: self,
            name: name.into(),
            predecessors: vec![],
            concurrency: Concurrency::Parallel,
        }
    }

    /// Registers the stage plan used for `mode`.
    pub fn plan(&mut self, mode: Mode, plan: StagePlan) -> &mut Self {
        self.plans.insert(mode, plan);
        self
    }

    /// Builds the task graph.
    ///
    /// Fails on duplicate task names, predecessors that were never declared,
    /// cycles, and stage plans that don't respect the declared ordering.
    pub fn finish(self) -> Result<TaskGraph, ConfigError> {
        let mut graph = Graph::new();
        let mut indices = HashMap::new();

        for node in self.nodes {
            if indices.contains_key(&node.name) {
                return Err(ConfigError::DuplicateTask(node.name.to_string()));
            }
            let name = node.name.clone();
            let index = graph.add_node(node);
            indices.insert(name, index);
        }

        let mut edges = vec![];
        for index in graph.node_indices() {
            let node: &TaskNode = &graph[index];
            for predecessor in &node.predecessors {
                let Some(&source) = indices.get(predecessor) else {
                    return Err(ConfigError::UnknownPredecessor {
                        task: node.name.to_string(),
                        missing: predecessor.to_string(),
                    });
                };
                edges.push((source, index));
            }
        }

        for (source, target) in edges {
            graph.add_edge(source, target, ());
        }

        // Ordering has to be a DAG, this rejects cycles before anything runs.
        petgraph::algo::toposort(&graph, None)
            .map_err(|cycle| ConfigError::Cycle(graph[cycle.node_id()].name.to_string()))?;

        let graph = TaskGraph {
            graph,
            indices,
            plans: self.plans,
        };

        for plan in graph.plans.values() {
            graph.validate(plan)?;
        }

        Ok(graph)
    }
}

pub struct TaskDef<'a> {
    blueprint: &'a mut Blueprint,
    name: TaskName,
    predecessors: Vec<TaskName>,
    concurrency: Concurrency,
}

impl TaskDef<'_> {
    /// Declares tasks that must complete in an earlier stage group.
    pub fn after<I, S>(mut self, predecessors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskName>,
    {
        self.predecessors
            .extend(predecessors.into_iter().map(Into::into));
        self
    }

    /// Marks the task as one that must not run alongside other tasks.
    pub fn exclusive(mut self) -> Self {
        self.concurrency = Concurrency::Exclusive;
        self
    }

    pub fn run<F>(self, action: F)
    where
        F: Fn(&TaskContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.blueprint.nodes.push(TaskNode {
            name: self.name,
            predecessors: self.predecessors,
            concurrency: self.concurrency,
            action: Arc::new(action),
        });
    }
}

/// A validated, acyclic task graph together with the stage plans of every
/// mode.
pub struct TaskGraph {
    pub(crate) graph: Graph<TaskNode, ()>,
    indices: HashMap<TaskName, NodeIndex>,
    plans: BTreeMap<Mode, StagePlan>,
}

impl TaskGraph {
    pub fn node(&self, name: &str) -> Option<&TaskNode> {
        self.indices.get(name).map(|&index| &self.graph[index])
    }

    pub(crate) fn index(&self, name: &str) -> Option<NodeIndex> {
        self.indices.get(name).copied()
    }

    /// Names of every task, in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.graph.node_weights().map(|node| node.name.as_ref())
    }

    pub fn plan(&self, mode: Mode) -> Result<&StagePlan, ConfigError> {
        self.plans
            .get(&mode)
            .ok_or_else(|| ConfigError::UnknownMode(mode.to_string()))
    }

    /// Checks that every task of `plan` exists, is scheduled once, and that
    /// each of its predecessors is scheduled in a strictly earlier group.
    pub fn validate(&self, plan: &StagePlan) -> Result<(), ConfigError> {
        self.validate_groups(plan, true)
    }

    fn validate_groups(&self, plan: &StagePlan, require_all: bool) -> Result<(), ConfigError> {
        let mut group_of: HashMap<&str, usize> = HashMap::new();

        for (group, names) in plan.groups().iter().enumerate() {
            for name in names {
                if self.node(name).is_none() {
                    return Err(ConfigError::UnknownTask {
                        plan: plan.name().to_string(),
                        task: name.to_string(),
                    });
                }
                if group_of.insert(name.as_ref(), group).is_some() {
                    return Err(ConfigError::RepeatedTask {
                        plan: plan.name().to_string(),
                        task: name.to_string(),
                    });
                }
            }
        }

        for (group, names) in plan.groups().iter().enumerate() {
            for name in names {
                let Some(node) = self.node(name) else {
                    continue;
                };
                for predecessor in &node.predecessors {
                    match group_of.get(predecessor.as_ref()) {
                        None if require_all => {
                            return Err(ConfigError::MissingPredecessor {
                                plan: plan.name().to_string(),
                                task: name.to_string(),
                                predecessor: predecessor.to_string(),
                            });
                        }
                        Some(&earlier) if earlier >= group => {
                            return Err(ConfigError::PredecessorNotEarlier {
                                plan: plan.name().to_string(),
                                task: name.to_string(),
                                predecessor: predecessor.to_string(),
                            });
                        }
                        _ => {}
                    }
                }
            }
        }

        Ok(())
    }

    /// Arranges a subset of tasks into stage groups that respect the graph
    /// ordering. Tasks outside of `tasks` are not run, but still order the
    /// selected ones through the edges they carry.
    pub fn layers(&self, name: &str, tasks: &BTreeSet<TaskName>) -> Result<StagePlan, ConfigError> {
        for task in tasks {
            if self.node(task).is_none() {
                return Err(ConfigError::UnknownTask {
                    plan: name.to_string(),
                    task: task.to_string(),
                });
            }
        }

        let order = petgraph::algo::toposort(&self.graph, None)
            .map_err(|cycle| ConfigError::Cycle(self.graph[cycle.node_id()].name.to_string()))?;

        // Number of selected tasks on the longest chain of ancestors.
        let mut depth: HashMap<NodeIndex, usize> = HashMap::new();
        let mut groups: Vec<Vec<TaskName>> = vec![];

        for index in order {
            let level = self
                .graph
                .neighbors_directed(index, petgraph::Direction::Incoming)
                .map(|pred| {
                    let selected = tasks.contains(&self.graph[pred].name) as usize;
                    depth.get(&pred).copied().unwrap_or(0) + selected
                })
                .max()
                .unwrap_or(0);
            depth.insert(index, level);

            let node = &self.graph[index];
            if tasks.contains(&node.name) {
                if groups.len() <= level {
                    groups.resize_with(level + 1, Vec::new);
                }
                groups[level].push(node.name.clone());
            }
        }

        groups.retain(|group| !group.is_empty());
        for group in &mut groups {
            group.sort();
        }

        let plan = StagePlan::from_groups(name.to_string(), groups);
        self.validate_groups(&plan, false)?;
        Ok(plan)
    }

    /// Renders a stage plan as a Mermaid graph with one subgraph per group.
    pub fn render_plan(&self, plan: &StagePlan) -> String {
        let mut f = String::new();
        writeln!(f, "graph LR").unwrap();

        for (number, group) in plan.groups().iter().enumerate() {
            writeln!(f, "    subgraph group{number}[\"group {}\"]", number + 1).unwrap();
            for name in group {
                if let Some(index) = self.index(name) {
                    writeln!(f, "        {}[\"{}\"]", index.index(), escape(name)).unwrap();
                }
            }
            writeln!(f, "    end").unwrap();
        }

        let scheduled: BTreeSet<&str> = plan.groups().iter().flatten().map(|name| &**name).collect();
        for edge in self.graph.raw_edges() {
            let source = &self.graph[edge.source()];
            let target = &self.graph[edge.target()];
            if scheduled.contains(source.name.as_ref()) && scheduled.contains(target.name.as_ref()) {
                writeln!(f, "    {} --> {}", edge.source().index(), edge.target().index()).unwrap();
            }
        }

        f
    }
}

pub(crate) fn escape(name: &str) -> String {
    name.replace('"', "\\\"")
}

impl fmt::Display for TaskGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let node = &self.graph[index];
            writeln!(f, "    {}[\"{}\"]", index.index(), escape(&node.name))?;
        }

        for edge in self.graph.raw_edges() {
            writeln!(f, "    {} --> {}", edge.source().index(), edge.target().index())?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(blueprint: &mut Blueprint, name: &'static str, after: &[&'static str]) {
        blueprint
            .task(name)
            .after(after.iter().copied())
            .run(|_| Ok(()));
    }

    fn names(set: &[&'static str]) -> BTreeSet<TaskName> {
        set.iter().map(|s| TaskName::from(*s)).collect()
    }

    #[test]
    fn duplicate_task_is_rejected() {
        let mut blueprint = Blueprint::new();
        noop(&mut blueprint, "lint", &[]);
        noop(&mut blueprint, "lint", &[]);

        let err = blueprint.finish().err().unwrap();
        assert!(matches!(err, ConfigError::DuplicateTask(name) if name == "lint"));
    }

    #[test]
    fn dangling_predecessor_is_rejected() {
        let mut blueprint = Blueprint::new();
        noop(&mut blueprint, "server", &["copy-index"]);

        let err = blueprint.finish().err().unwrap();
        assert!(matches!(
            err,
            ConfigError::UnknownPredecessor { task, missing } if task == "server" && missing == "copy-index"
        ));
    }

    #[test]
    fn cycle_is_rejected_at_construction() {
        let mut blueprint = Blueprint::new();
        noop(&mut blueprint, "a", &["c"]);
        noop(&mut blueprint, "b", &["a"]);
        noop(&mut blueprint, "c", &["b"]);

        assert!(matches!(blueprint.finish(), Err(ConfigError::Cycle(_))));

        let mut blueprint = Blueprint::new();
        noop(&mut blueprint, "self", &["self"]);
        assert!(matches!(blueprint.finish(), Err(ConfigError::Cycle(_))));
    }

    #[test]
    fn plan_must_schedule_predecessors_earlier() {
        let mut blueprint = Blueprint::new();
        noop(&mut blueprint, "copy-index", &[]);
        noop(&mut blueprint, "server", &["copy-index"]);
        blueprint.plan(
            Mode::Dev,
            StagePlan::new("dev").then(["copy-index", "server"]),
        );

        assert!(matches!(
            blueprint.finish(),
            Err(ConfigError::PredecessorNotEarlier { task, .. }) if task == "server"
        ));
    }

    #[test]
    fn plan_must_contain_predecessors() {
        let mut blueprint = Blueprint::new();
        noop(&mut blueprint, "copy-index", &[]);
        noop(&mut blueprint, "server", &["copy-index"]);
        blueprint.plan(Mode::Prod, StagePlan::new("prod").then(["server"]));

        assert!(matches!(
            blueprint.finish(),
            Err(ConfigError::MissingPredecessor { predecessor, .. }) if predecessor == "copy-index"
        ));
    }

    #[test]
    fn plan_with_unknown_or_repeated_task_is_rejected() {
        let mut blueprint = Blueprint::new();
        noop(&mut blueprint, "lint", &[]);
        blueprint.plan(Mode::Dev, StagePlan::new("dev").then(["lint", "nope"]));
        assert!(matches!(
            blueprint.finish(),
            Err(ConfigError::UnknownTask { task, .. }) if task == "nope"
        ));

        let mut blueprint = Blueprint::new();
        noop(&mut blueprint, "lint", &[]);
        blueprint.plan(Mode::Dev, StagePlan::new("dev").then(["lint"]).then(["lint"]));
        assert!(matches!(blueprint.finish(), Err(ConfigError::RepeatedTask { .. })));
    }

    #[test]
    fn missing_mode_is_reported() {
        let graph = Blueprint::new().finish().unwrap();
        assert!(matches!(graph.plan(Mode::Test), Err(ConfigError::UnknownMode(mode)) if mode == "test"));
    }

    #[test]
    fn layers_follow_edges_through_unselected_tasks() {
        let mut blueprint = Blueprint::new();
        noop(&mut blueprint, "a", &[]);
        noop(&mut blueprint, "b", &["a"]);
        noop(&mut blueprint, "c", &["b"]);
        noop(&mut blueprint, "d", &[]);
        let graph = blueprint.finish().unwrap();

        let plan = graph.layers("rebuild", &names(&["a", "c", "d"])).unwrap();
        assert_eq!(
            plan.groups(),
            &[
                vec![TaskName::from("a"), TaskName::from("d")],
                vec![TaskName::from("c")],
            ]
        );

        let plan = graph.layers("rebuild", &names(&["c"])).unwrap();
        assert_eq!(plan.groups(), &[vec![TaskName::from("c")]]);

        assert!(graph.layers("rebuild", &names(&["zzz"])).is_err());
    }

    #[test]
    fn plan_renders_as_mermaid() {
        let mut blueprint = Blueprint::new();
        noop(&mut blueprint, "copy-index", &[]);
        noop(&mut blueprint, "server", &["copy-index"]);
        let plan = StagePlan::new("prod").then(["copy-index"]).then(["server"]);
        blueprint.plan(Mode::Prod, plan.clone());
        let graph = blueprint.finish().unwrap();

        let out = graph.render_plan(&plan);
        assert!(out.starts_with("graph LR\n"));
        assert!(out.contains("subgraph group0[\"group 1\"]"));
        assert!(out.contains("0[\"copy-index\"]"));
        assert!(out.contains("0 --> 1"));

        assert_eq!(
            graph.to_string(),
            "graph LR\n    0[\"copy-index\"]\n    1[\"server\"]\n    0 --> 1\n"
        );
    }
}
