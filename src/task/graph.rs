//! Dependency graph of a job's tasks.
//!
//! Task nodes live in an arena and refer to each other through indices,
//! with a synthetic root ahead of every task. The execution order is a
//! priority-aware topological sort: higher priority first, recipe order
//! as the tie break.

use super::{JobRecipe, TaskDef, TaskKind};
use err_derive::Error;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

#[derive(Debug, Error)]
pub enum RecipeError {
    #[error(display = "duplicate task id: {}", _0)]
    DuplicateTask(String),

    #[error(display = "task {} depends on unknown task {}", task, dependency)]
    MissingDependency { task: String, dependency: String },

    #[error(display = "task {} has no command binary", _0)]
    MissingCommand(String),

    #[error(display = "task {} is sandboxed but has no sandbox record", _0)]
    MissingSandbox(String),

    #[error(display = "the task graph contains a cycle")]
    Cycle,
}

/// Arena node: a task definition plus graph bookkeeping. The root node
/// carries no definition.
#[derive(Debug)]
pub struct TaskNode {
    pub def: Option<TaskDef>,
    /// Position in the recipe, used as the sort tie break.
    pub order: usize,
    pub children: Vec<usize>,
    pub parents: Vec<usize>,
    pub indegree: usize,
}

impl TaskNode {
    pub fn task_id(&self) -> &str {
        self.def.as_ref().map(|d| d.task_id.as_str()).unwrap_or("")
    }
}

/// Entry of the ready queue; ordered by (priority DESC, recipe order ASC).
#[derive(PartialEq, Eq)]
struct ReadyTask {
    priority: u32,
    order: usize,
    node: usize,
}

impl Ord for ReadyTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.order.cmp(&self.order))
    }
}

impl PartialOrd for ReadyTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The job's task DAG.
#[derive(Debug)]
pub struct TaskGraph {
    nodes: Vec<TaskNode>,
}

/// Index of the synthetic root node.
pub const ROOT: usize = 0;

impl TaskGraph {
    /// Build the graph from a recipe and validate it.
    pub fn build(recipe: &JobRecipe) -> Result<TaskGraph, RecipeError> {
        let mut nodes = vec![TaskNode {
            def: None,
            order: 0,
            children: Vec::new(),
            parents: Vec::new(),
            indegree: 0,
        }];
        let mut index: HashMap<&str, usize> = HashMap::new();

        for (order, def) in recipe.tasks.iter().enumerate() {
            if def.kind == TaskKind::Execute {
                if def.cmd.bin.is_empty() {
                    return Err(RecipeError::MissingCommand(def.task_id.clone()));
                }
                if def.sandbox.is_none() {
                    return Err(RecipeError::MissingSandbox(def.task_id.clone()));
                }
            }
            let node = nodes.len();
            if index.insert(&def.task_id, node).is_some() {
                return Err(RecipeError::DuplicateTask(def.task_id.clone()));
            }
            nodes.push(TaskNode {
                def: Some(def.clone()),
                order: order + 1,
                children: Vec::new(),
                parents: Vec::new(),
                indegree: 0,
            });
        }

        for node in 1..nodes.len() {
            let def = nodes[node].def.as_ref().unwrap();
            let task_id = def.task_id.clone();
            let deps = def.dependencies.clone();
            let parents: Vec<usize> = if deps.is_empty() {
                vec![ROOT]
            } else {
                deps.iter()
                    .map(|dep| {
                        index
                            .get(dep.as_str())
                            .copied()
                            .ok_or_else(|| RecipeError::MissingDependency {
                                task: task_id.clone(),
                                dependency: dep.clone(),
                            })
                    })
                    .collect::<Result<_, _>>()?
            };
            for &parent in &parents {
                nodes[parent].children.push(node);
                nodes[node].indegree += 1;
            }
            nodes[node].parents = parents;
        }

        Ok(TaskGraph { nodes })
    }

    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }

    pub fn node(&self, idx: usize) -> &TaskNode {
        &self.nodes[idx]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Whether any task requires the sandbox.
    pub fn has_sandboxed_tasks(&self) -> bool {
        self.nodes
            .iter()
            .filter_map(|n| n.def.as_ref())
            .any(|d| d.kind == TaskKind::Execute)
    }

    /// Deterministic execution order of all nodes, root first.
    ///
    /// Ready tasks are drained from a priority queue keyed by
    /// (priority DESC, recipe order ASC); a child enters the queue when
    /// its last predecessor leaves it. An incomplete traversal means the
    /// graph has a cycle.
    pub fn topological_order(&self) -> Result<Vec<usize>, RecipeError> {
        let mut indegree: Vec<usize> = self.nodes.iter().map(|n| n.indegree).collect();
        let mut queue = BinaryHeap::new();
        queue.push(ReadyTask {
            priority: u32::MAX,
            order: 0,
            node: ROOT,
        });

        let mut result = Vec::with_capacity(self.nodes.len());
        while let Some(ready) = queue.pop() {
            result.push(ready.node);
            for &child in &self.nodes[ready.node].children {
                indegree[child] -= 1;
                if indegree[child] == 0 {
                    let def = self.nodes[child].def.as_ref().unwrap();
                    queue.push(ReadyTask {
                        priority: def.priority,
                        order: self.nodes[child].order,
                        node: child,
                    });
                }
            }
        }

        if result.len() < self.nodes.len() {
            return Err(RecipeError::Cycle);
        }
        Ok(result)
    }
}
