//! Task model of a job: the declarative recipe, the dependency graph and
//! the runners for internal and sandboxed tasks.

pub mod external;
pub mod graph;
pub mod internal;

pub use graph::{RecipeError, TaskGraph};

use crate::sandbox::{LimitsOverride, SandboxResult};
use serde::{Deserialize, Serialize};

/// Kind of a task in a job recipe.
///
/// Internal kinds are trusted in-process file operations; `Execute` runs
/// an untrusted command inside the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    Copy,
    Mkdir,
    Rename,
    Remove,
    Archive,
    Extract,
    Execute,
}

impl TaskKind {
    pub fn is_internal(self) -> bool {
        self != TaskKind::Execute
    }
}

/// Command of a task: the binary (sandboxed tasks only) plus arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    #[serde(default)]
    pub bin: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// One task definition from a job recipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TaskDef {
    pub task_id: String,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    #[serde(default)]
    pub cmd: CommandSpec,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Higher priority tasks run earlier among ready tasks.
    #[serde(default)]
    pub priority: u32,
    /// A failure of this task aborts all dependent tasks.
    #[serde(default)]
    pub fatal_failure: bool,
    /// Sandbox limits; required for `execute` tasks.
    #[serde(default)]
    pub sandbox: Option<LimitsOverride>,
}

/// A whole job recipe: the ordered task list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JobRecipe {
    pub tasks: Vec<TaskDef>,
}

impl JobRecipe {
    pub fn from_yaml(content: &str) -> Result<JobRecipe, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }
}

/// Status of one executed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Ok,
    Failed,
    Skipped,
}

/// Result record of one task, shipped with the job result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub status: TaskStatus,
    /// Sandbox measurements, for sandboxed tasks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxResult>,
    /// Captured stdout/stderr prefix, bounded by the configured output
    /// length.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    /// Failure cause, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskOutcome {
    pub fn ok(task_id: &str) -> TaskOutcome {
        TaskOutcome {
            task_id: task_id.to_owned(),
            status: TaskStatus::Ok,
            sandbox: None,
            output: String::new(),
            error: None,
        }
    }

    pub fn failed(task_id: &str, error: String) -> TaskOutcome {
        TaskOutcome {
            task_id: task_id.to_owned(),
            status: TaskStatus::Failed,
            sandbox: None,
            output: String::new(),
            error: Some(error),
        }
    }

    pub fn skipped(task_id: &str) -> TaskOutcome {
        TaskOutcome {
            task_id: task_id.to_owned(),
            status: TaskStatus::Skipped,
            sandbox: None,
            output: String::new(),
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn recipe_from_yaml() {
        let yaml = r#"
tasks:
  - task-id: fetch
    type: copy
    cmd:
      args: [input.txt, work/input.txt]
    priority: 2
  - task-id: run
    type: execute
    cmd:
      bin: /usr/bin/solution
      args: [--fast]
    dependencies: [fetch]
    fatal-failure: true
    sandbox:
      time: 2
      memory: 65536
      stdout: out.txt
"#;
        let recipe = JobRecipe::from_yaml(yaml).unwrap();
        assert_eq!(recipe.tasks.len(), 2);

        let fetch = &recipe.tasks[0];
        assert_eq!(fetch.task_id, "fetch");
        assert_eq!(fetch.kind, TaskKind::Copy);
        assert!(fetch.kind.is_internal());
        assert_eq!(fetch.cmd.args, vec!["input.txt", "work/input.txt"]);
        assert_eq!(fetch.priority, 2);
        assert!(!fetch.fatal_failure);

        let run = &recipe.tasks[1];
        assert_eq!(run.kind, TaskKind::Execute);
        assert!(!run.kind.is_internal());
        assert_eq!(run.dependencies, vec!["fetch"]);
        assert!(run.fatal_failure);
        let sandbox = run.sandbox.as_ref().unwrap();
        assert_eq!(sandbox.cpu_time, Some(2.0));
        assert_eq!(sandbox.memory_usage, Some(65536));
        assert_eq!(sandbox.stdout.as_deref(), Some("out.txt"));
    }

    #[test]
    fn malformed_recipe_is_an_error() {
        assert!(JobRecipe::from_yaml("tasks: notalist").is_err());
        assert!(JobRecipe::from_yaml("tasks:\n  - type: copy\n").is_err());
    }
}
