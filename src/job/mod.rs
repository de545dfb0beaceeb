//! One job: the built task graph and its sequential execution.

pub mod evaluator;
pub mod progress;

pub use evaluator::{EvalRequest, JobEvaluator};
pub use progress::{EmptyProgress, LogProgress, Progress};

use crate::sandbox::IsolateSandbox;
use crate::task::external::{self, OutputLimits};
use crate::task::graph::ROOT;
use crate::task::{internal, TaskGraph, TaskOutcome, TaskStatus};
use err_derive::Error;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

#[derive(Debug, Error)]
pub enum EvalError {
    #[error(display = "IO error: {}", _0)]
    Io(#[error(source)] std::io::Error),

    #[error(display = "malformed recipe: {}", _0)]
    Config(#[error(source)] serde_yaml::Error),

    #[error(display = "recipe error: {}", _0)]
    Recipe(#[error(source)] crate::task::RecipeError),

    #[error(display = "file manager error: {}", _0)]
    FileMan(#[error(source)] crate::fileman::FileManError),

    #[error(display = "sandbox error: {}", _0)]
    Sandbox(#[error(source)] crate::sandbox::SandboxError),

    #[error(display = "{}", _0)]
    Other(String),
}

/// Compact job status reported back to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// All tasks finished; individual tasks may still have failed.
    Ok,
    /// The job could not be evaluated at all.
    InternalFailure,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            JobStatus::Ok => "OK",
            JobStatus::InternalFailure => "INTERNAL_FAILURE",
        })
    }
}

/// Result of one evaluated job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub tasks: Vec<TaskOutcome>,
}

impl JobResult {
    pub fn failure(job_id: &str, message: String) -> JobResult {
        JobResult {
            job_id: job_id.to_owned(),
            status: JobStatus::InternalFailure,
            message: Some(message),
            tasks: Vec::new(),
        }
    }
}

/// A built job ready to run.
pub struct Job {
    pub job_id: String,
    graph: TaskGraph,
    order: Vec<usize>,
    /// Directory holding the unpacked submission sources.
    work_dir: PathBuf,
    /// Directory collecting result artifacts for upload.
    results_dir: PathBuf,
}

impl Job {
    /// Validate the graph and fix the execution order up front.
    pub fn build(
        job_id: String,
        graph: TaskGraph,
        work_dir: PathBuf,
        results_dir: PathBuf,
    ) -> Result<Job, EvalError> {
        let order = graph.topological_order()?;
        Ok(Job {
            job_id,
            graph,
            order,
            work_dir,
            results_dir,
        })
    }

    pub fn has_sandboxed_tasks(&self) -> bool {
        self.graph.has_sandboxed_tasks()
    }

    /// Run all tasks in topological order.
    ///
    /// A fatal task failure poisons every transitive dependent: those
    /// tasks are recorded as skipped without running. Non-fatal failures
    /// let dependents proceed.
    pub async fn run(
        &mut self,
        mut sandbox: Option<&mut IsolateSandbox>,
        defaults: &crate::sandbox::SandboxLimits,
        caps: OutputLimits,
        progress: &dyn Progress,
    ) -> Vec<TaskOutcome> {
        let mut outcomes = Vec::with_capacity(self.order.len().saturating_sub(1));
        let mut poisoned: HashSet<usize> = HashSet::new();

        for &node_idx in &self.order {
            if node_idx == ROOT {
                continue;
            }
            let node = self.graph.node(node_idx);
            let def = node.def.as_ref().unwrap().clone();

            if node.parents.iter().any(|p| poisoned.contains(p)) {
                tracing::debug!(job_id = %self.job_id, task_id = %def.task_id, "task skipped");
                poisoned.insert(node_idx);
                outcomes.push(TaskOutcome::skipped(&def.task_id));
                continue;
            }

            let outcome = if def.kind.is_internal() {
                match internal::run_internal(&def, &self.work_dir).await {
                    Ok(()) => TaskOutcome::ok(&def.task_id),
                    Err(e) => TaskOutcome::failed(&def.task_id, format!("{e:#}")),
                }
            } else {
                match sandbox.as_deref_mut() {
                    Some(sandbox) => {
                        match external::run_external(
                            &def,
                            defaults,
                            sandbox,
                            &self.work_dir,
                            &self.results_dir,
                            caps,
                        )
                        .await
                        {
                            Ok(out) => {
                                let failed = out.result.status
                                    != crate::sandbox::SandboxStatus::Ok;
                                TaskOutcome {
                                    task_id: def.task_id.clone(),
                                    status: if failed {
                                        TaskStatus::Failed
                                    } else {
                                        TaskStatus::Ok
                                    },
                                    sandbox: Some(out.result),
                                    output: out.output,
                                    error: None,
                                }
                            }
                            Err(e) => TaskOutcome::failed(&def.task_id, e.to_string()),
                        }
                    }
                    None => TaskOutcome::failed(
                        &def.task_id,
                        "no sandbox slot available for this task".into(),
                    ),
                }
            };

            match outcome.status {
                TaskStatus::Ok => progress.task_completed(&self.job_id, &def.task_id),
                _ => progress.task_failed(&self.job_id, &def.task_id),
            }
            if outcome.status == TaskStatus::Failed && def.fatal_failure {
                poisoned.insert(node_idx);
            }
            outcomes.push(outcome);
        }
        outcomes
    }
}

/// Executor side of the worker: receives `eval` envelopes from the
/// broker loop, evaluates them one at a time, and answers with `done`
/// envelopes.
pub async fn executor_loop(
    mut eval_rx: tokio::sync::mpsc::Receiver<Vec<String>>,
    done_tx: tokio::sync::mpsc::Sender<Vec<String>>,
    evaluator: JobEvaluator,
    progress: impl Progress,
) {
    while let Some(frames) = eval_rx.recv().await {
        let request = match crate::broker::parse_eval(&frames) {
            Ok(request) => request,
            Err(e) => {
                tracing::error!("dropping unusable eval envelope: {e}");
                continue;
            }
        };
        let job_id = request.job_id.clone();
        let result = evaluator.evaluate(request, &progress).await;

        let mut done = vec!["done".to_owned(), job_id, result.status.to_string()];
        if let Some(message) = &result.message {
            done.push(message.clone());
        }
        if done_tx.send(done).await.is_err() {
            tracing::warn!("broker loop is gone, stopping the executor");
            break;
        }
    }
}
