//! Drives one job end to end: download, unpack, build the task graph,
//! run it, upload the results and clean up.

use super::progress::Progress;
use super::{EvalError, Job, JobResult, JobStatus};
use crate::config::WorkerConfig;
use crate::fileman::FileManager;
use crate::sandbox::IsolateSandbox;
use crate::task::external::OutputLimits;
use crate::task::{JobRecipe, TaskGraph};
use crate::util::{self, archive};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Recipe file expected inside every submission archive.
pub const RECIPE_FILE_NAME: &str = "job-config.yml";

/// Name of the uploaded result bundle.
const RESULT_ARCHIVE_NAME: &str = "result.tar.gz";

/// An `eval` request received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalRequest {
    pub job_id: String,
    pub archive_url: String,
    pub result_url: String,
    /// Routing headers the broker matched on; retained for logging.
    pub headers: Vec<(String, String)>,
}

/// Evaluates jobs; constructed once per process and reused.
pub struct JobEvaluator {
    config: Arc<WorkerConfig>,
    fileman: Arc<dyn FileManager>,
}

impl JobEvaluator {
    pub fn new(config: Arc<WorkerConfig>, fileman: Arc<dyn FileManager>) -> JobEvaluator {
        JobEvaluator { config, fileman }
    }

    /// Evaluate one job. Never fails outward: evaluation errors are
    /// folded into the returned result, and the working directory is
    /// removed on every path unless configured otherwise.
    pub async fn evaluate(&self, request: EvalRequest, progress: &dyn Progress) -> JobResult {
        use tracing::Instrument;

        let span = tracing::info_span!("evaluate", job_id = %request.job_id);
        let job_id = request.job_id.clone();
        async move {
            for (key, value) in &request.headers {
                tracing::debug!("job header {key}={value}");
            }

            let work_dir = self.config.working_directory.join(&job_id);
            let result = match self.evaluate_inner(&request, &work_dir, progress).await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!("job evaluation failed: {e}");
                    JobResult::failure(&job_id, e.to_string())
                }
            };

            if self.config.cleanup_submission {
                if let Err(e) = util::ensure_removed_dir(&work_dir).await {
                    tracing::warn!("cannot remove working directory: {e}");
                }
            } else {
                tracing::info!("keeping working directory {}", work_dir.display());
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn evaluate_inner(
        &self,
        request: &EvalRequest,
        work_dir: &Path,
        progress: &dyn Progress,
    ) -> Result<JobResult, EvalError> {
        let job_id = &request.job_id;

        util::ensure_removed_dir(work_dir).await?;
        tokio::fs::create_dir_all(work_dir).await?;

        // Fetch and unpack the submission bundle.
        let archive_local =
            work_dir.join(archive::archive_name_from_url(&request.archive_url, "submission.tar.gz"));
        self.fileman.get(&request.archive_url, &archive_local).await?;
        progress.submission_downloaded(job_id);

        let source_dir = work_dir.join("submission");
        archive::unpack_tar_gz(&archive_local, &source_dir).await?;
        let recipe_file = find_recipe_file(&source_dir).await.ok_or_else(|| {
            EvalError::Other(format!("submission contains no {RECIPE_FILE_NAME}"))
        })?;
        let source_dir = recipe_file.parent().unwrap_or(&source_dir).to_owned();

        // Build the task graph.
        let recipe_text = tokio::fs::read_to_string(&recipe_file).await?;
        let recipe = JobRecipe::from_yaml(&recipe_text)?;
        let graph = TaskGraph::build(&recipe)?;

        let results_dir = work_dir.join("results");
        tokio::fs::create_dir_all(&results_dir).await?;
        let mut job = Job::build(job_id.clone(), graph, source_dir, results_dir.clone())?;
        progress.job_started(job_id);

        // The sandbox slot is claimed only when the job needs it.
        let mut sandbox = if job.has_sandboxed_tasks() {
            Some(
                IsolateSandbox::new(
                    self.config.worker_id,
                    &self.config.isolate_binary,
                    &self.config.working_directory.join("sandboxes"),
                )
                .await?,
            )
        } else {
            None
        };

        let caps = OutputLimits {
            max_output_length: self.config.max_output_length,
            max_carboncopy_length: self.config.max_carboncopy_length,
        };
        let outcomes = job
            .run(sandbox.as_mut(), &self.config.limits, caps, progress)
            .await;
        if let Some(sandbox) = sandbox.take() {
            sandbox.close().await;
        }
        progress.job_ended(job_id);

        let result = JobResult {
            job_id: job_id.clone(),
            status: JobStatus::Ok,
            message: None,
            tasks: outcomes,
        };

        // Bundle and upload the results.
        let results_yaml =
            serde_yaml::to_string(&result).map_err(|e| EvalError::Other(e.to_string()))?;
        tokio::fs::write(results_dir.join("results.yml"), results_yaml).await?;
        let result_archive = work_dir.join(RESULT_ARCHIVE_NAME);
        archive::pack_tar_gz(&results_dir, &result_archive).await?;
        self.fileman.put(&result_archive, &request.result_url).await?;
        progress.job_results_uploaded(job_id);

        Ok(result)
    }
}

/// Locate the recipe file: at the submission root or one directory below
/// it (archives often wrap their content in a single folder).
async fn find_recipe_file(root: &Path) -> Option<PathBuf> {
    let direct = root.join(RECIPE_FILE_NAME);
    if direct.exists() {
        return Some(direct);
    }
    let mut entries = tokio::fs::read_dir(root).await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_type().await.ok()?.is_dir() {
            let nested = entry.path().join(RECIPE_FILE_NAME);
            if nested.exists() {
                return Some(nested);
            }
        }
    }
    None
}
