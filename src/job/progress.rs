//! Observer interface for job lifecycle events.

/// Receives lifecycle events while a job is evaluated.
///
/// Implementations must be cheap; they are called inline from the
/// evaluation loop.
pub trait Progress: Send + Sync {
    fn submission_downloaded(&self, job_id: &str);
    fn job_started(&self, job_id: &str);
    fn task_completed(&self, job_id: &str, task_id: &str);
    fn task_failed(&self, job_id: &str, task_id: &str);
    fn job_ended(&self, job_id: &str);
    fn job_results_uploaded(&self, job_id: &str);
}

/// Does nothing; handed to the evaluator when nobody listens.
pub struct EmptyProgress;

impl Progress for EmptyProgress {
    fn submission_downloaded(&self, _job_id: &str) {}
    fn job_started(&self, _job_id: &str) {}
    fn task_completed(&self, _job_id: &str, _task_id: &str) {}
    fn task_failed(&self, _job_id: &str, _task_id: &str) {}
    fn job_ended(&self, _job_id: &str) {}
    fn job_results_uploaded(&self, _job_id: &str) {}
}

/// Emits every event into the log.
pub struct LogProgress;

impl Progress for LogProgress {
    fn submission_downloaded(&self, job_id: &str) {
        tracing::info!(%job_id, "submission downloaded");
    }

    fn job_started(&self, job_id: &str) {
        tracing::info!(%job_id, "job started");
    }

    fn task_completed(&self, job_id: &str, task_id: &str) {
        tracing::info!(%job_id, %task_id, "task completed");
    }

    fn task_failed(&self, job_id: &str, task_id: &str) {
        tracing::warn!(%job_id, %task_id, "task failed");
    }

    fn job_ended(&self, job_id: &str) {
        tracing::info!(%job_id, "job ended");
    }

    fn job_results_uploaded(&self, job_id: &str) {
        tracing::info!(%job_id, "job results uploaded");
    }
}
