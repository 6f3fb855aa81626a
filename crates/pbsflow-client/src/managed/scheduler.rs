use super::store::{JobRecord, ManagedStore};
use crate::error::Result;
use crate::logdir::{LogDir, SubmissionRecord};
use crate::targets::{QueueState, ResourceManager, SubmitRequest};
use pbsflow_core::config::{FailurePolicy, ManagedConfig};
use pbsflow_core::engine::PipelineStatus;
use pbsflow_core::status::{JobOutcome, StatusFile};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub submitted: usize,
    pub completed: usize,
    pub failed: usize,
    pub short_circuited: usize,
}

/// Polling loop that feeds eligible jobs from the store to the resource
/// manager, never keeping more than `max_queued` of them in flight.
pub struct ManagedScheduler<'s, R: ResourceManager> {
    store: &'s ManagedStore,
    rm: R,
    max_queued: usize,
    poll_interval: Duration,
    policy: FailurePolicy,
}

impl<'s, R: ResourceManager> ManagedScheduler<'s, R> {
    pub fn new(store: &'s ManagedStore, rm: R, config: &ManagedConfig) -> Self {
        Self {
            store,
            rm,
            max_queued: config.max_queued,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            policy: config.failure_policy,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn submit_eligible(&self, summary: &mut PollSummary) -> Result<()> {
        let headroom = self
            .max_queued
            .saturating_sub(self.store.submitted_count()?);
        for job in self.store.eligible_jobs(headroom)? {
            let request = SubmitRequest {
                job_name: &job.name,
                script: &job.script,
                hold: false,
                depends_on: &[],
                dependency_type: "",
            };
            let log_dir = self.pipeline_log_dir(&job)?;
            if let Some(pipeline) = &log_dir {
                // Left over from an earlier run of the same job name.
                match fs_err::remove_file(pipeline.status_path(&job.name)) {
                    Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                    _ => {}
                }
            }
            let batch_id = self.rm.submit(&request)?;
            self.store.mark_submitted(job.key, &batch_id)?;
            if let Some(pipeline) = log_dir {
                pipeline.append_submission(&SubmissionRecord::new(&batch_id, &job.name, &[]))?;
            }
            tracing::info!("Submitted '{}' as {}", job.name, batch_id);
            summary.submitted += 1;
        }
        Ok(())
    }

    fn pipeline_log_dir(&self, job: &JobRecord) -> Result<Option<LogDir>> {
        Ok(self
            .store
            .pipelines()?
            .into_iter()
            .find(|p| p.key == job.pipeline)
            .map(|p| LogDir::open(&p.log_dir)))
    }

    /// The status file when the epilogue wrote one, otherwise what the
    /// resource manager reports for a finished job.
    fn outcome_of(&self, job: &JobRecord) -> Result<Option<JobOutcome>> {
        let Some(log_dir) = self.pipeline_log_dir(job)? else {
            return Ok(None);
        };
        if let Some(status) = StatusFile::read(log_dir.root(), &job.name)? {
            if status.exit_status.is_some() {
                return Ok(Some(status.outcome()));
            }
        }
        let Some(batch_id) = &job.batch_id else {
            return Ok(None);
        };
        match self.rm.query(batch_id)? {
            Some(info) if info.state == QueueState::Complete => {
                Ok(info.exit_status.map(JobOutcome::from_exit_status))
            }
            _ => Ok(None),
        }
    }

    fn collect_finished(&self, summary: &mut PollSummary) -> Result<()> {
        for job in self.store.submitted_jobs()? {
            let Some(outcome) = self.outcome_of(&job)? else {
                continue;
            };
            if outcome.is_success() {
                self.store.complete_job(job.key)?;
                tracing::info!("'{}' completed", job.name);
                summary.completed += 1;
            } else {
                let policy = if outcome.aborts_pipeline() {
                    FailurePolicy::AbortPipeline
                } else {
                    self.policy
                };
                let skipped = self.store.fail_job(job.key, policy)?;
                tracing::warn!(
                    "'{}' failed: {}; {} waiting job(s) will not run",
                    job.name,
                    outcome,
                    skipped.len()
                );
                summary.failed += 1;
                summary.short_circuited += skipped.len();
            }
        }
        Ok(())
    }

    /// One pass: submit what is eligible, collect what finished, then
    /// refresh every pipeline's aggregate status.
    pub fn poll_once(&self) -> Result<PollSummary> {
        let mut summary = PollSummary::default();
        self.submit_eligible(&mut summary)?;
        self.collect_finished(&mut summary)?;
        self.store.refresh_pipeline_statuses()?;
        tracing::debug!("Poll finished: {:?}", summary);
        Ok(summary)
    }

    /// Polls until no job is waiting or in flight, or until `stop` is set.
    /// Marks the store started, after which no pipeline can be added.
    pub fn run(&self, stop: &AtomicBool) -> Result<Vec<(String, PipelineStatus)>> {
        self.store.mark_started()?;
        tracing::info!(
            "Managing {} (max {} queued, polling every {:?})",
            self.store.path().display(),
            self.max_queued,
            self.poll_interval
        );
        loop {
            self.poll_once()?;
            if self.store.active_job_count()? == 0 {
                break;
            }
            if self.sleep_or_stop(stop) {
                tracing::info!("Stop requested; the store can be resumed later");
                break;
            }
        }
        Ok(self
            .store
            .refresh_pipeline_statuses()?
            .into_iter()
            .map(|p| (p.name, p.status))
            .collect())
    }

    fn sleep_or_stop(&self, stop: &AtomicBool) -> bool {
        let deadline = Instant::now() + self.poll_interval;
        loop {
            if stop.load(Ordering::SeqCst) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(STOP_CHECK_INTERVAL.min(deadline - now));
        }
    }
}

/// Removes a pipeline's in-flight jobs from the queue and marks it deleted.
pub fn delete_pipeline<R: ResourceManager>(
    store: &ManagedStore,
    rm: &R,
    name: &str,
) -> Result<usize> {
    let in_flight = store.delete_pipeline(name)?;
    for job in &in_flight {
        if let Some(batch_id) = &job.batch_id {
            rm.delete(batch_id)?;
            tracing::info!("Deleted '{}' ({})", job.name, batch_id);
        }
    }
    Ok(in_flight.len())
}
