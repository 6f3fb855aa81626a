use crate::error::Result;
use crate::logdir::LogDir;
use crate::targets::ResourceManager;
use pbsflow_core::status::StatusFile;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CancelSummary {
    pub cancelled: usize,
    pub already_finished: usize,
    pub errors: usize,
}

/// Deletes every job in the submission log that has not finished and
/// records it in the cancel log. Failures are logged and skipped.
pub fn cancel_all<R: ResourceManager>(log_dir: &LogDir, rm: &R) -> Result<CancelSummary> {
    let mut summary = CancelSummary::default();
    if log_dir.is_no_submit() {
        tracing::info!("{} was never submitted", log_dir.root().display());
        return Ok(summary);
    }
    let already = log_dir.cancelled()?;

    for record in log_dir.read_submissions()? {
        if already.contains(&record.job_ref.0) {
            continue;
        }
        let finished = StatusFile::read(log_dir.root(), &record.name)?
            .is_some_and(|s| s.exit_status.is_some());
        if finished {
            summary.already_finished += 1;
            continue;
        }
        match rm.delete(&record.job_ref) {
            Ok(()) => {
                log_dir.append_cancel(&record.job_ref)?;
                tracing::info!("Cancelled '{}' ({})", record.name, record.job_ref);
                summary.cancelled += 1;
            }
            Err(e) => {
                tracing::warn!("Could not cancel '{}' ({}): {}", record.name, record.job_ref, e);
                summary.errors += 1;
            }
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use crate::logdir::SubmissionRecord;
    use crate::targets::{JobInfo, SubmitRequest};
    use pbsflow_core::model::JobRef;
    use std::cell::RefCell;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Deleter {
        deleted: RefCell<Vec<String>>,
    }

    impl ResourceManager for Deleter {
        fn name(&self) -> &str {
            "deleter"
        }

        fn submit(&self, _request: &SubmitRequest<'_>) -> Result<JobRef> {
            unreachable!()
        }

        fn release(&self, _jobs: &[JobRef]) -> Result<()> {
            Ok(())
        }

        fn delete(&self, job: &JobRef) -> Result<()> {
            if job.0 == "3.srv" {
                return Err(ClientError::CommandFailed {
                    program: "qdel".into(),
                    code: 1,
                    stderr: "Permission denied".into(),
                });
            }
            self.deleted.borrow_mut().push(job.0.clone());
            Ok(())
        }

        fn query(&self, _job: &JobRef) -> Result<Option<JobInfo>> {
            Ok(None)
        }
    }

    #[test]
    fn test_cancel_skips_finished_and_records_cancelled() {
        let dir = tempdir().unwrap();
        let log_dir = LogDir::open(dir.path());
        for (id, name) in [("1.srv", "done"), ("2.srv", "waiting"), ("3.srv", "stuck")] {
            log_dir
                .append_submission(&SubmissionRecord::new(&JobRef(id.into()), name, &[]))
                .unwrap();
        }
        fs_err::write(log_dir.status_path("done"), "exit_status=0\n").unwrap();

        let rm = Deleter::default();
        let summary = cancel_all(&log_dir, &rm).unwrap();
        assert_eq!(
            summary,
            CancelSummary {
                cancelled: 1,
                already_finished: 1,
                errors: 1
            }
        );
        assert_eq!(*rm.deleted.borrow(), vec!["2.srv"]);
        let cancelled = log_dir.cancelled().unwrap();
        assert!(cancelled.contains("2.srv"));
        assert!(!cancelled.contains("3.srv"));

        let again = cancel_all(&log_dir, &rm).unwrap();
        assert_eq!(again.cancelled, 0);
    }

    #[test]
    fn test_no_submit_directory_is_left_alone() {
        let dir = tempdir().unwrap();
        let log_dir = LogDir::open(dir.path());
        log_dir
            .append_submission(&SubmissionRecord::new(&JobRef("1.dry-run".into()), "a", &[]))
            .unwrap();
        log_dir.mark_no_submit().unwrap();
        let rm = Deleter::default();
        assert_eq!(cancel_all(&log_dir, &rm).unwrap(), CancelSummary::default());
        assert!(rm.deleted.borrow().is_empty());
    }
}
