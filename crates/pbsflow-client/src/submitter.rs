use crate::error::{ClientError, Result};
use crate::logdir::{LogDir, SubmissionRecord};
use crate::script::ScriptGenerator;
use crate::targets::{ResourceManager, SubmitRequest};
use pbsflow_core::config::Config;
use pbsflow_core::model::JobRef;
use pbsflow_core::pipeline::{BatchJob, JobSink};

/// Submits jobs straight to the resource manager, chaining them with
/// native dependency strings.
///
/// Jobs without dependencies are held when `submit_with_hold` is set, and
/// stay held until [`BatchSubmitter::release_all`] runs after the whole
/// DAG is known to the resource manager.
pub struct BatchSubmitter<R: ResourceManager> {
    rm: R,
    scripts: ScriptGenerator,
    hold: bool,
    dependency_type: String,
    held: Vec<JobRef>,
    submitted: usize,
}

impl<R: ResourceManager> BatchSubmitter<R> {
    pub fn new(rm: R, log_dir: LogDir, config: &Config) -> Result<Self> {
        if !rm.submits() {
            log_dir.mark_no_submit()?;
        }
        let scripts = ScriptGenerator::new(log_dir, config.clone(), config.submit.failure_policy);
        Ok(Self {
            rm,
            scripts,
            hold: config.submit.submit_with_hold,
            dependency_type: config.submit.dependency_type.clone(),
            held: Vec::new(),
            submitted: 0,
        })
    }

    pub fn log_dir(&self) -> &LogDir {
        self.scripts.log_dir()
    }

    pub fn held(&self) -> &[JobRef] {
        &self.held
    }

    pub fn submitted_count(&self) -> usize {
        self.submitted
    }

    /// Releases every held job in one resource-manager call.
    pub fn release_all(&mut self) -> Result<()> {
        if self.held.is_empty() {
            return Ok(());
        }
        self.rm.release(&self.held)?;
        tracing::info!("Released {} held job(s)", self.held.len());
        self.held.clear();
        Ok(())
    }
}

impl<R: ResourceManager> JobSink for BatchSubmitter<R> {
    type Error = ClientError;

    fn submit(&mut self, job: &BatchJob) -> Result<JobRef> {
        let script = self.scripts.write(job)?;
        let hold = self.hold && job.depends_on.is_empty();
        let request = SubmitRequest {
            job_name: &job.name,
            script: &script,
            hold,
            depends_on: &job.depends_on,
            dependency_type: &self.dependency_type,
        };
        let job_ref = self.rm.submit(&request)?;
        self.log_dir()
            .append_submission(&SubmissionRecord::new(&job_ref, &job.name, &job.depends_on))?;
        if hold {
            self.held.push(job_ref.clone());
        }
        self.submitted += 1;
        tracing::info!(
            "Submitted '{}' as {} ({} dependenc{}{})",
            job.name,
            job_ref,
            job.depends_on.len(),
            if job.depends_on.len() == 1 { "y" } else { "ies" },
            if hold { ", held" } else { "" }
        );
        Ok(job_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::targets::JobInfo;
    use pbsflow_core::pipeline::JobKind;
    use std::cell::RefCell;
    use std::path::PathBuf;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Recorder {
        calls: RefCell<Vec<String>>,
        next: RefCell<u32>,
    }

    impl ResourceManager for &Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn submit(&self, request: &SubmitRequest<'_>) -> Result<JobRef> {
            *self.next.borrow_mut() += 1;
            let id = format!("{}.srv", self.next.borrow());
            self.calls.borrow_mut().push(format!(
                "submit {} hold={} deps={}",
                request.job_name,
                request.hold,
                request.dependency_string().unwrap_or_default()
            ));
            Ok(JobRef(id))
        }

        fn release(&self, jobs: &[JobRef]) -> Result<()> {
            let ids: Vec<&str> = jobs.iter().map(|j| j.0.as_str()).collect();
            self.calls
                .borrow_mut()
                .push(format!("release {}", ids.join(" ")));
            Ok(())
        }

        fn delete(&self, _job: &JobRef) -> Result<()> {
            Ok(())
        }

        fn query(&self, _job: &JobRef) -> Result<Option<JobInfo>> {
            Ok(None)
        }
    }

    fn cleanup(name: &str, deps: Vec<JobRef>) -> BatchJob {
        BatchJob {
            name: name.into(),
            kind: JobKind::Cleanup { paths: vec![] },
            depends_on: deps,
            workdir: PathBuf::from("/tmp"),
        }
    }

    #[test]
    fn test_roots_held_until_release_all() {
        let dir = tempdir().unwrap();
        let recorder = Recorder::default();
        let mut submitter =
            BatchSubmitter::new(&recorder, LogDir::prepare(&dir.path().join("logs")).unwrap(), &Config::default())
                .unwrap();

        let a = submitter.submit(&cleanup("a", vec![])).unwrap();
        let b = submitter.submit(&cleanup("b", vec![])).unwrap();
        submitter.submit(&cleanup("c", vec![a.clone(), b.clone()])).unwrap();
        assert_eq!(submitter.held(), &[a, b]);

        submitter.release_all().unwrap();
        submitter.release_all().unwrap();
        assert_eq!(
            *recorder.calls.borrow(),
            vec![
                "submit a hold=true deps=".to_string(),
                "submit b hold=true deps=".to_string(),
                "submit c hold=false deps=afterok:1.srv:2.srv".to_string(),
                "release 1.srv 2.srv".to_string(),
            ]
        );
        assert_eq!(submitter.submitted_count(), 3);
        assert!(!submitter.log_dir().is_no_submit());
    }

    #[test]
    fn test_no_hold_policy_submits_roots_released() {
        let dir = tempdir().unwrap();
        let recorder = Recorder::default();
        let mut config = Config::default();
        config.submit.submit_with_hold = false;
        let mut submitter =
            BatchSubmitter::new(&recorder, LogDir::prepare(&dir.path().join("logs")).unwrap(), &config).unwrap();
        submitter.submit(&cleanup("a", vec![])).unwrap();
        assert!(submitter.held().is_empty());
        submitter.release_all().unwrap();
        assert_eq!(recorder.calls.borrow().len(), 1);
    }

    #[test]
    fn test_submission_log_records_every_job() {
        let dir = tempdir().unwrap();
        let recorder = Recorder::default();
        let log_dir = LogDir::prepare(&dir.path().join("logs")).unwrap();
        let mut submitter = BatchSubmitter::new(&recorder, log_dir.clone(), &Config::default()).unwrap();
        let a = submitter.submit(&cleanup("a", vec![])).unwrap();
        submitter.submit(&cleanup("b", vec![a])).unwrap();

        let records = log_dir.read_submissions().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].name, "b");
        assert_eq!(records[1].depends_on, vec!["1"]);
        assert!(log_dir.script_path("b").exists());
    }

    #[test]
    fn test_dry_run_marks_no_submit() {
        let dir = tempdir().unwrap();
        let log_dir = LogDir::prepare(&dir.path().join("logs")).unwrap();
        let mut submitter =
            BatchSubmitter::new(crate::targets::DryRun::new(), log_dir.clone(), &Config::default())
                .unwrap();
        let id = submitter.submit(&cleanup("a", vec![])).unwrap();
        assert_eq!(id.0, "1.dry-run");
        assert!(log_dir.is_no_submit());
    }
}
