use crate::error::Result;
use pbsflow_core::model::JobRef;
use pbsflow_core::status::Walltime;
use std::fmt;
use std::path::Path;

pub mod dry_run;
pub mod pbs;

pub use dry_run::DryRun;
pub use pbs::PbsCli;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Held,
    Queued,
    Running,
    Exiting,
    Complete,
    Unknown,
}

impl QueueState {
    pub fn from_code(code: &str) -> Self {
        match code.trim() {
            "H" => QueueState::Held,
            "Q" | "W" | "T" => QueueState::Queued,
            "R" => QueueState::Running,
            "E" => QueueState::Exiting,
            "C" | "F" => QueueState::Complete,
            _ => QueueState::Unknown,
        }
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueueState::Held => "Held",
            QueueState::Queued => "Queued",
            QueueState::Running => "Running",
            QueueState::Exiting => "Exiting",
            QueueState::Complete => "Complete",
            QueueState::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// What the resource manager reports about one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    pub state: QueueState,
    pub exit_status: Option<i32>,
    pub walltime: Option<Walltime>,
    pub requested_walltime: Option<Walltime>,
}

#[derive(Debug, Clone)]
pub struct SubmitRequest<'a> {
    pub job_name: &'a str,
    pub script: &'a Path,
    pub hold: bool,
    pub depends_on: &'a [JobRef],
    pub dependency_type: &'a str,
}

impl SubmitRequest<'_> {
    /// `afterok:12.srv:13.srv`, or `None` without dependencies.
    pub fn dependency_string(&self) -> Option<String> {
        if self.depends_on.is_empty() {
            return None;
        }
        let ids: Vec<&str> = self.depends_on.iter().map(|j| j.0.as_str()).collect();
        Some(format!("{}:{}", self.dependency_type, ids.join(":")))
    }
}

pub trait ResourceManager {
    fn name(&self) -> &str;

    /// Whether jobs really reach a cluster.
    fn submits(&self) -> bool {
        true
    }

    fn submit(&self, request: &SubmitRequest<'_>) -> Result<JobRef>;

    /// Releases every held job in one call.
    fn release(&self, jobs: &[JobRef]) -> Result<()>;

    /// Best effort: jobs that are unknown or already finished count as deleted.
    fn delete(&self, job: &JobRef) -> Result<()>;

    /// `None` once the resource manager no longer knows the job.
    fn query(&self, job: &JobRef) -> Result<Option<JobInfo>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_state_codes() {
        assert_eq!(QueueState::from_code("H"), QueueState::Held);
        assert_eq!(QueueState::from_code("W"), QueueState::Queued);
        assert_eq!(QueueState::from_code("C"), QueueState::Complete);
        assert_eq!(QueueState::from_code("?"), QueueState::Unknown);
    }

    #[test]
    fn test_dependency_string() {
        let deps = vec![JobRef("1.srv".into()), JobRef("2.srv".into())];
        let request = SubmitRequest {
            job_name: "j",
            script: Path::new("/x.sh"),
            hold: false,
            depends_on: &deps,
            dependency_type: "afterok",
        };
        assert_eq!(
            request.dependency_string(),
            Some("afterok:1.srv:2.srv".to_string())
        );
        let none = SubmitRequest {
            depends_on: &[],
            ..request
        };
        assert_eq!(none.dependency_string(), None);
    }
}
