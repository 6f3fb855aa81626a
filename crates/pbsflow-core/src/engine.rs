use crate::config::FailurePolicy;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

pub type JobKey = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ManagedJobStatus {
    NotSet,
    NotSubmitted,
    Eligible,
    Submitted,
    Complete,
    Failed,
    Deleted,
    PipelineFailure,
}

impl ManagedJobStatus {
    pub const ALL: [ManagedJobStatus; 8] = [
        ManagedJobStatus::NotSet,
        ManagedJobStatus::NotSubmitted,
        ManagedJobStatus::Eligible,
        ManagedJobStatus::Submitted,
        ManagedJobStatus::Complete,
        ManagedJobStatus::Failed,
        ManagedJobStatus::Deleted,
        ManagedJobStatus::PipelineFailure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ManagedJobStatus::NotSet => "NotSet",
            ManagedJobStatus::NotSubmitted => "NotSubmitted",
            ManagedJobStatus::Eligible => "Eligible",
            ManagedJobStatus::Submitted => "Submitted",
            ManagedJobStatus::Complete => "Complete",
            ManagedJobStatus::Failed => "Failed",
            ManagedJobStatus::Deleted => "Deleted",
            ManagedJobStatus::PipelineFailure => "PipelineFailure",
        }
    }

    /// Statuses a job never leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ManagedJobStatus::Complete
                | ManagedJobStatus::Failed
                | ManagedJobStatus::Deleted
                | ManagedJobStatus::PipelineFailure
        )
    }

    /// Not yet handed to the resource manager.
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            ManagedJobStatus::NotSet | ManagedJobStatus::NotSubmitted | ManagedJobStatus::Eligible
        )
    }
}

impl fmt::Display for ManagedJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseStatusError(pub String);

impl fmt::Display for ParseStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown status '{}'", self.0)
    }
}

impl std::error::Error for ParseStatusError {}

impl FromStr for ManagedJobStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineStatus {
    NotSubmitted,
    Submitted,
    Complete,
    Failed,
    Deleted,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::NotSubmitted => "NotSubmitted",
            PipelineStatus::Submitted => "Submitted",
            PipelineStatus::Complete => "Complete",
            PipelineStatus::Failed => "Failed",
            PipelineStatus::Deleted => "Deleted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineStatus::Complete | PipelineStatus::Failed | PipelineStatus::Deleted
        )
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NotSubmitted" => Ok(PipelineStatus::NotSubmitted),
            "Submitted" => Ok(PipelineStatus::Submitted),
            "Complete" => Ok(PipelineStatus::Complete),
            "Failed" => Ok(PipelineStatus::Failed),
            "Deleted" => Ok(PipelineStatus::Deleted),
            _ => Err(ParseStatusError(s.to_string())),
        }
    }
}

/// Aggregate status of a pipeline from the statuses of its jobs.
/// A deleted pipeline stays deleted.
pub fn aggregate_pipeline_status(
    current: PipelineStatus,
    jobs: &[ManagedJobStatus],
) -> PipelineStatus {
    if current == PipelineStatus::Deleted {
        return current;
    }

    let mut has_failed = false;
    let mut has_started = false;
    let mut complete_count = 0;

    for status in jobs {
        match status {
            ManagedJobStatus::Failed => has_failed = true,
            ManagedJobStatus::Complete => {
                complete_count += 1;
                has_started = true;
            }
            ManagedJobStatus::Submitted
            | ManagedJobStatus::PipelineFailure
            | ManagedJobStatus::Deleted => has_started = true,
            ManagedJobStatus::NotSet
            | ManagedJobStatus::NotSubmitted
            | ManagedJobStatus::Eligible => {}
        }
    }

    if has_failed {
        PipelineStatus::Failed
    } else if complete_count == jobs.len() && !jobs.is_empty() {
        PipelineStatus::Complete
    } else if has_started {
        PipelineStatus::Submitted
    } else {
        PipelineStatus::NotSubmitted
    }
}

/// Every job that depends on `failed`, directly or transitively.
/// `edges` are `(job, depends_on)` pairs.
pub fn transitive_dependents(failed: JobKey, edges: &[(JobKey, JobKey)]) -> HashSet<JobKey> {
    let mut dependents: HashMap<JobKey, Vec<JobKey>> = HashMap::new();
    for (job, dep) in edges {
        dependents.entry(*dep).or_default().push(*job);
    }

    let mut stack = vec![failed];
    let mut visited = HashSet::new();
    while let Some(current) = stack.pop() {
        if let Some(children) = dependents.get(&current) {
            for child in children {
                if visited.insert(*child) {
                    stack.push(*child);
                }
            }
        }
    }
    visited.remove(&failed);
    visited
}

/// Jobs of one pipeline that must be short-circuited to `PipelineFailure`
/// after `failed` reports failure.
pub fn pipeline_failure_targets(
    policy: FailurePolicy,
    failed: JobKey,
    jobs: &[(JobKey, ManagedJobStatus)],
    edges: &[(JobKey, JobKey)],
) -> Vec<JobKey> {
    let waiting = jobs
        .iter()
        .filter(|(key, status)| *key != failed && status.is_waiting());
    match policy {
        FailurePolicy::AbortPipeline => waiting.map(|(key, _)| *key).collect(),
        FailurePolicy::Branch => {
            let downstream = transitive_dependents(failed, edges);
            waiting
                .filter(|(key, _)| downstream.contains(key))
                .map(|(key, _)| *key)
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ManagedJobStatus::*;

    #[test]
    fn test_status_round_trip_names() {
        for status in ManagedJobStatus::ALL {
            assert_eq!(status.as_str().parse::<ManagedJobStatus>().unwrap(), status);
        }
        assert!("Running".parse::<ManagedJobStatus>().is_err());
    }

    #[test]
    fn test_all_complete_is_complete() {
        assert_eq!(
            aggregate_pipeline_status(PipelineStatus::Submitted, &[Complete, Complete]),
            PipelineStatus::Complete
        );
    }

    #[test]
    fn test_any_failed_is_failed() {
        assert_eq!(
            aggregate_pipeline_status(
                PipelineStatus::Submitted,
                &[Complete, Failed, PipelineFailure]
            ),
            PipelineStatus::Failed
        );
    }

    #[test]
    fn test_partial_progress_is_submitted() {
        assert_eq!(
            aggregate_pipeline_status(PipelineStatus::NotSubmitted, &[Complete, NotSubmitted]),
            PipelineStatus::Submitted
        );
        assert_eq!(
            aggregate_pipeline_status(PipelineStatus::NotSubmitted, &[NotSubmitted, NotSubmitted]),
            PipelineStatus::NotSubmitted
        );
    }

    #[test]
    fn test_deleted_is_sticky() {
        assert_eq!(
            aggregate_pipeline_status(PipelineStatus::Deleted, &[Complete]),
            PipelineStatus::Deleted
        );
    }

    #[test]
    fn test_empty_pipeline_is_not_complete() {
        assert_eq!(
            aggregate_pipeline_status(PipelineStatus::NotSubmitted, &[]),
            PipelineStatus::NotSubmitted
        );
    }

    #[test]
    fn test_transitive_dependents_diamond() {
        // 1 <- 2, 1 <- 3, 2 <- 4, 3 <- 4, 5 independent
        let edges = vec![(2, 1), (3, 1), (4, 2), (4, 3), (6, 5)];
        let downstream = transitive_dependents(1, &edges);
        assert_eq!(downstream, [2, 3, 4].into_iter().collect());
        assert!(transitive_dependents(4, &edges).is_empty());
    }

    #[test]
    fn test_failure_targets_by_policy() {
        let jobs = vec![
            (1, Failed),
            (2, NotSubmitted),
            (3, NotSubmitted),
            (4, Submitted),
            (5, Complete),
        ];
        let edges = vec![(2, 1)];

        let mut abort = pipeline_failure_targets(FailurePolicy::AbortPipeline, 1, &jobs, &edges);
        abort.sort();
        assert_eq!(abort, vec![2, 3]);

        let branch = pipeline_failure_targets(FailurePolicy::Branch, 1, &jobs, &edges);
        assert_eq!(branch, vec![2]);
    }
}
