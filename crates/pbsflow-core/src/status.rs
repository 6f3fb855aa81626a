use crate::constants::{exit_codes, logs, status_keys};
use crate::errors::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Walltime {
    Seconds(u64),
    Unlimited,
}

impl Walltime {
    /// Parses `[[D:]H:]M:S` or `unlimited`.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case(status_keys::UNLIMITED) {
            return Some(Walltime::Unlimited);
        }
        let parts: Vec<u64> = raw
            .split(':')
            .map(|p| p.trim().parse::<u64>())
            .collect::<std::result::Result<_, _>>()
            .ok()?;
        let seconds = match parts.as_slice() {
            [s] => *s,
            [m, s] => m * 60 + s,
            [h, m, s] => h * 3600 + m * 60 + s,
            [d, h, m, s] => d * 86400 + h * 3600 + m * 60 + s,
            _ => return None,
        };
        Some(Walltime::Seconds(seconds))
    }

    pub fn seconds(&self) -> Option<u64> {
        match self {
            Walltime::Seconds(s) => Some(*s),
            Walltime::Unlimited => None,
        }
    }
}

impl fmt::Display for Walltime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Walltime::Unlimited => write!(f, "{}", status_keys::UNLIMITED),
            Walltime::Seconds(total) => {
                let days = total / 86400;
                let hours = (total % 86400) / 3600;
                let minutes = (total % 3600) / 60;
                let seconds = total % 60;
                if days > 0 {
                    write!(f, "{}:{:02}:{:02}:{:02}", days, hours, minutes, seconds)
                } else {
                    write!(f, "{:02}:{:02}:{:02}", hours, minutes, seconds)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOutcome {
    Success,
    Failed { exit_status: i32 },
    WalltimeExceeded,
    ResourceManagerFailure { exit_status: i32 },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Success)
    }

    /// Failed validation and version commands stop the whole pipeline
    /// regardless of the configured failure policy.
    pub fn aborts_pipeline(&self) -> bool {
        matches!(
            self,
            JobOutcome::Failed {
                exit_status: exit_codes::VALIDATION_FAILED | exit_codes::VERSION_FAILED
            }
        )
    }

    pub fn from_exit_status(exit_status: i32) -> Self {
        match exit_status {
            0 => JobOutcome::Success,
            exit_codes::WALLTIME_EXCEEDED => JobOutcome::WalltimeExceeded,
            s if s < 0 => JobOutcome::ResourceManagerFailure { exit_status: s },
            s => JobOutcome::Failed { exit_status: s },
        }
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Success => write!(f, "completed successfully"),
            JobOutcome::Failed { exit_status } => {
                write!(f, "failed with exit status {}", exit_status)
            }
            JobOutcome::WalltimeExceeded => write!(f, "walltime limit exceeded"),
            JobOutcome::ResourceManagerFailure { exit_status } => write!(
                f,
                "terminated by the resource manager (exit status {})",
                exit_status
            ),
        }
    }
}

/// Parsed `{job}-status.txt`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFile {
    pub exit_status: Option<i32>,
    pub walltime: Option<Walltime>,
    pub requested_walltime: Option<Walltime>,
}

impl StatusFile {
    pub fn path_for(log_dir: &Path, job_name: &str) -> PathBuf {
        log_dir.join(format!("{}{}", job_name, logs::STATUS_SUFFIX))
    }

    pub fn parse(content: &str) -> Self {
        let mut status = StatusFile::default();
        for line in content.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                status_keys::EXIT_STATUS => status.exit_status = value.parse().ok(),
                status_keys::WALLTIME => status.walltime = Walltime::parse(value),
                status_keys::REQUESTED_WALLTIME => {
                    status.requested_walltime = Walltime::parse(value)
                }
                other => tracing::trace!("Ignoring unknown status key '{}'", other),
            }
        }
        status
    }

    /// Reads the status file for a job, `None` if the job has not finished.
    pub fn read(log_dir: &Path, job_name: &str) -> Result<Option<Self>> {
        let path = Self::path_for(log_dir, job_name);
        match fs_err::read_to_string(&path) {
            Ok(content) => Ok(Some(Self::parse(&content))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PipelineError::from(e)),
        }
    }

    /// A status file without a parseable exit status counts as a failure.
    pub fn outcome(&self) -> JobOutcome {
        match self.exit_status {
            Some(code) => JobOutcome::from_exit_status(code),
            None => JobOutcome::Failed { exit_status: -1 },
        }
    }

    pub fn walltime_usage(&self) -> String {
        match (self.walltime, self.requested_walltime) {
            (Some(used), Some(req)) => format!("{} / {}", used, req),
            (Some(used), None) => used.to_string(),
            _ => "-".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_negative_eleven_is_walltime() {
        let status = StatusFile::parse("exit_status=-11\nwalltime=01:00:03\n");
        assert_eq!(status.outcome(), JobOutcome::WalltimeExceeded);
        assert_eq!(status.outcome().to_string(), "walltime limit exceeded");
    }

    #[test]
    fn test_other_negative_is_resource_manager_failure() {
        let status = StatusFile::parse("exit_status=-3");
        assert_eq!(
            status.outcome(),
            JobOutcome::ResourceManagerFailure { exit_status: -3 }
        );
    }

    #[test]
    fn test_success_and_failure() {
        assert!(StatusFile::parse("exit_status=0").outcome().is_success());
        assert_eq!(
            StatusFile::parse("exit_status=102").outcome(),
            JobOutcome::Failed { exit_status: 102 }
        );
        assert!(!StatusFile::parse("garbage").outcome().is_success());
    }

    #[test]
    fn test_validation_and_version_failures_abort_pipeline() {
        assert!(JobOutcome::from_exit_status(100).aborts_pipeline());
        assert!(JobOutcome::from_exit_status(101).aborts_pipeline());
        assert!(!JobOutcome::from_exit_status(102).aborts_pipeline());
        assert!(!JobOutcome::from_exit_status(-11).aborts_pipeline());
    }

    #[test]
    fn test_walltime_formats() {
        assert_eq!(Walltime::parse("45"), Some(Walltime::Seconds(45)));
        assert_eq!(Walltime::parse("2:05"), Some(Walltime::Seconds(125)));
        assert_eq!(Walltime::parse("1:00:00"), Some(Walltime::Seconds(3600)));
        assert_eq!(
            Walltime::parse("1:02:00:00"),
            Some(Walltime::Seconds(93600))
        );
        assert_eq!(Walltime::parse("unlimited"), Some(Walltime::Unlimited));
        assert_eq!(Walltime::parse("1:2:3:4:5"), None);
        assert_eq!(Walltime::Seconds(93600).to_string(), "1:02:00:00");
        assert_eq!(Walltime::Seconds(3725).to_string(), "01:02:05");
    }

    #[test]
    fn test_requested_unlimited() {
        let status =
            StatusFile::parse("exit_status=0\nwalltime=00:10:00\nrequested_walltime=unlimited\n");
        assert_eq!(status.requested_walltime, Some(Walltime::Unlimited));
        assert_eq!(status.walltime_usage(), "00:10:00 / unlimited");
    }

    #[test]
    fn test_read_missing_is_none() {
        let dir = tempdir().unwrap();
        assert_eq!(StatusFile::read(dir.path(), "job").unwrap(), None);
        std::fs::write(dir.path().join("job-status.txt"), "exit_status=0\n").unwrap();
        let status = StatusFile::read(dir.path(), "job").unwrap().unwrap();
        assert_eq!(status.exit_status, Some(0));
    }
}
