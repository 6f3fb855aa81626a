use crate::error::{ClientError, Result};
use nix::unistd::{getegid, getgroups, Gid, Group};
use pbsflow_core::constants::{dirs, logs, scripts};
use pbsflow_core::model::JobRef;
use std::collections::HashSet;
use std::io::Write;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// One line of the submission log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub job_ref: JobRef,
    pub name: String,
    pub depends_on: Vec<String>,
}

impl SubmissionRecord {
    pub fn new(job_ref: &JobRef, name: &str, depends_on: &[JobRef]) -> Self {
        Self {
            job_ref: job_ref.clone(),
            name: name.to_string(),
            depends_on: depends_on.iter().map(|d| d.short_id().to_string()).collect(),
        }
    }

    fn to_line(&self) -> String {
        format!(
            "{}\t{}\t{}",
            self.job_ref,
            self.name,
            self.depends_on.join(",")
        )
    }

    fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split('\t');
        let id = fields.next().filter(|s| !s.is_empty())?;
        let name = fields.next().filter(|s| !s.is_empty())?;
        let depends_on = fields
            .next()
            .map(|deps| {
                deps.split(',')
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Some(Self {
            job_ref: JobRef(id.to_string()),
            name: name.to_string(),
            depends_on,
        })
    }
}

/// The per-invocation log directory and the files kept in it.
#[derive(Debug, Clone)]
pub struct LogDir {
    root: PathBuf,
}

impl LogDir {
    /// Wraps an existing directory without touching it.
    pub fn open(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// Creates the directory tree for a new run and checks that the
    /// resource manager will be able to write into it.
    pub fn prepare(root: &Path) -> Result<Self> {
        let created = !root.exists();
        fs_err::create_dir_all(root)?;
        if created {
            fs_err::set_permissions(root, std::fs::Permissions::from_mode(0o2770))?;
        }
        let log_dir = Self::open(root);
        fs_err::create_dir_all(log_dir.submit_dir())?;
        log_dir.check_group_writable()?;
        Ok(log_dir)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn submit_dir(&self) -> PathBuf {
        self.root.join(dirs::SUBMIT)
    }

    pub fn script_path(&self, job_name: &str) -> PathBuf {
        self.submit_dir()
            .join(format!("{}.{}", job_name, scripts::SCRIPT_EXT))
    }

    pub fn epilogue_path(&self) -> PathBuf {
        self.submit_dir().join(scripts::EPILOGUE)
    }

    pub fn status_path(&self, job_name: &str) -> PathBuf {
        pbsflow_core::status::StatusFile::path_for(&self.root, job_name)
    }

    pub fn stdout_path(&self, job_name: &str) -> PathBuf {
        self.root
            .join(format!("{}{}", job_name, logs::STDOUT_SUFFIX))
    }

    pub fn stderr_path(&self, job_name: &str) -> PathBuf {
        self.root
            .join(format!("{}{}", job_name, logs::STDERR_SUFFIX))
    }

    fn permission_error(&self, reason: String) -> ClientError {
        ClientError::LogDirPermission {
            path: self.root.clone(),
            reason,
        }
    }

    pub fn check_group_writable(&self) -> Result<()> {
        let marker = self.root.join(logs::PERMISSION_CHECK);
        fs_err::write(&marker, b"")?;
        let meta = fs_err::metadata(&marker);
        let _ = fs_err::remove_file(&marker);
        let gid = Gid::from_raw(meta?.gid());

        let mut groups = getgroups()
            .map_err(|e| self.permission_error(format!("cannot list user groups: {}", e)))?;
        groups.push(getegid());
        if !groups.contains(&gid) {
            let group_name = Group::from_gid(gid)
                .ok()
                .flatten()
                .map(|g| g.name)
                .unwrap_or_else(|| gid.to_string());
            let user = whoami::username().unwrap_or_else(|_| "unknown".to_string());
            return Err(self.permission_error(format!(
                "new files get group '{}', which user '{}' does not belong to",
                group_name, user
            )));
        }

        let mode = fs_err::metadata(&self.root)?.permissions().mode();
        if mode & 0o020 == 0 {
            return Err(self.permission_error(format!(
                "directory is not group-writable (mode {:o})",
                mode & 0o7777
            )));
        }
        Ok(())
    }

    fn append_line(&self, file: &str, line: &str) -> Result<()> {
        let mut f = fs_err::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(file))?;
        writeln!(f, "{}", line)?;
        Ok(())
    }

    pub fn append_submission(&self, record: &SubmissionRecord) -> Result<()> {
        self.append_line(logs::SUBMISSION_LOG, &record.to_line())
    }

    pub fn read_submissions(&self) -> Result<Vec<SubmissionRecord>> {
        let path = self.root.join(logs::SUBMISSION_LOG);
        let content = match fs_err::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        content
            .lines()
            .enumerate()
            .filter(|(_, l)| !l.trim().is_empty())
            .map(|(i, l)| {
                SubmissionRecord::parse(l).ok_or_else(|| ClientError::MalformedSubmissionLog {
                    path: path.clone(),
                    line: i + 1,
                })
            })
            .collect()
    }

    pub fn append_cancel(&self, job: &JobRef) -> Result<()> {
        self.append_line(logs::CANCEL_LOG, &job.0)
    }

    pub fn cancelled(&self) -> Result<HashSet<String>> {
        match fs_err::read_to_string(self.root.join(logs::CANCEL_LOG)) {
            Ok(c) => Ok(c
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashSet::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn mark_no_submit(&self) -> Result<()> {
        fs_err::write(self.root.join(logs::NO_SUBMIT_FLAG), b"")?;
        Ok(())
    }

    pub fn is_no_submit(&self) -> bool {
        self.root.join(logs::NO_SUBMIT_FLAG).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_prepare_creates_group_writable_tree() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("logs");
        let log_dir = LogDir::prepare(&root).unwrap();
        assert!(log_dir.submit_dir().is_dir());
        let mode = fs_err::metadata(&root).unwrap().permissions().mode();
        assert_ne!(mode & 0o020, 0);
        assert!(!root.join(logs::PERMISSION_CHECK).exists());
    }

    #[test]
    fn test_private_directory_is_rejected() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("private");
        fs_err::create_dir(&root).unwrap();
        fs_err::set_permissions(&root, std::fs::Permissions::from_mode(0o700)).unwrap();
        let err = LogDir::prepare(&root).unwrap_err();
        assert!(matches!(err, ClientError::LogDirPermission { .. }));
    }

    #[test]
    fn test_submission_log_round_trip() {
        let dir = tempdir().unwrap();
        let log_dir = LogDir::open(dir.path());
        let a = JobRef("10.srv.example".into());
        let b = JobRef("11.srv.example".into());
        log_dir
            .append_submission(&SubmissionRecord::new(&a, "first", &[]))
            .unwrap();
        log_dir
            .append_submission(&SubmissionRecord::new(&b, "second", &[a.clone()]))
            .unwrap();

        let raw = fs_err::read_to_string(dir.path().join(logs::SUBMISSION_LOG)).unwrap();
        assert_eq!(raw, "10.srv.example\tfirst\t\n11.srv.example\tsecond\t10\n");

        let records = log_dir.read_submissions().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].depends_on, vec!["10"]);
        assert!(records[0].depends_on.is_empty());
    }

    #[test]
    fn test_cancel_log_and_no_submit_flag() {
        let dir = tempdir().unwrap();
        let log_dir = LogDir::open(dir.path());
        assert!(log_dir.cancelled().unwrap().is_empty());
        log_dir.append_cancel(&JobRef("5.srv".into())).unwrap();
        assert!(log_dir.cancelled().unwrap().contains("5.srv"));

        assert!(!log_dir.is_no_submit());
        log_dir.mark_no_submit().unwrap();
        assert!(log_dir.is_no_submit());
    }

    #[test]
    fn test_missing_submission_log_is_empty() {
        let dir = tempdir().unwrap();
        assert!(LogDir::open(dir.path()).read_submissions().unwrap().is_empty());
    }
}
