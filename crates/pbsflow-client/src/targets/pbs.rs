use super::{JobInfo, QueueState, ResourceManager, SubmitRequest};
use crate::error::{ClientError, Result};
use pbsflow_core::constants::env as env_vars;
use pbsflow_core::logging::log_command;
use pbsflow_core::model::JobRef;
use pbsflow_core::status::Walltime;
use std::process::Command;
use std::thread;
use std::time::Duration;

/// Errors from qdel/qrls that mean there is nothing left to do.
const IGNORABLE_ERRORS: &[&str] = &[
    "Unknown Job Id",
    "unknown job id",
    "Request invalid for state of job",
    "invalid state for job",
    "Job has finished",
    "job has finished",
];

struct CommandOutput {
    code: i32,
    stdout: String,
    stderr: String,
}

/// TORQUE/PBS command line tools.
#[derive(Debug, Clone)]
pub struct PbsCli {
    pub qsub: String,
    pub qstat: String,
    pub qdel: String,
    pub qrls: String,
    pub max_retries: u32,
    pub retry_unit: Duration,
}

fn exec_from_env(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

impl PbsCli {
    pub fn from_env(max_retries: u32) -> Self {
        Self {
            qsub: exec_from_env(env_vars::QSUB, "qsub"),
            qstat: exec_from_env(env_vars::QSTAT, "qstat"),
            qdel: exec_from_env(env_vars::QDEL, "qdel"),
            qrls: exec_from_env(env_vars::QRLS, "qrls"),
            max_retries,
            retry_unit: Duration::from_secs(1),
        }
    }

    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        log_command(&cmd);
        let output = cmd.output()?;
        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn run_best_effort(&self, program: &str, args: &[String]) -> Result<()> {
        let out = self.run(program, args)?;
        if out.code == 0 {
            return Ok(());
        }
        if IGNORABLE_ERRORS
            .iter()
            .any(|e| out.stderr.contains(e) || out.stdout.contains(e))
        {
            tracing::debug!("Ignoring '{}' error: {}", program, out.stderr.trim());
            return Ok(());
        }
        Err(ClientError::CommandFailed {
            program: program.to_string(),
            code: out.code,
            stderr: out.stderr.trim().to_string(),
        })
    }
}

fn parse_job_id(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .filter(|l| !l.contains(char::is_whitespace))
        .map(str::to_string)
}

/// Parses `qstat -f` output.
pub fn parse_qstat_full(output: &str) -> Option<JobInfo> {
    let mut state = None;
    let mut exit_status = None;
    let mut walltime = None;
    let mut requested_walltime = None;
    for line in output.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "job_state" => state = Some(QueueState::from_code(value)),
            "exit_status" | "Exit_status" => exit_status = value.parse().ok(),
            "resources_used.walltime" => walltime = Walltime::parse(value),
            "Resource_List.walltime" => requested_walltime = Walltime::parse(value),
            _ => {}
        }
    }
    state.map(|state| JobInfo {
        state,
        exit_status,
        walltime,
        requested_walltime,
    })
}

impl ResourceManager for PbsCli {
    fn name(&self) -> &str {
        "pbs"
    }

    fn submit(&self, request: &SubmitRequest<'_>) -> Result<JobRef> {
        let mut args = Vec::new();
        if request.hold {
            args.push("-h".to_string());
        }
        if let Some(deps) = request.dependency_string() {
            args.push("-W".to_string());
            args.push(format!("depend={}", deps));
        }
        args.push(request.script.to_string_lossy().to_string());

        let attempts = self.max_retries.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.run(&self.qsub, &args) {
                Ok(out) if out.code == 0 => {
                    return parse_job_id(&out.stdout)
                        .map(JobRef)
                        .ok_or(ClientError::JobIdParse(out.stdout));
                }
                Ok(out) => {
                    last_error = format!("exit status {}: {}", out.code, out.stderr.trim());
                }
                Err(e) => last_error = e.to_string(),
            }
            tracing::warn!(
                "qsub of '{}' failed (attempt {}/{}): {}",
                request.job_name,
                attempt,
                attempts,
                last_error
            );
            if attempt < attempts {
                thread::sleep(self.retry_unit * attempt * attempt);
            }
        }
        Err(ClientError::SubmitRetriesExhausted {
            job: request.job_name.to_string(),
            attempts,
            last_error,
        })
    }

    fn release(&self, jobs: &[JobRef]) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        let args: Vec<String> = jobs.iter().map(|j| j.0.clone()).collect();
        tracing::info!("Releasing {} held job(s)", jobs.len());
        self.run_best_effort(&self.qrls, &args)
    }

    fn delete(&self, job: &JobRef) -> Result<()> {
        self.run_best_effort(&self.qdel, std::slice::from_ref(&job.0))
    }

    fn query(&self, job: &JobRef) -> Result<Option<JobInfo>> {
        let args = vec!["-f".to_string(), job.0.clone()];
        let out = self.run(&self.qstat, &args)?;
        if out.code != 0 {
            if IGNORABLE_ERRORS.iter().any(|e| out.stderr.contains(e)) {
                return Ok(None);
            }
            return Err(ClientError::CommandFailed {
                program: self.qstat.clone(),
                code: out.code,
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(parse_qstat_full(&out.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use tempfile::tempdir;

    fn fake(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    fn cli(dir: &Path, qsub: &str) -> PbsCli {
        PbsCli {
            qsub: fake(dir, "qsub", qsub),
            qstat: fake(dir, "qstat", "echo 'qstat: Unknown Job Id' >&2; exit 153"),
            qdel: fake(dir, "qdel", "echo 'qdel: Unknown Job Id 7.srv' >&2; exit 153"),
            qrls: fake(dir, "qrls", &format!("echo \"$@\" > {}/released", dir.display())),
            max_retries: 3,
            retry_unit: Duration::ZERO,
        }
    }

    fn request<'a>(script: &'a PathBuf, deps: &'a [JobRef], hold: bool) -> SubmitRequest<'a> {
        SubmitRequest {
            job_name: "align",
            script,
            hold,
            depends_on: deps,
            dependency_type: "afterok",
        }
    }

    #[test]
    fn test_submit_passes_hold_and_dependencies() {
        let dir = tempdir().unwrap();
        let args_file = dir.path().join("args");
        let pbs = cli(
            dir.path(),
            &format!("echo \"$@\" >> {}; echo 42.srv", args_file.display()),
        );
        let script = dir.path().join("job.sh");
        let deps = vec![JobRef("7.srv".into())];

        assert_eq!(
            pbs.submit(&request(&script, &[], true)).unwrap(),
            JobRef("42.srv".into())
        );
        pbs.submit(&request(&script, &deps, false)).unwrap();

        let recorded = fs::read_to_string(args_file).unwrap();
        let lines: Vec<&str> = recorded.lines().collect();
        assert_eq!(lines[0], format!("-h {}", script.display()));
        assert_eq!(
            lines[1],
            format!("-W depend=afterok:7.srv {}", script.display())
        );
    }

    #[test]
    fn test_submit_retries_then_fails() {
        let dir = tempdir().unwrap();
        let count = dir.path().join("count");
        let pbs = cli(
            dir.path(),
            &format!(
                "echo x >> {}; echo 'Connection refused' >&2; exit 1",
                count.display()
            ),
        );
        let script = dir.path().join("job.sh");
        let err = pbs.submit(&request(&script, &[], false)).unwrap_err();
        assert!(matches!(
            err,
            ClientError::SubmitRetriesExhausted { attempts: 3, .. }
        ));
        assert_eq!(fs::read_to_string(count).unwrap().lines().count(), 3);
    }

    #[test]
    fn test_submit_recovers_after_transient_failure() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("seen");
        let pbs = cli(
            dir.path(),
            &format!(
                "if [ -e {m} ]; then echo 9.srv; else touch {m}; exit 1; fi",
                m = marker.display()
            ),
        );
        let script = dir.path().join("job.sh");
        assert_eq!(
            pbs.submit(&request(&script, &[], false)).unwrap(),
            JobRef("9.srv".into())
        );
    }

    #[test]
    fn test_delete_and_query_tolerate_unknown_jobs() {
        let dir = tempdir().unwrap();
        let pbs = cli(dir.path(), "echo 1.srv");
        pbs.delete(&JobRef("7.srv".into())).unwrap();
        assert_eq!(pbs.query(&JobRef("7.srv".into())).unwrap(), None);
    }

    #[test]
    fn test_release_uses_single_call() {
        let dir = tempdir().unwrap();
        let pbs = cli(dir.path(), "echo 1.srv");
        pbs.release(&[JobRef("1.srv".into()), JobRef("2.srv".into())])
            .unwrap();
        let released = fs::read_to_string(dir.path().join("released")).unwrap();
        assert_eq!(released.trim(), "1.srv 2.srv");
    }

    #[test]
    fn test_parse_qstat_full() {
        let output = "Job Id: 12.srv\n    job_state = C\n    exit_status = -11\n    \
                      resources_used.walltime = 01:00:04\n    Resource_List.walltime = 01:00:00\n";
        let info = parse_qstat_full(output).unwrap();
        assert_eq!(info.state, QueueState::Complete);
        assert_eq!(info.exit_status, Some(-11));
        assert_eq!(info.walltime, Some(Walltime::Seconds(3604)));
        assert_eq!(info.requested_walltime, Some(Walltime::Seconds(3600)));
        assert_eq!(parse_qstat_full("nothing here"), None);
    }

    #[test]
    fn test_parse_job_id() {
        assert_eq!(parse_job_id("\n12.head\n"), Some("12.head".into()));
        assert_eq!(parse_job_id("qsub: error here"), None);
    }
}
