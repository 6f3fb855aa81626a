use crate::error::Result;
use crate::logdir::LogDir;
use crate::resources::{pbs_directives, resolve_for_tool};
use pbsflow_core::config::{mail_flags, Config, FailurePolicy, MailEvent};
use pbsflow_core::constants::{exit_codes, logs, status_keys};
use pbsflow_core::model::ExitTestLogic;
use pbsflow_core::pipeline::{BatchJob, JobKind};
use pbsflow_core::tool::{ResourceRequest, ToolInvocation};
use std::fmt::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn quote_path(p: &Path) -> String {
    shell_quote(&p.to_string_lossy())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationBlock {
    pub validator: String,
    pub manifest: PathBuf,
    pub programs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistenceTest {
    pub paths: Vec<PathBuf>,
    pub logic: ExitTestLogic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBlock {
    pub label: String,
    pub line: String,
    pub stdout: Option<PathBuf>,
    pub stderr: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorScan {
    pub markers: Vec<String>,
    pub files: Vec<PathBuf>,
}

/// Every slot of a job script. Optional blocks are rendered only when present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobScript {
    pub job_name: String,
    pub log_dir: PathBuf,
    pub directives: Vec<String>,
    pub workdir: PathBuf,
    pub modules: Vec<String>,
    pub path_dirs: Vec<PathBuf>,
    pub failure_mail: Option<String>,
    pub validation: Option<ValidationBlock>,
    pub existence_test: Option<ExistenceTest>,
    pub version_commands: Vec<String>,
    pub commands: Vec<CommandBlock>,
    pub error_scan: Option<ErrorScan>,
    pub cleanup: Vec<PathBuf>,
}

impl JobScript {
    pub fn render(&self) -> String {
        let mut s = String::from("#!/bin/bash\n");
        for d in &self.directives {
            let _ = writeln!(s, "{}", d);
        }
        s.push('\n');

        let _ = writeln!(s, "LOG_DIR={}", quote_path(&self.log_dir));
        let _ = writeln!(s, "JOB_NAME={}", shell_quote(&self.job_name));
        let _ = writeln!(
            s,
            "STATUS_FILE=\"$LOG_DIR/$JOB_NAME{}\"",
            logs::STATUS_SUFFIX
        );
        let _ = writeln!(
            s,
            "TIMESTAMP_FILE=\"$LOG_DIR/$JOB_NAME{}\"",
            logs::TIMESTAMP_SUFFIX
        );
        s.push_str("rm -f \"$STATUS_FILE\"\n");
        s.push('\n');

        s.push_str("pbsflow_fail() {\n");
        let _ = writeln!(
            s,
            "    echo \"{}=$1\" > \"$STATUS_FILE\"",
            status_keys::EXIT_STATUS
        );
        s.push_str("    echo \"pbsflow: $JOB_NAME: $2\" >&2\n");
        if let Some(email) = &self.failure_mail {
            let _ = writeln!(
                s,
                "    echo \"$2 (log directory $LOG_DIR)\" | mail -s \"pbsflow: $JOB_NAME failed\" {} || true",
                shell_quote(email)
            );
        }
        s.push_str("    exit \"$1\"\n}\n\n");

        let _ = writeln!(
            s,
            "cd {} || pbsflow_fail 1 \"cannot enter working directory\"",
            quote_path(&self.workdir)
        );
        for module in &self.modules {
            let _ = writeln!(
                s,
                "module load {} || pbsflow_fail 1 \"module load {} failed\"",
                shell_quote(module),
                module.replace('"', "")
            );
        }
        if !self.path_dirs.is_empty() {
            let dirs: Vec<String> = self.path_dirs.iter().map(|p| quote_path(p)).collect();
            let _ = writeln!(s, "export PATH={}:\"$PATH\"", dirs.join(":"));
        }
        s.push('\n');

        if let Some(v) = &self.validation {
            let programs: Vec<String> = v.programs.iter().map(|p| shell_quote(p)).collect();
            let _ = writeln!(
                s,
                "{} -m {} {} || pbsflow_fail {} \"validation failed\"\n",
                shell_quote(&v.validator),
                quote_path(&v.manifest),
                programs.join(" "),
                exit_codes::VALIDATION_FAILED
            );
        }

        if let Some(test) = &self.existence_test {
            let joiner = match test.logic {
                ExitTestLogic::And => " && ",
                ExitTestLogic::Or => " || ",
            };
            let checks: Vec<String> = test
                .paths
                .iter()
                .map(|p| format!("[ -e {} ]", quote_path(p)))
                .collect();
            let _ = writeln!(s, "if {}; then", checks.join(joiner));
            s.push_str("    echo \"pbsflow: $JOB_NAME: outputs already present, skipping\"\n");
            s.push_str("    exit 0\nfi\n\n");
        }

        for version in &self.version_commands {
            let _ = writeln!(
                s,
                "( {} ) >> \"$LOG_DIR/$JOB_NAME{}\" 2>&1 || pbsflow_fail {} \"version command failed\"",
                version,
                logs::VERSION_SUFFIX,
                exit_codes::VERSION_FAILED
            );
        }
        if !self.version_commands.is_empty() {
            s.push('\n');
        }

        for cmd in &self.commands {
            let _ = writeln!(
                s,
                "echo \"start {} $(date +%s)\" >> \"$TIMESTAMP_FILE\"",
                cmd.label.replace('"', "")
            );
            let mut line = cmd.line.clone();
            if let Some(out) = &cmd.stdout {
                let _ = write!(line, " > {}", quote_path(out));
            }
            let _ = write!(line, " 2>> {}", quote_path(&cmd.stderr));
            let _ = writeln!(
                s,
                "{} || pbsflow_fail $? \"{} exited with status $?\"",
                line,
                cmd.label.replace('"', "")
            );
        }
        if !self.commands.is_empty() {
            s.push_str("echo \"end $(date +%s)\" >> \"$TIMESTAMP_FILE\"\n\n");
        }

        if let Some(scan) = &self.error_scan {
            let files: Vec<String> = scan.files.iter().map(|p| quote_path(p)).collect();
            let patterns: Vec<String> = scan
                .markers
                .iter()
                .map(|m| format!("-e {}", shell_quote(m)))
                .collect();
            let _ = writeln!(s, "for f in {}; do", files.join(" "));
            let _ = writeln!(
                s,
                "    if [ -f \"$f\" ] && grep -qF {} \"$f\"; then",
                patterns.join(" ")
            );
            let _ = writeln!(
                s,
                "        pbsflow_fail {} \"error string found in $f\"",
                exit_codes::ERROR_STRING_MATCH
            );
            s.push_str("    fi\ndone\n\n");
        }

        if !self.cleanup.is_empty() {
            let paths: Vec<String> = self.cleanup.iter().map(|p| quote_path(p)).collect();
            let _ = writeln!(s, "rm -rf -- {}\n", paths.join(" "));
        }

        s.push_str("exit 0\n");
        s
    }
}

/// Renders job scripts and the shared epilogue for one log directory.
pub struct ScriptGenerator {
    log_dir: LogDir,
    config: Config,
    failure_policy: FailurePolicy,
    epilogue: Option<PathBuf>,
}

impl ScriptGenerator {
    pub fn new(log_dir: LogDir, config: Config, failure_policy: FailurePolicy) -> Self {
        Self {
            log_dir,
            config,
            failure_policy,
            epilogue: None,
        }
    }

    pub fn log_dir(&self) -> &LogDir {
        &self.log_dir
    }

    fn failure_mail(&self) -> Option<String> {
        let submit = &self.config.submit;
        submit
            .email
            .clone()
            .filter(|_| submit.mail_on.contains(&MailEvent::Abort))
    }

    fn base_directives(&self, job_name: &str, resources: &ResourceRequest, epilogue: &Path) -> Vec<String> {
        let mut lines = vec![
            format!("#PBS -N {}", job_name),
            format!("#PBS -o {}", self.log_dir.stdout_path(job_name).display()),
            format!("#PBS -e {}", self.log_dir.stderr_path(job_name).display()),
        ];
        lines.extend(pbs_directives(resources));
        lines.push(format!("#PBS -l epilogue={}", epilogue.display()));
        let submit = &self.config.submit;
        if let Some(email) = &submit.email {
            lines.push(format!("#PBS -M {}", email));
            if !submit.mail_on.is_empty() {
                lines.push(format!("#PBS -m {}", mail_flags(&submit.mail_on)));
            }
        }
        lines
    }

    fn validation_block(&self, invocation: &ToolInvocation) -> Option<ValidationBlock> {
        let v = &self.config.validation;
        match (&v.manifest, v.enabled) {
            (Some(manifest), true) => Some(ValidationBlock {
                validator: v.validator.clone(),
                manifest: manifest.clone(),
                programs: invocation.validate_programs.clone(),
            }),
            _ => None,
        }
    }

    /// The resources a job is submitted with after config defaults and rules.
    pub fn resources_for(&self, job: &BatchJob) -> ResourceRequest {
        match &job.kind {
            JobKind::Tool(invocation) => resolve_for_tool(
                &invocation.tool_name,
                &invocation.resources,
                &self.config.resources,
                self.config.submit.queue.as_deref(),
            ),
            JobKind::Cleanup { .. } => ResourceRequest {
                threads: 1,
                queue: self.config.submit.queue.clone(),
                ..ResourceRequest::default()
            },
        }
    }

    pub fn build(&mut self, job: &BatchJob) -> Result<JobScript> {
        let epilogue = self.ensure_epilogue()?;
        let resources = self.resources_for(job);
        let script = match &job.kind {
            JobKind::Tool(invocation) => {
                let default_stderr = self.log_dir.root().join(format!("{}.stderr.log", job.name));
                let commands: Vec<CommandBlock> = invocation
                    .commands
                    .iter()
                    .map(|c| CommandBlock {
                        label: c.program.clone(),
                        line: c.command_line.clone(),
                        stdout: c.stdout.clone(),
                        stderr: c.stderr.clone().unwrap_or_else(|| default_stderr.clone()),
                    })
                    .collect();
                let mut stderr_files: Vec<PathBuf> = Vec::new();
                for c in &commands {
                    if !stderr_files.contains(&c.stderr) {
                        stderr_files.push(c.stderr.clone());
                    }
                }
                JobScript {
                    job_name: job.name.clone(),
                    log_dir: self.log_dir.root().to_path_buf(),
                    directives: self.base_directives(&job.name, &resources, &epilogue),
                    workdir: job.workdir.clone(),
                    modules: invocation.modules.clone(),
                    path_dirs: invocation.bin_path.clone(),
                    failure_mail: self.failure_mail(),
                    validation: self.validation_block(invocation),
                    existence_test: (!invocation.exit_if_exists.is_empty()).then(|| {
                        ExistenceTest {
                            paths: invocation.exit_if_exists.clone(),
                            logic: invocation.exit_test_logic,
                        }
                    }),
                    version_commands: invocation
                        .commands
                        .iter()
                        .filter_map(|c| c.version_command.clone())
                        .collect(),
                    commands,
                    error_scan: (!invocation.error_strings.is_empty()).then(|| ErrorScan {
                        markers: invocation.error_strings.clone(),
                        files: stderr_files,
                    }),
                    cleanup: invocation.local_temp_files.clone(),
                }
            }
            JobKind::Cleanup { paths } => {
                JobScript {
                    job_name: job.name.clone(),
                    log_dir: self.log_dir.root().to_path_buf(),
                    directives: self.base_directives(&job.name, &resources, &epilogue),
                    workdir: job.workdir.clone(),
                    modules: Vec::new(),
                    path_dirs: Vec::new(),
                    failure_mail: self.failure_mail(),
                    validation: None,
                    existence_test: None,
                    version_commands: Vec::new(),
                    commands: Vec::new(),
                    error_scan: None,
                    cleanup: paths.clone(),
                }
            }
        };
        Ok(script)
    }

    /// Renders the job script into `submit/{job}.sh`, owner-only.
    pub fn write(&mut self, job: &BatchJob) -> Result<PathBuf> {
        let script = self.build(job)?;
        let path = self.log_dir.script_path(&job.name);
        let status = self.log_dir.status_path(&job.name);
        if status.exists() {
            fs_err::remove_file(&status)?;
        }
        fs_err::write(&path, script.render())?;
        fs_err::set_permissions(&path, std::fs::Permissions::from_mode(0o700))?;
        tracing::debug!("Wrote job script {}", path.display());
        Ok(path)
    }

    /// Writes the epilogue on first use; a configured epilogue is used as is.
    pub fn ensure_epilogue(&mut self) -> Result<PathBuf> {
        if let Some(path) = &self.epilogue {
            return Ok(path.clone());
        }
        let path = match &self.config.submit.epilogue {
            Some(custom) => custom.clone(),
            None => {
                let path = self.log_dir.epilogue_path();
                fs_err::write(&path, render_epilogue(self.log_dir.root(), self.failure_policy))?;
                fs_err::set_permissions(&path, std::fs::Permissions::from_mode(0o700))?;
                tracing::debug!("Wrote epilogue {}", path.display());
                path
            }
        };
        self.epilogue = Some(path.clone());
        Ok(path)
    }
}

/// The resource manager calls this after each job as
/// `epilogue id user group name session limits used queue account exit`.
///
/// A failed validation or version command deletes the rest of the pipeline
/// under either policy; `AbortPipeline` does so for any failure.
pub fn render_epilogue(log_dir: &Path, policy: FailurePolicy) -> String {
    let mut s = String::from("#!/bin/bash\n");
    let _ = writeln!(s, "LOG_DIR={}", quote_path(log_dir));
    s.push_str("JOB_ID=\"$1\"\nJOB_NAME=\"$4\"\nLIMITS=\"$6\"\nUSED=\"$7\"\nEXIT=\"${10}\"\n");
    let _ = writeln!(
        s,
        "STATUS_FILE=\"$LOG_DIR/$JOB_NAME{}\"\n",
        logs::STATUS_SUFFIX
    );
    s.push_str(
        "field() {\n    echo \"$1\" | tr ',' '\\n' | sed -n \"s/^$2=//p\" | head -n 1\n}\n\n",
    );
    s.push_str("WALLTIME=$(field \"$USED\" walltime)\nREQUESTED=$(field \"$LIMITS\" walltime)\n");
    let _ = writeln!(
        s,
        "[ -n \"$REQUESTED\" ] || REQUESTED={}\n",
        status_keys::UNLIMITED
    );

    s.push_str("if [ -f \"$STATUS_FILE\" ]; then\n");
    let _ = writeln!(
        s,
        "    RECORDED=$(sed -n 's/^{}=//p' \"$STATUS_FILE\" | head -n 1)",
        status_keys::EXIT_STATUS
    );
    s.push_str("    [ -n \"$RECORDED\" ] && EXIT=\"$RECORDED\"\n");
    let _ = writeln!(
        s,
        "    echo \"{}=$WALLTIME\" >> \"$STATUS_FILE\"",
        status_keys::WALLTIME
    );
    let _ = writeln!(
        s,
        "    echo \"{}=$REQUESTED\" >> \"$STATUS_FILE\"",
        status_keys::REQUESTED_WALLTIME
    );
    s.push_str("else\n");
    let _ = writeln!(
        s,
        "    printf '{}=%s\\n{}=%s\\n{}=%s\\n' \"$EXIT\" \"$WALLTIME\" \"$REQUESTED\" > \"$STATUS_FILE\"",
        status_keys::EXIT_STATUS,
        status_keys::WALLTIME,
        status_keys::REQUESTED_WALLTIME
    );
    s.push_str("fi\n\n");

    let _ = writeln!(s, "if [ \"$EXIT\" = \"{}\" ]; then", exit_codes::WALLTIME_EXCEEDED);
    s.push_str("    echo \"pbsflow: $JOB_NAME ($JOB_ID) exceeded its walltime limit ($REQUESTED)\" >&2\n");
    s.push_str("elif [ \"$EXIT\" -lt 0 ] 2>/dev/null; then\n");
    s.push_str("    echo \"pbsflow: $JOB_NAME ($JOB_ID) was terminated by the resource manager ($EXIT)\" >&2\n");
    s.push_str("elif [ \"$EXIT\" != \"0\" ]; then\n");
    s.push_str("    echo \"pbsflow: $JOB_NAME ($JOB_ID) failed with exit status $EXIT\" >&2\n");
    s.push_str("fi\n");

    s.push('\n');
    if policy == FailurePolicy::AbortPipeline {
        s.push_str("if [ \"$EXIT\" != \"0\" ]; then\n");
    } else {
        let _ = writeln!(
            s,
            "if [ \"$EXIT\" = \"{}\" ] || [ \"$EXIT\" = \"{}\" ]; then",
            exit_codes::VALIDATION_FAILED,
            exit_codes::VERSION_FAILED
        );
    }
    let _ = writeln!(
        s,
        "    cut -f1 \"$LOG_DIR/{}\" | while read -r other; do",
        logs::SUBMISSION_LOG
    );
    s.push_str("        [ \"$other\" = \"$JOB_ID\" ] && continue\n");
    s.push_str("        qdel \"$other\" >/dev/null 2>&1 || true\n");
    s.push_str("    done\nfi\n");
    s.push_str("exit 0\n");
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use pbsflow_core::tool::RenderedCommand;
    use tempfile::tempdir;

    fn invocation() -> ToolInvocation {
        ToolInvocation {
            job_name: "align_bwa".into(),
            tool_name: "bwa".into(),
            inputs: vec!["reads".into()],
            outputs: vec!["bam".into()],
            commands: vec![RenderedCommand {
                program: "bwa".into(),
                command_line: "bwa mem /in/r.fq".into(),
                stdout: Some(PathBuf::from("/out/r.sam")),
                stderr: None,
                version_command: Some("bwa 2>&1 | grep Version".into()),
            }],
            resources: ResourceRequest {
                threads: 4,
                walltime: Some("02:00:00".into()),
                ..ResourceRequest::default()
            },
            modules: vec!["bwa/0.7.17".into()],
            bin_path: vec![PathBuf::from("/pipe/bin"), PathBuf::from("/tools/bin")],
            error_strings: vec!["[E::".into()],
            exit_if_exists: vec![PathBuf::from("/out/r.sam")],
            exit_test_logic: ExitTestLogic::And,
            validate_programs: vec!["bwa".into()],
            local_temp_files: vec![PathBuf::from("/out/scratch.1")],
        }
    }

    fn job(kind: JobKind) -> BatchJob {
        BatchJob {
            name: "align_bwa".into(),
            kind,
            depends_on: vec![],
            workdir: PathBuf::from("/out"),
        }
    }

    fn generator(root: &Path, config: Config) -> ScriptGenerator {
        let log_dir = LogDir::open(root);
        fs_err::create_dir_all(log_dir.submit_dir()).unwrap();
        ScriptGenerator::new(log_dir, config, FailurePolicy::Branch)
    }

    #[test]
    fn test_tool_script_sections_in_order() {
        let dir = tempdir().unwrap();
        let mut gen = generator(dir.path(), Config::default());
        let text = gen
            .build(&job(JobKind::Tool(Box::new(invocation()))))
            .unwrap()
            .render();

        assert!(text.starts_with("#!/bin/bash\n#PBS -N align_bwa\n"));
        assert!(text.contains("#PBS -l nodes=1:ppn=4"));
        assert!(text.contains("#PBS -l walltime=02:00:00"));
        assert!(text.contains("module load 'bwa/0.7.17'"));
        assert!(text.contains("export PATH='/pipe/bin':'/tools/bin':\"$PATH\""));

        let order = [
            "cd '/out'",
            "if [ -e '/out/r.sam' ]; then",
            "( bwa 2>&1 | grep Version )",
            "bwa mem /in/r.fq > '/out/r.sam' 2>> ",
            "grep -qF -e '[E::'",
            "rm -rf -- '/out/scratch.1'",
            "exit 0\n",
        ];
        let mut last = 0;
        for needle in order {
            let pos = text[last..]
                .find(needle)
                .unwrap_or_else(|| panic!("'{}' missing or out of order", needle));
            last += pos + needle.len();
        }
    }

    #[test]
    fn test_validation_block_omitted_when_disabled() {
        let dir = tempdir().unwrap();
        let mut gen = generator(dir.path(), Config::default());
        let text = gen
            .build(&job(JobKind::Tool(Box::new(invocation()))))
            .unwrap()
            .render();
        assert!(!text.contains("validation failed"));
    }

    #[test]
    fn test_validation_block_present_when_enabled() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.validation.enabled = true;
        config.validation.manifest = Some(PathBuf::from("/etc/manifest.txt"));
        let mut gen = generator(dir.path(), config);
        let text = gen
            .build(&job(JobKind::Tool(Box::new(invocation()))))
            .unwrap()
            .render();
        assert!(text.contains(
            "'validate-files' -m '/etc/manifest.txt' 'bwa' || pbsflow_fail 100 \"validation failed\""
        ));
    }

    #[test]
    fn test_or_logic_and_failure_mail() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.submit.email = Some("me@example.org".into());
        let mut inv = invocation();
        inv.exit_if_exists = vec![PathBuf::from("/a"), PathBuf::from("/b")];
        inv.exit_test_logic = ExitTestLogic::Or;
        let mut gen = generator(dir.path(), config);
        let text = gen.build(&job(JobKind::Tool(Box::new(inv)))).unwrap().render();
        assert!(text.contains("if [ -e '/a' ] || [ -e '/b' ]; then"));
        assert!(text.contains("mail -s \"pbsflow: $JOB_NAME failed\" 'me@example.org'"));
        assert!(text.contains("#PBS -M me@example.org"));
        assert!(text.contains("#PBS -m a"));
    }

    #[test]
    fn test_cleanup_job_script() {
        let dir = tempdir().unwrap();
        let mut gen = generator(dir.path(), Config::default());
        let text = gen
            .build(&job(JobKind::Cleanup {
                paths: vec![PathBuf::from("/out/tmp.1"), PathBuf::from("/out/tmp dir")],
            }))
            .unwrap()
            .render();
        assert!(text.contains("rm -rf -- '/out/tmp.1' '/out/tmp dir'"));
        assert!(!text.contains("echo \"start "));
        assert!(text.contains("#PBS -N align_bwa"));
    }

    #[test]
    fn test_script_written_owner_only_and_epilogue_once() {
        let dir = tempdir().unwrap();
        let mut gen = generator(dir.path(), Config::default());
        let path = gen.write(&job(JobKind::Tool(Box::new(invocation())))).unwrap();
        assert_eq!(path, dir.path().join("submit/align_bwa.sh"));
        let mode = fs_err::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);

        let epilogue = gen.log_dir().epilogue_path();
        assert!(epilogue.exists());
        fs_err::write(&epilogue, "sentinel").unwrap();
        gen.write(&job(JobKind::Cleanup { paths: vec![] })).unwrap();
        assert_eq!(fs_err::read_to_string(&epilogue).unwrap(), "sentinel");
    }

    #[test]
    fn test_epilogue_abort_policy_deletes_siblings() {
        let branch = render_epilogue(Path::new("/logs"), FailurePolicy::Branch);
        let abort = render_epilogue(Path::new("/logs"), FailurePolicy::AbortPipeline);
        assert!(abort.contains("if [ \"$EXIT\" != \"0\" ]; then\n    cut -f1"));
        assert!(abort.contains("qdel \"$other\""));
        assert!(!branch.contains("if [ \"$EXIT\" != \"0\" ]; then\n    cut -f1"));
        assert!(branch.contains("if [ \"$EXIT\" = \"-11\" ]; then"));
    }

    #[test]
    fn test_branch_epilogue_still_aborts_on_validation_and_version_failure() {
        let branch = render_epilogue(Path::new("/logs"), FailurePolicy::Branch);
        assert!(branch.contains(
            "if [ \"$EXIT\" = \"100\" ] || [ \"$EXIT\" = \"101\" ]; then\n    cut -f1 \"$LOG_DIR/pipeline_batch_id_list.txt\""
        ));
        assert!(branch.contains("qdel \"$other\""));
    }

    #[test]
    fn test_rewriting_a_job_clears_its_previous_status() {
        let dir = tempdir().unwrap();
        let mut gen = generator(dir.path(), Config::default());
        let status = gen.log_dir().status_path("align_bwa");
        fs_err::write(&status, "exit_status=0\n").unwrap();

        let path = gen.write(&job(JobKind::Tool(Box::new(invocation())))).unwrap();
        assert!(!status.exists());
        let script = fs_err::read_to_string(path).unwrap();
        let rm = script.find("rm -f \"$STATUS_FILE\"").unwrap();
        assert!(rm < script.find("pbsflow_fail() {").unwrap());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("hello"), "'hello'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }
}
