use pbsflow_core::constants::env as env_vars;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// How the fake `qstat` answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeQueue {
    /// Every job is unknown, as if it already left the queue.
    Empty,
    /// Every job is finished with the given exit status.
    Finished(i32),
}

/// A throwaway workspace with its own XDG dirs and fake PBS executables
/// that record their arguments instead of talking to a server.
pub struct TestContext {
    pub _temp_dir: tempfile::TempDir,
    pub test_root: PathBuf,
    pub config_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub bin_dir: PathBuf,
    pub work_dir: PathBuf,
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_queue(FakeQueue::Empty)
    }

    pub fn with_queue(queue: FakeQueue) -> Self {
        let temp_dir = tempfile::Builder::new()
            .prefix("pbsflow-test-")
            .tempdir()
            .expect("Failed to create temp dir");
        let test_root = temp_dir.path().to_path_buf();

        let config_dir = test_root.join("config");
        let cache_dir = test_root.join("cache");
        let bin_dir = test_root.join("bin");
        let work_dir = test_root.join("work");
        for dir in [&config_dir, &cache_dir, &bin_dir, &work_dir] {
            fs::create_dir_all(dir).expect("Failed to create test dir");
        }

        let pbsflow_config = config_dir.join("pbsflow");
        fs::create_dir(&pbsflow_config).expect("Failed to create pbsflow config subdir");
        fs::write(
            pbsflow_config.join("config.toml"),
            r#"
[submit]
max_retries = 1

[managed]
max_queued = 2
poll_interval_secs = 0
"#,
        )
        .expect("Failed to write temp config");

        let ctx = Self {
            _temp_dir: temp_dir,
            test_root,
            config_dir,
            cache_dir,
            bin_dir,
            work_dir,
        };
        ctx.install_fake_pbs(queue);
        ctx
    }

    fn calls_file(&self, program: &str) -> PathBuf {
        self.test_root.join(format!("{}.calls", program))
    }

    fn write_executable(&self, name: &str, body: &str) -> PathBuf {
        let path = self.bin_dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("Failed to write fake");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
            .expect("Failed to chmod fake");
        path
    }

    fn install_fake_pbs(&self, queue: FakeQueue) {
        let counter = self.test_root.join("next_job_id");
        self.write_executable(
            "qsub",
            &format!(
                "echo \"$@\" >> {calls}\n\
                 n=$(( $(cat {counter} 2>/dev/null || echo 0) + 1 ))\n\
                 echo $n > {counter}\n\
                 echo $n.fake-server",
                calls = self.calls_file("qsub").display(),
                counter = counter.display()
            ),
        );
        let qstat = match queue {
            FakeQueue::Empty => "echo \"qstat: Unknown Job Id $2\" >&2\nexit 153".to_string(),
            FakeQueue::Finished(code) => format!(
                "echo \"Job Id: $2\"\necho \"    job_state = C\"\necho \"    exit_status = {}\"",
                code
            ),
        };
        self.write_executable("qstat", &qstat);
        for program in ["qdel", "qrls"] {
            self.write_executable(
                program,
                &format!("echo \"$@\" >> {}", self.calls_file(program).display()),
            );
        }
    }

    /// Environment pointing the binary at this context's config, cache and
    /// fake PBS executables.
    pub fn envs(&self) -> Vec<(&'static str, PathBuf)> {
        vec![
            ("XDG_CONFIG_HOME", self.config_dir.clone()),
            ("XDG_CACHE_HOME", self.cache_dir.clone()),
            (env_vars::QSUB, self.bin_dir.join("qsub")),
            (env_vars::QSTAT, self.bin_dir.join("qstat")),
            (env_vars::QDEL, self.bin_dir.join("qdel")),
            (env_vars::QRLS, self.bin_dir.join("qrls")),
        ]
    }

    /// One line per invocation of the fake `program`, holding its arguments.
    pub fn calls(&self, program: &str) -> Vec<String> {
        fs::read_to_string(self.calls_file(program))
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn write_tool(&self, name: &str, program: &str, args: &str) -> PathBuf {
        let tools = self.work_dir.join("tools");
        fs::create_dir_all(&tools).expect("Failed to create tools dir");
        let path = tools.join(format!("{}.toml", name));
        fs::write(
            &path,
            format!(
                "name = \"{}\"\n\n[[command]]\nprogram = \"{}\"\nargs = \"{}\"\n",
                name, program, args
            ),
        )
        .expect("Failed to write tool");
        path
    }

    /// A copy step feeding a temporary file into a count step, with the
    /// input file bound to the first positional parameter.
    pub fn write_two_step_pipeline(&self, name: &str) -> PathBuf {
        self.write_tool("copy", "cp", "{in_1} {out_1}");
        self.write_tool("count", "wc", "-l {in_1}");
        let path = self.work_dir.join(format!("{}.toml", name));
        fs::write(
            &path,
            format!(
                r#"
name = "{name}"
tool_search_path = ["tools"]

[[file]]
id = "out"
kind = "dir"
path = "{out}"
default_output = true

[[file]]
id = "A"
parameter = 1
input = true

[[file]]
id = "B"
in_dir = "out"
temp = true

[[step]]
name = "first"
[[step.tool]]
definition = "copy.toml"
input = ["A"]
output = ["B"]

[[step]]
name = "second"
[[step.tool]]
definition = "count.toml"
input = ["B"]
"#,
                name = name,
                out = self.output_dir(name).display()
            ),
        )
        .expect("Failed to write pipeline");
        path
    }

    pub fn write_input(&self, name: &str, content: &str) -> PathBuf {
        let path = self.work_dir.join(name);
        fs::write(&path, content).expect("Failed to write input");
        path
    }

    pub fn output_dir(&self, pipeline: &str) -> PathBuf {
        self.work_dir.join(format!("{}-out", pipeline))
    }

    pub fn log_dir(&self, pipeline: &str) -> PathBuf {
        self.output_dir(pipeline).join("logs")
    }

    pub fn path(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.work_dir.join(rel)
    }
}
