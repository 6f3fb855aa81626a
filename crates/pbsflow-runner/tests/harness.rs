#![allow(dead_code)]
use assert_cmd::Command as AssertCommand;
use pbsflow_test_utils::harness::{FakeQueue, TestContext};
use std::ops::Deref;

pub struct TestHarness {
    pub context: TestContext,
}

impl TestHarness {
    pub fn new() -> Self {
        Self {
            context: TestContext::new(),
        }
    }

    pub fn with_queue(queue: FakeQueue) -> Self {
        Self {
            context: TestContext::with_queue(queue),
        }
    }

    pub fn cmd(&self) -> AssertCommand {
        let mut cmd = AssertCommand::new(env!("CARGO_BIN_EXE_pbsflow"));
        for (key, value) in self.context.envs() {
            cmd.env(key, value);
        }
        cmd.env("RUST_BACKTRACE", "1");
        cmd.env("PBSFLOW_TEST_LOG_TEE", "1");
        cmd.env("PBSFLOW_LOG_LEVEL", "DEBUG");
        cmd.current_dir(&self.context.work_dir);
        cmd
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for TestHarness {
    type Target = TestContext;

    fn deref(&self) -> &Self::Target {
        &self.context
    }
}
