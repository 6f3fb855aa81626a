pub mod logs {
    pub const SUBMISSION_LOG: &str = "pipeline_batch_id_list.txt";
    pub const CANCEL_LOG: &str = "cancel.log";
    pub const NO_SUBMIT_FLAG: &str = "NO_SUBMIT";
    pub const STATUS_SUFFIX: &str = "-status.txt";
    pub const VERSION_SUFFIX: &str = "-version.log";
    pub const TIMESTAMP_SUFFIX: &str = "-timestamps.txt";
    pub const STDOUT_SUFFIX: &str = ".o";
    pub const STDERR_SUFFIX: &str = ".e";
    pub const PERMISSION_CHECK: &str = ".pbsflow_permission_check";
}

pub mod dirs {
    pub const LOGS: &str = "logs";
    pub const SUBMIT: &str = "submit";
}

pub mod scripts {
    pub const EPILOGUE: &str = "epilogue.sh";
    pub const SCRIPT_EXT: &str = "sh";
}

pub mod status_keys {
    pub const EXIT_STATUS: &str = "exit_status";
    pub const WALLTIME: &str = "walltime";
    pub const REQUESTED_WALLTIME: &str = "requested_walltime";
    pub const UNLIMITED: &str = "unlimited";
}

pub mod exit_codes {
    pub const WALLTIME_EXCEEDED: i32 = -11;
    pub const VALIDATION_FAILED: i32 = 100;
    pub const VERSION_FAILED: i32 = 101;
    pub const ERROR_STRING_MATCH: i32 = 102;
}

pub mod env {
    pub const LOG_LEVEL: &str = "PBSFLOW_LOG_LEVEL";
    pub const TEST_LOG_TEE: &str = "PBSFLOW_TEST_LOG_TEE";
    pub const QSUB: &str = "PBSFLOW_QSUB";
    pub const QSTAT: &str = "PBSFLOW_QSTAT";
    pub const QDEL: &str = "PBSFLOW_QDEL";
    pub const QRLS: &str = "PBSFLOW_QRLS";
}

pub const DEFAULT_OUTPUT_DIR_ID: &str = "__default_output_dir__";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_constants() {
        assert_eq!(logs::SUBMISSION_LOG, "pipeline_batch_id_list.txt");
        assert_eq!(logs::STATUS_SUFFIX, "-status.txt");
    }

    #[test]
    fn test_status_key_constants() {
        assert_eq!(status_keys::EXIT_STATUS, "exit_status");
        assert_eq!(status_keys::REQUESTED_WALLTIME, "requested_walltime");
    }

    #[test]
    fn test_walltime_exit_code() {
        assert_eq!(exit_codes::WALLTIME_EXCEEDED, -11);
    }
}
