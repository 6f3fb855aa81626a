use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] pbsflow_core::errors::ConfigError),

    #[error(transparent)]
    Pipeline(#[from] pbsflow_core::errors::PipelineError),

    #[error("Managed store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Failed to encode job resources: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Corrupt managed store: {0}")]
    CorruptStore(String),

    #[error("'{program}' exited with status {code}: {stderr}")]
    CommandFailed {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("Giving up on submitting '{job}' after {attempts} attempt(s): {last_error}")]
    SubmitRetriesExhausted {
        job: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Failed to parse a job id from qsub output: '{0}'")]
    JobIdParse(String),

    #[error("Log directory '{path}' is not usable: {reason}")]
    LogDirPermission { path: PathBuf, reason: String },

    #[error("Store '{0}' has already started submitting; no new pipelines can be added.")]
    StoreStarted(PathBuf),

    #[error("Pipeline '{0}' is not in the managed store.")]
    PipelineNotFound(String),

    #[error("A pipeline named '{0}' is already in the managed store.")]
    DuplicatePipeline(String),

    #[error("Malformed line {line} in submission log '{path}'.")]
    MalformedSubmissionLog { path: PathBuf, line: usize },
}

pub type Result<T> = std::result::Result<T, ClientError>;

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Config(pbsflow_core::errors::ConfigError::Io(e))
    }
}
