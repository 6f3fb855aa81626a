use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] pbsflow_core::errors::ConfigError),

    #[error(transparent)]
    Pipeline(#[from] pbsflow_core::errors::PipelineError),

    #[error(transparent)]
    Client(#[from] pbsflow_client::error::ClientError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Failed to install the Ctrl-C handler: {0}")]
    Signal(#[from] ctrlc::Error),

    #[error("Managed store '{0}' does not exist.")]
    StoreMissing(std::path::PathBuf),

    #[error("{failed} of {total} pipeline(s) failed")]
    PipelinesFailed { failed: usize, total: usize },
}
