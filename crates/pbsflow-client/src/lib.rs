pub mod cancel;
pub mod error;
pub mod logdir;
pub mod managed;
pub mod resources;
pub mod script;
pub mod status;
pub mod submission;
pub mod submitter;
pub mod targets;

pub use error::{ClientError, Result};
pub use logdir::LogDir;
pub use targets::{DryRun, PbsCli, ResourceManager};
