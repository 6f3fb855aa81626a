//! Store-backed submission for pipelines too large to hold in the queue at once.

pub mod scheduler;
pub mod store;
pub mod writer;

pub use scheduler::{delete_pipeline, ManagedScheduler, PollSummary};
pub use store::{JobRecord, ManagedStore, PipelineRecord};
pub use writer::{add_pipeline, ManagedWriter};
