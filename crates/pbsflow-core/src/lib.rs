pub mod config;
pub mod constants;
pub mod engine;
pub mod errors;
pub mod files;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod status;
pub mod tool;
