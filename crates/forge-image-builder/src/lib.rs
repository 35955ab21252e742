pub mod config;
pub mod error;
pub mod executor;
pub mod fs;
pub mod image;
pub mod log_sanitize;
pub mod pipeline;
pub mod planner;
pub mod process;
pub mod stage;
pub mod workspace;

pub use error::{Error, Result};
