pub mod config;
pub mod db;
pub mod error;
pub mod ipc;
pub mod jobs;
pub mod logging;
pub mod supervisor;
pub mod tx;

pub use error::JobsError;
