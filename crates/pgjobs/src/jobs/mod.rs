pub mod context;
pub mod cron;
pub mod maintenance;
pub mod model;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod store;

pub use context::{HandlerError, JobContext, JobLogger};
pub use model::{JobConfig, JobCounts, NewWorkerJob, WorkerJob, SYSTEM_OWNER};
pub use registry::{boxed, HandlerFuture, JobKind, JobRegistry};
pub use runner::{JobOutcome, JobRunner, Tick};
pub use scheduler::Scheduler;
pub use store::JobStore;
