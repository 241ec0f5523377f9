//! Dispatch pipeline: the task queue and dedup ledger, the submission
//! fan-out scheduler, send pacing, and the per-channel workers.

pub mod scheduler;
pub mod store;
pub mod throttle;
pub mod types;
pub mod worker;

pub use scheduler::CampaignScheduler;
pub use store::SqliteDispatchStore;
pub use throttle::{AntiBanThrottle, ThrottleConfig, ThrottleError};
pub use types::{CampaignStats, ClaimOutcome, DispatchTask, TaskState};
pub use worker::{run_worker_once, start_worker, WorkerConfig, WorkerControl};
