pub mod classifier;
pub mod config;
pub mod error;
pub mod governor;
pub mod language;
pub mod orchestrator;
pub mod queue;
pub mod scheduler;
pub mod submission;
pub mod worker;
pub mod workspace;

pub use classifier::{ExecutionResult, Outcome};
pub use scheduler::{JobHandle, Scheduler};
pub use submission::Submission;

/// Milliseconds since the Unix epoch
pub fn unix_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
