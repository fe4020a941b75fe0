pub mod log_store;
pub mod model;
pub mod poller;
pub mod reconciler;

pub use log_store::{LiveLog, LogStore};
pub use model::{
    Channel, JobFailure, JobId, JobKind, JobOutcome, JobSnapshot, JobStatus, LogEntry, LogKind,
};
pub use poller::{JobPoller, JobSource, PollConfig, PollError};
pub use reconciler::{JobReconciler, OutcomeCell, ReconcileError, ReconcilePhase};
