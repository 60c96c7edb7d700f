//! Worker system: single-slot job execution with priorities.
//!
//! Core components:
//! - `job`: Job, Requester and outcome types
//! - `queue`: Pending jobs ordered by tier, FIFO within a tier
//! - `cancel`: Cooperative cancellation token and subprocess kill handle
//! - `scheduler`: Running slot, preemption, cancellation and draining

pub mod cancel;
pub mod job;
pub mod queue;
pub mod scheduler;

pub use cancel::{CancelReason, CancellationContext, KillHandle, KillSignal};
pub use job::{Job, JobOutcome, JobTotals, Requester};
pub use queue::JobQueue;
pub use scheduler::{
    CancelOutcome, CancelScope, Dispatch, JobTicket, ReplySink, RunningJob, Scheduler,
    SchedulerConfig, SchedulerStatus,
};
