//! Single-worker job scheduler.
//!
//! At most one backend call is in flight. Pending jobs wait in a
//! [`JobQueue`] ordered by authority tier; a job of strictly higher tier than
//! the running one preempts it on submit. Cancellation is cooperative: the
//! scheduler flips the running job's [`CancellationContext`] and fires its kill
//! handle, the backend call returns on its own, and only then is the slot
//! cleared and the next job dispatched.
//!
//! All scheduler state sits behind one mutex that is never held across an
//! await, so submit, cancel and preemption are single synchronous steps.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backends::Reply;
use crate::error::{BackendError, JobError};
use crate::roles::{AuthorityTier, RoleResolver};
use crate::worker::cancel::{CancelReason, CancellationContext};
use crate::worker::job::{Job, JobOutcome, JobTotals, Requester};
use crate::worker::queue::JobQueue;

/// Notice sent when a backend call fails.
pub const FAILURE_NOTICE: &str = "Something went wrong while generating a reply. Please try again.";

/// Notice sent when the watchdog stops a job.
pub const TIMEOUT_NOTICE: &str = "Your request took too long and was stopped.";

/// Runs one job against a text-generation backend.
#[async_trait]
pub trait Dispatch: Send + Sync {
    /// Produce a reply for `job`, or `None` when there is nothing to send
    /// (e.g. the call observed cancellation). Errors are reserved for
    /// unrecoverable backend failures.
    async fn dispatch(
        &self,
        job: &Job,
        ctx: &CancellationContext,
    ) -> Result<Option<Reply>, BackendError>;
}

/// Delivers finished results back to requesters.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn deliver(&self, requester: &Requester, reply: Reply);

    async fn deliver_failure(&self, requester: &Requester, notice: &str);
}

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of pending jobs (0 = unbounded).
    pub max_queue_depth: usize,
    /// Watchdog limit per backend call (`None` = no limit).
    pub job_timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_queue_depth: 32,
            job_timeout: Some(Duration::from_secs(300)),
        }
    }
}

/// Which running job a stop request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelScope {
    /// The caller's own running job.
    Own,
    /// Whatever is running (top tier only).
    All,
}

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Stopped,
    NoActiveJob,
    Forbidden,
}

/// Receipt for an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTicket {
    pub job_id: Uuid,
    pub tier: AuthorityTier,
    /// Pending jobs that will run before this one.
    pub queued_ahead: usize,
    /// The job went straight into the running slot.
    pub dispatched: bool,
    /// The job preempted the previously running job.
    pub preempted: bool,
}

/// The job currently occupying the running slot.
#[derive(Debug, Clone, Serialize)]
pub struct RunningJob {
    pub job_id: Uuid,
    pub requester: String,
    pub channel: String,
    pub tier: AuthorityTier,
    pub started_at: DateTime<Utc>,
    pub cancelled: bool,
}

/// Read-only snapshot for status displays.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub busy: bool,
    pub queue_depth: usize,
    pub running: Option<RunningJob>,
    pub totals: JobTotals,
    pub accepting: bool,
}

struct RunningSlot {
    job_id: Uuid,
    requester: Requester,
    started_at: DateTime<Utc>,
    ctx: Arc<CancellationContext>,
}

struct SchedulerState {
    queue: JobQueue,
    running: Option<RunningSlot>,
    next_seq: u64,
    /// Finished jobs whose reply has not been handed to the sink yet.
    delivering: usize,
    totals: JobTotals,
    accepting: bool,
}

impl SchedulerState {
    fn is_quiescent(&self) -> bool {
        self.running.is_none() && self.queue.is_empty() && self.delivering == 0
    }
}

/// Single-worker priority scheduler.
pub struct Scheduler {
    config: SchedulerConfig,
    roles: Arc<RoleResolver>,
    dispatcher: Arc<dyn Dispatch>,
    sink: Arc<dyn ReplySink>,
    state: Mutex<SchedulerState>,
    idle: Notify,
}

impl Scheduler {
    /// Create a new scheduler. Must be used from within a Tokio runtime:
    /// dispatch spawns a task per job.
    pub fn new(
        config: SchedulerConfig,
        roles: Arc<RoleResolver>,
        dispatcher: Arc<dyn Dispatch>,
        sink: Arc<dyn ReplySink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            roles,
            dispatcher,
            sink,
            state: Mutex::new(SchedulerState {
                queue: JobQueue::new(),
                running: None,
                next_seq: 0,
                delivering: 0,
                totals: JobTotals::default(),
                accepting: true,
            }),
            idle: Notify::new(),
        })
    }

    pub fn roles(&self) -> &Arc<RoleResolver> {
        &self.roles
    }

    /// Resolve the requester's tier as the scheduler would.
    pub fn tier_of(&self, requester: &Requester) -> AuthorityTier {
        self.roles.resolve_any(requester.identities())
    }

    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Submission ─────────────────────────────────────────────────

    /// Accept a request for scheduling. The reply arrives later through the
    /// [`ReplySink`].
    pub fn submit(
        self: &Arc<Self>,
        requester: Requester,
        text: impl Into<String>,
    ) -> Result<JobTicket, JobError> {
        let tier = self.tier_of(&requester);
        let mut state = self.lock_state();

        if !state.accepting {
            return Err(JobError::ShuttingDown);
        }
        let max = self.config.max_queue_depth;
        if max > 0 && state.queue.len() >= max {
            warn!(
                requester = %requester.display_name(),
                depth = state.queue.len(),
                "Queue full, rejecting job"
            );
            return Err(JobError::QueueFull { max });
        }

        state.next_seq += 1;
        let job = Job::new(state.next_seq, requester, tier, text);
        let job_id = job.id;
        let queued_ahead = state.queue.count_ahead(tier);

        info!(
            job_id = %job_id,
            requester = %job.requester.display_name(),
            tier = %tier,
            queued_ahead,
            "Job queued"
        );

        let mut preempted = false;
        if let Some(ref running) = state.running {
            if tier > running.ctx.owner_tier() && running.ctx.cancel(CancelReason::Preempted { by: tier }) {
                info!(
                    job_id = %running.job_id,
                    running_tier = %running.ctx.owner_tier(),
                    by = %job_id,
                    tier = %tier,
                    "Preempting running job"
                );
                preempted = true;
            }
        }

        state.queue.push(job);
        self.start_next(&mut state);

        let dispatched = state
            .running
            .as_ref()
            .is_some_and(|r| r.job_id == job_id);

        Ok(JobTicket {
            job_id,
            tier,
            queued_ahead,
            dispatched,
            preempted,
        })
    }

    /// Move the highest-priority pending job into the running slot, if the
    /// slot is free.
    fn start_next(self: &Arc<Self>, state: &mut SchedulerState) {
        if state.running.is_some() {
            return;
        }
        let Some(job) = state.queue.pop_highest() else {
            return;
        };

        let ctx = Arc::new(CancellationContext::new(job.id, job.tier));
        state.running = Some(RunningSlot {
            job_id: job.id,
            requester: job.requester.clone(),
            started_at: Utc::now(),
            ctx: Arc::clone(&ctx),
        });

        debug!(
            job_id = %job.id,
            tier = %job.tier,
            pending = state.queue.len(),
            "Dispatching job"
        );

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_job(job, ctx).await;
        });
    }

    // ── Execution ──────────────────────────────────────────────────

    async fn run_job(self: Arc<Self>, job: Job, ctx: Arc<CancellationContext>) {
        let started = std::time::Instant::now();
        let call = AssertUnwindSafe(self.dispatcher.dispatch(&job, &ctx)).catch_unwind();

        let result = match self.config.job_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(caught) => flatten_panic(caught),
                Err(_) => {
                    ctx.cancel(CancelReason::Timeout);
                    Err(BackendError::Timeout(limit))
                }
            },
            None => flatten_panic(call.await),
        };

        // Classified under the lock: a preemption accepted while the slot
        // was still occupied must suppress this reply.
        let outcome = {
            let mut state = self.lock_state();
            let outcome = classify(&ctx, &result);
            if state.running.as_ref().is_some_and(|r| r.job_id == job.id) {
                state.running = None;
            }
            state.totals.record(outcome);
            state.delivering += 1;
            self.start_next(&mut state);
            outcome
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match (outcome, result) {
            (JobOutcome::Completed, Ok(Some(reply))) => {
                info!(
                    job_id = %job.id,
                    backend = %reply.backend_label,
                    elapsed_ms,
                    "Job completed"
                );
                self.sink.deliver(&job.requester, reply).await;
            }
            (JobOutcome::Completed, _) => {
                debug!(job_id = %job.id, elapsed_ms, "Job completed with no reply");
            }
            (JobOutcome::Cancelled, _) => {
                info!(
                    job_id = %job.id,
                    reason = ?ctx.reason(),
                    elapsed_ms,
                    "Job cancelled, reply suppressed"
                );
            }
            (JobOutcome::TimedOut, _) => {
                warn!(job_id = %job.id, elapsed_ms, "Job timed out");
                self.sink.deliver_failure(&job.requester, TIMEOUT_NOTICE).await;
            }
            (JobOutcome::Failed, result) => {
                let reason = result.err().map(|e| e.to_string()).unwrap_or_default();
                error!(job_id = %job.id, elapsed_ms, "Job failed: {reason}");
                self.sink.deliver_failure(&job.requester, FAILURE_NOTICE).await;
            }
        }

        let quiescent = {
            let mut state = self.lock_state();
            state.delivering -= 1;
            state.is_quiescent()
        };
        if quiescent {
            self.idle.notify_waiters();
        }
    }

    // ── Cancellation ───────────────────────────────────────────────

    /// Stop the running job on behalf of `requester`.
    ///
    /// The job stays in the slot until its backend call returns; its output
    /// is discarded. A running job that outranks the caller is `Forbidden`
    /// for `Own` whoever owns it.
    pub fn request_cancel(&self, requester: &Requester, scope: CancelScope) -> CancelOutcome {
        let caller_tier = self.tier_of(requester);
        let state = self.lock_state();

        let outcome = match scope {
            CancelScope::All => {
                if !caller_tier.is_top() {
                    CancelOutcome::Forbidden
                } else if let Some(ref running) = state.running {
                    running.ctx.cancel(CancelReason::StopAll);
                    CancelOutcome::Stopped
                } else {
                    CancelOutcome::NoActiveJob
                }
            }
            CancelScope::Own => match state.running {
                Some(ref running) if running.ctx.owner_tier() > caller_tier => {
                    CancelOutcome::Forbidden
                }
                Some(ref running) if running.requester.same_as(requester) => {
                    running.ctx.cancel(CancelReason::Owner);
                    CancelOutcome::Stopped
                }
                _ => CancelOutcome::NoActiveJob,
            },
        };

        info!(
            requester = %requester.display_name(),
            tier = %caller_tier,
            ?scope,
            ?outcome,
            "Stop requested"
        );
        outcome
    }

    // ── Status & lifecycle ─────────────────────────────────────────

    pub fn snapshot(&self) -> SchedulerStatus {
        let state = self.lock_state();
        SchedulerStatus {
            busy: state.running.is_some(),
            queue_depth: state.queue.len(),
            running: state.running.as_ref().map(|r| RunningJob {
                job_id: r.job_id,
                requester: r.requester.display_name().to_string(),
                channel: r.requester.channel.clone(),
                tier: r.ctx.owner_tier(),
                started_at: r.started_at,
                cancelled: r.ctx.is_cancelled(),
            }),
            totals: state.totals,
            accepting: state.accepting,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.lock_state().running.is_some()
    }

    pub fn queue_depth(&self) -> usize {
        self.lock_state().queue.len()
    }

    /// Wait until nothing is running or pending and every finished job's
    /// reply has been handed to the sink.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.lock_state().is_quiescent() {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting jobs, drop the backlog and cancel the running job.
    /// Returns the number of pending jobs dropped.
    pub fn shutdown(&self) -> usize {
        let mut state = self.lock_state();
        state.accepting = false;
        let dropped = state.queue.drain().len();
        if let Some(ref running) = state.running {
            running.ctx.cancel(CancelReason::Shutdown);
        }
        let quiescent = state.is_quiescent();
        drop(state);

        if quiescent {
            self.idle.notify_waiters();
        }
        info!(dropped, "Scheduler shut down");
        dropped
    }
}

fn flatten_panic(
    caught: Result<Result<Option<Reply>, BackendError>, Box<dyn Any + Send>>,
) -> Result<Option<Reply>, BackendError> {
    caught.unwrap_or_else(|panic| {
        let msg = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(BackendError::Panicked(msg))
    })
}

/// Decide the outcome of a finished call. A cancelled job is never an
/// error, whatever the call returned.
fn classify(
    ctx: &CancellationContext,
    result: &Result<Option<Reply>, BackendError>,
) -> JobOutcome {
    if ctx.is_cancelled() {
        return match ctx.reason() {
            Some(CancelReason::Timeout) => JobOutcome::TimedOut,
            _ => JobOutcome::Cancelled,
        };
    }
    match result {
        Ok(_) => JobOutcome::Completed,
        Err(_) => JobOutcome::Failed,
    }
}
