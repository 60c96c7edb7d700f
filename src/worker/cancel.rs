//! Cooperative cancellation shared between the scheduler and one in-flight
//! backend call.
//!
//! The scheduler is the only writer: it sets the flag and fires the kill
//! handle. The backend call reads the flag at its checkpoints, can await
//! [`CancellationContext::cancelled`] alongside its network I/O, and
//! registers a [`KillHandle`] for any subprocess it spawns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

use serde::Serialize;
use tokio::sync::{Notify, oneshot};
use uuid::Uuid;

use crate::roles::AuthorityTier;

/// Why a running job was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CancelReason {
    /// The owner stopped their own job.
    Owner,
    /// The top tier stopped the running job.
    StopAll,
    /// A strictly higher-tier job was submitted.
    Preempted { by: AuthorityTier },
    /// The per-job watchdog fired.
    Timeout,
    /// The scheduler is shutting down.
    Shutdown,
}

/// Sending half of a subprocess termination signal.
#[derive(Debug)]
pub struct KillHandle {
    tx: oneshot::Sender<()>,
}

/// Receiving half, held by the backend that owns the subprocess.
#[derive(Debug)]
pub struct KillSignal {
    rx: oneshot::Receiver<()>,
}

impl KillHandle {
    /// Create a connected handle/signal pair.
    pub fn channel() -> (KillHandle, KillSignal) {
        let (tx, rx) = oneshot::channel();
        (KillHandle { tx }, KillSignal { rx })
    }

    /// Ask the owning backend to terminate its process.
    pub fn terminate(self) {
        let _ = self.tx.send(());
    }
}

impl KillSignal {
    /// Resolves once `terminate` is called. Never resolves if the handle is
    /// dropped without firing.
    pub async fn triggered(&mut self) {
        if (&mut self.rx).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Per-job cancellation token.
#[derive(Debug)]
pub struct CancellationContext {
    job_id: Uuid,
    owner_tier: AuthorityTier,
    cancelled: AtomicBool,
    reason: OnceLock<CancelReason>,
    notify: Notify,
    kill: Mutex<Option<KillHandle>>,
}

impl CancellationContext {
    pub fn new(job_id: Uuid, owner_tier: AuthorityTier) -> Self {
        Self {
            job_id,
            owner_tier,
            cancelled: AtomicBool::new(false),
            reason: OnceLock::new(),
            notify: Notify::new(),
            kill: Mutex::new(None),
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Tier of the job this context belongs to.
    pub fn owner_tier(&self) -> AuthorityTier {
        self.owner_tier
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// The first reason the job was cancelled for, if any.
    pub fn reason(&self) -> Option<CancelReason> {
        self.reason.get().copied()
    }

    /// Mark the job cancelled, wake waiters and fire the kill handle.
    ///
    /// Returns `true` if this call performed the transition; repeated calls
    /// keep the original reason.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let first = !self.cancelled.swap(true, Ordering::SeqCst);
        if first {
            let _ = self.reason.set(reason);
            self.notify.notify_waiters();
        }

        let handle = self.kill.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            handle.terminate();
        }

        first
    }

    /// Register the kill handle for a spawned subprocess. Fires it
    /// immediately if the job was already cancelled.
    pub fn attach_kill_handle(&self, handle: KillHandle) {
        let mut slot = self.kill.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_cancelled() {
            drop(slot);
            handle.terminate();
            return;
        }
        *slot = Some(handle);
    }

    pub fn has_kill_handle(&self) -> bool {
        self.kill.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Wait until the job is cancelled.
    pub async fn cancelled(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}
