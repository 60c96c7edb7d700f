//! Job types: the requester, the request and how it ended.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::roles::AuthorityTier;

/// Identity of the person behind a request, plus the routing data needed
/// to answer them on the channel they wrote from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requester {
    /// Channel name the request arrived on (e.g. "telegram").
    pub channel: String,
    /// Stable user id on that channel.
    pub id: String,
    /// Human-readable handle, if the channel provides one.
    pub name: Option<String>,
    /// Channel-specific reply routing (e.g. `chat_id`).
    pub metadata: serde_json::Value,
}

impl Requester {
    pub fn new(channel: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            id: id.into(),
            name: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// All identities the role table may list this requester under.
    pub fn identities(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.id.as_str()).chain(self.name.as_deref())
    }

    /// Whether two requesters are the same person on the same channel.
    pub fn same_as(&self, other: &Requester) -> bool {
        self.channel == other.channel && self.id == other.id
    }

    /// Name to show in replies and logs.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// A request accepted for scheduling. Immutable once created.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    /// Monotonic submission number, the final FIFO tie-break.
    pub seq: u64,
    pub requester: Requester,
    pub tier: AuthorityTier,
    pub text: String,
    pub submitted_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        seq: u64,
        requester: Requester,
        tier: AuthorityTier,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            seq,
            requester,
            tier,
            text: text.into(),
            submitted_at: Utc::now(),
        }
    }
}

/// How a dispatched job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    /// Backend produced a result (delivered unless it was empty).
    Completed,
    /// Stopped by its owner, the top tier, a higher-tier job or shutdown.
    /// Output is suppressed.
    Cancelled,
    /// Backend returned an error or panicked.
    Failed,
    /// The watchdog stopped the job.
    TimedOut,
}

impl std::fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        };
        write!(f, "{s}")
    }
}

/// Running totals of finished jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobTotals {
    pub completed: u64,
    pub cancelled: u64,
    pub failed: u64,
    pub timed_out: u64,
}

impl JobTotals {
    pub fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Completed => self.completed += 1,
            JobOutcome::Cancelled => self.cancelled += 1,
            JobOutcome::Failed => self.failed += 1,
            JobOutcome::TimedOut => self.timed_out += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.completed + self.cancelled + self.failed + self.timed_out
    }
}
