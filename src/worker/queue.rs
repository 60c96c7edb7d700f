//! Pending-job backlog ordered by authority tier, FIFO within a tier.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::roles::AuthorityTier;
use crate::worker::job::Job;

/// Heap entry. Greater = extracted first: higher tier, then earlier
/// `submitted_at`, then lower submission sequence.
#[derive(Debug)]
struct Queued(Job);

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .tier
            .cmp(&other.0.tier)
            .then_with(|| other.0.submitted_at.cmp(&self.0.submitted_at))
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

/// Priority queue of jobs that have not started yet.
#[derive(Debug, Default)]
pub struct JobQueue {
    heap: BinaryHeap<Queued>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, job: Job) {
        self.heap.push(Queued(job));
    }

    /// Remove and return the highest-priority job.
    pub fn pop_highest(&mut self) -> Option<Job> {
        self.heap.pop().map(|q| q.0)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Number of pending jobs that a newly submitted job of `tier` would run
    /// after (all jobs of the same or higher tier).
    pub fn count_ahead(&self, tier: AuthorityTier) -> usize {
        self.heap.iter().filter(|q| q.0.tier >= tier).count()
    }

    /// Remove every pending job, highest priority first.
    pub fn drain(&mut self) -> Vec<Job> {
        let mut jobs = Vec::with_capacity(self.heap.len());
        while let Some(job) = self.pop_highest() {
            jobs.push(job);
        }
        jobs
    }
}
