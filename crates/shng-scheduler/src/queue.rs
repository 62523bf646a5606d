//! Run-queue and trigger-queue
//!
//! The run-queue is ordered by priority only (FIFO within a priority), the
//! trigger-queue by due time and then priority.

use crate::job::{JobRun, JobTarget};
use chrono::DateTime;
use chrono_tz::Tz;
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

/// A job waiting for a worker
#[derive(Debug)]
pub(crate) struct QueuedJob {
    pub priority: u8,
    seq: u64,
    pub target: JobTarget,
    pub run: JobRun,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    // BinaryHeap is a max-heap: the lowest (priority, seq) must compare greatest
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

pub(crate) struct RunQueue {
    heap: Mutex<BinaryHeap<QueuedJob>>,
    available: Condvar,
    seq: AtomicU64,
}

impl RunQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            available: Condvar::new(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn push(&self, priority: u8, target: JobTarget, run: JobRun) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.heap.lock().push(QueuedJob {
            priority,
            seq,
            target,
            run,
        });
        self.available.notify_one();
    }

    pub fn try_pop(&self) -> Option<QueuedJob> {
        self.heap.lock().pop()
    }

    /// Block up to `timeout` for a job
    pub fn pop_timeout(&self, timeout: Duration) -> Option<QueuedJob> {
        let mut heap = self.heap.lock();
        if heap.is_empty() {
            self.available.wait_for(&mut heap, timeout);
        }
        heap.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn wake_all(&self) {
        self.available.notify_all();
    }

    /// Drop the least urgent jobs until at most `ceiling` remain
    ///
    /// Jobs sharing the most urgent priority present are never dropped.
    pub fn shed(&self, ceiling: usize) -> Vec<QueuedJob> {
        let mut heap = self.heap.lock();
        if heap.len() <= ceiling {
            return Vec::new();
        }
        let mut jobs = std::mem::take(&mut *heap).into_sorted_vec();
        // sorted ascending by Ord, so the most urgent job is last
        let protected = jobs.last().map(|j| j.priority).unwrap_or_default();
        let mut dropped = Vec::new();
        let mut index = 0;
        while jobs.len() > ceiling && index < jobs.len() {
            if jobs[index].priority > protected {
                dropped.push(jobs.remove(index));
            } else {
                index += 1;
            }
        }
        heap.extend(jobs);
        dropped
    }
}

/// A job waiting for its due time
#[derive(Debug)]
struct DueJob {
    due: DateTime<Tz>,
    priority: u8,
    seq: u64,
    target: JobTarget,
    run: JobRun,
}

impl PartialEq for DueJob {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DueJob {}

impl PartialOrd for DueJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DueJob {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.due, other.priority, other.seq).cmp(&(self.due, self.priority, self.seq))
    }
}

pub(crate) struct TriggerQueue {
    heap: Mutex<BinaryHeap<DueJob>>,
    seq: AtomicU64,
}

impl TriggerQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
        }
    }

    pub fn push(&self, due: DateTime<Tz>, priority: u8, target: JobTarget, run: JobRun) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.heap.lock().push(DueJob {
            due,
            priority,
            seq,
            target,
            run,
        });
    }

    /// Pop the earliest entry if it is due at `now`
    pub fn pop_due(&self, now: &DateTime<Tz>) -> Option<(u8, JobTarget, JobRun)> {
        let mut heap = self.heap.lock();
        if heap.peek().is_some_and(|job| job.due <= *now) {
            heap.pop().map(|job| (job.priority, job.target, job.run))
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn next_due(&self) -> Option<DateTime<Tz>> {
        self.heap.lock().peek().map(|job| job.due)
    }
}
