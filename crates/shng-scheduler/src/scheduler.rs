//! The scheduler: job table, queues and worker pool
//!
//! One main thread ticks roughly every half second. Each tick moves due
//! entries of the trigger-queue to the run-queue, scans the job table for
//! due cycle/cron jobs and re-arms the ones that fired. Workers block on
//! the run-queue and execute jobs by owner kind.

use crate::error::{SchedulerError, SchedulerResult};
use crate::job::{
    parse_cron, parse_cycle, JobChange, JobEntry, JobInfo, JobRun, JobSource, JobSpec, JobTarget,
    DEFAULT_PRIORITY, SCHEDULER_CALLER,
};
use crate::logic::LogicTrigger;
use crate::queue::{QueuedJob, RunQueue, TriggerQueue};
use chrono::{DateTime, Duration as ChronoDuration};
use chrono_tz::Tz;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shng_core::{ItemAccess, SharedClock};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, instrument, trace, warn};

/// Upper bound of jobs executed by one `run_until_idle` call
const IDLE_GUARD: usize = 100_000;

/// What to do when the worker pool is at its ceiling and the backlog keeps growing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Ask the registered restart handler to restart the process
    #[default]
    Restart,
    /// Drop the least urgent queued jobs, restart only if that is not enough
    ShedLoad,
}

/// Scheduler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Workers started with the scheduler
    pub worker_num: usize,
    /// Ceiling of the worker pool
    pub worker_max: usize,
    /// Minimum seconds between two pool adjustments
    pub worker_delta: u64,
    /// Backlog ceiling used by the exhaustion policy
    pub restart_on_num_workers: usize,
    pub exhaustion_policy: ExhaustionPolicy,
    pub tick_ms: u64,
    /// Timeout for the job table lock in the main loop
    pub lock_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_num: 5,
            worker_max: 20,
            worker_delta: 60,
            restart_on_num_workers: 30,
            exhaustion_policy: ExhaustionPolicy::default(),
            tick_ms: 500,
            lock_timeout_ms: 1000,
        }
    }
}

/// Called with a reason when the scheduler wants the process restarted
pub type RestartHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Options of [`Scheduler::trigger`]
#[derive(Debug, Clone)]
pub struct Trigger {
    pub caller: String,
    pub source: JobSource,
    pub value: Option<Value>,
    pub dest: Option<String>,
    pub priority: u8,
    /// Run at this time instead of as soon as possible
    pub at: Option<DateTime<Tz>>,
    /// Owner to run when the job is not in the table
    pub target: Option<JobTarget>,
}

impl Trigger {
    pub fn new(caller: impl Into<String>) -> Self {
        Self {
            caller: caller.into(),
            source: JobSource::None,
            value: None,
            dest: None,
            priority: DEFAULT_PRIORITY,
            at: None,
            target: None,
        }
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = JobSource::Text(source.into());
        self
    }

    pub fn value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn dest(mut self, dest: impl Into<String>) -> Self {
        self.dest = Some(dest.into());
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn at(mut self, at: DateTime<Tz>) -> Self {
        self.at = Some(at);
        self
    }

    pub fn target(mut self, target: JobTarget) -> Self {
        self.target = Some(target);
        self
    }
}

impl Default for Trigger {
    fn default() -> Self {
        Self::new("Logic")
    }
}

/// A worker as reported by [`Scheduler::workers`]
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub name: String,
    /// Job currently executed, `None` when idle
    pub job: Option<String>,
}

struct Worker {
    name: String,
    current: Arc<Mutex<Option<String>>>,
    handle: Option<JoinHandle<()>>,
}

/// Shared handle to the scheduler
pub type SharedScheduler = Arc<Scheduler>;

pub struct Scheduler {
    config: SchedulerConfig,
    clock: SharedClock,
    jobs: Mutex<IndexMap<String, JobEntry>>,
    runq: RunQueue,
    triggerq: TriggerQueue,
    workers: Mutex<Vec<Worker>>,
    last_pool_change: Mutex<Option<DateTime<Tz>>>,
    running: AtomicBool,
    main_thread: Mutex<Option<JoinHandle<()>>>,
    items: RwLock<Option<Weak<dyn ItemAccess>>>,
    restart_handler: RwLock<Option<RestartHandler>>,
    deadlocks: AtomicU64,
    shed: AtomicU64,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            jobs: Mutex::new(IndexMap::new()),
            runq: RunQueue::new(),
            triggerq: TriggerQueue::new(),
            workers: Mutex::new(Vec::new()),
            last_pool_change: Mutex::new(None),
            running: AtomicBool::new(false),
            main_thread: Mutex::new(None),
            items: RwLock::new(None),
            restart_handler: RwLock::new(None),
            deadlocks: AtomicU64::new(0),
            shed: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Attach the item graph handed to logics
    pub fn set_items(&self, items: &Arc<dyn ItemAccess>) {
        *self.items.write() = Some(Arc::downgrade(items));
    }

    pub fn set_restart_handler(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        *self.restart_handler.write() = Some(Arc::new(handler));
    }

    fn items(&self) -> Option<Arc<dyn ItemAccess>> {
        self.items.read().as_ref().and_then(Weak::upgrade)
    }

    /// Add (or replace) a job, returning its final name
    #[instrument(skip(self, spec), fields(job = %spec.name))]
    pub fn add(&self, spec: JobSpec) -> SchedulerResult<String> {
        let name = spec.final_name();
        let now = self.clock.now();

        let (cron, init) = match &spec.cron {
            Some(cron) => {
                let parsed = parse_cron(&name, cron, spec.value.as_ref()).map_err(|e| {
                    warn!(error = %e, "Job not added");
                    e
                })?;
                let entries = (!parsed.entries.is_empty()).then_some(parsed.entries);
                (entries, parsed.init)
            }
            None => (None, None),
        };
        let cycle = match &spec.cycle {
            Some(cycle) => parse_cycle(&name, cycle, spec.value.as_ref()).map_err(|e| {
                warn!(error = %e, "Job not added");
                e
            })?,
            None => None,
        };
        let offset = spec
            .offset
            .or_else(|| cycle.as_ref().map(|_| rand::thread_rng().gen_range(10..15)));

        let mut entry = JobEntry {
            name: name.clone(),
            target: spec.target,
            priority: spec.priority,
            cron,
            cycle,
            next: spec.next,
            value: spec.value,
            active: true,
            source: JobSource::None,
            caller: spec.caller,
        };
        if entry.next.is_none() {
            match init {
                Some((delay, value)) => entry.schedule_init(now, delay, value),
                None => entry.schedule_next(now, offset),
            }
        }

        debug!(
            job = %name,
            kind = entry.target.kind(),
            next = ?entry.next,
            priority = entry.priority,
            "Adding job"
        );
        self.jobs.lock().insert(name.clone(), entry);
        Ok(name)
    }

    /// Change fields of an existing job
    pub fn change(&self, name: &str, change: JobChange) -> SchedulerResult<()> {
        let now = self.clock.now();
        let mut jobs = self.jobs.lock();
        let entry = jobs
            .get_mut(name)
            .ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))?;

        let mut reschedule = false;
        let mut init = None;
        if let Some(cron) = &change.cron {
            let parsed = parse_cron(name, cron, None)?;
            entry.cron = (!parsed.entries.is_empty()).then_some(parsed.entries);
            init = parsed.init;
            reschedule = true;
        }
        if let Some(cycle) = &change.cycle {
            let current = entry.cycle.as_ref().and_then(|c| c.value.clone());
            entry.cycle = parse_cycle(name, cycle, current.as_ref())?;
            reschedule = true;
        }
        if let Some(value) = change.value {
            entry.value = Some(value);
        }
        if let Some(priority) = change.priority {
            entry.priority = priority;
        }
        if let Some(next) = change.next {
            entry.next = Some(next);
        }
        if let Some(active) = change.active {
            entry.active = active;
            if !active {
                entry.next = None;
            }
        }
        if reschedule && entry.active && change.next.is_none() {
            match init {
                Some((delay, value)) => {
                    let value = value.or_else(|| entry.value.clone());
                    entry.schedule_init(now, delay, value);
                }
                None => entry.schedule_next(now, None),
            }
        }
        debug!(job = name, next = ?entry.next, active = entry.active, "Changed job");
        Ok(())
    }

    pub fn remove(&self, name: &str) -> bool {
        let removed = self.jobs.lock().shift_remove(name).is_some();
        if removed {
            debug!(job = name, "Removed job");
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<JobInfo> {
        self.jobs.lock().get(name).map(JobEntry::info)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.jobs.lock().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.jobs.lock().keys().cloned().collect()
    }

    /// Queue a one-off run of a job
    ///
    /// Returns `false` when nothing was queued: the job is deactivated, or
    /// unknown and no target was given.
    #[instrument(skip(self, trigger), fields(caller = %trigger.caller))]
    pub fn trigger(&self, name: &str, trigger: Trigger) -> bool {
        let target = {
            let jobs = self.jobs.lock();
            match (jobs.get(name), trigger.target) {
                (Some(entry), _) if !entry.active => {
                    debug!(job = name, "Job deactivated, ignoring trigger");
                    return false;
                }
                (_, Some(target)) => target,
                (Some(entry), None) => entry.target.clone(),
                (None, None) => {
                    warn!(job = name, "Trigger for unknown job");
                    return false;
                }
            }
        };

        let run = JobRun {
            name: name.to_string(),
            caller: trigger.caller,
            source: trigger.source,
            dest: trigger.dest,
            value: trigger.value,
        };
        match trigger.at {
            Some(at) => self.triggerq.push(at, trigger.priority, target, run),
            None => self.runq.push(trigger.priority, target, run),
        }
        true
    }

    /// One pass of the main loop without pool management
    pub fn tick(&self) {
        let now = self.clock.now();
        while let Some((priority, target, run)) = self.triggerq.pop_due(&now) {
            self.runq.push(priority, target, run);
        }

        let timeout = Duration::from_millis(self.config.lock_timeout_ms);
        let Some(mut jobs) = self.jobs.try_lock_for(timeout) else {
            self.deadlocks.fetch_add(1, Ordering::Relaxed);
            error!(
                timeout_ms = self.config.lock_timeout_ms,
                "Deadlock! Job table lock not acquired, skipping tick"
            );
            return;
        };

        for entry in jobs.values_mut() {
            if let Some(next) = entry.next {
                if next <= now {
                    trace!(job = %entry.name, "Job due");
                    let run = JobRun {
                        name: entry.name.clone(),
                        caller: entry
                            .caller
                            .clone()
                            .unwrap_or_else(|| SCHEDULER_CALLER.to_string()),
                        source: entry.source.clone(),
                        dest: None,
                        value: entry.value.clone(),
                    };
                    self.runq.push(entry.priority, entry.target.clone(), run);
                    entry.next = None;
                }
                continue;
            }
            if entry.active && entry.is_timed() {
                entry.schedule_next(now, None);
            }
        }
    }

    /// Tick and execute on the calling thread until nothing is runnable
    ///
    /// Returns the number of executed jobs.
    pub fn run_until_idle(&self) -> usize {
        let mut executed = 0;
        while executed < IDLE_GUARD {
            self.tick();
            let Some(job) = self.runq.try_pop() else {
                return executed;
            };
            self.execute(job);
            executed += 1;
        }
        warn!(executed, "Queues did not settle");
        executed
    }

    fn execute(&self, job: QueuedJob) {
        let QueuedJob { target, run, .. } = job;
        trace!(job = %run.name, kind = target.kind(), caller = %run.caller, "Executing");

        match target {
            JobTarget::Logic(logic) => {
                let trigger = LogicTrigger {
                    by: run.caller.clone(),
                    source: run.source.name().map(str::to_string),
                    source_details: run.source.details().map(str::to_string),
                    dest: run.dest.clone(),
                    value: run.value.clone(),
                };
                logic.execute(&trigger, &self.clock, self.items());
            }
            JobTarget::Item(item) => {
                let value = run
                    .value
                    .clone()
                    .or_else(|| run.source.is_timed().then(|| item.current_value()));
                let Some(value) = value else {
                    debug!(job = %run.name, "Nothing to write");
                    return;
                };
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    item.scheduled_write(value, &run.caller, run.source.name())
                }));
                if outcome.is_err() {
                    error!(job = %run.name, item = %item.path(), "Item write panicked");
                }
            }
            JobTarget::Callable(callable) => {
                match panic::catch_unwind(AssertUnwindSafe(|| callable(&run))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(job = %run.name, error = %e, "Method failed"),
                    Err(_) => error!(job = %run.name, "Method panicked"),
                }
            }
        }
    }

    /// Spawn workers and the main loop
    pub fn start(self: &Arc<Self>) -> SchedulerResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for _ in 0..self.config.worker_num {
            self.spawn_worker()?;
        }
        let scheduler = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("Scheduler".to_string())
            .spawn(move || scheduler.main_loop())
            .map_err(|source| SchedulerError::Spawn {
                name: "Scheduler".to_string(),
                source,
            })?;
        *self.main_thread.lock() = Some(handle);
        info!(workers = self.config.worker_num, "Scheduler started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the main loop and join all threads
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.runq.wake_all();

        let mut handles: Vec<(String, JoinHandle<()>)> = Vec::new();
        if let Some(handle) = self.main_thread.lock().take() {
            handles.push(("Scheduler".to_string(), handle));
        }
        for worker in self.workers.lock().iter_mut() {
            if let Some(handle) = worker.handle.take() {
                handles.push((worker.name.clone(), handle));
            }
        }
        let me = thread::current().id();
        for (name, handle) in handles {
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                error!(thread = %name, "Thread panicked");
            }
        }
        self.workers.lock().clear();
        info!("Scheduler stopped");
    }

    fn main_loop(self: Arc<Self>) {
        let pause = Duration::from_millis(self.config.tick_ms);
        while self.is_running() {
            self.manage_workers();
            self.tick();
            thread::sleep(pause);
        }
        debug!("Scheduler main loop left");
    }

    fn spawn_worker(self: &Arc<Self>) -> SchedulerResult<()> {
        let mut workers = self.workers.lock();
        let name = format!("Worker-{}", workers.len());
        let current = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&current);
        let scheduler = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || scheduler.worker_loop(&slot))
            .map_err(|source| SchedulerError::Spawn {
                name: name.clone(),
                source,
            })?;
        workers.push(Worker {
            name,
            current,
            handle: Some(handle),
        });
        Ok(())
    }

    fn worker_loop(&self, current: &Mutex<Option<String>>) {
        let wait = Duration::from_millis(self.config.tick_ms);
        while self.is_running() {
            if let Some(job) = self.runq.pop_timeout(wait) {
                *current.lock() = Some(job.run.name.clone());
                self.execute(job);
                *current.lock() = None;
            }
        }
    }

    /// Grow the pool on backlog and apply the exhaustion policy at the ceiling
    pub fn manage_workers(self: &Arc<Self>) {
        let backlog = self.runq.len();
        let workers = self.workers.lock().len();
        if backlog <= workers {
            return;
        }

        let now = self.clock.now();
        {
            let mut last = self.last_pool_change.lock();
            let delta = ChronoDuration::seconds(self.config.worker_delta as i64);
            if last.is_some_and(|at| now - at < delta) {
                return;
            }
            *last = Some(now);
        }

        if workers < self.config.worker_max {
            match self.spawn_worker() {
                Ok(()) => info!(workers = workers + 1, backlog, "Adding worker thread"),
                Err(e) => error!(error = %e, "Unable to add worker thread"),
            }
            return;
        }

        error!(workers, backlog, "Needing more worker threads than allowed");
        self.handle_exhaustion(backlog);
    }

    fn handle_exhaustion(&self, backlog: usize) {
        let ceiling = self.config.restart_on_num_workers;
        match self.config.exhaustion_policy {
            ExhaustionPolicy::Restart => {
                if backlog > ceiling {
                    self.request_restart(&format!(
                        "worker pool exhausted with {backlog} queued jobs"
                    ));
                }
            }
            ExhaustionPolicy::ShedLoad => {
                let dropped = self.runq.shed(ceiling);
                for job in &dropped {
                    warn!(job = %job.run.name, priority = job.priority, "Dropped queued job");
                }
                self.shed.fetch_add(dropped.len() as u64, Ordering::Relaxed);
                let remaining = self.runq.len();
                if remaining > ceiling {
                    self.request_restart(&format!(
                        "{remaining} urgent jobs queued after shedding"
                    ));
                }
            }
        }
    }

    fn request_restart(&self, reason: &str) {
        let handler = self.restart_handler.read().clone();
        match handler {
            Some(handler) => {
                warn!(reason, "Requesting restart");
                handler(reason);
            }
            None => error!(reason, "Restart needed but no restart handler registered"),
        }
    }

    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.workers
            .lock()
            .iter()
            .map(|w| WorkerInfo {
                name: w.name.clone(),
                job: w.current.lock().clone(),
            })
            .collect()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn idle_workers(&self) -> usize {
        self.workers
            .lock()
            .iter()
            .filter(|w| w.current.lock().is_none())
            .count()
    }

    pub fn run_queue_len(&self) -> usize {
        self.runq.len()
    }

    pub fn trigger_queue_len(&self) -> usize {
        self.triggerq.len()
    }

    /// Ticks skipped because the job table lock timed out
    pub fn deadlock_count(&self) -> u64 {
        self.deadlocks.load(Ordering::Relaxed)
    }

    /// Jobs dropped by the `shed_load` policy
    pub fn shed_count(&self) -> u64 {
        self.shed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shng_core::ManualClock;
    use std::sync::atomic::AtomicUsize;

    fn make_test_setup(config: SchedulerConfig) -> (Arc<Scheduler>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_utc(2024, 6, 1, 12, 0, 0));
        let scheduler = Arc::new(Scheduler::new(config, clock.clone()));
        (scheduler, clock)
    }

    fn noop() -> JobTarget {
        JobTarget::callable(|_| Ok(()))
    }

    fn fill(scheduler: &Scheduler, priorities: &[u8]) {
        for (i, p) in priorities.iter().enumerate() {
            scheduler.trigger(
                &format!("job{i}"),
                Trigger::new("Test").priority(*p).target(noop()),
            );
        }
    }

    #[test]
    fn test_deadlock_skips_tick() {
        let config = SchedulerConfig {
            lock_timeout_ms: 10,
            ..Default::default()
        };
        let (scheduler, clock) = make_test_setup(config);
        scheduler
            .add(JobSpec::new("cyclic", noop()).cycle(10).offset(1))
            .unwrap();
        clock.advance_secs(2);

        {
            let _held = scheduler.jobs.lock();
            scheduler.tick();
        }
        assert_eq!(scheduler.deadlock_count(), 1);
        assert_eq!(scheduler.run_queue_len(), 0);

        scheduler.tick();
        assert_eq!(scheduler.run_queue_len(), 1);
    }

    #[test]
    fn test_restart_policy_calls_handler_above_ceiling() {
        let config = SchedulerConfig {
            worker_num: 0,
            worker_max: 0,
            worker_delta: 0,
            restart_on_num_workers: 2,
            ..Default::default()
        };
        let (scheduler, _clock) = make_test_setup(config);
        let restarts = Arc::new(AtomicUsize::new(0));
        let counter = restarts.clone();
        scheduler.set_restart_handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        fill(&scheduler, &[3, 3]);
        scheduler.manage_workers();
        assert_eq!(restarts.load(Ordering::SeqCst), 0);

        fill(&scheduler, &[3]);
        scheduler.manage_workers();
        assert_eq!(restarts.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.run_queue_len(), 3);
    }

    #[test]
    fn test_shed_load_drops_least_urgent() {
        let config = SchedulerConfig {
            worker_num: 0,
            worker_max: 0,
            worker_delta: 0,
            restart_on_num_workers: 2,
            exhaustion_policy: ExhaustionPolicy::ShedLoad,
            ..Default::default()
        };
        let (scheduler, _clock) = make_test_setup(config);
        let restarts = Arc::new(AtomicUsize::new(0));
        let counter = restarts.clone();
        scheduler.set_restart_handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        fill(&scheduler, &[1, 8, 5, 2]);
        scheduler.manage_workers();
        assert_eq!(scheduler.run_queue_len(), 2);
        assert_eq!(scheduler.shed_count(), 2);
        assert_eq!(restarts.load(Ordering::SeqCst), 0);

        let mut left = Vec::new();
        while let Some(job) = scheduler.runq.try_pop() {
            left.push(job.priority);
        }
        assert_eq!(left, vec![1, 2]);
    }

    #[test]
    fn test_pool_grows_once_per_delta() {
        let config = SchedulerConfig {
            worker_num: 0,
            worker_max: 4,
            worker_delta: 60,
            ..Default::default()
        };
        let (scheduler, clock) = make_test_setup(config);
        fill(&scheduler, &[3, 3, 3]);

        scheduler.manage_workers();
        scheduler.manage_workers();
        assert_eq!(scheduler.worker_count(), 1);

        clock.advance_secs(60);
        scheduler.manage_workers();
        assert_eq!(scheduler.worker_count(), 2);
        assert_eq!(scheduler.workers()[1].name, "Worker-1");
    }
}
