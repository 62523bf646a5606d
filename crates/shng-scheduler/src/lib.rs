//! Scheduler for the SmartHome runtime
//!
//! Jobs live in a named job table and are owned by an item, a [`Logic`] or a
//! plain callable. A job fires when its `next` time passes (cycles, crontab
//! entries, one-off timers) or when it is triggered explicitly. Fired jobs
//! go through a priority run-queue to a growable pool of worker threads.
//!
//! Tests drive the scheduler without threads: advance a
//! [`shng_core::ManualClock`] and call [`Scheduler::run_until_idle`].

pub mod cron;
mod error;
mod job;
mod logic;
mod queue;
mod scheduler;

pub use error::{JobError, SchedulerError, SchedulerResult};
pub use job::{
    CronEntry, Cycle, JobCallable, JobChange, JobEntry, JobInfo, JobRun, JobSource, JobSpec,
    JobTarget, ScheduledItem, DEFAULT_PRIORITY, SCHEDULER_CALLER,
};
pub use logic::{Logic, LogicBody, LogicContext, LogicError, LogicMethodTrigger, LogicTrigger};
pub use scheduler::{
    ExhaustionPolicy, RestartHandler, Scheduler, SchedulerConfig, SharedScheduler, Trigger,
    WorkerInfo,
};
