//! Job table entries and the builders used to create and change them

use crate::cron::Crontab;
use crate::error::{JobError, SchedulerError, SchedulerResult};
use crate::logic::Logic;
use chrono::{DateTime, Duration, Timelike};
use chrono_tz::Tz;
use serde::Serialize;
use serde_json::Value;
use shng_core::time::{duration_seconds, to_seconds};
use shng_core::value::parse_literal;
use std::sync::Arc;
use tracing::{debug, warn};

/// Default job priority, lower is more urgent
pub const DEFAULT_PRIORITY: u8 = 3;

/// Caller recorded for jobs fired by the scheduler itself
pub const SCHEDULER_CALLER: &str = "Scheduler";

/// An item as seen by the scheduler
pub trait ScheduledItem: Send + Sync {
    fn path(&self) -> String;

    /// Value written by cycle/cron jobs that carry none of their own
    fn current_value(&self) -> Value;

    /// Write a value on behalf of a job
    fn scheduled_write(&self, value: Value, caller: &str, source: Option<&str>);
}

/// Plain function jobs
pub type JobCallable = Arc<dyn Fn(&JobRun) -> Result<(), JobError> + Send + Sync>;

/// What a job executes
#[derive(Clone)]
pub enum JobTarget {
    Item(Arc<dyn ScheduledItem>),
    Logic(Arc<Logic>),
    Callable(JobCallable),
}

impl JobTarget {
    pub fn callable<F>(f: F) -> Self
    where
        F: Fn(&JobRun) -> Result<(), JobError> + Send + Sync + 'static,
    {
        Self::Callable(Arc::new(f))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Item(_) => "item",
            Self::Logic(_) => "logic",
            Self::Callable(_) => "method",
        }
    }
}

impl std::fmt::Debug for JobTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Item(item) => write!(f, "Item({})", item.path()),
            Self::Logic(logic) => write!(f, "Logic({})", logic.name()),
            Self::Callable(_) => f.write_str("Callable"),
        }
    }
}

/// Why a job ran
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "source", content = "details", rename_all = "lowercase")]
pub enum JobSource {
    #[default]
    None,
    /// Fired by a cycle, details hold the period
    Cycle(String),
    /// Fired by a crontab entry
    Cron(String),
    /// Free-form source given with a trigger, usually an item path
    Text(String),
}

impl JobSource {
    /// Short source name: `cycle`, `cron` or the trigger text
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::None => None,
            Self::Cycle(_) => Some("cycle"),
            Self::Cron(_) => Some("cron"),
            Self::Text(text) => Some(text),
        }
    }

    pub fn details(&self) -> Option<&str> {
        match self {
            Self::Cycle(details) | Self::Cron(details) => Some(details),
            _ => None,
        }
    }

    pub fn is_timed(&self) -> bool {
        matches!(self, Self::Cycle(_) | Self::Cron(_))
    }
}

/// Everything a worker knows about one execution
#[derive(Debug, Clone)]
pub struct JobRun {
    pub name: String,
    pub caller: String,
    pub source: JobSource,
    pub dest: Option<String>,
    pub value: Option<Value>,
}

/// One crontab entry with its optional value
#[derive(Debug, Clone)]
pub struct CronEntry {
    pub crontab: Crontab,
    pub value: Option<Value>,
}

/// A repeating period with its optional value
#[derive(Debug, Clone, PartialEq)]
pub struct Cycle {
    pub seconds: i64,
    pub value: Option<Value>,
}

/// A row of the job table
#[derive(Debug, Clone)]
pub struct JobEntry {
    pub name: String,
    pub target: JobTarget,
    pub priority: u8,
    pub cron: Option<Vec<CronEntry>>,
    pub cycle: Option<Cycle>,
    pub next: Option<DateTime<Tz>>,
    pub value: Option<Value>,
    pub active: bool,
    pub source: JobSource,
    /// Caller used instead of `Scheduler` when the job fires
    pub caller: Option<String>,
}

impl JobEntry {
    pub fn is_timed(&self) -> bool {
        self.cron.is_some() || self.cycle.is_some()
    }

    /// Compute `next` from the cycle and crontab entries
    ///
    /// The cycle fires `offset` (or one period) from now; a crontab entry
    /// that comes earlier wins.
    pub(crate) fn schedule_next(&mut self, now: DateTime<Tz>, offset: Option<i64>) {
        let now = now.with_nanosecond(0).unwrap_or(now);
        let mut candidate: Option<(DateTime<Tz>, Option<Value>, JobSource)> = None;

        if let Some(cycle) = &self.cycle {
            let delay = offset.unwrap_or(cycle.seconds);
            candidate = Some((
                now + Duration::seconds(delay),
                cycle.value.clone(),
                JobSource::Cycle(cycle.seconds.to_string()),
            ));
        }

        for entry in self.cron.iter().flatten() {
            let Some(at) = entry.crontab.next_after(&now) else {
                continue;
            };
            if candidate.as_ref().map_or(true, |(best, _, _)| at < *best) {
                candidate = Some((
                    at,
                    entry.value.clone(),
                    JobSource::Cron(entry.crontab.entry().to_string()),
                ));
            }
        }

        match candidate {
            Some((next, value, source)) => {
                debug!(job = %self.name, next = %next, source = ?source, "Next time");
                self.next = Some(next);
                self.value = value;
                self.source = source;
            }
            None => self.next = None,
        }
    }

    /// Schedule the one-off `init` run `delay` seconds from now
    pub(crate) fn schedule_init(&mut self, now: DateTime<Tz>, delay: i64, value: Option<Value>) {
        let now = now.with_nanosecond(0).unwrap_or(now);
        self.next = Some(now + Duration::seconds(delay));
        self.value = value;
        self.source = JobSource::Cron("init".to_string());
    }

    pub fn info(&self) -> JobInfo {
        JobInfo {
            name: self.name.clone(),
            kind: self.target.kind(),
            priority: self.priority,
            cron: self.cron.as_ref().map(|entries| {
                entries
                    .iter()
                    .map(|e| e.crontab.entry().to_string())
                    .collect()
            }),
            cycle: self.cycle.as_ref().map(|c| c.seconds),
            next: self.next,
            value: self.value.clone(),
            active: self.active,
            source: self.source.clone(),
        }
    }
}

/// Snapshot of a job for introspection
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub name: String,
    pub kind: &'static str,
    pub priority: u8,
    pub cron: Option<Vec<String>>,
    pub cycle: Option<i64>,
    pub next: Option<DateTime<Tz>>,
    pub value: Option<Value>,
    pub active: bool,
    pub source: JobSource,
}

/// Parameters of `Scheduler::add`
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub target: JobTarget,
    pub priority: u8,
    pub cron: Option<Value>,
    pub cycle: Option<Value>,
    pub value: Option<Value>,
    pub offset: Option<i64>,
    pub next: Option<DateTime<Tz>>,
    pub caller: Option<String>,
    pub instance: Option<String>,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, target: JobTarget) -> Self {
        Self {
            name: name.into(),
            target,
            priority: DEFAULT_PRIORITY,
            cron: None,
            cycle: None,
            value: None,
            offset: None,
            next: None,
            caller: None,
            instance: None,
        }
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Crontab string (`|` separated) or list of `desc[=value]` entries
    pub fn cron(mut self, cron: impl Into<Value>) -> Self {
        self.cron = Some(cron.into());
        self
    }

    /// Seconds, `"N"`, `"N=value"` or `{N: value}`
    pub fn cycle(mut self, cycle: impl Into<Value>) -> Self {
        self.cycle = Some(cycle.into());
        self
    }

    pub fn value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn offset(mut self, seconds: i64) -> Self {
        self.offset = Some(seconds);
        self
    }

    pub fn next(mut self, at: DateTime<Tz>) -> Self {
        self.next = Some(at);
        self
    }

    pub fn caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }

    /// Instance name of a multi-instance owner, appended as `_<instance>`
    pub fn instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    pub(crate) fn final_name(&self) -> String {
        match self.instance.as_deref() {
            Some(instance) if !instance.is_empty() => format!("{}_{}", self.name, instance),
            _ => self.name.clone(),
        }
    }
}

/// Parameters of `Scheduler::change`
///
/// `Some(Value::Null)` for `cron` or `cycle` removes that schedule.
#[derive(Debug, Clone, Default)]
pub struct JobChange {
    pub active: Option<bool>,
    pub cron: Option<Value>,
    pub cycle: Option<Value>,
    pub value: Option<Value>,
    pub priority: Option<u8>,
    pub next: Option<DateTime<Tz>>,
}

impl JobChange {
    pub fn active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }

    pub fn cron(mut self, cron: impl Into<Value>) -> Self {
        self.cron = Some(cron.into());
        self
    }

    pub fn cycle(mut self, cycle: impl Into<Value>) -> Self {
        self.cycle = Some(cycle.into());
        self
    }

    pub fn value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn next(mut self, at: DateTime<Tz>) -> Self {
        self.next = Some(at);
        self
    }
}

/// Crontab entries split off into table entries and an optional `init` run
#[derive(Debug, Default)]
pub(crate) struct ParsedCron {
    pub entries: Vec<CronEntry>,
    /// Seconds until the one-off `init` run, with its value
    pub init: Option<(i64, Option<Value>)>,
}

/// Offset of `init` runs
const INIT_DELAY: i64 = 5;

pub(crate) fn parse_cron(
    name: &str,
    cron: &Value,
    default_value: Option<&Value>,
) -> SchedulerResult<ParsedCron> {
    let raw: Vec<String> = match cron {
        Value::Null => Vec::new(),
        Value::String(s) => s.split('|').map(str::to_string).collect(),
        Value::Array(entries) => entries
            .iter()
            .map(|e| match e {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        other => {
            return Err(SchedulerError::InvalidCron {
                name: name.to_string(),
                entry: other.to_string(),
            })
        }
    };

    let mut parsed = ParsedCron::default();
    for entry in raw {
        let (desc, value) = match entry.split_once('=') {
            Some((desc, value)) if !value.trim().is_empty() => {
                (desc.trim().to_string(), Some(literal(value.trim())))
            }
            Some((desc, _)) => (desc.trim().to_string(), None),
            None => (entry.trim().to_string(), None),
        };
        if desc.is_empty() || desc == "None" {
            continue;
        }
        let value = value.or_else(|| default_value.cloned());

        if desc.to_lowercase().starts_with("init") {
            let delta = desc[4..].trim();
            let delay = if delta.is_empty() {
                INIT_DELAY
            } else {
                match delta.replace(' ', "").parse::<i64>() {
                    Ok(n) => INIT_DELAY + n,
                    Err(_) => {
                        warn!(job = name, entry = %desc, "Invalid init offset, using default");
                        INIT_DELAY
                    }
                }
            };
            parsed.init = Some((delay.max(0), value));
            continue;
        }

        match Crontab::parse(&desc) {
            Some(crontab) => parsed.entries.push(CronEntry { crontab, value }),
            None => {
                return Err(SchedulerError::InvalidCron {
                    name: name.to_string(),
                    entry: desc,
                })
            }
        }
    }
    Ok(parsed)
}

/// Parse a cycle given as seconds, `"N"`, `"N=v"`, `"N;v"`, `"N:v"`, `"{N:v}"` or `{N: v}`
pub(crate) fn parse_cycle(
    name: &str,
    cycle: &Value,
    default_value: Option<&Value>,
) -> SchedulerResult<Option<Cycle>> {
    let invalid = || SchedulerError::InvalidCycle {
        name: name.to_string(),
        cycle: cycle.to_string(),
    };

    let (seconds, value) = match cycle {
        Value::Null => return Ok(None),
        Value::Number(_) => (duration_seconds(cycle), None),
        Value::String(s) => {
            let s = s.trim().trim_start_matches('{').trim_end_matches('}');
            match s.split_once(['=', ';', ':']) {
                Some((period, value)) => {
                    let value = value.trim();
                    (
                        to_seconds(period),
                        (!value.is_empty() && value != "None").then(|| literal(value)),
                    )
                }
                None => (to_seconds(s), None),
            }
        }
        Value::Object(map) => {
            let Some((period, value)) = map.iter().next() else {
                return Err(invalid());
            };
            (to_seconds(period), (!value.is_null()).then(|| value.clone()))
        }
        _ => return Err(invalid()),
    };

    match seconds {
        Some(seconds) if seconds > 0 => Ok(Some(Cycle {
            seconds,
            value: value.or_else(|| default_value.cloned()),
        })),
        _ => Err(invalid()),
    }
}

fn literal(raw: &str) -> Value {
    parse_literal(raw).unwrap_or_else(|| Value::String(raw.to_string()))
}
