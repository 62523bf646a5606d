//! Logics: named user rules executed by scheduler workers

use chrono::DateTime;
use chrono_tz::Tz;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use shng_core::{ItemAccess, SharedClock};
use std::panic::{self, AssertUnwindSafe, Location};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

/// How a logic run ended early
#[derive(Debug, Error)]
pub enum LogicError {
    /// Deliberate early exit, not an error
    #[error("logic left")]
    Leave,

    #[error("{message} (at {location})")]
    Failed {
        message: String,
        location: &'static Location<'static>,
    },
}

impl LogicError {
    #[track_caller]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            location: Location::caller(),
        }
    }
}

/// Why a logic is running
#[derive(Debug, Clone, Default, Serialize)]
pub struct LogicTrigger {
    pub by: String,
    pub source: Option<String>,
    pub source_details: Option<String>,
    pub dest: Option<String>,
    pub value: Option<Value>,
}

/// Everything a logic body can reach while it runs
pub struct LogicContext<'a> {
    pub logic: &'a Logic,
    pub trigger: &'a LogicTrigger,
    pub clock: &'a SharedClock,
    pub items: Option<Arc<dyn ItemAccess>>,
}

impl LogicContext<'_> {
    /// Read an item value, `None` when no item graph is attached or the path is unknown
    pub fn item(&self, path: &str) -> Option<Value> {
        self.items.as_ref()?.item_value(path)
    }

    /// Write an item with the logic as caller
    pub fn set_item(&self, path: &str, value: Value) -> bool {
        let caller = format!("Logic:{}", self.logic.name());
        self.items
            .as_ref()
            .is_some_and(|items| items.write_item(path, value, &caller, None))
    }
}

/// The body of a logic
pub trait LogicBody: Send + Sync {
    fn run(&self, ctx: &LogicContext<'_>) -> Result<(), LogicError>;
}

impl<F> LogicBody for F
where
    F: Fn(&LogicContext<'_>) -> Result<(), LogicError> + Send + Sync,
{
    fn run(&self, ctx: &LogicContext<'_>) -> Result<(), LogicError> {
        self(ctx)
    }
}

/// Callback run after every logic execution: `(logic, by, source, dest)`
pub type LogicMethodTrigger =
    Arc<dyn Fn(&Logic, &str, Option<&str>, Option<&str>) + Send + Sync>;

/// A named rule
pub struct Logic {
    name: String,
    enabled: AtomicBool,
    body: Box<dyn LogicBody>,
    last_run: Mutex<Option<DateTime<Tz>>>,
    method_triggers: Mutex<Vec<LogicMethodTrigger>>,
}

impl std::fmt::Debug for Logic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logic")
            .field("name", &self.name)
            .field("enabled", &self.is_enabled())
            .field("last_run", &self.last_run())
            .finish_non_exhaustive()
    }
}

impl Logic {
    pub fn new(name: impl Into<String>, body: impl LogicBody + 'static) -> Self {
        Self {
            name: name.into(),
            enabled: AtomicBool::new(true),
            body: Box::new(body),
            last_run: Mutex::new(None),
            method_triggers: Mutex::new(Vec::new()),
        }
    }

    /// Build a logic from a closure
    pub fn from_fn<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&LogicContext<'_>) -> Result<(), LogicError> + Send + Sync + 'static,
    {
        Self::new(name, body)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the scheduler job that runs this logic
    pub fn job_name(&self) -> String {
        format!("logics.{}", self.name)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn last_run(&self) -> Option<DateTime<Tz>> {
        *self.last_run.lock()
    }

    pub fn add_method_trigger(&self, trigger: LogicMethodTrigger) {
        self.method_triggers.lock().push(trigger);
    }

    /// Run the body, containing errors and panics
    pub(crate) fn execute(
        &self,
        trigger: &LogicTrigger,
        clock: &SharedClock,
        items: Option<Arc<dyn ItemAccess>>,
    ) {
        let logic = self.job_name();
        if !self.is_enabled() {
            debug!(logic = %logic, "Logic disabled, ignoring trigger");
            return;
        }
        debug!(logic = %logic, by = %trigger.by, source = ?trigger.source, "Triggered");

        let ctx = LogicContext {
            logic: self,
            trigger,
            clock,
            items,
        };
        match panic::catch_unwind(AssertUnwindSafe(|| self.body.run(&ctx))) {
            Ok(Ok(())) => {}
            Ok(Err(LogicError::Leave)) => info!(logic = %logic, "Logic left"),
            Ok(Err(e)) => error!(logic = %logic, error = %e, "Logic failed"),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(logic = %logic, panic = %message, "Logic panicked");
            }
        }

        *self.last_run.lock() = Some(clock.now());

        let callbacks: Vec<LogicMethodTrigger> = self.method_triggers.lock().clone();
        for callback in callbacks {
            callback(
                self,
                &trigger.by,
                trigger.source.as_deref(),
                trigger.dest.as_deref(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shng_core::ManualClock;
    use std::sync::atomic::AtomicUsize;

    fn make_test_setup() -> SharedClock {
        Arc::new(ManualClock::at_utc(2024, 5, 1, 8, 0, 0))
    }

    fn trigger(by: &str) -> LogicTrigger {
        LogicTrigger {
            by: by.to_string(),
            source: Some("living.motion".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_execute_records_last_run_and_calls_method_triggers() {
        let clock = make_test_setup();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let logic = Logic::from_fn("lights", move |ctx| {
            assert_eq!(ctx.trigger.by, "Item");
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        logic.add_method_trigger(Arc::new(move |logic: &Logic, by: &str, source: Option<&str>, _dest: Option<&str>| {
            sink.lock()
                .push(format!("{}:{}:{}", logic.name(), by, source.unwrap_or("-")));
        }));

        logic.execute(&trigger("Item"), &clock, None);

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(logic.last_run(), Some(clock.now()));
        assert_eq!(*seen.lock(), vec!["lights:Item:living.motion".to_string()]);
    }

    #[test]
    fn test_leave_and_failure_still_count_as_run() {
        let clock = make_test_setup();
        let leaving = Logic::from_fn("leaving", |_| Err(LogicError::Leave));
        leaving.execute(&trigger("Logic"), &clock, None);
        assert!(leaving.last_run().is_some());

        let failing = Logic::from_fn("failing", |_| {
            Err(LogicError::failed("sensor missing"))
        });
        failing.execute(&trigger("Logic"), &clock, None);
        assert!(failing.last_run().is_some());
    }

    #[test]
    fn test_panics_are_contained() {
        let clock = make_test_setup();
        let logic = Logic::from_fn("boom", |_| {
            panic!("division by zero")
        });
        logic.execute(&trigger("Logic"), &clock, None);
        assert!(logic.last_run().is_some());
    }

    #[test]
    fn test_disabled_logic_does_not_run() {
        let clock = make_test_setup();
        let logic = Logic::from_fn("off", |_| Ok(()));
        logic.set_enabled(false);
        logic.execute(&trigger("Logic"), &clock, None);
        assert!(logic.last_run().is_none());
    }

    #[test]
    fn test_failed_records_location() {
        match LogicError::failed("x") {
            LogicError::Failed { location, .. } => assert!(location.file().ends_with("logic.rs")),
            LogicError::Leave => panic!("expected failure"),
        }
    }
}
