//! Services every item reaches for while it runs

use shng_core::{SharedClock, SharedEvaluator};
use shng_event_bus::SharedEventBus;
use shng_scheduler::SharedScheduler;
use std::path::PathBuf;
use std::sync::Arc;

/// Scheduler, evaluator, clock and optional cache directory and event bus
///
/// Built once in the composition root and shared by all items.
pub struct ItemRuntime {
    pub scheduler: SharedScheduler,
    pub evaluator: SharedEvaluator,
    pub clock: SharedClock,
    /// Directory holding one cache file per cached item
    pub cache_dir: Option<PathBuf>,
    pub events: Option<SharedEventBus>,
}

impl ItemRuntime {
    /// Runtime using the scheduler's clock
    pub fn new(scheduler: SharedScheduler, evaluator: SharedEvaluator) -> Self {
        let clock = scheduler.clock().clone();
        Self {
            scheduler,
            evaluator,
            clock,
            cache_dir: None,
            events: None,
        }
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn with_events(mut self, events: SharedEventBus) -> Self {
        self.events = Some(events);
        self
    }
}

impl std::fmt::Debug for ItemRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemRuntime")
            .field("tz", &self.clock.tz())
            .field("cache_dir", &self.cache_dir)
            .field("events", &self.events.is_some())
            .finish_non_exhaustive()
    }
}

/// Shared handle to the runtime
pub type SharedItemRuntime = Arc<ItemRuntime>;
