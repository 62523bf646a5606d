//! Shared fixtures for unit tests

use crate::registry::{ItemRegistry, RegistryOptions};
use crate::runtime::ItemRuntime;
use serde_json::Value;
use shng_core::{ItemAccess, ManualClock, SharedClock};
use shng_eval::ExpressionEngine;
use shng_scheduler::{Scheduler, SchedulerConfig};
use std::sync::Arc;

/// Registry loaded from `tree` and prerun, on a manual clock
///
/// Jobs only run when the test calls `scheduler.run_until_idle()`.
pub(crate) fn make_test_setup(tree: Value) -> (Arc<ItemRegistry>, Arc<Scheduler>, Arc<ManualClock>) {
    make_test_setup_with_options(tree, RegistryOptions::default())
}

pub(crate) fn make_test_setup_with_options(
    tree: Value,
    options: RegistryOptions,
) -> (Arc<ItemRegistry>, Arc<Scheduler>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::at_utc(2024, 3, 1, 12, 0, 0));
    let scheduler = Arc::new(Scheduler::new(
        SchedulerConfig::default(),
        clock.clone() as SharedClock,
    ));
    let runtime = ItemRuntime::new(scheduler.clone(), Arc::new(ExpressionEngine::new()));
    let registry = ItemRegistry::new(Arc::new(runtime), options);
    let items: Arc<dyn ItemAccess> = registry.clone();
    scheduler.set_items(&items);
    registry.load(tree).expect("test item tree loads");
    registry.init_prerun();
    (registry, scheduler, clock)
}
