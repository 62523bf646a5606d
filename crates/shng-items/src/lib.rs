//! Item graph for the SmartHome runtime
//!
//! Items form a tree addressed by dotted paths (`living.light.level`). Every
//! write goes through one pipeline: type cast, fade gate, compare and commit
//! under the item's lock, provenance bookkeeping, then notification of
//! everything watching the item. Dependent expressions, logics, hysteresis
//! outputs and timers run as scheduler jobs, never by direct recursion, so
//! cyclic graphs are fine.
//!
//! The [`ItemRegistry`] builds the tree from configuration, owns the
//! path index and runs the two startup phases.
//!
//! # Example
//!
//! ```ignore
//! let registry = ItemRegistry::new(runtime, RegistryOptions::default());
//! registry.load(tree)?;
//! registry.init_prerun();
//! registry.start_schedulers();
//! registry.init_run();
//! ```

mod attributes;
pub mod audit;
pub mod cache;
mod error;
mod fade;
mod hysteresis;
mod item;
mod plugin;
mod registry;
mod rules;
mod runtime;
mod structs;

#[cfg(test)]
mod testing;

pub use attributes::{ItemConfig, OnRule, Threshold, TimedValue, CORE_ATTRIBUTES};
pub use audit::{ChangeLog, LogRules, CHANGE_LOG_TARGET};
pub use cache::CacheEntry;
pub use error::{ItemError, ItemResult};
pub use fade::FadeRequest;
pub use hysteresis::HysteresisConfig;
pub use item::{
    Element, Item, ListIndex, MethodTrigger, AUTOTIMER_CALLER, FADER_CALLER, HYSTERESIS_CALLER,
    INIT_CALLER, ON_CHANGE_CALLER, ON_UPDATE_CALLER, TIMER_CALLER,
};
pub use plugin::{update_callback, Plugin, SharedPlugin};
pub use registry::{ItemRegistry, RegistryOptions};
pub use runtime::{ItemRuntime, SharedItemRuntime};
pub use structs::StructRegistry;
