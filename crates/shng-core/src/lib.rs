//! Core types for the SmartHome runtime
//!
//! This crate provides the types shared by the item graph and the scheduler:
//! item types and cast rules, the clock abstraction, provenance facts,
//! relative path resolution, the evaluator contract and event payloads.

mod eval;
mod event;
pub mod path;
mod provenance;
pub mod time;
pub mod value;

pub use eval::{
    EvalError, EvalResult, EvalScope, Evaluator, ItemAccess, SharedEvaluator, WRITE_CALLER_VAR,
};
pub use event::{Event, EventData, EventKind};
pub use provenance::{causer, Fact, FactPair, Provenance};
pub use time::{ManualClock, SharedClock, SystemClock, TimeSource};
pub use value::{CastError, CastFn, ItemType};

/// Re-exported so downstream crates agree on the timezone type
pub use chrono_tz::Tz;

/// Payloads fired by items
pub mod events {
    pub use crate::event::{ItemChangedData, ItemUpdatedData};
}
