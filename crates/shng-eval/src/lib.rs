//! Expression evaluation for item attributes
//!
//! Provides [`ExpressionEngine`], the minijinja based implementation of the
//! `Evaluator` contract from `shng-core`. It backs item `eval` expressions,
//! `trigger_condition`, `on_change`/`on_update` rules, hysteresis thresholds,
//! autotimer values and `log_text` rendering.
//!
//! # Bound names
//!
//! - `value`, `caller`, `source`, `dest`, `path`
//! - `items`: the item graph (`items('a.b')`, `items.set('a.b', 1)`)
//! - `item(path)`, `set_item(path, value)`, `age(path)`, `changed_by(path)`
//! - `max(...)`, `min(...)`, `avg(...)`

mod engine;
mod error;
mod items;

pub use engine::ExpressionEngine;
pub use items::{ItemsObject, EVAL_CALLER};
