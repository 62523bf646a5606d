//! Expression evaluation contract
//!
//! Items never interpret expressions themselves. They hand the expression text
//! and an [`EvalScope`] to an injected [`Evaluator`], which may read and write
//! other items through the [`ItemAccess`] handle in the scope.

use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

/// Scope variable naming the caller recorded for writes issued by the expression
pub const WRITE_CALLER_VAR: &str = "write_caller";

/// Result type for expression evaluation
pub type EvalResult<T> = Result<T, EvalError>;

/// Errors raised while evaluating an expression
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvalError {
    /// The expression could not be parsed
    #[error("invalid expression '{expression}': {message}")]
    Syntax { expression: String, message: String },

    /// The expression failed while running
    #[error("failed to evaluate '{expression}': {message}")]
    Runtime { expression: String, message: String },

    /// An item referenced by the expression does not exist
    #[error("unknown item '{path}' in '{expression}'")]
    UnknownItem { expression: String, path: String },

    /// The result has the wrong shape for the caller
    #[error("expression '{expression}' returned {value}, expected {expected}")]
    UnexpectedResult {
        expression: String,
        value: String,
        expected: &'static str,
    },
}

/// Read/write access to the item graph from inside an expression
pub trait ItemAccess: Send + Sync {
    /// Current value of the item at `path`
    fn item_value(&self, path: &str) -> Option<Value>;

    /// Write `value` to the item at `path`; returns false if no such item
    fn write_item(&self, path: &str, value: Value, caller: &str, source: Option<&str>) -> bool;

    /// Seconds since the last change of the item at `path`
    fn item_age(&self, path: &str) -> Option<f64> {
        let _ = path;
        None
    }

    /// Causer of the last change of the item at `path`
    fn item_changed_by(&self, path: &str) -> Option<String> {
        let _ = path;
        None
    }
}

/// Names bound while an expression runs
#[derive(Clone, Default)]
pub struct EvalScope {
    /// Path of the item that owns the expression
    pub path: String,
    /// The value being processed (`value`)
    pub value: Option<Value>,
    pub caller: Option<String>,
    pub source: Option<String>,
    pub dest: Option<String>,
    /// Additional names, e.g. `old_value` for audit texts
    pub extra: Map<String, Value>,
    pub items: Option<Arc<dyn ItemAccess>>,
}

impl EvalScope {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_trigger(
        mut self,
        caller: impl Into<String>,
        source: Option<&str>,
        dest: Option<&str>,
    ) -> Self {
        self.caller = Some(caller.into());
        self.source = source.map(str::to_string);
        self.dest = dest.map(str::to_string);
        self
    }

    pub fn with_items(mut self, items: Arc<dyn ItemAccess>) -> Self {
        self.items = Some(items);
        self
    }

    pub fn with_var(mut self, name: impl Into<String>, value: Value) -> Self {
        self.extra.insert(name.into(), value);
        self
    }

    /// Record writes issued by the expression under `caller`
    pub fn with_write_caller(self, caller: &str) -> Self {
        self.with_var(WRITE_CALLER_VAR, Value::from(caller))
    }
}

impl std::fmt::Debug for EvalScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvalScope")
            .field("path", &self.path)
            .field("value", &self.value)
            .field("caller", &self.caller)
            .field("source", &self.source)
            .field("dest", &self.dest)
            .finish_non_exhaustive()
    }
}

/// A pluggable expression engine
///
/// `Value::Null` as a result means "no value"; callers skip the write.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, expression: &str, scope: &EvalScope) -> EvalResult<Value>;

    /// Evaluate and require a numeric result
    fn evaluate_number(&self, expression: &str, scope: &EvalScope) -> EvalResult<f64> {
        let value = self.evaluate(expression, scope)?;
        crate::value::as_f64(&value).ok_or_else(|| EvalError::UnexpectedResult {
            expression: expression.to_string(),
            value: value.to_string(),
            expected: "a number",
        })
    }

    /// Evaluate a boolean condition
    fn evaluate_condition(&self, expression: &str, scope: &EvalScope) -> EvalResult<bool> {
        let value = self.evaluate(expression, scope)?;
        Ok(match value {
            Value::Bool(b) => b,
            Value::Null => false,
            Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
            Value::String(s) => !s.is_empty(),
            Value::Array(a) => !a.is_empty(),
            Value::Object(o) => !o.is_empty(),
        })
    }
}

/// Shared handle to the evaluator
pub type SharedEvaluator = Arc<dyn Evaluator>;
