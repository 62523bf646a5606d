//! Expression engine backed by minijinja
//!
//! Expressions use minijinja's expression syntax:
//!
//! - `item('living.temp') > 21 and not item('living.window')`
//! - `value * 2`, `value if caller != 'Init' else 0`
//! - `max(item('a'), item('b'))`, `[1, 2, 3] | sum`
//! - `set_item('living.light', true)` for side effects

use crate::error::map_error;
use crate::items::{self, ItemsObject, ITEMS_VAR};
use minijinja::value::Rest;
use minijinja::{Environment, Error, ErrorKind, Value};
use shng_core::{EvalResult, EvalScope, Evaluator};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// Evaluator implementation used by the runtime
pub struct ExpressionEngine {
    env: Environment<'static>,
}

impl ExpressionEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_debug(true);
        Self::register_functions(&mut env);
        Self { env }
    }

    fn register_functions(env: &mut Environment<'static>) {
        // Item graph access
        env.add_function("item", items::item_fn);
        env.add_function("set_item", items::set_item_fn);
        env.add_function("age", items::age_fn);
        env.add_function("changed_by", items::changed_by_fn);

        // Aggregates accept either a single list or several arguments
        env.add_function("max", |args: Rest<Value>| fold_numbers(&args, f64::max));
        env.add_function("min", |args: Rest<Value>| fold_numbers(&args, f64::min));
        env.add_function("avg", |args: Rest<Value>| {
            let nums = numbers(&args)?;
            if nums.is_empty() {
                return Ok(Value::UNDEFINED);
            }
            Ok(Value::from(nums.iter().sum::<f64>() / nums.len() as f64))
        });
    }

    fn build_context(scope: &EvalScope) -> BTreeMap<String, Value> {
        let mut ctx = BTreeMap::new();
        ctx.insert("path".to_string(), Value::from(scope.path.as_str()));
        if let Some(value) = &scope.value {
            ctx.insert("value".to_string(), Value::from_serialize(value));
        }
        for (name, field) in [
            ("caller", &scope.caller),
            ("source", &scope.source),
            ("dest", &scope.dest),
        ] {
            let bound = field
                .as_deref()
                .map(Value::from)
                .unwrap_or(Value::from(()));
            ctx.insert(name.to_string(), bound);
        }
        for (name, value) in &scope.extra {
            ctx.insert(name.clone(), Value::from_serialize(value));
        }
        if let Some(access) = &scope.items {
            ctx.insert(
                ITEMS_VAR.to_string(),
                Value::from_object(ItemsObject::new(Arc::clone(access))),
            );
        }
        ctx
    }

    /// Check that an expression parses
    pub fn validate(&self, expression: &str) -> EvalResult<()> {
        self.env
            .compile_expression(expression)
            .map(|_| ())
            .map_err(|e| map_error(expression, e))
    }
}

impl Default for ExpressionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Evaluator for ExpressionEngine {
    fn evaluate(&self, expression: &str, scope: &EvalScope) -> EvalResult<serde_json::Value> {
        trace!(path = %scope.path, expression, "Evaluating expression");
        let expr = self
            .env
            .compile_expression(expression)
            .map_err(|e| map_error(expression, e))?;
        let result = expr
            .eval(Self::build_context(scope))
            .map_err(|e| map_error(expression, e))?;
        if result.is_undefined() || result.is_none() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::to_value(&result).map_err(|e| shng_core::EvalError::Runtime {
            expression: expression.to_string(),
            message: e.to_string(),
        })
    }
}

fn numbers(args: &[Value]) -> Result<Vec<f64>, Error> {
    let values: Vec<Value> = match args {
        [single] if single.try_iter().is_ok() && single.as_str().is_none() => {
            single.try_iter()?.collect()
        }
        _ => args.to_vec(),
    };
    values
        .iter()
        .map(|v| {
            f64::try_from(v.clone())
                .ok()
                .or_else(|| v.as_i64().map(|i| i as f64))
                .ok_or_else(|| {
                    Error::new(
                        ErrorKind::InvalidOperation,
                        format!("'{v}' is not a number"),
                    )
                })
        })
        .collect()
}

fn fold_numbers(args: &[Value], op: fn(f64, f64) -> f64) -> Result<Value, Error> {
    let nums = numbers(args)?;
    let Some((first, rest)) = nums.split_first() else {
        return Ok(Value::UNDEFINED);
    };
    let folded = rest.iter().copied().fold(*first, op);
    if folded.fract() == 0.0 && folded.abs() < i64::MAX as f64 {
        Ok(Value::from(folded as i64))
    } else {
        Ok(Value::from(folded))
    }
}
