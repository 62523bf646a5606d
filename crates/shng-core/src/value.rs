//! Item types and their cast rules
//!
//! Values are carried as `serde_json::Value`. Each [`ItemType`] resolves once to
//! a plain cast function that every write goes through.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error produced when a value does not fit an item type
#[derive(Debug, Clone, Error, PartialEq)]
#[error("value {value} does not match type {item_type}")]
pub struct CastError {
    pub item_type: ItemType,
    pub value: String,
}

impl CastError {
    fn new(item_type: ItemType, value: &Value) -> Self {
        Self {
            item_type,
            value: value.to_string(),
        }
    }
}

/// Signature shared by all cast functions
pub type CastFn = fn(&Value) -> Result<Value, CastError>;

/// The declared type of an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Bool,
    Num,
    Str,
    List,
    Dict,
    Scene,
    /// Untyped, values pass through unchanged
    #[default]
    Foo,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Bool => "bool",
            ItemType::Num => "num",
            ItemType::Str => "str",
            ItemType::List => "list",
            ItemType::Dict => "dict",
            ItemType::Scene => "scene",
            ItemType::Foo => "foo",
        }
    }

    /// The cast function for this type
    pub fn cast_fn(&self) -> CastFn {
        match self {
            ItemType::Bool => cast_bool,
            ItemType::Num => cast_num,
            ItemType::Str => cast_str,
            ItemType::List => cast_list,
            ItemType::Dict => cast_dict,
            ItemType::Scene => cast_scene,
            ItemType::Foo => cast_foo,
        }
    }

    /// Value an item of this type holds before anything was written
    pub fn default_value(&self) -> Value {
        match self {
            ItemType::Bool => Value::Bool(false),
            ItemType::Num | ItemType::Scene => Value::from(0),
            ItemType::Str => Value::String(String::new()),
            ItemType::List => Value::Array(Vec::new()),
            ItemType::Dict => Value::Object(Map::new()),
            ItemType::Foo => Value::Null,
        }
    }

    pub fn cast(&self, value: &Value) -> Result<Value, CastError> {
        (self.cast_fn())(value)
    }
}

impl FromStr for ItemType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bool" => Ok(ItemType::Bool),
            "num" => Ok(ItemType::Num),
            "str" => Ok(ItemType::Str),
            "list" => Ok(ItemType::List),
            "dict" => Ok(ItemType::Dict),
            "scene" => Ok(ItemType::Scene),
            "foo" | "" => Ok(ItemType::Foo),
            other => Err(format!("unknown item type '{other}'")),
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn cast_bool(value: &Value) -> Result<Value, CastError> {
    match value {
        Value::Bool(_) => Ok(value.clone()),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f == 0.0 => Ok(Value::Bool(false)),
            Some(f) if f == 1.0 => Ok(Value::Bool(true)),
            _ => Err(CastError::new(ItemType::Bool, value)),
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "0" | "false" | "no" | "off" | "" => Ok(Value::Bool(false)),
            "1" | "true" | "yes" | "on" => Ok(Value::Bool(true)),
            _ => Err(CastError::new(ItemType::Bool, value)),
        },
        _ => Err(CastError::new(ItemType::Bool, value)),
    }
}

pub fn cast_num(value: &Value) -> Result<Value, CastError> {
    match value {
        Value::Number(_) => Ok(value.clone()),
        Value::Bool(b) => Ok(Value::from(i64::from(*b))),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok(Value::from(0));
            }
            if let Ok(i) = s.parse::<i64>() {
                return Ok(Value::from(i));
            }
            s.parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| CastError::new(ItemType::Num, value))
        }
        _ => Err(CastError::new(ItemType::Num, value)),
    }
}

pub fn cast_str(value: &Value) -> Result<Value, CastError> {
    match value {
        Value::String(_) => Ok(value.clone()),
        Value::Number(n) => Ok(Value::String(n.to_string())),
        Value::Bool(b) => Ok(Value::String(if *b { "True" } else { "False" }.to_string())),
        _ => Err(CastError::new(ItemType::Str, value)),
    }
}

pub fn cast_list(value: &Value) -> Result<Value, CastError> {
    match value {
        Value::Array(_) => Ok(value.clone()),
        Value::String(s) => match parse_literal(s) {
            Some(parsed @ Value::Array(_)) => Ok(parsed),
            _ => Err(CastError::new(ItemType::List, value)),
        },
        _ => Err(CastError::new(ItemType::List, value)),
    }
}

pub fn cast_dict(value: &Value) -> Result<Value, CastError> {
    match value {
        Value::Object(_) => Ok(value.clone()),
        Value::String(s) => match parse_literal(s) {
            Some(parsed @ Value::Object(_)) => Ok(parsed),
            _ => Err(CastError::new(ItemType::Dict, value)),
        },
        _ => Err(CastError::new(ItemType::Dict, value)),
    }
}

pub fn cast_scene(value: &Value) -> Result<Value, CastError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(Value::from)
            .ok_or_else(|| CastError::new(ItemType::Scene, value)),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| CastError::new(ItemType::Scene, value)),
        Value::Bool(b) => Ok(Value::from(i64::from(*b))),
        _ => Err(CastError::new(ItemType::Scene, value)),
    }
}

pub fn cast_foo(value: &Value) -> Result<Value, CastError> {
    Ok(value.clone())
}

/// Parse a literal list/dict string such as `[1, 'a']` or `{'k': 2}`
///
/// YAML flow syntax covers both JSON and single-quoted literals.
pub fn parse_literal(s: &str) -> Option<Value> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    serde_json::from_str(s)
        .ok()
        .or_else(|| serde_yaml::from_str::<Value>(s).ok())
}

/// Equality that treats `1` and `1.0` as the same value
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(i), Some(j)) => i == j,
            _ => x.as_f64() == y.as_f64(),
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x
                    .iter()
                    .all(|(k, v)| y.get(k).is_some_and(|w| values_equal(v, w)))
        }
        _ => a == b,
    }
}

/// Numeric view of a value, used by thresholds and fades
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Build a JSON number from a float, keeping integral results as integers
pub fn number_value(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Value::from(f as i64)
    } else {
        Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// Human readable rendering used in logs and audit lines
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        other => other.to_string(),
    }
}
