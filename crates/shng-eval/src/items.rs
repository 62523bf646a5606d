//! The `items` object exposed to expressions

use minijinja::value::{Object, ObjectRepr, Value};
use minijinja::{Error, ErrorKind, State};
use shng_core::{ItemAccess, WRITE_CALLER_VAR};
use std::sync::Arc;

/// Caller recorded for writes issued from inside an expression
pub const EVAL_CALLER: &str = "Eval";

/// Name under which the items object is bound in every evaluation
pub(crate) const ITEMS_VAR: &str = "items";

/// Handle to the item graph
///
/// Supports `items('a.b')` and `items['a.b']` for reads and
/// `items.set('a.b', value)` for writes.
#[derive(Clone)]
pub struct ItemsObject {
    access: Arc<dyn ItemAccess>,
}

impl std::fmt::Debug for ItemsObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemsObject").finish_non_exhaustive()
    }
}

impl ItemsObject {
    pub fn new(access: Arc<dyn ItemAccess>) -> Self {
        Self { access }
    }

    fn read(&self, path: &str) -> Result<Value, Error> {
        self.access
            .item_value(path)
            .map(|v| Value::from_serialize(&v))
            .ok_or_else(|| unknown_item(path))
    }

    fn write(&self, state: &State, path: &str, value: &Value) -> Result<Value, Error> {
        let json = serde_json::to_value(value)
            .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))?;
        let caller = write_caller(state);
        let source = current_path(state);
        if self.access.write_item(path, json, &caller, source.as_deref()) {
            Ok(Value::from(()))
        } else {
            Err(unknown_item(path))
        }
    }
}

impl Object for ItemsObject {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Plain
    }

    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let path = key.as_str()?;
        self.access.item_value(path).map(|v| Value::from_serialize(&v))
    }

    fn call(self: &Arc<Self>, _state: &State, args: &[Value]) -> Result<Value, Error> {
        let path = path_arg(args, "items()")?;
        self.read(path)
    }

    fn call_method(
        self: &Arc<Self>,
        state: &State,
        method: &str,
        args: &[Value],
    ) -> Result<Value, Error> {
        match method {
            "get" => self.read(path_arg(args, "items.get()")?),
            "set" => {
                let path = path_arg(args, "items.set()")?;
                let value = args.get(1).cloned().unwrap_or(Value::from(()));
                self.write(state, path, &value)
            }
            "age" => {
                let path = path_arg(args, "items.age()")?;
                Ok(self
                    .access
                    .item_age(path)
                    .map(Value::from)
                    .unwrap_or(Value::UNDEFINED))
            }
            _ => Err(Error::new(
                ErrorKind::UnknownMethod,
                format!("items has no method '{method}'"),
            )),
        }
    }
}

fn path_arg<'a>(args: &'a [Value], function: &str) -> Result<&'a str, Error> {
    args.first().and_then(|v| v.as_str()).ok_or_else(|| {
        Error::new(
            ErrorKind::MissingArgument,
            format!("{function} requires an item path"),
        )
    })
}

fn unknown_item(path: &str) -> Error {
    Error::new(
        ErrorKind::InvalidOperation,
        format!("unknown item '{path}'"),
    )
}

fn current_path(state: &State) -> Option<String> {
    state
        .lookup("path")
        .and_then(|v| v.as_str().map(str::to_string))
}

fn write_caller(state: &State) -> String {
    state
        .lookup(WRITE_CALLER_VAR)
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| EVAL_CALLER.to_string())
}

fn items_handle(state: &State) -> Result<Arc<ItemsObject>, Error> {
    state
        .lookup(ITEMS_VAR)
        .and_then(|v| v.downcast_object::<ItemsObject>())
        .ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidOperation,
                "no item graph bound to this expression",
            )
        })
}

/// `item(path)`: read an item value
pub(crate) fn item_fn(state: &State, path: &str) -> Result<Value, Error> {
    items_handle(state)?.read(path)
}

/// `set_item(path, value)`: write an item value
pub(crate) fn set_item_fn(state: &State, path: &str, value: Value) -> Result<Value, Error> {
    items_handle(state)?.write(state, path, &value)
}

/// `age(path)`: seconds since the item's last change
pub(crate) fn age_fn(state: &State, path: &str) -> Result<Value, Error> {
    let items = items_handle(state)?;
    items
        .access
        .item_age(path)
        .map(Value::from)
        .ok_or_else(|| unknown_item(path))
}

/// `changed_by(path)`: causer of the item's last change
pub(crate) fn changed_by_fn(state: &State, path: &str) -> Result<Value, Error> {
    let items = items_handle(state)?;
    Ok(items
        .access
        .item_changed_by(path)
        .map(Value::from)
        .unwrap_or(Value::from(())))
}
