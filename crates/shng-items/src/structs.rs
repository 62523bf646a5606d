//! Struct templates
//!
//! A struct is a named item subtree. Items (and other structs) pull one or
//! more structs in through a `struct` attribute; the struct content is merged
//! into the referencing node:
//!
//! - keys the node does not have are copied in
//! - nested maps are merged recursively, values already in the node win
//! - lists are concatenated, the node's entries first
//!
//! Struct names starting with a dot refer to a struct from the same
//! definition file (`.light` inside `my.living.room` means `my.living.light`).

use indexmap::IndexMap;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

/// Passes over all definitions before nested references are given up on
const MAX_RESOLVE_RUNS: usize = 16;

/// All loaded struct definitions, in load order
#[derive(Debug, Clone, Default)]
pub struct StructRegistry {
    definitions: IndexMap<String, Map<String, Value>>,
}

impl StructRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a definition, named `<plugin>.<name>` for plugin structs
    pub fn add(&mut self, plugin: Option<&str>, name: &str, definition: Map<String, Value>) {
        let name = match plugin {
            Some(plugin) if !plugin.is_empty() => format!("{plugin}.{name}"),
            _ => name.to_string(),
        };
        debug!(name = %name, "Adding struct definition");
        self.definitions.insert(name, definition);
    }

    /// Add all definitions of one file
    ///
    /// Definitions from `struct.yaml` use their plain names (`prefix` is
    /// `None`); those from `struct_<x>.yaml` are named `my.<x>.<name>`.
    pub fn add_file(&mut self, prefix: Option<&str>, definitions: Map<String, Value>) {
        match prefix {
            Some(prefix) => info!(prefix, "Loading struct definitions with key prefix"),
            None => info!("Loading struct definitions without key prefix"),
        }
        for (name, definition) in definitions {
            let Value::Object(definition) = definition else {
                error!(name = %name, "Struct definition is not a map, ignoring it");
                continue;
            };
            let name = match prefix {
                Some(prefix) => format!("my.{prefix}.{name}"),
                None => name,
            };
            self.add(None, &name, definition);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Map<String, Value>> {
        self.definitions.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.definitions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Definitions, optionally without internal ones (names starting with `_`)
    pub fn definitions(&self, include_internal: bool) -> IndexMap<String, Map<String, Value>> {
        self.definitions
            .iter()
            .filter(|(name, _)| {
                include_internal || !name.rsplit('.').next().unwrap_or(name).starts_with('_')
            })
            .map(|(name, def)| (name.clone(), def.clone()))
            .collect()
    }

    /// Expand `struct` references inside the definitions themselves
    ///
    /// Runs until no definition changes; references that are still
    /// unresolved after a bounded number of passes (cycles) are logged.
    pub fn resolve(&mut self) {
        for run in 1..=MAX_RESOLVE_RUNS {
            let mut changed = false;
            let names: Vec<String> = self.definitions.keys().cloned().collect();
            for name in names {
                let Some(mut definition) = self.definitions.get(&name).cloned() else {
                    continue;
                };
                let prefix = key_prefix(&name);
                if self.expand_node(&mut definition, &name, &prefix) {
                    debug!(name = %name, run, "Struct updated");
                    self.definitions.insert(name, definition);
                    changed = true;
                }
            }
            if !changed {
                return;
            }
        }
        error!(
            runs = MAX_RESOLVE_RUNS,
            "Struct references still unresolved, check for circular struct definitions"
        );
    }

    /// Merge the structs referenced by an item's `struct` attribute into its config
    ///
    /// Returns true if the item referenced any structs.
    pub fn apply(&self, path: &str, raw: &mut Map<String, Value>) -> bool {
        let Some(names) = raw.remove("struct") else {
            return false;
        };
        for name in struct_names(&names) {
            match self.definitions.get(&name) {
                Some(definition) => merge_struct(raw, definition),
                None => error!(item = %path, name = %name, "Struct not found"),
            }
        }
        true
    }

    fn expand_node(&self, node: &mut Map<String, Value>, node_name: &str, prefix: &str) -> bool {
        let mut expanded = false;
        for (key, value) in node.iter_mut() {
            if let Value::Object(child) = value {
                expanded |= self.expand_node(child, key, prefix);
            }
        }
        if let Some(names) = node.remove("struct") {
            for name in struct_names(&names) {
                let name = qualified_name(prefix, &name);
                match self.definitions.get(&name) {
                    Some(definition) => merge_struct(node, definition),
                    None => error!(
                        name = %name,
                        used_in = node_name,
                        prefix,
                        "Struct not found in struct definitions"
                    ),
                }
            }
            expanded = true;
        }
        expanded
    }
}

fn struct_names(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.trim().to_string()],
        Value::Array(names) => names
            .iter()
            .filter_map(|n| n.as_str().map(|s| s.trim().to_string()))
            .collect(),
        other => {
            warn!(value = %other, "Invalid struct attribute");
            Vec::new()
        }
    }
}

/// `my.<file>` for file structs, else the plugin name
fn key_prefix(name: &str) -> String {
    let mut parts = name.split('.');
    match (parts.next(), parts.next()) {
        (Some("my"), Some(file)) => format!("my.{file}"),
        (Some(first), _) => first.to_string(),
        _ => String::new(),
    }
}

fn qualified_name(prefix: &str, name: &str) -> String {
    if name.starts_with('.') && !prefix.is_empty() {
        format!("{prefix}{name}")
    } else {
        name.trim_start_matches('.').to_string()
    }
}

/// Merge a struct into a node, the node's own values win
fn merge_struct(node: &mut Map<String, Value>, definition: &Map<String, Value>) {
    for (key, value) in definition {
        match node.get_mut(key) {
            None | Some(Value::Null) => {
                node.insert(key.clone(), value.clone());
            }
            Some(Value::Object(existing)) => {
                if let Value::Object(source) = value {
                    merge_tree(source, existing);
                }
            }
            Some(existing) if existing.is_array() || value.is_array() => {
                *existing = concat(existing, value);
            }
            Some(_) => {}
        }
    }
}

fn merge_tree(source: &Map<String, Value>, destination: &mut Map<String, Value>) {
    for (key, value) in source {
        match (value, destination.get_mut(key)) {
            (Value::Object(child), Some(Value::Object(node))) => merge_tree(child, node),
            (Value::Object(_), Some(_)) => {}
            (_, None) | (_, Some(Value::Null)) => {
                destination.insert(key.clone(), value.clone());
            }
            (_, Some(existing)) if existing.is_array() || value.is_array() => {
                *existing = concat(existing, value);
            }
            _ => {}
        }
    }
}

fn concat(first: &Value, second: &Value) -> Value {
    let as_list = |v: &Value| match v {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    };
    let mut items = as_list(first);
    items.extend(as_list(second));
    Value::Array(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("fixture must be an object"),
        }
    }

    fn make_test_setup() -> StructRegistry {
        let mut structs = StructRegistry::new();
        structs.add(
            None,
            "dimmer",
            map(json!({
                "type": "num",
                "visu_acl": "rw",
                "level": {"type": "num", "knx_dpt": "5"},
                "tags": ["light"]
            })),
        );
        structs.add_file(
            Some("living"),
            map(json!({
                "lamp": {"struct": ".base", "color": {"type": "str"}},
                "base": {"type": "bool", "tags": ["room"]}
            })),
        );
        structs.add(Some("knx"), "_internal", map(json!({"type": "foo"})));
        structs
    }

    #[test]
    fn test_apply_merges_node_wins() {
        let structs = make_test_setup();
        let mut raw = map(json!({
            "struct": "dimmer",
            "visu_acl": "ro",
            "level": {"knx_dpt": "5.001"},
            "tags": ["kitchen"]
        }));
        assert!(structs.apply("kitchen.light", &mut raw));
        assert_eq!(
            Value::Object(raw),
            json!({
                "visu_acl": "ro",
                "level": {"knx_dpt": "5.001", "type": "num"},
                "tags": ["kitchen", "light"],
                "type": "num"
            })
        );
    }

    #[test]
    fn test_nested_references_use_file_prefix() {
        let mut structs = make_test_setup();
        structs.resolve();
        let lamp = structs.get("my.living.lamp").unwrap();
        assert_eq!(lamp.get("type"), Some(&json!("bool")));
        assert_eq!(lamp.get("tags"), Some(&json!(["room"])));
        assert!(lamp.get("struct").is_none());
    }

    #[test]
    fn test_internal_definitions_are_hidden() {
        let structs = make_test_setup();
        assert!(structs.definitions(true).contains_key("knx._internal"));
        assert!(!structs.definitions(false).contains_key("knx._internal"));
        assert_eq!(structs.len(), 4);
    }

    #[test]
    fn test_circular_structs_terminate() {
        let mut structs = StructRegistry::new();
        structs.add(None, "a", map(json!({"struct": "b", "x": 1})));
        structs.add(None, "b", map(json!({"struct": "a", "y": 2})));
        structs.resolve();
        assert!(structs.get("a").is_some());
    }
}
