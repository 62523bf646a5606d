//! Item registry
//!
//! Builds the item tree from the nested configuration, indexes every item by
//! its absolute path and wires the graph in two startup phases:
//!
//! 1. [`ItemRegistry::init_prerun`]: watch lists, aggregate expressions and
//!    hysteresis inputs. Runs once the whole tree exists, so forward
//!    references resolve.
//! 2. [`ItemRegistry::init_run`]: first evaluation of expression items
//!    through the scheduler.
//!
//! [`ItemRegistry::start_schedulers`] registers the `cycle` and `crontab`
//! jobs in between.

use crate::attributes::{absolute, ItemConfig, TimedValue};
use crate::error::{ItemError, ItemResult};
use crate::item::{Item, INIT_CALLER};
use crate::plugin::SharedPlugin;
use crate::runtime::SharedItemRuntime;
use crate::structs::StructRegistry;
use dashmap::DashMap;
use parking_lot::RwLock;
use regex::Regex;
use serde_json::{json, Map, Value};
use shng_core::path::referenced_paths;
use shng_core::time::to_seconds;
use shng_core::value::display_value;
use shng_core::ItemAccess;
use shng_scheduler::{JobChange, JobSpec, JobTarget, Trigger};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, instrument, warn};

/// Registry behavior switches
#[derive(Debug, Clone, Default)]
pub struct RegistryOptions {
    /// Replace an existing item on a path collision instead of rejecting it
    pub allow_collisions: bool,
}

/// All items by absolute path
pub struct ItemRegistry {
    runtime: SharedItemRuntime,
    options: RegistryOptions,
    items: DashMap<String, Arc<Item>>,
    /// Paths in construction order
    order: RwLock<Vec<String>>,
    roots: RwLock<Vec<Arc<Item>>>,
    structs: RwLock<StructRegistry>,
    plugins: RwLock<Vec<SharedPlugin>>,
    self_ref: Weak<ItemRegistry>,
}

impl std::fmt::Debug for ItemRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemRegistry")
            .field("items", &self.items.len())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ItemRegistry {
    pub fn new(runtime: SharedItemRuntime, options: RegistryOptions) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            runtime,
            options,
            items: DashMap::new(),
            order: RwLock::new(Vec::new()),
            roots: RwLock::new(Vec::new()),
            structs: RwLock::new(StructRegistry::new()),
            plugins: RwLock::new(Vec::new()),
            self_ref: self_ref.clone(),
        })
    }

    pub fn runtime(&self) -> &SharedItemRuntime {
        &self.runtime
    }

    /// Install the struct templates used while loading; nested references
    /// are resolved here
    pub fn set_structs(&self, mut structs: StructRegistry) {
        structs.resolve();
        *self.structs.write() = structs;
    }

    pub fn structs(&self) -> StructRegistry {
        self.structs.read().clone()
    }

    /// Register a plugin; it sees every item constructed afterwards
    pub fn add_plugin(&self, plugin: SharedPlugin) {
        info!(plugin = plugin.name(), "Plugin registered");
        self.plugins.write().push(plugin);
    }

    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    /// Build all items of a configuration tree
    ///
    /// Returns the number of items in the registry afterwards.
    #[instrument(skip_all)]
    pub fn load(&self, tree: Value) -> ItemResult<usize> {
        let Value::Object(tree) = tree else {
            return Err(ItemError::InvalidConfig {
                path: String::new(),
                message: "item tree must be a map".to_string(),
            });
        };
        for (name, node) in tree {
            match node {
                Value::Object(raw) => {
                    if let Err(e) = self.construct(None, &name, raw) {
                        error!(item = %name, error = %e, "Item not created");
                    }
                }
                other => warn!(item = %name, value = %other, "Top level entry is not an item, ignoring it"),
            }
        }
        info!(items = self.len(), "Items loaded");
        Ok(self.len())
    }

    /// Build one item and, recursively, its children
    ///
    /// The item is fully initialized (cache restored, plugins attached)
    /// before its first child is built.
    pub fn construct(
        &self,
        parent: Option<&Arc<Item>>,
        name: &str,
        mut raw: Map<String, Value>,
    ) -> ItemResult<Arc<Item>> {
        let path = match parent {
            Some(parent) => format!("{}.{}", parent.path(), name),
            None => name.to_string(),
        };

        self.structs.read().apply(&path, &mut raw);

        let ancestors = ancestor_chain(parent);
        let confs: Vec<&Map<String, Value>> = ancestors.iter().map(|a| a.conf()).collect();
        let mut config = ItemConfig::parse(&path, &raw, &confs)?;
        let children = std::mem::take(&mut config.children);

        let replaced = self.items.contains_key(&path);
        if replaced {
            if !self.options.allow_collisions {
                warn!(item = %path, "Item already exists, ignoring the duplicate definition");
                return Err(ItemError::Collision(path));
            }
            warn!(item = %path, "Item already exists, replacing it");
        }

        let item = Item::new(
            self.runtime.clone(),
            self.self_ref.clone(),
            parent.map(Arc::downgrade).unwrap_or_default(),
            &path,
            config,
        );

        for plugin in self.plugins.read().iter() {
            if let Some(callback) = plugin.parse_item(&item) {
                debug!(item = %path, plugin = plugin.name(), "Plugin attached");
                item.add_method_trigger(callback);
            }
        }

        self.items.insert(path.clone(), item.clone());
        if !replaced {
            self.order.write().push(path.clone());
        }
        match parent {
            Some(parent) => parent.add_child(item.clone()),
            None => {
                let mut roots = self.roots.write();
                match roots.iter_mut().find(|root| root.path() == path) {
                    Some(existing) => *existing = item.clone(),
                    None => roots.push(item.clone()),
                }
            }
        }

        for (child_name, child_raw) in children {
            if let Err(e) = self.construct(Some(&item), &child_name, child_raw) {
                error!(item = %path, child = %child_name, error = %e, "Child item not created");
            }
        }
        Ok(item)
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    pub fn get(&self, path: &str) -> Option<Arc<Item>> {
        self.items.get(path).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.items.contains_key(path)
    }

    /// All paths in construction order
    pub fn paths(&self) -> Vec<String> {
        self.order.read().clone()
    }

    /// All items in construction order
    pub fn items(&self) -> Vec<Arc<Item>> {
        self.order.read().iter().filter_map(|path| self.get(path)).collect()
    }

    /// Top level items
    pub fn roots(&self) -> Vec<Arc<Item>> {
        self.roots.read().clone()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items matching `pattern[:attribute[value]]`
    ///
    /// `*` in the path part matches any sequence, dots are literal, other
    /// regex syntax is passed through; the pattern is anchored on both ends.
    /// With an attribute only items carrying it match, with a value only
    /// those whose attribute equals (or, for lists and maps, contains) it.
    pub fn match_items(&self, pattern: &str) -> Vec<Arc<Item>> {
        let (glob, filter) = pattern.split_once(':').unwrap_or((pattern, ""));
        let regex = match Regex::new(&format!(
            "^(?:{})$",
            glob.trim().replace('.', r"\.").replace('*', ".*")
        )) {
            Ok(regex) => regex,
            Err(e) => {
                warn!(pattern, error = %e, "Invalid item pattern");
                return Vec::new();
            }
        };
        let (attr, expected) = match filter.split_once('[') {
            Some((attr, value)) => (attr, Some(value.trim_end_matches(']'))),
            None => (filter, None),
        };

        self.items()
            .into_iter()
            .filter(|item| regex.is_match(item.path()))
            .filter(|item| {
                if attr.is_empty() {
                    return true;
                }
                match (item.conf().get(attr), expected) {
                    (None, _) => false,
                    (Some(_), None) | (Some(_), Some("")) => true,
                    (Some(value), Some(expected)) => attribute_matches(value, expected),
                }
            })
            .collect()
    }

    /// Items carrying attribute `attr`
    pub fn find_items(&self, attr: &str) -> Vec<Arc<Item>> {
        self.items()
            .into_iter()
            .filter(|item| item.conf().contains_key(attr))
            .collect()
    }

    /// Descendants of `parent` carrying attribute `attr`, depth first
    pub fn find_children(&self, parent: &Item, attr: &str) -> Vec<Arc<Item>> {
        let mut found = Vec::new();
        for child in parent.children() {
            if child.conf().contains_key(attr) {
                found.push(child.clone());
            }
            found.extend(self.find_children(&child, attr));
        }
        found
    }

    /// Look up attribute `key` on `item` and its ancestors
    ///
    /// `level` bounds the number of hops up the tree (`None` walks to the
    /// top). With `strict` only the item exactly `level` hops up is looked
    /// at; otherwise the nearest item carrying the attribute wins.
    pub fn find_attribute(
        &self,
        item: &Item,
        key: &str,
        level: Option<usize>,
        strict: bool,
    ) -> Option<Value> {
        let mut current = self.get(item.path())?;
        let mut hops = 0;
        loop {
            let at_level = level.map_or(true, |level| hops == level);
            if !strict || at_level {
                if let Some(value) = current.conf().get(key) {
                    return Some(value.clone());
                }
            }
            if strict && at_level || level.is_some_and(|level| hops >= level) {
                return None;
            }
            current = current.parent()?;
            hops += 1;
        }
    }

    /// Absolute path for a reference made from `item`
    ///
    /// A reference climbing above the root is logged and resolved to the
    /// root.
    pub fn resolve_relative_reference(&self, item: &Item, reference: &str) -> String {
        absolute(item.path(), "reference", reference)
    }

    // ------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------

    /// Wire watch lists, expand aggregate expressions, wire hysteresis inputs
    #[instrument(skip_all)]
    pub fn init_prerun(&self) {
        for item in self.items() {
            let triggers = item.eval_triggers().to_vec();
            if !triggers.is_empty() {
                let eval = item.eval_expression();
                let mut watched: Vec<Arc<Item>> = Vec::new();
                for trigger in &triggers {
                    let matches = self.match_items(trigger);
                    if matches.is_empty() && eval.is_some() {
                        warn!(item = %item.path(), trigger = %trigger, "Trigger item not found");
                    }
                    watched.extend(matches);
                }
                for source in &watched {
                    if !Arc::ptr_eq(source, &item) {
                        source.add_item_to_trigger(&item);
                    }
                }
                item.set_eval_trigger_paths(
                    watched.iter().map(|source| source.path().to_string()).collect(),
                );
                if let Some(expanded) = eval
                    .as_deref()
                    .and_then(|eval| aggregate_expression(item.path(), eval, &watched))
                {
                    debug!(item = %item.path(), eval = %expanded, "Aggregate expression expanded");
                    item.set_eval_expression(expanded);
                }
            }

            if let Some(hysteresis) = &item.config().hysteresis {
                match self.get(&hysteresis.input) {
                    Some(input) if !Arc::ptr_eq(&input, &item) => {
                        input.add_hysteresis_item_to_trigger(&item);
                    }
                    Some(_) => {}
                    None => error!(
                        item = %item.path(),
                        input = %hysteresis.input,
                        "Hysteresis input item not found"
                    ),
                }
            }
        }
    }

    /// Register `items.<path>` jobs for items with `cycle` or `crontab`
    #[instrument(skip_all)]
    pub fn start_schedulers(&self) {
        for item in self.items() {
            let config = item.config();
            if config.crontab.is_empty() && config.cycle.is_none() {
                continue;
            }
            let name = format!("items.{}", item.path());
            let mut spec = JobSpec::new(&name, JobTarget::Item(item.clone()));
            if !config.crontab.is_empty() {
                let entries = config.crontab.iter().cloned().map(Value::String).collect();
                spec = spec.cron(Value::Array(entries));
            }
            if let Some(cycle) = &config.cycle {
                match cycle_setting(&item, cycle) {
                    Some(setting) => spec = spec.cycle(setting),
                    None => warn!(item = %item.path(), cycle = %cycle.time, "Invalid cycle"),
                }
                if to_seconds(&cycle.time).is_none() {
                    self.watch_cycle(&item, &name, cycle);
                }
            }
            if let Err(e) = self.runtime.scheduler.add(spec) {
                warn!(item = %item.path(), error = %e, "Unable to schedule item");
            }
        }
    }

    /// Reschedule a cycle computed from other items whenever they change
    fn watch_cycle(&self, item: &Arc<Item>, job: &str, cycle: &TimedValue) {
        for path in referenced_paths(&cycle.time) {
            let Some(watched) = self.get(&path) else {
                warn!(item = %item.path(), watched = %path, "Item referenced by cycle not found");
                continue;
            };
            let target = Arc::downgrade(item);
            let scheduler = self.runtime.scheduler.clone();
            let job = job.to_string();
            let cycle = cycle.clone();
            watched.add_method_trigger(Arc::new(move |_: &Item, _: &str, _: Option<&str>, _: Option<&str>| {
                let Some(item) = target.upgrade() else {
                    return;
                };
                let Some(setting) = cycle_setting(&item, &cycle) else {
                    warn!(item = %item.path(), cycle = %cycle.time, "Invalid cycle");
                    return;
                };
                debug!(job = %job, cycle = %setting, "Cycle recomputed");
                if let Err(e) = scheduler.change(&job, JobChange::default().cycle(setting)) {
                    warn!(job = %job, error = %e, "Unable to reschedule cycle");
                }
            }));
        }
    }

    /// First evaluation of expression items
    ///
    /// Covers items with an `eval` and `eval_trigger` whose value was not
    /// restored from the cache. Returns the number of evaluations queued.
    #[instrument(skip_all)]
    pub fn init_run(&self) -> usize {
        let mut queued = 0;
        for item in self.items() {
            if item.eval_triggers().is_empty()
                || item.eval_expression().is_none()
                || item.restored_from_cache()
            {
                continue;
            }
            let trigger = Trigger::new(INIT_CALLER)
                .source("Eval")
                .value(item.value())
                .target(item.eval_target());
            if self
                .runtime
                .scheduler
                .trigger(&format!("items.{}", item.path()), trigger)
            {
                queued += 1;
            }
        }
        debug!(queued, "Initial evaluations queued");
        queued
    }
}

impl ItemAccess for ItemRegistry {
    fn item_value(&self, path: &str) -> Option<Value> {
        self.get(path).map(|item| item.value())
    }

    fn write_item(&self, path: &str, value: Value, caller: &str, source: Option<&str>) -> bool {
        match self.get(path) {
            Some(item) => {
                item.write(value, caller, source);
                true
            }
            None => {
                warn!(item = %path, caller, "Write to unknown item");
                false
            }
        }
    }

    fn item_age(&self, path: &str) -> Option<f64> {
        self.get(path).map(|item| item.age())
    }

    fn item_changed_by(&self, path: &str) -> Option<String> {
        self.get(path).map(|item| item.changed_by())
    }
}

/// Parent, grandparent, ... of a new item
fn ancestor_chain(parent: Option<&Arc<Item>>) -> Vec<Arc<Item>> {
    let mut chain = Vec::new();
    let mut current = parent.cloned();
    while let Some(item) = current {
        current = item.parent();
        chain.push(item);
    }
    chain
}

fn attribute_matches(value: &Value, expected: &str) -> bool {
    match value {
        Value::Array(entries) => entries.iter().any(|e| display_value(e) == expected),
        Value::Object(map) => map.contains_key(expected),
        other => display_value(other) == expected,
    }
}

/// Expand `and`, `or`, `sum`, `avg`, `max` and `min` over the watched items
fn aggregate_expression(path: &str, eval: &str, watched: &[Arc<Item>]) -> Option<String> {
    let function = eval.trim();
    if !matches!(function, "and" | "or" | "sum" | "avg" | "max" | "min") {
        return None;
    }
    if watched.is_empty() {
        warn!(item = %path, function, "No trigger items to aggregate");
        return None;
    }
    let refs: Vec<String> = watched
        .iter()
        .map(|item| format!("item('{}')", item.path()))
        .collect();
    Some(match function {
        "and" => refs.join(" and "),
        "or" => refs.join(" or "),
        "sum" => refs.join(" + "),
        "avg" => format!("({}) / {}", refs.join(" + "), refs.len()),
        "max" => format!("max({})", refs.join(", ")),
        _ => format!("min({})", refs.join(", ")),
    })
}

/// Cycle period and value as handed to the scheduler
fn cycle_setting(item: &Item, cycle: &TimedValue) -> Option<Value> {
    let scope = item.scope().with_value(item.value());
    let seconds = item.resolve_seconds(&cycle.time, &scope)?;
    Some(match &cycle.value {
        Some(text) => json!({ (seconds.to_string()): item.resolve_value(text, &scope) }),
        None => Value::from(seconds),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{make_test_setup, make_test_setup_with_options};

    #[test]
    fn test_construct_order_and_lookup() {
        let (registry, _scheduler, _clock) = make_test_setup(json!({
            "living": {
                "light": {"type": "bool", "dimmer": {"type": "num"}},
                "temp": {"type": "num"}
            },
            "outside": {"type": "num"}
        }));
        assert_eq!(
            registry.paths(),
            vec!["living", "living.light", "living.light.dimmer", "living.temp", "outside"]
        );
        assert_eq!(registry.roots().len(), 2);
        assert!(registry.contains("living.light.dimmer"));
        assert!(registry.get("living.dimmer").is_none());
    }

    #[test]
    fn test_collision_rejected() {
        let (registry, _scheduler, _clock) =
            make_test_setup(json!({"lamp": {"type": "bool", "initial_value": true}}));
        let duplicate = registry.construct(None, "lamp", Map::new());
        assert!(matches!(duplicate, Err(ItemError::Collision(path)) if path == "lamp"));
        assert_eq!(registry.get("lamp").unwrap().value(), json!(true));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_collision_replaces_in_place() {
        let (registry, _scheduler, _clock) = make_test_setup_with_options(
            json!({
                "living": {"light": {"type": "bool"}, "temp": {"type": "num"}},
                "outside": {"type": "num"}
            }),
            RegistryOptions {
                allow_collisions: true,
            },
        );
        let living = registry.get("living").unwrap();
        let mut raw = Map::new();
        raw.insert("type".to_string(), json!("num"));
        raw.insert("initial_value".to_string(), json!(5));
        registry.construct(Some(&living), "light", raw).unwrap();

        assert_eq!(living.children_paths(), vec!["living.light", "living.temp"]);
        assert_eq!(living.children()[0].value(), json!(5));
        assert_eq!(registry.get("living.light").unwrap().value(), json!(5));
        assert_eq!(registry.len(), 4);

        registry.construct(None, "living", Map::new()).unwrap();
        let roots: Vec<String> = registry.roots().iter().map(|r| r.path().to_string()).collect();
        assert_eq!(roots, vec!["living", "outside"]);
        assert_eq!(registry.paths().len(), 4);
    }

    #[test]
    fn test_match_items_patterns() {
        let (registry, _scheduler, _clock) = make_test_setup(json!({
            "living": {
                "light": {"type": "bool", "knx_dpt": "1", "tags": ["light", "main"]},
                "lamp": {"type": "bool", "knx_dpt": "5"},
                "temp": {"type": "num"}
            }
        }));
        let paths = |pattern: &str| -> Vec<String> {
            registry
                .match_items(pattern)
                .iter()
                .map(|i| i.path().to_string())
                .collect()
        };
        assert_eq!(paths("living.l*"), vec!["living.light", "living.lamp"]);
        assert_eq!(paths("living.temp"), vec!["living.temp"]);
        assert_eq!(paths("*:knx_dpt"), vec!["living.light", "living.lamp"]);
        assert_eq!(paths("*:knx_dpt[5]"), vec!["living.lamp"]);
        assert_eq!(paths("*:tags[main]"), vec!["living.light"]);
        assert!(paths("living").len() == 1);
        assert!(paths("livingXtemp").is_empty());
    }

    #[test]
    fn test_find_attribute_walks_ancestors() {
        let (registry, _scheduler, _clock) = make_test_setup(json!({
            "house": {
                "room": "none",
                "floor": {
                    "room": "upstairs",
                    "bath": {"light": {"type": "bool"}}
                }
            }
        }));
        let light = registry.get("house.floor.bath.light").unwrap();
        assert_eq!(registry.find_attribute(&light, "room", None, false), Some(json!("upstairs")));
        assert_eq!(registry.find_attribute(&light, "room", Some(1), false), None);
        assert_eq!(registry.find_attribute(&light, "room", Some(3), true), Some(json!("none")));
        assert_eq!(registry.find_attribute(&light, "room", Some(1), true), None);
        assert_eq!(
            registry.find_children(&registry.get("house").unwrap(), "room")
                .iter()
                .map(|i| i.path().to_string())
                .collect::<Vec<_>>(),
            vec!["house.floor"]
        );
    }

    #[test]
    fn test_relative_references() {
        let (registry, _scheduler, _clock) = make_test_setup(json!({
            "living": {"light": {"type": "bool"}}
        }));
        let light = registry.get("living.light").unwrap();
        assert_eq!(registry.resolve_relative_reference(&light, ".level"), "living.light.level");
        assert_eq!(registry.resolve_relative_reference(&light, "..dimmer"), "living.dimmer");
        assert_eq!(registry.resolve_relative_reference(&light, "..self"), "living");
        assert_eq!(registry.resolve_relative_reference(&light, "outside.temp"), "outside.temp");
    }

    #[test]
    fn test_aggregate_expansion() {
        let (registry, _scheduler, _clock) = make_test_setup(json!({
            "a": {"type": "num"},
            "b": {"type": "num"},
            "total": {"type": "num", "eval": "sum", "eval_trigger": ["a", "b"]},
            "mean": {"type": "num", "eval": "avg", "eval_trigger": "*"},
            "any": {"type": "bool", "eval": "or", "eval_trigger": ["a", "b"]}
        }));
        assert_eq!(
            registry.get("total").unwrap().eval_expression().as_deref(),
            Some("item('a') + item('b')")
        );
        assert_eq!(
            registry.get("any").unwrap().eval_expression().as_deref(),
            Some("item('a') or item('b')")
        );
        assert!(registry
            .get("mean")
            .unwrap()
            .eval_expression()
            .unwrap()
            .ends_with("/ 5"));
        assert_eq!(registry.get("a").unwrap().items_to_trigger(), vec!["total", "mean", "any"]);
        assert!(!registry.get("mean").unwrap().items_to_trigger().contains(&"mean".to_string()));
    }

    #[test]
    fn test_init_run_evaluates_expression_items() {
        let (registry, scheduler, _clock) = make_test_setup(json!({
            "a": {"type": "num", "initial_value": 3},
            "b": {"type": "num", "initial_value": 4},
            "total": {"type": "num", "eval": "sum", "eval_trigger": ["a", "b"]},
            "plain": {"type": "num", "eval": "1 + 1"}
        }));
        assert_eq!(registry.init_run(), 1);
        scheduler.run_until_idle();
        let total = registry.get("total").unwrap();
        assert_eq!(total.value(), json!(7));
        assert_eq!(total.changed_by(), "Init:Eval");
        assert_eq!(registry.get("plain").unwrap().value(), json!(0));
    }

    #[test]
    fn test_item_access() {
        let (registry, _scheduler, _clock) = make_test_setup(json!({"lamp": {"type": "bool"}}));
        assert!(registry.write_item("lamp", json!(true), "Logic", Some("test")));
        assert_eq!(registry.item_value("lamp"), Some(json!(true)));
        assert_eq!(registry.item_changed_by("lamp").as_deref(), Some("Logic:test"));
        assert!(!registry.write_item("missing", json!(1), "Logic", None));
        assert_eq!(registry.item_value("missing"), None);
    }
}
