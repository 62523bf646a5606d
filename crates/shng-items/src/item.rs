//! The item: a typed value cell with provenance and attached behaviors
//!
//! Every write goes through the same pipeline:
//!
//! 1. cast to the item type (failures are logged, the value is kept)
//! 2. the fade gate while a fade is running
//! 3. compare and commit under the per-item lock
//! 4. notify dependents outside the lock: rules, method triggers, logics,
//!    re-evaluation and hysteresis jobs
//! 5. persist the cache and re-arm the autotimer
//!
//! Dependent work is handed to the scheduler, so writes never recurse into
//! other items' expressions on the writer's stack.

use crate::attributes::{ItemConfig, TimedValue};
use crate::cache::{read_cache, remove_cache, write_cache};
use crate::error::{ItemError, ItemResult};
use crate::fade::FadeState;
use crate::hysteresis::HysteresisState;
use crate::registry::ItemRegistry;
use crate::runtime::ItemRuntime;
use chrono::{DateTime, Duration as ChronoDuration};
use chrono_tz::Tz;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use shng_core::events::{ItemChangedData, ItemUpdatedData};
use shng_core::time::{duration_seconds, to_seconds};
use shng_core::value::{as_f64, display_value, parse_literal, values_equal};
use shng_core::{causer, CastFn, EvalScope, Fact, ItemAccess, ItemType, Provenance};
use shng_scheduler::{JobRun, JobSpec, JobTarget, Logic, ScheduledItem, Trigger};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, instrument, warn};

pub const FADER_CALLER: &str = "Fader";
pub const AUTOTIMER_CALLER: &str = "Autotimer";
pub const TIMER_CALLER: &str = "Timer";
pub const HYSTERESIS_CALLER: &str = "Hysteresis";
pub const INIT_CALLER: &str = "Init";
pub const ON_CHANGE_CALLER: &str = "On_Change";
pub const ON_UPDATE_CALLER: &str = "On_Update";

const NOT_AVAILABLE: &str = "N/A";

/// Callback run on every qualifying write: `(item, caller, source, dest)`
pub type MethodTrigger = Arc<dyn Fn(&Item, &str, Option<&str>, Option<&str>) + Send + Sync>;

/// Position inside a list item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListIndex {
    At(i64),
    Append,
    Prepend,
}

impl FromStr for ListIndex {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "append" => Ok(Self::Append),
            "prepend" => Ok(Self::Prepend),
            other => other
                .parse()
                .map(Self::At)
                .map_err(|_| format!("invalid list index '{other}'")),
        }
    }
}

/// A single element of a dict or list item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Element {
    Key(String),
    Index(ListIndex),
}

/// Mutable part of an item, guarded by the per-item lock
#[derive(Debug)]
pub(crate) struct ItemState {
    pub value: Value,
    pub last_value: Value,
    pub prev_value: Value,
    pub provenance: Provenance,
    pub fade: Option<FadeState>,
    pub fade_generation: u64,
    pub hysteresis: HysteresisState,
    pub threshold_crossed: bool,
}

/// A node of the item tree
pub struct Item {
    pub(crate) path: String,
    name: String,
    cast: CastFn,
    pub(crate) config: ItemConfig,
    pub(crate) eval: RwLock<Option<String>>,
    pub(crate) state: Mutex<ItemState>,
    parent: Weak<Item>,
    children: RwLock<Vec<Arc<Item>>>,
    pub(crate) self_ref: Weak<Item>,
    pub(crate) runtime: Arc<ItemRuntime>,
    registry: Weak<ItemRegistry>,
    items_to_trigger: RwLock<Vec<Weak<Item>>>,
    /// Paths of the items matched by `eval_trigger`
    eval_trigger_paths: RwLock<Vec<String>>,
    hysteresis_items_to_trigger: RwLock<Vec<Weak<Item>>>,
    method_triggers: RwLock<Vec<MethodTrigger>>,
    logics: RwLock<Vec<Arc<Logic>>>,
    autotimer: RwLock<Option<TimedValue>>,
    pub(crate) cache_file: Option<PathBuf>,
    cache_lock: Mutex<()>,
    restored_from_cache: bool,
}

impl std::fmt::Debug for Item {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Item")
            .field("path", &self.path)
            .field("type", &self.config.item_type)
            .field("value", &self.value())
            .finish_non_exhaustive()
    }
}

impl Item {
    /// Build an item from its parsed configuration
    ///
    /// The initial value comes from the cache file when caching is enabled
    /// and the file holds a value of the right type, else from `value` /
    /// `initial_value`, else the type default.
    pub(crate) fn new(
        runtime: Arc<ItemRuntime>,
        registry: Weak<ItemRegistry>,
        parent: Weak<Item>,
        path: &str,
        mut config: ItemConfig,
    ) -> Arc<Self> {
        let now = runtime.clock.now();
        let item_type = config.item_type;
        let cast = item_type.cast_fn();
        config.children.clear();

        let mut init_source = "None";
        let mut value = item_type.default_value();
        if let Some(initial) = &config.initial_value {
            match cast(initial) {
                Ok(v) => {
                    value = v;
                    init_source = "Initial_Value";
                }
                Err(e) => warn!(item = %path, error = %e, "Initial value ignored"),
            }
        }

        let mut provenance = Provenance::new(now);
        let init_causer = causer(INIT_CALLER, Some(init_source));
        provenance.change.last.by = Some(init_causer.clone());
        provenance.update.last.by = Some(init_causer);

        let cache_file = match (&runtime.cache_dir, config.cache) {
            (Some(dir), true) => Some(dir.join(path)),
            (None, true) => {
                warn!(item = %path, "cache requested but no cache directory configured");
                None
            }
            _ => None,
        };

        let mut restored_from_cache = false;
        if let Some(file) = &cache_file {
            match read_cache(file, runtime.clock.tz()) {
                Ok(Some(entry)) => match cast(&entry.value) {
                    Ok(v) => {
                        value = v;
                        init_source = "Cache";
                        let by = causer(INIT_CALLER, Some("Cache"));
                        provenance.change.last = Fact::by(entry.changed, by.clone());
                        provenance.change.prev = Fact::new(entry.changed);
                        provenance.update.last = Fact::by(entry.changed, by);
                        provenance.update.prev = Fact::new(entry.changed);
                        restored_from_cache = true;
                    }
                    Err(e) => {
                        warn!(item = %path, error = %e, "Cached value does not match type, discarding cache");
                        remove_cache(file);
                    }
                },
                Ok(None) => {
                    if let Err(e) = write_cache(file, &value, &now) {
                        warn!(item = %path, error = %e, "Unable to create cache file");
                    }
                }
                Err(e) => warn!(item = %path, error = %e, "Unable to read cache file"),
            }
        }

        let name = config
            .name
            .clone()
            .unwrap_or_else(|| shng_core::path::leaf_name(path).to_string());
        let eval = config.eval.clone();
        let autotimer = config.autotimer.clone();
        let initial = value.clone();

        let item = Arc::new_cyclic(|self_ref| Self {
            path: path.to_string(),
            name,
            cast,
            config,
            eval: RwLock::new(eval),
            state: Mutex::new(ItemState {
                value,
                last_value: Value::Null,
                prev_value: Value::Null,
                provenance,
                fade: None,
                fade_generation: 0,
                hysteresis: HysteresisState::default(),
                threshold_crossed: false,
            }),
            parent,
            children: RwLock::new(Vec::new()),
            self_ref: self_ref.clone(),
            runtime,
            registry,
            items_to_trigger: RwLock::new(Vec::new()),
            eval_trigger_paths: RwLock::new(Vec::new()),
            hysteresis_items_to_trigger: RwLock::new(Vec::new()),
            method_triggers: RwLock::new(Vec::new()),
            logics: RwLock::new(Vec::new()),
            autotimer: RwLock::new(autotimer),
            cache_file,
            cache_lock: Mutex::new(()),
            restored_from_cache,
        });

        if init_source != "None" {
            item.log_on_change(&initial, &Value::Null, INIT_CALLER, Some(init_source), None);
        }
        item
    }

    // ------------------------------------------------------------------
    // Identity and tree
    // ------------------------------------------------------------------

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Same as [`Item::path`]
    pub fn id(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.config.description.as_deref()
    }

    pub fn item_type(&self) -> ItemType {
        self.config.item_type
    }

    pub fn config(&self) -> &ItemConfig {
        &self.config
    }

    /// Attributes not interpreted by the core
    pub fn conf(&self) -> &Map<String, Value> {
        &self.config.conf
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.config.conf.get(key)
    }

    pub fn parent(&self) -> Option<Arc<Item>> {
        self.parent.upgrade()
    }

    pub fn children(&self) -> Vec<Arc<Item>> {
        self.children.read().clone()
    }

    pub fn children_paths(&self) -> Vec<String> {
        self.children.read().iter().map(|c| c.path.clone()).collect()
    }

    /// Append a child, or replace the child with the same path in place
    pub(crate) fn add_child(&self, child: Arc<Item>) {
        let mut children = self.children.write();
        match children.iter_mut().find(|c| c.path == child.path) {
            Some(existing) => *existing = child,
            None => children.push(child),
        }
    }

    pub(crate) fn registry(&self) -> Option<Arc<ItemRegistry>> {
        self.registry.upgrade()
    }

    pub(crate) fn self_arc(&self) -> Option<Arc<Item>> {
        self.self_ref.upgrade()
    }

    /// Whether the value was restored from the cache file at startup
    pub fn restored_from_cache(&self) -> bool {
        self.restored_from_cache
    }

    pub fn eval_expression(&self) -> Option<String> {
        self.eval.read().clone()
    }

    pub(crate) fn set_eval_expression(&self, expression: String) {
        *self.eval.write() = Some(expression);
    }

    pub fn eval_triggers(&self) -> &[String] {
        &self.config.eval_triggers
    }

    // ------------------------------------------------------------------
    // Value and provenance
    // ------------------------------------------------------------------

    pub fn value(&self) -> Value {
        self.state.lock().value.clone()
    }

    /// Value before the last change
    pub fn last_value(&self) -> Value {
        self.state.lock().last_value.clone()
    }

    /// Value before the change preceding the last one
    pub fn prev_value(&self) -> Value {
        self.state.lock().prev_value.clone()
    }

    pub fn provenance(&self) -> Provenance {
        self.state.lock().provenance.clone()
    }

    pub fn last_change(&self) -> DateTime<Tz> {
        self.state.lock().provenance.change.last.at
    }

    pub fn prev_change(&self) -> DateTime<Tz> {
        self.state.lock().provenance.change.prev.at
    }

    pub fn last_update(&self) -> DateTime<Tz> {
        self.state.lock().provenance.update.last.at
    }

    pub fn prev_update(&self) -> DateTime<Tz> {
        self.state.lock().provenance.update.prev.at
    }

    pub fn last_trigger(&self) -> DateTime<Tz> {
        self.state.lock().provenance.trigger.last.at
    }

    pub fn prev_trigger(&self) -> DateTime<Tz> {
        self.state.lock().provenance.trigger.prev.at
    }

    pub fn changed_by(&self) -> String {
        by_or_na(&self.state.lock().provenance.change.last)
    }

    pub fn prev_change_by(&self) -> String {
        by_or_na(&self.state.lock().provenance.change.prev)
    }

    pub fn updated_by(&self) -> String {
        by_or_na(&self.state.lock().provenance.update.last)
    }

    pub fn prev_update_by(&self) -> String {
        by_or_na(&self.state.lock().provenance.update.prev)
    }

    pub fn triggered_by(&self) -> String {
        by_or_na(&self.state.lock().provenance.trigger.last)
    }

    pub fn prev_trigger_by(&self) -> String {
        by_or_na(&self.state.lock().provenance.trigger.prev)
    }

    /// Seconds since the last change
    pub fn age(&self) -> f64 {
        self.runtime.clock.seconds_since(&self.last_change())
    }

    /// Seconds the previous value was held
    pub fn prev_age(&self) -> f64 {
        let state = self.state.lock();
        let change = &state.provenance.change;
        (change.last.at - change.prev.at).num_milliseconds() as f64 / 1000.0
    }

    pub fn update_age(&self) -> f64 {
        self.runtime.clock.seconds_since(&self.last_update())
    }

    pub fn prev_update_age(&self) -> f64 {
        let state = self.state.lock();
        let update = &state.provenance.update;
        (update.last.at - update.prev.at).num_milliseconds() as f64 / 1000.0
    }

    pub fn trigger_age(&self) -> f64 {
        self.runtime.clock.seconds_since(&self.last_trigger())
    }

    pub fn is_fading(&self) -> bool {
        self.state.lock().fade.is_some()
    }

    /// Summary used by introspection endpoints
    pub fn jsonvars(&self) -> Value {
        json!({
            "id": self.path,
            "name": self.name,
            "value": self.value(),
            "type": self.config.item_type.as_str(),
            "attributes": self.config.conf,
            "children": self.children_paths(),
        })
    }

    // ------------------------------------------------------------------
    // Dependencies
    // ------------------------------------------------------------------

    pub fn add_method_trigger(&self, trigger: MethodTrigger) {
        self.method_triggers.write().push(trigger);
    }

    pub fn method_trigger_count(&self) -> usize {
        self.method_triggers.read().len()
    }

    /// Run `logic` whenever this item changes
    pub fn add_logic_trigger(&self, logic: Arc<Logic>) {
        self.logics.write().push(logic);
    }

    /// Re-evaluate `item` whenever this item changes
    pub(crate) fn set_eval_trigger_paths(&self, paths: Vec<String>) {
        *self.eval_trigger_paths.write() = paths;
    }

    pub(crate) fn add_item_to_trigger(&self, item: &Arc<Item>) {
        let mut targets = self.items_to_trigger.write();
        if !targets.iter().any(|t| t.as_ptr() == Arc::as_ptr(item)) {
            targets.push(Arc::downgrade(item));
        }
    }

    pub(crate) fn add_hysteresis_item_to_trigger(&self, item: &Arc<Item>) {
        let mut targets = self.hysteresis_items_to_trigger.write();
        if !targets.iter().any(|t| t.as_ptr() == Arc::as_ptr(item)) {
            targets.push(Arc::downgrade(item));
        }
    }

    /// Paths of the items re-evaluated when this item changes
    pub fn items_to_trigger(&self) -> Vec<String> {
        self.items_to_trigger
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .map(|i| i.path.clone())
            .collect()
    }

    pub fn hysteresis_items_to_trigger(&self) -> Vec<String> {
        self.hysteresis_items_to_trigger
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .map(|i| i.path.clone())
            .collect()
    }

    /// Scope for expressions owned by this item
    pub(crate) fn scope(&self) -> EvalScope {
        let scope = EvalScope::new(self.path.clone());
        match self.registry() {
            Some(registry) => scope.with_items(registry as Arc<dyn ItemAccess>),
            None => scope,
        }
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Write a value
    pub fn write(&self, value: Value, caller: &str, source: Option<&str>) {
        self.write_to(value, caller, source, None, None);
    }

    /// Write a value with destination information or into a single element
    ///
    /// Items with an `eval` expression do not take whole-value writes
    /// directly: the expression runs as a scheduler job with the written
    /// value bound as `value`, and its result is written.
    pub fn write_to(
        &self,
        value: Value,
        caller: &str,
        source: Option<&str>,
        dest: Option<&str>,
        element: Option<Element>,
    ) {
        if element.is_none() && self.eval.read().is_some() {
            let mut trigger = Trigger::new(caller)
                .value(value)
                .target(self.eval_target());
            if let Some(source) = source {
                trigger = trigger.source(source);
            }
            if let Some(dest) = dest {
                trigger = trigger.dest(dest);
            }
            self.runtime
                .scheduler
                .trigger(&format!("items.{}-eval", self.path), trigger);
            return;
        }
        self.update(value, caller, source, dest, element);
    }

    /// Job target running this item's expression
    pub(crate) fn eval_target(&self) -> JobTarget {
        let item = self.self_ref.clone();
        JobTarget::callable(move |run: &JobRun| {
            if let Some(item) = item.upgrade() {
                item.run_eval(
                    run.value.clone(),
                    &run.caller,
                    run.source.name(),
                    run.dest.as_deref(),
                );
            }
            Ok(())
        })
    }

    /// Apply a write: cast, fade gate, commit, notify, persist, re-arm
    ///
    /// Returns whether the value changed.
    #[instrument(skip(self, value, element), fields(item = %self.path))]
    pub(crate) fn update(
        &self,
        value: Value,
        caller: &str,
        source: Option<&str>,
        dest: Option<&str>,
        element: Option<Element>,
    ) -> bool {
        let value = if element.is_none() {
            match (self.cast)(&value) {
                Ok(v) => v,
                Err(e) => {
                    warn!(
                        value = %value,
                        caller,
                        source = ?source,
                        error = %e,
                        "Value does not match item type"
                    );
                    return false;
                }
            }
        } else {
            value
        };

        let now = self.runtime.clock.now();
        let by = causer(caller, source);
        let (changed, old, value, fading) = {
            let mut state = self.state.lock();
            if self.config.hysteresis.is_some() {
                state.hysteresis.clear();
            }
            if !self.pass_fade_gate(&mut state, caller, &value) {
                return false;
            }
            let value = match element {
                Some(element) => match apply_element(&state.value, element, value) {
                    Ok(v) => v,
                    Err(message) => {
                        warn!(caller, error = %message, "Element write rejected");
                        return false;
                    }
                },
                None => value,
            };

            let changed = self.config.enforce_change || !values_equal(&value, &state.value);
            let old = state.value.clone();
            if changed {
                commit(&mut state, value.clone(), now, &by, None, None);
            } else {
                state.provenance.update.record(Fact::by(now, by.clone()));
            }
            (changed, old, value, state.fade.is_some())
        };

        if changed {
            debug!(value = %value, caller, source = ?source, dest = ?dest, "Item changed");
            self.log_on_change(&value, &old, caller, source, dest);
        }
        self.fire_events(changed, &old, &value, caller, source, dest);

        self.run_rules(&self.config.on_update, &value, ON_UPDATE_CALLER);
        if changed || self.config.enforce_updates || self.config.item_type == ItemType::Scene {
            self.notify(&value, caller, source, dest);
            self.run_rules(&self.config.on_change, &value, ON_CHANGE_CALLER);
        }

        if changed && !fading {
            self.persist_cache();
        }
        if caller != AUTOTIMER_CALLER && !fading {
            self.arm_autotimer(&value);
        }
        changed
    }

    /// Write the committed value to the cache file
    ///
    /// Writers are serialized and each one stores whatever is committed when
    /// it gets the file, so the last write always carries the latest value.
    fn persist_cache(&self) {
        let Some(file) = &self.cache_file else {
            return;
        };
        let _guard = self.cache_lock.lock();
        let (value, changed) = {
            let state = self.state.lock();
            (state.value.clone(), state.provenance.change.last.at)
        };
        if let Err(e) = write_cache(file, &value, &changed) {
            warn!(error = %e, "Cache write failed");
        }
    }

    /// Set the value without triggering anything
    ///
    /// Meant for restoring values, e.g. from a database; timestamps may be
    /// supplied.
    pub fn set(
        &self,
        value: Value,
        caller: &str,
        source: Option<&str>,
        prev_change: Option<DateTime<Tz>>,
        last_change: Option<DateTime<Tz>>,
    ) -> ItemResult<()> {
        let value = (self.cast)(&value).map_err(|source| ItemError::TypeMismatch {
            path: self.path.clone(),
            source,
        })?;
        let now = self.runtime.clock.now();
        let by = causer(caller, source);
        let old = {
            let mut state = self.state.lock();
            let old = state.value.clone();
            commit(&mut state, value.clone(), now, &by, prev_change, last_change);
            old
        };
        self.log_on_change(&value, &old, caller, source, None);
        Ok(())
    }

    fn fire_events(
        &self,
        changed: bool,
        old: &Value,
        value: &Value,
        caller: &str,
        source: Option<&str>,
        dest: Option<&str>,
    ) {
        let Some(events) = &self.runtime.events else {
            return;
        };
        let now = self.runtime.clock.now();
        if changed {
            let data = ItemChangedData {
                path: self.path.clone(),
                old_value: old.clone(),
                new_value: value.clone(),
                caller: caller.to_string(),
                source: source.map(str::to_string),
                dest: dest.map(str::to_string),
            };
            events.fire_typed(data, now);
        } else {
            let data = ItemUpdatedData {
                path: self.path.clone(),
                value: value.clone(),
                caller: caller.to_string(),
                source: source.map(str::to_string),
            };
            events.fire_typed(data, now);
        }
    }

    /// Method triggers, logics, re-evaluation and hysteresis jobs
    fn notify(&self, value: &Value, caller: &str, source: Option<&str>, dest: Option<&str>) {
        let callbacks = self.method_triggers.read().clone();
        for callback in callbacks {
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| callback(self, caller, source, dest)));
            if outcome.is_err() {
                error!(item = %self.path, caller, "Method trigger panicked");
            }
        }

        let logics = self.logics.read().clone();
        if !logics.is_empty() && self.threshold_edge(value) {
            for logic in logics {
                let trigger = Trigger::new("Item")
                    .source(self.path.clone())
                    .value(value.clone())
                    .target(JobTarget::Logic(logic.clone()));
                self.runtime.scheduler.trigger(&logic.job_name(), trigger);
            }
        }

        let dependents: Vec<Arc<Item>> = self
            .items_to_trigger
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for item in dependents {
            let mut trigger = Trigger::new(caller)
                .source(self.path.clone())
                .value(value.clone())
                .target(item.eval_target());
            if let Some(dest) = dest {
                trigger = trigger.dest(dest);
            }
            self.runtime
                .scheduler
                .trigger(&format!("items.{}", item.path), trigger);
        }

        let outputs: Vec<Arc<Item>> = self
            .hysteresis_items_to_trigger
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for item in outputs {
            let mut trigger = Trigger::new(caller)
                .source(self.path.clone())
                .value(value.clone())
                .target(item.hysteresis_target());
            if let Some(dest) = dest {
                trigger = trigger.dest(dest);
            }
            self.runtime
                .scheduler
                .trigger(&format!("items.{}", item.path), trigger);
        }
    }

    /// Threshold latch: logics fire on crossing edges only
    fn threshold_edge(&self, value: &Value) -> bool {
        let Some(threshold) = self.config.threshold else {
            return true;
        };
        let Some(v) = as_f64(value) else {
            return false;
        };
        let mut state = self.state.lock();
        if state.threshold_crossed && v <= threshold.low {
            state.threshold_crossed = false;
            debug!(item = %self.path, value = v, "Threshold: crossed lower bound");
            true
        } else if !state.threshold_crossed && v >= threshold.high {
            state.threshold_crossed = true;
            debug!(item = %self.path, value = v, "Threshold: crossed upper bound");
            true
        } else {
            false
        }
    }

    /// Evaluate the item's expression and write the result
    pub fn run_eval(
        &self,
        value: Option<Value>,
        caller: &str,
        source: Option<&str>,
        dest: Option<&str>,
    ) {
        let Some(expression) = self.eval.read().clone() else {
            return;
        };
        let caller = eval_caller(caller);
        let mut scope = self.scope().with_trigger(caller.clone(), source, dest);
        if let Some(v) = &value {
            scope = scope.with_value(v.clone());
        }

        if let Some(condition) = &self.config.trigger_condition {
            match self.runtime.evaluator.evaluate_condition(condition, &scope) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(item = %self.path, condition = %condition, "Trigger condition not met");
                    return;
                }
                Err(e) => {
                    warn!(item = %self.path, caller = %caller, error = %e, "Problem evaluating trigger condition");
                    return;
                }
            }
        }

        let by = causer(&caller, source);
        self.state
            .lock()
            .provenance
            .trigger
            .record(Fact::by(self.runtime.clock.now(), by.clone()));

        let triggered =
            source.is_some_and(|s| self.eval_trigger_paths.read().iter().any(|t| t == s));
        let result = if self.config.eval_on_trigger_only && !triggered {
            info!(
                item = %self.path,
                triggered_by = %by,
                "Not triggered by an eval_trigger, ignoring eval expression"
            );
            value
        } else {
            debug!(item = %self.path, triggered_by = %by, expression = %expression, "Evaluating");
            match self.runtime.evaluator.evaluate(&expression, &scope) {
                Ok(result) => Some(result),
                Err(e) => {
                    self.state.lock().provenance.trigger.last.by = Some(format!("{by}:None"));
                    warn!(
                        item = %self.path,
                        caller = %caller,
                        source = ?source,
                        error = %e,
                        "Problem evaluating expression"
                    );
                    return;
                }
            }
        };

        match result {
            None | Some(Value::Null) => {
                debug!(item = %self.path, expression = %expression, "Expression returned nothing")
            }
            Some(result) => {
                self.update(result, &caller, source, dest, None);
            }
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn timer_job(&self) -> String {
        format!("items.{}-Timer", self.path)
    }

    /// Write `value` once after `time` (seconds or a duration string)
    ///
    /// With `auto` the timer also becomes the item's autotimer.
    pub fn timer(&self, time: &Value, value: Value, auto: bool) -> ItemResult<()> {
        let seconds = duration_seconds(time)
            .ok_or_else(|| ItemError::attribute(&self.path, "timer", format!("invalid duration {time}")))?;
        let value = (self.cast)(&value).map_err(|source| ItemError::TypeMismatch {
            path: self.path.clone(),
            source,
        })?;
        let caller = if auto {
            *self.autotimer.write() = Some(TimedValue {
                time: display_value(time),
                value: Some(literal_text(&value)),
            });
            AUTOTIMER_CALLER
        } else {
            TIMER_CALLER
        };
        self.schedule_write(&self.timer_job(), seconds, value, caller)
    }

    /// Cancel a pending timer
    pub fn remove_timer(&self) -> bool {
        self.runtime.scheduler.remove(&self.timer_job())
    }

    /// Set the autotimer, or clear it when either part is missing
    pub fn autotimer(&self, time: Option<&Value>, value: Option<Value>) {
        let timer = match (time, value) {
            (Some(time), Some(value)) => Some(TimedValue {
                time: display_value(time),
                value: Some(literal_text(&value)),
            }),
            _ => None,
        };
        *self.autotimer.write() = timer;
    }

    pub fn autotimer_setting(&self) -> Option<TimedValue> {
        self.autotimer.read().clone()
    }

    fn arm_autotimer(&self, value: &Value) {
        let Some(timer) = self.autotimer.read().clone() else {
            return;
        };
        let scope = self.scope().with_value(value.clone());
        let Some(seconds) = self.resolve_seconds(&timer.time, &scope) else {
            warn!(item = %self.path, time = %timer.time, "Invalid autotimer duration");
            return;
        };
        let target = match &timer.value {
            Some(text) => self.resolve_value(text, &scope),
            None => value.clone(),
        };
        if let Err(e) = self.schedule_write(&self.timer_job(), seconds, target, AUTOTIMER_CALLER) {
            warn!(item = %self.path, error = %e, "Unable to arm autotimer");
        }
    }

    /// One-shot job writing `value` to this item with `caller`
    pub(crate) fn schedule_write(
        &self,
        name: &str,
        seconds: i64,
        value: Value,
        caller: &str,
    ) -> ItemResult<()> {
        let Some(item) = self.self_arc() else {
            return Ok(());
        };
        let next = self.runtime.clock.now() + ChronoDuration::seconds(seconds.max(0));
        self.runtime.scheduler.add(
            JobSpec::new(name, JobTarget::Item(item))
                .next(next)
                .value(value)
                .caller(caller),
        )?;
        Ok(())
    }

    /// Seconds from a duration literal or an expression
    pub(crate) fn resolve_seconds(&self, text: &str, scope: &EvalScope) -> Option<i64> {
        if let Some(seconds) = to_seconds(text) {
            return Some(seconds);
        }
        match self.runtime.evaluator.evaluate(text, scope) {
            Ok(result) => duration_seconds(&result),
            Err(e) => {
                warn!(item = %self.path, expression = %text, error = %e, "Problem evaluating duration");
                None
            }
        }
    }

    /// A value from an expression, falling back to the literal text
    pub(crate) fn resolve_value(&self, text: &str, scope: &EvalScope) -> Value {
        match self.runtime.evaluator.evaluate(text, scope) {
            Ok(Value::Null) | Err(_) => {
                parse_literal(text).unwrap_or_else(|| Value::String(text.to_string()))
            }
            Ok(result) => result,
        }
    }
}

impl ScheduledItem for Item {
    fn path(&self) -> String {
        self.path.clone()
    }

    fn current_value(&self) -> Value {
        self.value()
    }

    fn scheduled_write(&self, value: Value, caller: &str, source: Option<&str>) {
        self.write(value, caller, source);
    }
}

/// Commit a change: shift values, advance change and update facts
fn commit(
    state: &mut ItemState,
    value: Value,
    now: DateTime<Tz>,
    by: &str,
    prev_change: Option<DateTime<Tz>>,
    last_change: Option<DateTime<Tz>>,
) {
    let old = std::mem::replace(&mut state.value, value);
    state.prev_value = std::mem::replace(&mut state.last_value, old);

    let at = last_change.unwrap_or(now);
    state.provenance.change.record(Fact::by(at, by));
    if let Some(prev) = prev_change {
        state.provenance.change.prev.at = prev;
    }
    state.provenance.update.record(Fact::by(at, by));
    state.provenance.trigger.last.by = Some(by.to_string());
}

fn apply_element(current: &Value, element: Element, value: Value) -> Result<Value, String> {
    match (element, current) {
        (Element::Key(key), Value::Object(map)) => {
            let mut map = map.clone();
            map.insert(key, value);
            Ok(Value::Object(map))
        }
        (Element::Index(index), Value::Array(list)) => {
            let mut list = list.clone();
            match index {
                ListIndex::Append => list.push(value),
                ListIndex::Prepend => list.insert(0, value),
                ListIndex::At(i) => {
                    let len = list.len() as i64;
                    let idx = if i < 0 { len + i } else { i };
                    if !(0..len).contains(&idx) {
                        return Err(format!("index {i} out of range for {len} elements"));
                    }
                    list[idx as usize] = value;
                }
            }
            Ok(Value::Array(list))
        }
        (Element::Key(key), _) => Err(format!("key '{key}' given for a non-dict item")),
        (Element::Index(_), _) => Err("index given for a non-list item".to_string()),
    }
}

/// Writes from expressions are recorded with an `Eval:` prefix
fn eval_caller(caller: &str) -> String {
    let lower = caller.to_ascii_lowercase();
    if caller == INIT_CALLER || lower.starts_with("eval:") || lower.ends_with(":eval") {
        caller.to_string()
    } else {
        format!("Eval:{caller}")
    }
}

fn by_or_na(fact: &Fact) -> String {
    fact.by.clone().unwrap_or_else(|| NOT_AVAILABLE.to_string())
}

/// Text form of a value that evaluates back to the same value
fn literal_text(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{}'", s.replace('\'', "\\'")),
        other => other.to_string(),
    }
}
