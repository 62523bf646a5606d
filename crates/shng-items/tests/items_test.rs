//! Item graph behaviour driven by a manual clock
//!
//! The scheduler runs without worker threads; `run_until_idle` executes
//! every queued job on the test thread.

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use shng_core::events::{ItemChangedData, ItemUpdatedData};
use shng_core::{ItemAccess, ManualClock};
use shng_eval::ExpressionEngine;
use shng_event_bus::{EventBus, SharedEventBus};
use shng_items::{
    update_callback, FadeRequest, Item, ItemRegistry, ItemRuntime, MethodTrigger, Plugin,
    RegistryOptions, StructRegistry, AUTOTIMER_CALLER, FADER_CALLER,
};
use shng_scheduler::{Logic, Scheduler, SchedulerConfig};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

struct Setup {
    registry: Arc<ItemRegistry>,
    scheduler: Arc<Scheduler>,
    clock: Arc<ManualClock>,
}

#[derive(Default)]
struct Options {
    cache_dir: Option<std::path::PathBuf>,
    events: Option<SharedEventBus>,
    structs: Option<StructRegistry>,
    plugin: Option<Arc<dyn Plugin>>,
}

fn make_test_setup_with(tree: Value, options: Options) -> Setup {
    let clock = Arc::new(ManualClock::at_utc(2024, 6, 1, 12, 0, 0));
    let config = SchedulerConfig {
        worker_num: 0,
        ..Default::default()
    };
    let scheduler = Arc::new(Scheduler::new(config, clock.clone()));
    let mut runtime = ItemRuntime::new(scheduler.clone(), Arc::new(ExpressionEngine::new()));
    if let Some(dir) = options.cache_dir {
        runtime = runtime.with_cache_dir(dir);
    }
    if let Some(events) = options.events {
        runtime = runtime.with_events(events);
    }
    let registry = ItemRegistry::new(Arc::new(runtime), RegistryOptions::default());
    let items: Arc<dyn ItemAccess> = registry.clone();
    scheduler.set_items(&items);
    if let Some(structs) = options.structs {
        registry.set_structs(structs);
    }
    if let Some(plugin) = options.plugin {
        registry.add_plugin(plugin);
    }
    registry.load(tree).unwrap();
    registry.init_prerun();
    registry.start_schedulers();
    Setup {
        registry,
        scheduler,
        clock,
    }
}

fn make_test_setup(tree: Value) -> Setup {
    make_test_setup_with(tree, Options::default())
}

/// Method trigger recording `(value, caller)` of every change
fn record_changes(item: &Item) -> Arc<Mutex<Vec<(Value, String)>>> {
    let writes = Arc::new(Mutex::new(Vec::new()));
    let sink = writes.clone();
    let callback: MethodTrigger = Arc::new(
        move |item: &Item, caller: &str, _source: Option<&str>, _dest: Option<&str>| {
            sink.lock().push((item.value(), caller.to_string()));
        },
    );
    item.add_method_trigger(callback);
    writes
}

fn map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("fixture must be an object"),
    }
}

// ============================================================================
// Write pipeline
// ============================================================================

#[test]
fn test_cast_is_idempotent() {
    let setup = make_test_setup(json!({
        "temp": {"type": "num"},
        "flag": {"type": "bool"},
        "label": {"type": "str"}
    }));
    let temp = setup.registry.get("temp").unwrap();
    temp.write(json!("21.5"), "Test", None);
    let once = temp.value();
    temp.write(once.clone(), "Test", None);
    assert_eq!(temp.value(), once);
    assert_eq!(once, json!(21.5));

    let flag = setup.registry.get("flag").unwrap();
    flag.write(json!("on"), "Test", None);
    assert_eq!(flag.value(), json!(true));
    flag.write(json!("maybe"), "Test", None);
    assert_eq!(flag.value(), json!(true));

    let label = setup.registry.get("label").unwrap();
    label.write(json!(12), "Test", None);
    assert_eq!(label.value(), json!("12"));
}

#[test]
fn test_timestamps_are_monotonic() {
    let setup = make_test_setup(json!({"counter": {"type": "num"}}));
    let counter = setup.registry.get("counter").unwrap();
    for i in 1..=5 {
        setup.clock.advance_secs(3);
        counter.write(json!(i), "Test", None);
        assert!(counter.prev_change() <= counter.last_change());
        assert!(counter.prev_update() <= counter.last_update());
        assert!(counter.last_change() <= counter.last_update());
    }
    setup.clock.advance_secs(3);
    counter.write(json!(5), "Test", None);
    assert!(counter.last_change() < counter.last_update());
    assert_eq!(counter.age(), 3.0);
}

#[test]
fn test_concurrent_writes_commit_one_at_a_time() {
    let setup = make_test_setup(json!({"level": {"type": "num"}}));
    let level = setup.registry.get("level").unwrap();
    let changes = Arc::new(AtomicUsize::new(0));
    let counter = changes.clone();
    level.add_method_trigger(Arc::new(
        move |_item: &Item, _caller: &str, _source: Option<&str>, _dest: Option<&str>| {
            counter.fetch_add(1, Ordering::SeqCst);
        },
    ));

    std::thread::scope(|s| {
        for thread in 1..=8 {
            let level = level.clone();
            s.spawn(move || {
                for i in 0..250 {
                    level.write(json!(thread * 1000 + i), "Thread", None);
                }
            });
        }
    });

    // every value is distinct, so every write is a committed change
    assert_eq!(changes.load(Ordering::SeqCst), 8 * 250);
    assert_ne!(level.value(), level.last_value());
}

#[test]
fn test_propagation_runs_once() {
    let setup = make_test_setup(json!({
        "a": {"type": "num"},
        "double": {"type": "num", "eval": "item('a') * 2", "eval_trigger": "a"}
    }));
    let a = setup.registry.get("a").unwrap();
    let double = setup.registry.get("double").unwrap();
    let changes = record_changes(&double);

    a.write(json!(4), "Test", None);
    assert_eq!(double.value(), json!(0));
    setup.scheduler.run_until_idle();
    assert_eq!(double.value(), json!(8));
    assert_eq!(changes.lock().len(), 1);
    assert_eq!(double.changed_by(), "Eval:Test:a");

    a.write(json!(4), "Test", None);
    setup.scheduler.run_until_idle();
    assert_eq!(changes.lock().len(), 1);
}

#[test]
fn test_cyclic_graph_settles() {
    let setup = make_test_setup(json!({
        "a": {"type": "num", "eval": "value", "eval_trigger": "b"},
        "b": {"type": "num", "eval": "value", "eval_trigger": "a"}
    }));
    let a = setup.registry.get("a").unwrap();
    let b = setup.registry.get("b").unwrap();
    let a_changes = record_changes(&a);
    let b_changes = record_changes(&b);

    a.write(json!(5), "Test", None);
    setup.scheduler.run_until_idle();
    assert_eq!(a.value(), json!(5));
    assert_eq!(b.value(), json!(5));
    assert_eq!(a_changes.lock().len(), 1);
    assert_eq!(b_changes.lock().len(), 1);
}

#[test]
fn test_trigger_condition_and_trigger_only() {
    let setup = make_test_setup(json!({
        "sensor": {"type": "num"},
        "alarm": {
            "type": "bool",
            "eval": "value > 50",
            "eval_trigger": "sensor",
            "trigger_condition": "value > 10"
        },
        "gate": {
            "type": "num",
            "eval": "value * 10",
            "eval_trigger": "sensor",
            "eval_on_trigger_only": true
        }
    }));
    let sensor = setup.registry.get("sensor").unwrap();
    let alarm = setup.registry.get("alarm").unwrap();
    let gate = setup.registry.get("gate").unwrap();

    sensor.write(json!(5), "Test", None);
    setup.scheduler.run_until_idle();
    assert_eq!(alarm.triggered_by(), "N/A");
    assert_eq!(gate.value(), json!(50));

    sensor.write(json!(60), "Test", None);
    setup.scheduler.run_until_idle();
    assert_eq!(alarm.value(), json!(true));

    gate.write(json!(3), "Visu", None);
    setup.scheduler.run_until_idle();
    assert_eq!(gate.value(), json!(3));
}

#[test]
fn test_trigger_only_accepts_wildcard_matches() {
    let setup = make_test_setup(json!({
        "sensor": {
            "inside": {"type": "num"},
            "outside": {"type": "num"}
        },
        "peak": {
            "type": "num",
            "eval": "value * 2",
            "eval_trigger": "sensor.*",
            "eval_on_trigger_only": true
        }
    }));
    let outside = setup.registry.get("sensor.outside").unwrap();
    let peak = setup.registry.get("peak").unwrap();

    outside.write(json!(7), "Test", None);
    setup.scheduler.run_until_idle();
    assert_eq!(peak.value(), json!(14));
    assert_eq!(peak.changed_by(), "Eval:Test:sensor.outside");

    peak.write(json!(3), "Visu", None);
    setup.scheduler.run_until_idle();
    assert_eq!(peak.value(), json!(3));
}

#[test]
fn test_on_change_writes_destination() {
    let setup = make_test_setup(json!({
        "living": {
            "temp": {
                "type": "num",
                "on_change": ["..fahrenheit = value * 9 // 5 + 32", "set_item('living.touched', true)"],
                "on_update": ".count = item('living.temp.count') + 1",
                "count": {"type": "num"}
            },
            "fahrenheit": {"type": "num"},
            "touched": {"type": "bool"}
        }
    }));
    let temp = setup.registry.get("living.temp").unwrap();
    temp.write(json!(20), "Test", None);
    temp.write(json!(20), "Test", None);
    setup.scheduler.run_until_idle();

    let fahrenheit = setup.registry.get("living.fahrenheit").unwrap();
    assert_eq!(fahrenheit.value(), json!(68));
    assert_eq!(fahrenheit.changed_by(), "On_Change:living.temp");
    assert_eq!(setup.registry.get("living.touched").unwrap().value(), json!(true));
    assert_eq!(setup.registry.get("living.temp.count").unwrap().value(), json!(2));
}

#[test]
fn test_threshold_fires_logics_on_edges() {
    let setup = make_test_setup(json!({"temp": {"type": "num", "threshold": "20:25"}}));
    let temp = setup.registry.get("temp").unwrap();
    let runs = Arc::new(Mutex::new(Vec::new()));
    let sink = runs.clone();
    temp.add_logic_trigger(Arc::new(Logic::from_fn("heating", move |ctx| {
        sink.lock().push(ctx.trigger.value.clone());
        Ok(())
    })));

    for v in [22, 26, 27, 23, 19, 18, 30] {
        temp.write(json!(v), "Test", None);
        setup.scheduler.run_until_idle();
    }
    assert_eq!(*runs.lock(), vec![Some(json!(26)), Some(json!(19)), Some(json!(30))]);
}

// ============================================================================
// Hysteresis
// ============================================================================

#[test]
fn test_hysteresis_sequence() {
    let setup = make_test_setup(json!({
        "temp": {"type": "num"},
        "heating": {
            "type": "bool",
            "hysteresis_input": "temp",
            "hysteresis_upper_threshold": 20,
            "hysteresis_lower_threshold": 10
        }
    }));
    let temp = setup.registry.get("temp").unwrap();
    let heating = setup.registry.get("heating").unwrap();
    assert_eq!(temp.hysteresis_items_to_trigger(), vec!["heating"]);

    let mut outputs = Vec::new();
    for input in [0, 15, 25, 5] {
        temp.write(json!(input), "Test", None);
        setup.scheduler.run_until_idle();
        outputs.push(heating.value());
    }
    assert_eq!(outputs, vec![json!(false), json!(false), json!(true), json!(false)]);
    assert_eq!(heating.hysteresis_state().as_deref(), Some("Off"));

    temp.write(json!(15), "Test", None);
    setup.scheduler.run_until_idle();
    assert_eq!(heating.hysteresis_state().as_deref(), Some("Stay (Off)"));
}

#[test]
fn test_hysteresis_timer_delays_edge() {
    let setup = make_test_setup(json!({
        "temp": {"type": "num"},
        "fan": {
            "type": "bool",
            "hysteresis_input": "temp",
            "hysteresis_upper_threshold": "20 | 30",
            "hysteresis_lower_threshold": 10
        }
    }));
    let temp = setup.registry.get("temp").unwrap();
    let fan = setup.registry.get("fan").unwrap();

    temp.write(json!(25), "Test", None);
    setup.scheduler.run_until_idle();
    assert_eq!(fan.value(), json!(false));
    assert_eq!(fan.hysteresis_state().as_deref(), Some("Timer -> On"));
    let data = fan.hysteresis_data().unwrap();
    assert_eq!(data["upper_timer"], json!(30.0));
    assert_eq!(data["upper_timer_active"], json!(true));

    setup.clock.advance_secs(30);
    setup.scheduler.run_until_idle();
    assert_eq!(fan.value(), json!(true));
    assert!(fan.changed_by().starts_with("Hysteresis"));

    // dropping below the upper threshold before the timer ends cancels it
    fan.write(json!(false), "Test", None);
    temp.write(json!(26), "Test", None);
    setup.scheduler.run_until_idle();
    temp.write(json!(15), "Test", None);
    setup.scheduler.run_until_idle();
    setup.clock.advance_secs(60);
    setup.scheduler.run_until_idle();
    assert_eq!(fan.value(), json!(false));
}

// ============================================================================
// Fading
// ============================================================================

#[test]
fn test_fade_writes_every_step() {
    let setup = make_test_setup(json!({"dimmer": {"type": "num"}}));
    let dimmer = setup.registry.get("dimmer").unwrap();
    let writes = record_changes(&dimmer);

    assert!(dimmer.fade(FadeRequest::new(10.0, 2.0, 0.0)));
    setup.scheduler.run_until_idle();

    let writes = writes.lock();
    let values: Vec<Value> = writes.iter().map(|(v, _)| v.clone()).collect();
    assert_eq!(values, vec![json!(2), json!(4), json!(6), json!(8), json!(10)]);
    assert!(writes.iter().all(|(_, caller)| caller == FADER_CALLER));
    assert!(!dimmer.is_fading());
}

#[test]
fn test_foreign_write_stops_fade() {
    let setup = make_test_setup(json!({"dimmer": {"type": "num"}}));
    let dimmer = setup.registry.get("dimmer").unwrap();

    assert!(dimmer.fade(FadeRequest::new(100.0, 10.0, 1.0)));
    assert!(!dimmer.fade(FadeRequest::new(50.0, 10.0, 1.0)));
    setup.scheduler.run_until_idle();
    assert_eq!(dimmer.value(), json!(10));

    dimmer.write(json!(42), "Visu", None);
    assert!(!dimmer.is_fading());
    setup.clock.advance_secs(5);
    setup.scheduler.run_until_idle();
    assert_eq!(dimmer.value(), json!(42));
}

#[test]
fn test_continue_list_drops_foreign_writes() {
    let setup = make_test_setup(json!({"dimmer": {"type": "num"}}));
    let dimmer = setup.registry.get("dimmer").unwrap();

    let request = FadeRequest::new(30.0, 10.0, 1.0).continue_fade(vec!["knx".to_string()]);
    assert!(dimmer.fade(request));
    setup.scheduler.run_until_idle();
    dimmer.write(json!(99), "knx", None);
    assert!(dimmer.is_fading());
    assert_eq!(dimmer.value(), json!(10));

    for _ in 0..3 {
        setup.clock.advance_secs(1);
        setup.scheduler.run_until_idle();
    }
    assert_eq!(dimmer.value(), json!(30));
}

// ============================================================================
// Timers and schedules
// ============================================================================

#[test]
fn test_autotimer_fires_once_without_rearming() {
    let setup = make_test_setup(json!({
        "light": {"type": "num", "autotimer": "10 = 0"}
    }));
    let light = setup.registry.get("light").unwrap();
    let writes = record_changes(&light);

    light.write(json!(80), "Visu", None);
    setup.clock.advance_secs(10);
    setup.scheduler.run_until_idle();
    assert_eq!(light.value(), json!(0));

    setup.clock.advance_secs(100);
    setup.scheduler.run_until_idle();
    let by_autotimer = writes
        .lock()
        .iter()
        .filter(|(_, caller)| caller == AUTOTIMER_CALLER)
        .count();
    assert_eq!(by_autotimer, 1);
    assert!(setup.scheduler.get("items.light-Timer").unwrap().next.is_none());
}

#[test]
fn test_cycle_writes_value() {
    let setup = make_test_setup(json!({"ping": {"type": "num", "cycle": "60 = 5"}}));
    let ping = setup.registry.get("ping").unwrap();
    let job = setup.scheduler.get("items.ping").unwrap();
    assert_eq!(job.cycle, Some(60));

    setup.clock.advance_secs(15);
    setup.scheduler.run_until_idle();
    assert_eq!(ping.value(), json!(5));
    assert_eq!(ping.changed_by(), "Scheduler:cycle");
}

#[test]
fn test_dynamic_cycle_follows_item() {
    let setup = make_test_setup(json!({
        "interval": {"type": "num", "initial_value": 30},
        "poll": {"type": "num", "cycle": "item('interval') = 1"}
    }));
    assert_eq!(setup.scheduler.get("items.poll").unwrap().cycle, Some(30));

    let interval = setup.registry.get("interval").unwrap();
    interval.write(json!(90), "Visu", None);
    assert_eq!(setup.scheduler.get("items.poll").unwrap().cycle, Some(90));
}

// ============================================================================
// Cache
// ============================================================================

#[test]
fn test_cache_round_trip() {
    let dir = TempDir::new().unwrap();
    let tree = json!({"living": {"temp": {"type": "num", "cache": true}}});
    let options = |dir: &Path| Options {
        cache_dir: Some(dir.to_path_buf()),
        ..Default::default()
    };

    let first = make_test_setup_with(tree.clone(), options(dir.path()));
    let temp = first.registry.get("living.temp").unwrap();
    assert!(dir.path().join("living.temp").exists());
    temp.write(json!(23.5), "knx", None);
    let changed = temp.last_change();

    let second = make_test_setup_with(tree, options(dir.path()));
    let temp = second.registry.get("living.temp").unwrap();
    assert_eq!(temp.value(), json!(23.5));
    assert_eq!(temp.changed_by(), "Init:Cache");
    assert_eq!(temp.last_change(), changed);
    assert!(temp.restored_from_cache());
}

#[test]
fn test_cached_eval_item_skips_initial_run() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("sum"),
        r#"{"changed": "2024-05-01T10:00:00+00:00", "value": 42}"#,
    )
    .unwrap();
    let setup = make_test_setup_with(
        json!({
            "a": {"type": "num", "initial_value": 1},
            "sum": {"type": "num", "eval": "sum", "eval_trigger": "a", "cache": true}
        }),
        Options {
            cache_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        },
    );
    assert_eq!(setup.registry.init_run(), 0);
    setup.scheduler.run_until_idle();
    assert_eq!(setup.registry.get("sum").unwrap().value(), json!(42));
}

#[test]
fn test_concurrent_writes_leave_latest_value_in_cache() {
    let dir = TempDir::new().unwrap();
    let setup = make_test_setup_with(
        json!({"level": {"type": "num", "cache": true}}),
        Options {
            cache_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        },
    );
    let level = setup.registry.get("level").unwrap();

    std::thread::scope(|s| {
        for thread in 0..8 {
            let level = level.clone();
            s.spawn(move || {
                for i in 0..50 {
                    level.write(json!(thread * 1000 + i), "knx", None);
                }
            });
        }
    });

    let content = std::fs::read_to_string(dir.path().join("level")).unwrap();
    let document: Value = serde_json::from_str(&content).unwrap();
    assert_eq!(document["value"], level.value());
    // no temporary files left behind
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
}

#[test]
fn test_cache_value_of_wrong_type_is_dropped() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("temp");
    std::fs::write(&file, r#"{"value": "abc"}"#).unwrap();
    let setup = make_test_setup_with(
        json!({"temp": {"type": "num", "cache": true}}),
        Options {
            cache_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        },
    );
    let temp = setup.registry.get("temp").unwrap();
    assert_eq!(temp.value(), json!(0));
    assert!(!temp.restored_from_cache());
    assert!(!file.exists());
}

// ============================================================================
// Registry
// ============================================================================

#[test]
fn test_structs_expand_into_items() {
    let mut structs = StructRegistry::new();
    structs.add(
        None,
        "dimmer",
        map(json!({
            "type": "bool",
            "level": {"type": "num", "initial_value": 50}
        })),
    );
    let setup = make_test_setup_with(
        json!({"living": {"lamp": {"struct": "dimmer", "name": "Living lamp"}}}),
        Options {
            structs: Some(structs),
            ..Default::default()
        },
    );
    let lamp = setup.registry.get("living.lamp").unwrap();
    assert_eq!(lamp.item_type().as_str(), "bool");
    assert_eq!(lamp.name(), "Living lamp");
    assert_eq!(
        setup.registry.get("living.lamp.level").unwrap().value(),
        json!(50)
    );
}

#[test]
fn test_relative_attribute_references() {
    let setup = make_test_setup(json!({
        "living": {
            "knx_group": "1/2/3",
            "light": {
                "type": "bool",
                "knx_send": "..:knx_group",
                "knx_listen": ".:knx_send"
            }
        }
    }));
    let light = setup.registry.get("living.light").unwrap();
    assert_eq!(light.attribute("knx_send"), Some(&json!("1/2/3")));
    assert_eq!(light.attribute("knx_listen"), Some(&json!("1/2/3")));
    assert_eq!(
        setup.registry.match_items("living.*:knx_send[1/2/3]").len(),
        1
    );
}

#[derive(Clone, Default)]
struct RecordingPlugin {
    updates: Arc<Mutex<Vec<(String, String)>>>,
}

impl Plugin for RecordingPlugin {
    fn name(&self) -> &str {
        "knx"
    }

    fn parse_item(&self, item: &Arc<Item>) -> Option<MethodTrigger> {
        item.attribute("knx_dpt")?;
        Some(update_callback(Arc::new(self.clone())))
    }

    fn update_item(&self, item: &Item, caller: &str, _source: Option<&str>, _dest: Option<&str>) {
        self.updates.lock().push((item.path().to_string(), caller.to_string()));
    }
}

#[test]
fn test_plugin_sees_writes_of_claimed_items() {
    let plugin = RecordingPlugin::default();
    let updates = plugin.updates.clone();
    let setup = make_test_setup_with(
        json!({
            "hall": {"type": "bool", "knx_dpt": 1},
            "attic": {"type": "bool"}
        }),
        Options {
            plugin: Some(Arc::new(plugin)),
            ..Default::default()
        },
    );
    let hall = setup.registry.get("hall").unwrap();
    hall.write(json!(true), "Visu", None);
    hall.write(json!(false), "knx", Some("1/1/1"));
    setup.registry.get("attic").unwrap().write(json!(true), "Visu", None);

    assert_eq!(*updates.lock(), vec![("hall".to_string(), "Visu".to_string())]);
}

// ============================================================================
// Events
// ============================================================================

#[tokio::test]
async fn test_events_fired_for_changes_and_updates() {
    let bus: SharedEventBus = Arc::new(EventBus::new());
    let mut changed = bus.subscribe_typed::<ItemChangedData>();
    let mut updated = bus.subscribe_typed::<ItemUpdatedData>();
    let setup = make_test_setup_with(
        json!({"window": {"type": "bool"}}),
        Options {
            events: Some(bus.clone()),
            ..Default::default()
        },
    );
    let window = setup.registry.get("window").unwrap();
    window.write(json!(true), "knx", Some("2/0/1"));
    window.write(json!(true), "knx", Some("2/0/1"));

    let event = changed.recv().await.unwrap();
    assert_eq!(event.path, "window");
    assert_eq!(event.time_fired, window.last_change());
    assert_eq!(event.data.old_value, json!(false));
    assert_eq!(event.data.new_value, json!(true));
    assert_eq!(event.data.source.as_deref(), Some("2/0/1"));

    let event = updated.recv().await.unwrap();
    assert_eq!(event.data.value, json!(true));
    assert_eq!(event.data.caller, "knx");
}
