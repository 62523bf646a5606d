//! SmartHome runtime
//!
//! Main entry point: loads the deployment directory, builds the item tree
//! and runs the scheduler until interrupted.
//!
//! The base directory is taken from the first argument, else from
//! `SMARTHOME_BASE`, else the working directory.

use anyhow::{Context, Result};
use shng_config::{load_items, load_structs, CoreConfig};
use shng_core::events::ItemChangedData;
use shng_core::{ItemAccess, SharedClock, SystemClock};
use shng_eval::ExpressionEngine;
use shng_event_bus::{EventBus, SharedEventBus, TypedEventReceiver};
use shng_items::{ItemRegistry, ItemRuntime};
use shng_scheduler::{Scheduler, SharedScheduler};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// The composed runtime
pub struct SmartHome {
    pub config: CoreConfig,
    pub scheduler: SharedScheduler,
    pub items: Arc<ItemRegistry>,
    pub events: SharedEventBus,
}

impl SmartHome {
    /// Build everything from a base directory, without starting the scheduler
    pub fn bootstrap(base_dir: &Path) -> Result<Self> {
        let config = CoreConfig::load(base_dir).context("loading core configuration")?;
        let tz = config.timezone()?;
        let clock: SharedClock = Arc::new(SystemClock::new(tz));

        let bus = Arc::new(EventBus::new());
        let scheduler = Arc::new(Scheduler::new(config.scheduler.clone(), clock));
        let runtime = ItemRuntime::new(scheduler.clone(), Arc::new(ExpressionEngine::new()))
            .with_cache_dir(config.cache_path(base_dir))
            .with_events(bus.clone());
        let items = ItemRegistry::new(Arc::new(runtime), config.registry_options());
        let access: Arc<dyn ItemAccess> = items.clone();
        scheduler.set_items(&access);

        let structs = load_structs(base_dir.join("etc")).context("loading struct definitions")?;
        items.set_structs(structs);

        let items_dir = base_dir.join("items");
        if items_dir.is_dir() {
            let tree = load_items(&items_dir).context("loading item definitions")?;
            let count = items.load(tree)?;
            info!(items = count, "Item tree built");
        } else {
            warn!(dir = ?items_dir, "No items directory, starting without items");
        }
        items.init_prerun();
        items.start_schedulers();

        Ok(Self {
            config,
            scheduler,
            items,
            events: bus,
        })
    }

    /// Run the first evaluations and start the scheduler
    pub fn start(&self) -> Result<()> {
        let queued = self.items.init_run();
        info!(queued, "Initial evaluations queued");
        self.scheduler.start()?;
        Ok(())
    }

    pub fn stop(&self) {
        self.scheduler.stop();
    }
}

/// Log every item change at debug level on the `items.event` target
///
/// Returns the number of events seen once the bus is gone.
async fn log_item_changes(mut rx: TypedEventReceiver<ItemChangedData>) -> usize {
    let mut seen = 0;
    loop {
        match rx.recv().await {
            Ok(event) => {
                seen += 1;
                tracing::debug!(
                    target: "items.event",
                    item = %event.path,
                    old = %event.data.old_value,
                    new = %event.data.new_value,
                    caller = %event.data.caller,
                    source = ?event.data.source,
                    at = %event.time_fired,
                    "Item changed"
                );
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event log fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => return seen,
        }
    }
}

fn spawn_event_log(events: &EventBus) -> JoinHandle<usize> {
    tokio::spawn(log_item_changes(events.subscribe_typed::<ItemChangedData>()))
}

fn base_dir() -> PathBuf {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SMARTHOME_BASE").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let base_dir = base_dir();
    info!(base_dir = ?base_dir, "Starting SmartHome");

    let home = Arc::new(SmartHome::bootstrap(&base_dir)?);
    let event_log = spawn_event_log(&home.events);

    let (restart_tx, mut restart_rx) = mpsc::unbounded_channel::<String>();
    home.scheduler.set_restart_handler(move |reason: &str| {
        let _ = restart_tx.send(reason.to_string());
    });

    home.start()?;
    info!(tz = %home.config.tz, "SmartHome is running");

    let exit_reason = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            None
        }
        reason = restart_rx.recv() => reason,
    };

    info!("Shutting down...");
    let stopping = home.clone();
    tokio::task::spawn_blocking(move || stopping.stop()).await?;
    event_log.abort();

    if let Some(reason) = exit_reason {
        // a supervisor is expected to start the process again
        error!(reason = %reason, "Restart requested by the scheduler");
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use shng_core::{EventKind, Tz};
    use tempfile::TempDir;

    fn make_test_setup() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        std::fs::create_dir_all(dir.path().join("items")).unwrap();
        std::fs::write(
            dir.path().join("etc/smarthome.yaml"),
            "tz: Europe/Berlin\nscheduler:\n  worker_num: 1\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("items/living.yaml"),
            "living:\n  temp:\n    type: num\n    initial_value: 21\n",
        )
        .unwrap();
        dir
    }

    #[test]
    fn test_bootstrap_builds_items() {
        let dir = make_test_setup();
        let home = SmartHome::bootstrap(dir.path()).unwrap();
        assert_eq!(home.items.item_value("living.temp"), Some(json!(21)));
        assert_eq!(home.config.tz, "Europe/Berlin");
        assert!(!home.scheduler.is_running());
    }

    #[test]
    fn test_start_and_stop() {
        let dir = make_test_setup();
        let home = SmartHome::bootstrap(dir.path()).unwrap();
        home.start().unwrap();
        assert!(home.scheduler.is_running());
        home.stop();
        assert!(!home.scheduler.is_running());
    }

    #[tokio::test]
    async fn test_event_log_follows_item_changes() {
        let dir = make_test_setup();
        let home = SmartHome::bootstrap(dir.path()).unwrap();
        let event_log = spawn_event_log(&home.events);
        assert!(home.events.has_subscribers(EventKind::ItemChanged));

        let mut changes = home.events.subscribe_typed::<ItemChangedData>();
        assert!(home.items.write_item("living.temp", json!(22), "Test", None));
        let event = changes.recv().await.unwrap();
        assert_eq!(event.path, "living.temp");
        assert!(!event_log.is_finished());
        event_log.abort();
    }

    #[tokio::test]
    async fn test_event_log_counts_until_bus_is_dropped() {
        let bus = EventBus::new();
        let event_log = spawn_event_log(&bus);
        let at = Tz::UTC.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        for value in [1, 2] {
            let data = ItemChangedData {
                path: "hall.light".to_string(),
                old_value: json!(value - 1),
                new_value: json!(value),
                caller: "Test".to_string(),
                source: None,
                dest: None,
            };
            bus.fire_typed(data, at);
        }
        drop(bus);
        assert_eq!(event_log.await.unwrap(), 2);
    }

    #[test]
    fn test_bootstrap_without_items_dir() {
        let dir = TempDir::new().unwrap();
        let home = SmartHome::bootstrap(dir.path()).unwrap();
        assert!(home.items.is_empty());
    }
}
