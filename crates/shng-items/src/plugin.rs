//! Plugin hooks into item construction

use crate::item::{Item, MethodTrigger};
use std::sync::Arc;

/// A plugin that looks at every item while the tree is built
///
/// `parse_item` may claim an item by returning a callback; the callback is
/// registered as a method trigger and runs after every qualifying write.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Inspect a new item, return a callback to be notified of its writes
    fn parse_item(&self, item: &Arc<Item>) -> Option<MethodTrigger> {
        let _ = item;
        None
    }

    /// Called by the callback returned from [`update_callback`]
    fn update_item(&self, item: &Item, caller: &str, source: Option<&str>, dest: Option<&str>) {
        let _ = (item, caller, source, dest);
    }
}

/// Shared handle to a plugin
pub type SharedPlugin = Arc<dyn Plugin>;

/// A method trigger forwarding writes to `plugin.update_item`
///
/// Writes issued by the plugin itself are not echoed back.
pub fn update_callback(plugin: SharedPlugin) -> MethodTrigger {
    Arc::new(move |item: &Item, caller: &str, source: Option<&str>, dest: Option<&str>| {
        if caller != plugin.name() {
            plugin.update_item(item, caller, source, dest);
        }
    })
}
