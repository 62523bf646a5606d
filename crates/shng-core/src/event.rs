//! Item events
//!
//! Every committed write produces exactly one event: `item_changed` when
//! the value changed, `item_updated` when it was written unchanged. Events
//! carry the item path and the item clock time of the write, so subscribers
//! on a manual clock see deterministic timestamps.

use chrono::DateTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What happened to the item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ItemChanged,
    ItemUpdated,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ItemChanged => "item_changed",
            EventKind::ItemUpdated => "item_updated",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of an item event
pub trait EventData: Clone + Send + Sync + 'static {
    const KIND: EventKind;

    /// Path of the item the event is about
    fn item_path(&self) -> &str;
}

/// An event as carried by the bus
#[derive(Debug, Clone, Serialize)]
pub struct Event<T = Value> {
    pub kind: EventKind,
    pub path: String,
    pub data: T,
    pub time_fired: DateTime<Tz>,
}

impl<T> Event<T> {
    pub fn new(kind: EventKind, path: impl Into<String>, data: T, time_fired: DateTime<Tz>) -> Self {
        Self {
            kind,
            path: path.into(),
            data,
            time_fired,
        }
    }

    /// Swap the payload, keeping kind, path and time
    pub fn with_data<U>(self, data: U) -> Event<U> {
        Event {
            kind: self.kind,
            path: self.path,
            data,
            time_fired: self.time_fired,
        }
    }
}

impl<T: EventData> Event<T> {
    pub fn typed(data: T, time_fired: DateTime<Tz>) -> Self {
        Self::new(T::KIND, data.item_path().to_string(), data, time_fired)
    }
}

/// Payload of `item_changed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemChangedData {
    pub path: String,
    pub old_value: Value,
    pub new_value: Value,
    pub caller: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest: Option<String>,
}

impl EventData for ItemChangedData {
    const KIND: EventKind = EventKind::ItemChanged;

    fn item_path(&self) -> &str {
        &self.path
    }
}

/// Payload of `item_updated`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemUpdatedData {
    pub path: String,
    pub value: Value,
    pub caller: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl EventData for ItemUpdatedData {
    const KIND: EventKind = EventKind::ItemUpdated;

    fn item_path(&self) -> &str {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_typed_event_takes_item_path() {
        let at = Tz::Europe__Berlin.with_ymd_and_hms(2024, 6, 1, 14, 0, 0).unwrap();
        let event = Event::typed(
            ItemUpdatedData {
                path: "living.temp".to_string(),
                value: json!(21),
                caller: "knx".to_string(),
                source: None,
            },
            at,
        );
        assert_eq!(event.kind, EventKind::ItemUpdated);
        assert_eq!(event.path, "living.temp");
        assert_eq!(event.time_fired, at);
        assert_eq!(serde_json::to_value(event.kind).unwrap(), json!("item_updated"));
    }
}
