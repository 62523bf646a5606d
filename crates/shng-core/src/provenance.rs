//! Who touched an item and when

use chrono::DateTime;
use chrono_tz::Tz;
use serde::Serialize;

/// Format the causer string stored with every fact: `caller:source`
///
/// A missing source renders as `None`, so `"Init:Cache"` and `"Logic:None"`
/// are both valid causers.
pub fn causer(caller: &str, source: Option<&str>) -> String {
    format!("{}:{}", caller, source.unwrap_or("None"))
}

/// A single timestamped fact about an item
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fact {
    pub at: DateTime<Tz>,
    pub by: Option<String>,
}

impl Fact {
    pub fn new(at: DateTime<Tz>) -> Self {
        Self { at, by: None }
    }

    pub fn by(at: DateTime<Tz>, by: impl Into<String>) -> Self {
        Self {
            at,
            by: Some(by.into()),
        }
    }
}

/// A last/previous pair of facts
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FactPair {
    pub last: Fact,
    pub prev: Fact,
}

impl FactPair {
    pub fn new(at: DateTime<Tz>) -> Self {
        Self {
            last: Fact::new(at),
            prev: Fact::new(at),
        }
    }

    /// Shift `last` into `prev` and record a new fact
    pub fn record(&mut self, fact: Fact) {
        self.prev = std::mem::replace(&mut self.last, fact);
    }
}

/// Change, update and trigger history of an item
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Provenance {
    pub change: FactPair,
    pub update: FactPair,
    pub trigger: FactPair,
}

impl Provenance {
    pub fn new(at: DateTime<Tz>) -> Self {
        Self {
            change: FactPair::new(at),
            update: FactPair::new(at),
            trigger: FactPair::new(at),
        }
    }
}
