//! Clock abstraction and duration strings
//!
//! Every component reads wall-clock time through a [`TimeSource`] so tests can
//! drive time deterministically with a [`ManualClock`].

use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

/// A timezone-aware wall clock
pub trait TimeSource: Send + Sync {
    /// Current local time
    fn now(&self) -> DateTime<Tz>;

    /// The configured timezone
    fn tz(&self) -> Tz;

    /// Seconds elapsed since `then`, never negative
    fn seconds_since(&self, then: &DateTime<Tz>) -> f64 {
        let delta = self.now().signed_duration_since(*then);
        (delta.num_milliseconds() as f64 / 1000.0).max(0.0)
    }
}

/// Shared handle to the process clock
pub type SharedClock = Arc<dyn TimeSource>;

/// The system clock rendered in a fixed timezone
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    tz: Tz,
}

impl SystemClock {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    /// Build a clock from an IANA timezone name
    pub fn from_name(name: &str) -> Option<Self> {
        name.parse::<Tz>().ok().map(Self::new)
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new(Tz::UTC)
    }
}

impl TimeSource for SystemClock {
    fn now(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&self.tz)
    }

    fn tz(&self) -> Tz {
        self.tz
    }
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    tz: Tz,
    now: Mutex<DateTime<Tz>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Tz>) -> Self {
        Self {
            tz: start.timezone(),
            now: Mutex::new(start),
        }
    }

    /// Start at a fixed UTC instant, handy in tests
    pub fn at_utc(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        let start = Tz::UTC
            .with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .unwrap_or_else(|| Utc::now().with_timezone(&Tz::UTC));
        Self::new(start)
    }

    pub fn set(&self, now: DateTime<Tz>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    pub fn advance_secs(&self, secs: i64) {
        self.advance(Duration::seconds(secs));
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> DateTime<Tz> {
        *self.now.lock()
    }

    fn tz(&self) -> Tz {
        self.tz
    }
}

/// Convert a duration string such as `45`, `45s`, `5m` or `2h5m45s` to seconds
///
/// Returns `None` when the string is not a valid duration.
pub fn to_seconds(time: &str) -> Option<i64> {
    let mut rest = time.trim();
    if rest.is_empty() {
        return None;
    }
    let mut total: i64 = 0;

    for (unit, factor) in [('h', 3600), ('m', 60)] {
        if let Some((head, tail)) = rest.split_once(unit) {
            total += head.trim().parse::<i64>().ok()? * factor;
            rest = tail.trim();
        }
    }

    match rest.split_once('s') {
        Some((head, tail)) => {
            if !tail.trim().is_empty() {
                return None;
            }
            total += head.trim().parse::<i64>().ok()?;
        }
        None if !rest.is_empty() => total += rest.parse::<i64>().ok()?,
        None => {}
    }

    Some(total)
}

/// Convert a duration given as JSON (number or duration string) to seconds
pub fn duration_seconds(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        serde_json::Value::String(s) => {
            let secs = to_seconds(s);
            if secs.is_none() {
                warn!(time = %s, "Unable to convert duration to seconds");
            }
            secs
        }
        _ => None,
    }
}

/// Split a `time = value` (or `time | value`) attribute into its parts
///
/// The value part is `None` when no separator is present.
pub fn split_duration_value(raw: &str) -> (String, Option<String>) {
    let raw = strip_quotes(raw.trim());
    let split = raw.split_once('|').or_else(|| raw.split_once('='));
    match split {
        Some((time, value)) => {
            let value = value.split(['|', '=']).next().unwrap_or_default().trim();
            (time.trim().to_string(), Some(value.to_string()))
        }
        None => (raw.to_string(), None),
    }
}

fn strip_quotes(s: &str) -> &str {
    let bytes = s.as_bytes();
    if bytes.len() >= 2
        && ((bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\'')
            || (bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"'))
    {
        &s[1..s.len() - 1]
    } else {
        s
    }
}
