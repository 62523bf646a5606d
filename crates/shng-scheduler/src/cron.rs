//! Crontab parsing and next-fire resolution
//!
//! Crontab entries come in three shapes:
//!
//! - `min hour day wday` (four fields, month implied as `*`)
//! - `min hour day month wday` (five fields)
//! - `sec min hour day month wday` (six fields)
//!
//! Weekdays count from `0` = Monday to `6` = Sunday and are translated to
//! names before the entry is handed to the `cron` crate, which counts from
//! Sunday. `@hourly`-style presets pass through unchanged.

use chrono::DateTime;
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;
use tracing::{debug, warn};

const WEEKDAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

const SKY_EVENTS: [&str; 4] = ["sunrise", "sunset", "moonrise", "moonset"];

/// A parsed crontab entry
#[derive(Debug, Clone)]
pub struct Crontab {
    entry: String,
    schedule: Schedule,
}

impl Crontab {
    /// Parse a crontab entry, returning `None` (with a warning) when invalid
    pub fn parse(entry: &str) -> Option<Self> {
        let entry = entry.trim();
        let lowered = entry.to_lowercase();
        if SKY_EVENTS.iter().any(|event| lowered.contains(event)) {
            warn!(entry, "Astronomical crontab entries are not supported");
            return None;
        }
        let normalized = normalize_crontab(entry)?;
        match Schedule::from_str(&normalized) {
            Ok(schedule) => Some(Self {
                entry: entry.to_string(),
                schedule,
            }),
            Err(e) => {
                warn!(entry, normalized = %normalized, error = %e, "Invalid crontab entry");
                None
            }
        }
    }

    /// The entry as written
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// First fire time strictly after `after`
    pub fn next_after(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.schedule.after(after).next()
    }
}

/// Resolve the next fire time of `entry` after `after`
pub fn get_next(entry: &str, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
    let next = Crontab::parse(entry)?.next_after(after);
    debug!(entry, ?next, "Resolved next crontab time");
    next
}

/// Rewrite a crontab entry into the six field form the `cron` crate expects
pub fn normalize_crontab(entry: &str) -> Option<String> {
    let entry = entry.trim();
    if entry.starts_with('@') {
        return Some(entry.to_string());
    }
    let fields: Vec<&str> = entry.split_whitespace().collect();
    let (second, minute, hour, day, month, wday) = match fields.as_slice() {
        [minute, hour, day, wday] => ("0", *minute, *hour, *day, "*", *wday),
        [minute, hour, day, month, wday] => ("0", *minute, *hour, *day, *month, *wday),
        [second, minute, hour, day, month, wday] => (*second, *minute, *hour, *day, *month, *wday),
        _ => {
            warn!(entry, fields = fields.len(), "Crontab entry needs 4 to 6 fields");
            return None;
        }
    };
    let wday = translate_weekdays(wday)?;
    Some(format!("{second} {minute} {hour} {day} {month} {wday}"))
}

/// Map `0`-based Monday-first weekday numbers onto names
fn translate_weekdays(field: &str) -> Option<String> {
    let mut parts = Vec::new();
    for part in field.split(',') {
        let (base, step) = match part.split_once('/') {
            Some((base, step)) => (base, Some(step)),
            None => (part, None),
        };
        let base = if base == "*" || base == "?" {
            base.to_string()
        } else {
            base.split('-')
                .map(weekday_name)
                .collect::<Option<Vec<_>>>()?
                .join("-")
        };
        parts.push(match step {
            Some(step) => format!("{base}/{step}"),
            None => base,
        });
    }
    Some(parts.join(","))
}

fn weekday_name(token: &str) -> Option<String> {
    let token = token.trim();
    if let Ok(n) = token.parse::<usize>() {
        return match WEEKDAYS.get(n) {
            Some(name) => Some((*name).to_string()),
            None => {
                warn!(weekday = n, "Weekday out of range 0..6");
                None
            }
        };
    }
    let lowered = token.to_lowercase();
    WEEKDAYS
        .iter()
        .find(|name| lowered.starts_with(&name.to_lowercase()))
        .map(|name| (*name).to_string())
        .or_else(|| {
            warn!(weekday = token, "Unknown weekday");
            None
        })
}
