//! `log_change` audit lines
//!
//! Items with a `log_change` attribute write one line per committed change
//! to a named logger. `log_rules` filters what gets logged, `log_mapping`
//! translates values and `log_text` replaces the standard line with a
//! template whose `{...}` segments are evaluated as expressions.

use crate::item::Item;
use serde_json::{json, Map, Value};
use shng_core::value::{as_f64, display_value, parse_literal, values_equal};
use shng_core::{ItemAccess, ItemType};
use tracing::{debug, error, info, trace, warn, Level};

/// Tracing target of audit lines; the configured logger name is a field
pub const CHANGE_LOG_TARGET: &str = "items.change";

/// Parse a log level name or number, `NOTICE` maps to info
pub fn parse_level(raw: &str) -> Option<Level> {
    let raw = raw.trim();
    if let Ok(number) = raw.parse::<u32>() {
        return match number {
            0..=5 => Some(Level::TRACE),
            6..=10 => Some(Level::DEBUG),
            11..=29 => Some(Level::INFO),
            30..=39 => Some(Level::WARN),
            _ => Some(Level::ERROR),
        };
    }
    match raw.to_ascii_uppercase().as_str() {
        "TRACE" => Some(Level::TRACE),
        "DEBUG" | "DBGHIGH" | "DBGMED" | "DBGLOW" => Some(Level::DEBUG),
        "INFO" | "NOTICE" => Some(Level::INFO),
        "WARN" | "WARNING" => Some(Level::WARN),
        "ERROR" | "CRITICAL" => Some(Level::ERROR),
        _ => None,
    }
}

/// `log_rules` entries
///
/// Limits and list entries may name an item; its current value is used.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogRules {
    pub filter: Vec<Value>,
    pub exclude: Vec<Value>,
    pub lowlimit: Option<Value>,
    pub highlimit: Option<Value>,
    pub itemvalue: Option<String>,
}

impl LogRules {
    fn parse(path: &str, raw: &Value) -> Self {
        let map = match raw {
            Value::Object(map) => map.clone(),
            Value::String(s) if !s.trim().is_empty() => match parse_literal(s) {
                Some(Value::Object(map)) => map,
                _ => {
                    warn!(item = %path, rules = %s, "Invalid data for attribute 'log_rules'");
                    return Self::default();
                }
            },
            _ => return Self::default(),
        };
        let list = |key: &str| match map.get(key) {
            Some(Value::Array(values)) => values.clone(),
            Some(Value::Null) | None => Vec::new(),
            Some(other) => vec![other.clone()],
        };
        Self {
            filter: list("filter"),
            exclude: list("exclude"),
            lowlimit: map.get("lowlimit").filter(|v| !v.is_null()).cloned(),
            highlimit: map.get("highlimit").filter(|v| !v.is_null()).cloned(),
            itemvalue: map
                .get("itemvalue")
                .map(display_value)
                .map(|s| s.trim().trim_start_matches("sh.").to_string()),
        }
    }
}

/// Parsed `log_change` configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeLog {
    /// Logger name: `items.<log_change>`, or the value without a leading `_`
    pub logger: String,
    pub level: Level,
    pub mapping: Map<String, Value>,
    pub rules: LogRules,
    pub text: Option<String>,
}

impl ChangeLog {
    pub fn new(
        path: &str,
        logger: &str,
        level: Option<&str>,
        mapping: Option<&Value>,
        rules: Option<&Value>,
        text: Option<String>,
    ) -> Self {
        let logger = match logger.strip_prefix('_') {
            Some(name) => name.to_string(),
            None => format!("items.{logger}"),
        };
        let level = match level {
            Some(raw) => parse_level(raw).unwrap_or_else(|| {
                warn!(item = %path, level = raw, "Invalid log_level, using INFO");
                Level::INFO
            }),
            None => Level::INFO,
        };
        let mapping = match mapping {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::String(s)) if !s.trim().is_empty() => match parse_literal(s) {
                Some(Value::Object(map)) => map,
                _ => {
                    warn!(item = %path, mapping = %s, "Invalid data for attribute 'log_mapping'");
                    Map::new()
                }
            },
            _ => Map::new(),
        };
        Self {
            logger,
            level,
            mapping,
            rules: rules.map(|r| LogRules::parse(path, r)).unwrap_or_default(),
            text,
        }
    }

    fn map_value(&self, value: &Value) -> Value {
        self.mapping
            .get(&display_value(value))
            .cloned()
            .unwrap_or_else(|| value.clone())
    }
}

/// Standard audit line
pub(crate) fn standard_text(
    path: &str,
    value: &Value,
    caller: &str,
    source: Option<&str>,
    dest: Option<&str>,
) -> String {
    let source = source.map(|s| format!(" ({s})")).unwrap_or_default();
    let dest = dest.map(|d| format!(", dest: {d}")).unwrap_or_default();
    format!(
        "Item Change: {path} = {}  -  caller: {caller}{source}{dest}",
        display_value(value)
    )
}

impl Item {
    /// Value of a rule entry, reading the named item for string entries
    fn rule_value(&self, entry: &Value) -> Value {
        if let Value::String(s) = entry {
            let path = s.trim().trim_start_matches("sh.");
            if let Some(value) = self.registry().and_then(|r| r.item_value(path)) {
                return value;
            }
        }
        entry.clone()
    }

    fn rule_list(&self, entries: &[Value]) -> Vec<Value> {
        entries.iter().map(|e| self.rule_value(e)).collect()
    }

    fn rule_limit(&self, entry: &Option<Value>) -> Option<f64> {
        let entry = entry.as_ref()?;
        let limit = as_f64(&self.rule_value(entry));
        if limit.is_none() {
            warn!(item = %self.path, entry = %entry, "Given log_rules entry is invalid");
        }
        limit
    }

    /// Whether `log_rules` let the change through
    fn passes_log_rules(&self, log: &ChangeLog, value: &Value) -> bool {
        let filter = self.rule_list(&log.rules.filter);
        let exclude = self.rule_list(&log.rules.exclude);
        if !filter.is_empty() && !exclude.is_empty() {
            warn!(
                item = %self.path,
                "Defining filter and exclude does not work, ignoring exclude list"
            );
        }

        if self.config.item_type == ItemType::Num {
            let Some(number) = as_f64(value) else {
                return true;
            };
            if self.rule_limit(&log.rules.lowlimit).is_some_and(|low| low > number) {
                return false;
            }
            if self.rule_limit(&log.rules.highlimit).is_some_and(|high| high <= number) {
                return false;
            }
            let contains = |list: &[Value]| list.iter().any(|v| as_f64(v) == Some(number));
            if !filter.is_empty() {
                return contains(&filter);
            }
            if !exclude.is_empty() {
                return !contains(&exclude);
            }
            return true;
        }

        let contains = |list: &[Value]| list.iter().any(|v| values_equal(v, value));
        if !filter.is_empty() {
            return contains(&filter);
        }
        if !exclude.is_empty() {
            return !contains(&exclude);
        }
        true
    }

    /// The audit line for a change, `None` when nothing is to be logged
    pub(crate) fn change_log_text(
        &self,
        value: &Value,
        old: &Value,
        caller: &str,
        source: Option<&str>,
        dest: Option<&str>,
    ) -> Option<String> {
        let log = self.config.change_log.as_ref()?;
        if !self.passes_log_rules(log, value) {
            trace!(item = %self.path, value = %value, "Change filtered by log_rules");
            return None;
        }
        Some(match &log.text {
            None => standard_text(&self.path, value, caller, source, dest),
            Some(template) => self.render_log_text(log, template, value, old, caller, source, dest),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn render_log_text(
        &self,
        log: &ChangeLog,
        template: &str,
        value: &Value,
        old: &Value,
        caller: &str,
        source: Option<&str>,
        dest: Option<&str>,
    ) -> String {
        let now = self.runtime.clock.now();
        let parent = self.parent();
        let itemvalue = log.rules.itemvalue.as_deref().map(|path| {
            match self.registry().and_then(|r| r.item_value(path)) {
                Some(v) => Value::String(display_value(&v)),
                None => {
                    error!(item = %self.path, itemvalue = path, "Invalid item in log_rules");
                    Value::String("INVALID".to_string())
                }
            }
        });
        let limit = |entry: &Option<Value>| self.rule_limit(entry).map_or(Value::Null, |l| json!(l));

        let scope = self
            .scope()
            .with_value(value.clone())
            .with_trigger(caller, source, dest)
            .with_var("mvalue", log.map_value(value))
            .with_var("lvalue", old.clone())
            .with_var("mlvalue", log.map_value(old))
            .with_var("old_value", old.clone())
            .with_var("name", Value::String(self.name().to_string()))
            .with_var("id", Value::String(self.path.clone()))
            .with_var("pname", parent.as_ref().map_or(Value::Null, |p| json!(p.name())))
            .with_var("pid", parent.as_ref().map_or(Value::Null, |p| json!(p.path())))
            .with_var("age", json!((self.age() * 100.0).round() / 100.0))
            .with_var("lowlimit", limit(&log.rules.lowlimit))
            .with_var("highlimit", limit(&log.rules.highlimit))
            .with_var("filter", Value::Array(self.rule_list(&log.rules.filter)))
            .with_var("exclude", Value::Array(self.rule_list(&log.rules.exclude)))
            .with_var("time", json!(now.format("%H:%M:%S").to_string()))
            .with_var("date", json!(now.format("%d.%m.%Y").to_string()))
            .with_var("stamp", json!(now.timestamp_millis() as f64 / 1000.0))
            .with_var("now", json!(now.to_string()))
            .with_var("itemvalue", itemvalue.unwrap_or(Value::Null));

        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find('{') {
            let Some(len) = rest[start..].find('}') else {
                break;
            };
            out.push_str(&rest[..start]);
            let expression = &rest[start + 1..start + len];
            match self.runtime.evaluator.evaluate(expression, &scope) {
                Ok(result) => out.push_str(&display_value(&result)),
                Err(e) => {
                    error!(item = %self.path, template, error = %e, "Invalid log_text template");
                    return template.to_string();
                }
            }
            rest = &rest[start + len + 1..];
        }
        out.push_str(rest);
        out
    }

    /// Emit the audit line for a committed change
    pub(crate) fn log_on_change(
        &self,
        value: &Value,
        old: &Value,
        caller: &str,
        source: Option<&str>,
        dest: Option<&str>,
    ) {
        let Some(log) = &self.config.change_log else {
            return;
        };
        let Some(text) = self.change_log_text(value, old, caller, source, dest) else {
            return;
        };
        let logger = log.logger.as_str();
        match log.level {
            Level::ERROR => error!(target: CHANGE_LOG_TARGET, logger, "{text}"),
            Level::WARN => warn!(target: CHANGE_LOG_TARGET, logger, "{text}"),
            Level::INFO => info!(target: CHANGE_LOG_TARGET, logger, "{text}"),
            Level::DEBUG => debug!(target: CHANGE_LOG_TARGET, logger, "{text}"),
            Level::TRACE => trace!(target: CHANGE_LOG_TARGET, logger, "{text}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::make_test_setup;

    #[test]
    fn test_level_parsing() {
        assert_eq!(parse_level("debug"), Some(Level::DEBUG));
        assert_eq!(parse_level("NOTICE"), Some(Level::INFO));
        assert_eq!(parse_level("30"), Some(Level::WARN));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_logger_names() {
        let log = ChangeLog::new("a", "heating", None, None, None, None);
        assert_eq!(log.logger, "items.heating");
        assert_eq!(log.level, Level::INFO);
        let log = ChangeLog::new("a", "_audit", Some("WARNING"), None, None, None);
        assert_eq!(log.logger, "audit");
        assert_eq!(log.level, Level::WARN);
    }

    #[test]
    fn test_standard_text() {
        assert_eq!(
            standard_text("hall.light", &json!(true), "knx", Some("1/1/1"), None),
            "Item Change: hall.light = True  -  caller: knx (1/1/1)"
        );
        assert_eq!(
            standard_text("hall.dim", &json!(40), "Logic", None, Some("visu")),
            "Item Change: hall.dim = 40  -  caller: Logic, dest: visu"
        );
    }

    #[test]
    fn test_numeric_rules() {
        let (registry, _scheduler, _clock) = make_test_setup(json!({
            "power": {
                "type": "num",
                "log_change": "power",
                "log_rules": {"lowlimit": 10, "highlimit": 100, "exclude": [50]}
            }
        }));
        let power = registry.get("power").unwrap();
        let text = |v: Value| power.change_log_text(&v, &json!(0), "Test", None, None);
        assert!(text(json!(5)).is_none());
        assert!(text(json!(100)).is_none());
        assert!(text(json!(50)).is_none());
        assert_eq!(
            text(json!(20)).as_deref(),
            Some("Item Change: power = 20  -  caller: Test")
        );
    }

    #[test]
    fn test_log_text_template() {
        let (registry, _scheduler, _clock) = make_test_setup(json!({
            "door": {
                "type": "bool",
                "log_change": "door",
                "log_mapping": {"True": "open", "False": "closed"},
                "log_text": "{name} is {mvalue} (was {mlvalue}) by {caller}",
                "name": "Front door"
            }
        }));
        let door = registry.get("door").unwrap();
        assert_eq!(
            door.change_log_text(&json!(true), &json!(false), "knx", None, None).as_deref(),
            Some("Front door is open (was closed) by knx")
        );
    }
}
