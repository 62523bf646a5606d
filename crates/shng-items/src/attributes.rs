//! Item attribute parsing
//!
//! Turns the raw configuration map of one item into an [`ItemConfig`].
//! Relative item references in attributes and expressions are rewritten to
//! absolute paths here, so nothing downstream ever sees a leading dot.

use crate::audit::ChangeLog;
use crate::error::{ItemError, ItemResult};
use crate::hysteresis::HysteresisConfig;
use serde_json::{Map, Value};
use shng_core::path::{resolve_relative, rewrite_expression};
use shng_core::time::split_duration_value;
use shng_core::value::{cast_bool, display_value};
use shng_core::ItemType;
use std::str::FromStr;
use tracing::{error, warn};

/// Attributes the core interprets itself
pub const CORE_ATTRIBUTES: &[&str] = &[
    "type",
    "name",
    "description",
    "value",
    "initial_value",
    "cache",
    "enforce_updates",
    "enforce_change",
    "eval",
    "eval_trigger",
    "eval_on_trigger_only",
    "trigger_condition",
    "hysteresis_input",
    "hysteresis_upper_threshold",
    "hysteresis_lower_threshold",
    "on_change",
    "on_update",
    "log_change",
    "log_level",
    "log_mapping",
    "log_rules",
    "log_text",
    "autotimer",
    "cycle",
    "crontab",
    "threshold",
    "struct",
    "remark",
    "instance",
];

/// An `on_change` / `on_update` entry: `dest = expression` or a bare expression
#[derive(Debug, Clone, PartialEq)]
pub struct OnRule {
    pub dest: Option<String>,
    pub expression: String,
}

impl OnRule {
    /// Split an entry on the first assignment `=` in front of any `(`
    pub fn parse(entry: &str) -> Self {
        match assignment_index(entry) {
            Some(idx) => {
                let dest = entry[..idx].trim();
                let dest = dest.strip_prefix("sh.").unwrap_or(dest);
                let dest = dest.strip_suffix("()").unwrap_or(dest).trim();
                Self {
                    dest: (!dest.is_empty()).then(|| dest.to_string()),
                    expression: entry[idx + 1..].trim().to_string(),
                }
            }
            None => Self {
                dest: None,
                expression: entry.trim().to_string(),
            },
        }
    }
}

fn assignment_index(entry: &str) -> Option<usize> {
    let bytes = entry.as_bytes();
    for (idx, &b) in bytes.iter().enumerate() {
        match b {
            b'(' | b'\'' | b'"' => return None,
            b'=' => {
                let prev = idx.checked_sub(1).map(|i| bytes[i]);
                let next = bytes.get(idx + 1).copied();
                if next == Some(b'=') || matches!(prev, Some(b'=' | b'!' | b'<' | b'>')) {
                    return None;
                }
                return Some(idx);
            }
            _ => {}
        }
    }
    None
}

/// `threshold: "low:high"` or a single number for both bounds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Threshold {
    pub low: f64,
    pub high: f64,
}

impl FromStr for Threshold {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (low, high) = match s.rsplit_once(':') {
            Some((low, high)) if !low.trim().is_empty() => (low, high),
            Some((_, high)) => (high, high),
            None => (s, s),
        };
        let parse = |part: &str| {
            part.trim()
                .parse::<f64>()
                .map_err(|_| format!("'{}' is not a number", part.trim()))
        };
        Ok(Self {
            low: parse(low)?,
            high: parse(high)?,
        })
    }
}

/// A `time = value` attribute such as `autotimer` or `cycle`
///
/// Both parts are kept as text; they may be literals or expressions and are
/// resolved when used.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedValue {
    pub time: String,
    pub value: Option<String>,
}

impl TimedValue {
    pub fn parse(path: &str, attribute: &str, raw: &Value) -> Self {
        let (time, value) = split_duration_value(&display_value(raw));
        Self {
            time: rewrite(path, attribute, &time),
            value: value
                .filter(|v| !v.is_empty())
                .map(|v| rewrite(path, attribute, &v)),
        }
    }
}

/// Parsed configuration of a single item
#[derive(Debug, Clone, Default)]
pub struct ItemConfig {
    pub item_type: ItemType,
    pub name: Option<String>,
    pub description: Option<String>,
    pub initial_value: Option<Value>,
    pub cache: bool,
    pub enforce_updates: bool,
    pub enforce_change: bool,
    pub eval: Option<String>,
    pub eval_triggers: Vec<String>,
    pub eval_on_trigger_only: bool,
    pub trigger_condition: Option<String>,
    pub hysteresis: Option<HysteresisConfig>,
    pub on_update: Vec<OnRule>,
    pub on_change: Vec<OnRule>,
    pub change_log: Option<ChangeLog>,
    pub autotimer: Option<TimedValue>,
    pub cycle: Option<TimedValue>,
    pub crontab: Vec<String>,
    pub threshold: Option<Threshold>,
    /// Attributes not interpreted by the core, e.g. plugin attributes
    pub conf: Map<String, Value>,
    /// Child item definitions in declaration order
    pub children: Vec<(String, Map<String, Value>)>,
}

impl ItemConfig {
    /// Parse the configuration of the item at `path`
    ///
    /// `ancestors` holds the `conf` maps of the parent, grandparent and so on,
    /// used to resolve `..:attr` style attribute references.
    pub fn parse(
        path: &str,
        raw: &Map<String, Value>,
        ancestors: &[&Map<String, Value>],
    ) -> ItemResult<Self> {
        let item_type = match raw.get("type") {
            Some(v) => ItemType::from_str(&display_value(v))
                .map_err(|message| ItemError::attribute(path, "type", message))?,
            None => ItemType::Foo,
        };
        let mut config = Self {
            item_type,
            ..Default::default()
        };
        let mut hysteresis_input = None;
        let mut upper = None;
        let mut lower = None;
        let mut log_change = None;
        let mut log_level = None;
        let mut log_mapping = None;
        let mut log_rules = None;
        let mut log_text = None;

        for (attr, value) in raw {
            if let Value::Object(child) = value {
                if !matches!(attr.as_str(), "value" | "initial_value" | "log_mapping" | "log_rules") {
                    config.children.push((attr.clone(), child.clone()));
                    continue;
                }
            }
            match attr.as_str() {
                "type" | "struct" | "remark" | "instance" => {}
                "name" => config.name = Some(display_value(value)),
                "description" => config.description = Some(display_value(value)),
                "value" | "initial_value" => config.initial_value = Some(value.clone()),
                "cache" | "enforce_updates" | "enforce_change" => {
                    let Ok(Value::Bool(flag)) = cast_bool(value) else {
                        warn!(item = %path, attribute = %attr, "Problem parsing attribute");
                        continue;
                    };
                    match attr.as_str() {
                        "cache" => config.cache = flag,
                        "enforce_updates" => config.enforce_updates = flag,
                        _ => config.enforce_change = flag,
                    }
                }
                "eval_on_trigger_only" => {
                    config.eval_on_trigger_only = matches!(cast_bool(value), Ok(Value::Bool(true)))
                }
                "eval" => config.eval = Some(rewrite(path, attr, &display_value(value))),
                "eval_trigger" => {
                    config.eval_triggers = string_list(value)
                        .iter()
                        .map(|t| absolute(path, attr, t))
                        .collect();
                }
                "trigger_condition" => {
                    config.trigger_condition = Some(rewrite(path, attr, &display_value(value)))
                }
                "hysteresis_input" => hysteresis_input = Some(absolute(path, attr, &display_value(value))),
                "hysteresis_upper_threshold" => upper = Some(threshold_with_timer(path, attr, value)),
                "hysteresis_lower_threshold" => lower = Some(threshold_with_timer(path, attr, value)),
                "on_change" | "on_update" => {
                    let rules = string_list(value)
                        .iter()
                        .map(|entry| {
                            let rule = OnRule::parse(entry);
                            OnRule {
                                dest: rule.dest.map(|d| absolute(path, attr, &d)),
                                expression: rewrite(path, attr, &rule.expression),
                            }
                        })
                        .collect();
                    if attr == "on_change" {
                        config.on_change = rules;
                    } else {
                        config.on_update = rules;
                    }
                }
                "log_change" => log_change = non_empty(value),
                "log_level" => log_level = non_empty(value),
                "log_mapping" => log_mapping = Some(value.clone()),
                "log_rules" => log_rules = Some(value.clone()),
                "log_text" => log_text = non_empty(value),
                "autotimer" => config.autotimer = Some(TimedValue::parse(path, attr, value)),
                "cycle" => config.cycle = Some(TimedValue::parse(path, attr, value)),
                "crontab" => config.crontab = string_list(value),
                "threshold" => match display_value(value).parse::<Threshold>() {
                    Ok(threshold) => config.threshold = Some(threshold),
                    Err(message) => return Err(ItemError::attribute(path, attr, message)),
                },
                _ => {
                    let value = match value {
                        Value::String(s) => attribute_reference(s, attr, ancestors, true)
                            .unwrap_or_else(|| value.clone()),
                        other => other.clone(),
                    };
                    config.conf.insert(attr.clone(), value);
                }
            }
        }

        if let Some(input) = hysteresis_input {
            match (upper, lower) {
                (Some(upper), Some(lower)) => {
                    config.hysteresis = Some(HysteresisConfig {
                        input,
                        upper: upper.0,
                        upper_timer: upper.1,
                        lower: lower.0,
                        lower_timer: lower.1,
                    })
                }
                _ => warn!(
                    item = %path,
                    "hysteresis_input needs both hysteresis thresholds, ignoring hysteresis"
                ),
            }
        }

        if let Some(logger) = log_change {
            config.change_log = Some(ChangeLog::new(
                path,
                &logger,
                log_level.as_deref(),
                log_mapping.as_ref(),
                log_rules.as_ref(),
                log_text,
            ));
        }

        copy_own_attributes(&mut config.conf);
        substitute_variables(path, &mut config, ancestors);
        Ok(config)
    }
}

fn non_empty(value: &Value) -> Option<String> {
    let text = display_value(value);
    (!text.trim().is_empty()).then_some(text)
}

fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().map(display_value).collect(),
        Value::Null => Vec::new(),
        other => vec![display_value(other)],
    }
}

/// Resolve a relative item reference, logging and falling back to the root
pub(crate) fn absolute(path: &str, attribute: &str, reference: &str) -> String {
    let reference = reference.trim();
    resolve_relative(path, reference).unwrap_or_else(|e| {
        error!(item = %path, attribute = %attribute, error = %e, "Invalid relative reference");
        reference.trim_start_matches('.').to_string()
    })
}

/// Rewrite relative references inside an expression
pub(crate) fn rewrite(path: &str, attribute: &str, expression: &str) -> String {
    rewrite_expression(path, expression).unwrap_or_else(|e| {
        error!(item = %path, attribute = %attribute, error = %e, "Invalid relative reference");
        expression.to_string()
    })
}

fn threshold_with_timer(path: &str, attribute: &str, value: &Value) -> (String, Option<String>) {
    let raw = display_value(value);
    match raw.rsplit_once('|') {
        Some((threshold, timer)) => (
            rewrite(path, attribute, threshold.trim()),
            Some(rewrite(path, attribute, timer.trim())),
        ),
        None => (rewrite(path, attribute, raw.trim()), None),
    }
}

/// Look up a `.:attr`, `..:attr`, `...:attr` or `....:attr` reference
///
/// The number of dots selects the item (the item itself, its parent, ...).
/// An empty attribute name or `.` refers to the attribute being defined.
fn attribute_reference(
    reference: &str,
    current_attr: &str,
    ancestors: &[&Map<String, Value>],
    skip_self: bool,
) -> Option<Value> {
    let (from_item, from_attr) = reference.trim().split_once(':')?;
    if from_item.is_empty() || from_item.len() > 4 || !from_item.chars().all(|c| c == '.') {
        return None;
    }
    let attr = match from_attr {
        "" | "." => current_attr,
        other => other,
    };
    let level = from_item.len() - 1;
    if level == 0 {
        // the item's own attributes are resolved once parsing is complete
        return if skip_self { None } else { Some(Value::String(String::new())) };
    }
    Some(
        ancestors
            .get(level - 1)
            .and_then(|conf| conf.get(attr).cloned())
            .unwrap_or_else(|| Value::String(String::new())),
    )
}

/// Resolve `.:attr` copies within the item's own attributes
fn copy_own_attributes(conf: &mut Map<String, Value>) {
    let copies: Vec<(String, String)> = conf
        .iter()
        .filter_map(|(attr, value)| {
            let text = value.as_str()?;
            let from = text.strip_prefix(".:")?;
            let from = match from {
                "" | "." => attr.as_str(),
                other => other,
            };
            Some((attr.clone(), from.to_string()))
        })
        .collect();
    for (attr, from) in copies {
        let value = conf
            .get(&from)
            .filter(|_| from != attr)
            .cloned()
            .unwrap_or_else(|| Value::String(String::new()));
        conf.insert(attr, value);
    }
}

/// `{..:attr}` substitution for attributes whose names end in `_`
///
/// The resolved text is stored under the name without the underscore;
/// `name_` sets the item name.
fn substitute_variables(path: &str, config: &mut ItemConfig, ancestors: &[&Map<String, Value>]) {
    let templated: Vec<String> = config
        .conf
        .keys()
        .filter(|k| k.ends_with('_'))
        .cloned()
        .collect();
    for attr in templated {
        let Some(raw) = config.conf.remove(&attr) else {
            continue;
        };
        let mut text = display_value(&raw);
        let mut out = String::new();
        while let Some(start) = text.find('{') {
            let Some(len) = text[start..].find('}') else {
                warn!(item = %path, attribute = %attr, "Invalid var definition, '}}' is missing");
                break;
            };
            let var = &text[start + 1..start + len];
            let resolved = match attribute_reference(var, &attr, ancestors, false) {
                Some(Value::String(s)) if var.starts_with(".:") => {
                    config.conf.get(var.trim_start_matches(".:")).map(display_value).unwrap_or(s)
                }
                Some(value) => display_value(&value),
                None => var.to_string(),
            };
            out.push_str(&text[..start]);
            out.push_str(&resolved);
            text = text[start + len + 1..].to_string();
        }
        out.push_str(&text);

        let target = attr.trim_end_matches('_');
        if target == "name" {
            config.name = Some(out);
        } else {
            config.conf.insert(target.to_string(), Value::String(out));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(path: &str, raw: Value) -> ItemConfig {
        let Value::Object(map) = raw else {
            panic!("fixture must be an object")
        };
        ItemConfig::parse(path, &map, &[]).unwrap()
    }

    #[test]
    fn test_on_rule_split() {
        assert_eq!(
            OnRule::parse("..light = value > 10"),
            OnRule {
                dest: Some("..light".to_string()),
                expression: "value > 10".to_string()
            }
        );
        assert_eq!(OnRule::parse("value == 1").dest, None);
        assert_eq!(OnRule::parse("set_item('a', x == 1)").dest, None);
        assert_eq!(
            OnRule::parse("sh.hall.lamp = not value").dest.as_deref(),
            Some("hall.lamp")
        );
        assert_eq!(OnRule::parse("value >= 3").dest, None);
    }

    #[test]
    fn test_threshold_parsing() {
        assert_eq!(
            "10:20".parse::<Threshold>().unwrap(),
            Threshold { low: 10.0, high: 20.0 }
        );
        assert_eq!(
            "15".parse::<Threshold>().unwrap(),
            Threshold { low: 15.0, high: 15.0 }
        );
        assert!("low:high".parse::<Threshold>().is_err());
    }

    #[test]
    fn test_core_attributes_and_children() {
        let config = parse(
            "living.heating",
            json!({
                "type": "num",
                "initial_value": 18,
                "cache": "yes",
                "enforce_updates": true,
                "eval": "item('.target') + 1",
                "eval_trigger": [".target", "outside.temp"],
                "crontab": "0 6 * *",
                "cycle": "60 = 21",
                "knx_dpt": "9",
                "target": {"type": "num"}
            }),
        );
        assert_eq!(config.item_type, ItemType::Num);
        assert_eq!(config.initial_value, Some(json!(18)));
        assert!(config.cache);
        assert!(config.enforce_updates);
        assert!(!config.enforce_change);
        assert_eq!(config.eval.as_deref(), Some("item('living.heating.target') + 1"));
        assert_eq!(
            config.eval_triggers,
            vec!["living.heating.target".to_string(), "outside.temp".to_string()]
        );
        assert_eq!(config.crontab, vec!["0 6 * *".to_string()]);
        assert_eq!(
            config.cycle,
            Some(TimedValue {
                time: "60".to_string(),
                value: Some("21".to_string())
            })
        );
        assert_eq!(config.conf.get("knx_dpt"), Some(&json!("9")));
        assert_eq!(config.children.len(), 1);
        assert_eq!(config.children[0].0, "target");
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let Value::Object(map) = json!({"type": "integer"}) else {
            unreachable!()
        };
        assert!(ItemConfig::parse("x", &map, &[]).is_err());
    }

    #[test]
    fn test_hysteresis_attributes() {
        let config = parse(
            "hall.fan",
            json!({
                "type": "bool",
                "hysteresis_input": "..humidity",
                "hysteresis_upper_threshold": "70 | 30",
                "hysteresis_lower_threshold": "60"
            }),
        );
        let hysteresis = config.hysteresis.unwrap();
        assert_eq!(hysteresis.input, "hall.humidity");
        assert_eq!(hysteresis.upper, "70");
        assert_eq!(hysteresis.upper_timer.as_deref(), Some("30"));
        assert_eq!(hysteresis.lower, "60");
        assert_eq!(hysteresis.lower_timer, None);
    }

    #[test]
    fn test_on_change_dest_is_resolved() {
        let config = parse(
            "hall.motion",
            json!({"on_change": ["..light = value", "set_item('hall.seen', True)"]}),
        );
        assert_eq!(config.on_change[0].dest.as_deref(), Some("hall.light"));
        assert_eq!(config.on_change[1].dest, None);
    }

    #[test]
    fn test_attribute_references_and_substitution() {
        let parent = json!({"room": "kitchen", "knx_ga": "1/2/3"});
        let Value::Object(parent) = parent else {
            unreachable!()
        };
        let Value::Object(raw) = json!({
            "knx_ga": "..:.",
            "alias": ".:knx_ga",
            "name_": "Light {..:room}",
            "label_": "{..:room}/{.:alias}"
        }) else {
            unreachable!()
        };
        let config = ItemConfig::parse("kitchen.light", &raw, &[&parent]).unwrap();
        assert_eq!(config.conf.get("knx_ga"), Some(&json!("1/2/3")));
        assert_eq!(config.conf.get("alias"), Some(&json!("1/2/3")));
        assert_eq!(config.name.as_deref(), Some("Light kitchen"));
        assert_eq!(config.conf.get("label"), Some(&json!("kitchen/1/2/3")));
        assert!(!config.conf.contains_key("name_"));
    }
}
