//! Hysteresis: a bool output item driven by a numeric input item
//!
//! The output switches on above the upper threshold and off below the lower
//! one. Each edge may be delayed by a timer; an armed timer is dropped as
//! soon as the input falls back inside the band.

use crate::item::{Item, HYSTERESIS_CALLER};
use chrono::{DateTime, Duration as ChronoDuration};
use chrono_tz::Tz;
use serde_json::{json, Value};
use shng_core::value::as_f64;
use shng_core::ItemAccess;
use shng_scheduler::{JobRun, JobSpec, JobTarget};
use tracing::{debug, error, warn};

/// `hysteresis_*` attributes of an item
#[derive(Debug, Clone, PartialEq)]
pub struct HysteresisConfig {
    /// Absolute path of the input item
    pub input: String,
    pub upper: String,
    pub upper_timer: Option<String>,
    pub lower: String,
    pub lower_timer: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct HysteresisState {
    pub upper_timer_active: bool,
    pub lower_timer_active: bool,
    pub active_timer_ends: Option<DateTime<Tz>>,
}

impl HysteresisState {
    pub(crate) fn clear(&mut self) {
        self.upper_timer_active = false;
        self.lower_timer_active = false;
    }
}

#[derive(Clone, Copy)]
enum Edge {
    Upper,
    Lower,
}

impl Edge {
    fn job_suffix(self) -> &'static str {
        match self {
            Self::Upper => "UpTimer",
            Self::Lower => "LoTimer",
        }
    }

    fn output(self) -> bool {
        matches!(self, Self::Upper)
    }
}

fn on_off(value: &Value) -> &'static str {
    if value.as_bool().unwrap_or(false) {
        "On"
    } else {
        "Off"
    }
}

impl Item {
    fn hysteresis_job(&self, edge: Edge) -> String {
        format!("items.{}-{}", self.path, edge.job_suffix())
    }

    /// Job target running the hysteresis decision for an input value
    pub(crate) fn hysteresis_target(&self) -> JobTarget {
        let item = self.self_ref.clone();
        JobTarget::callable(move |run: &JobRun| {
            if let (Some(item), Some(value)) = (item.upgrade(), run.value.as_ref()) {
                item.run_hysteresis(value, &run.caller, run.source.name(), run.dest.as_deref());
            }
            Ok(())
        })
    }

    fn hysteresis_number(&self, expression: &str) -> f64 {
        let scope = self.scope();
        match self.runtime.evaluator.evaluate_number(expression, &scope) {
            Ok(n) => n,
            Err(e) => {
                error!(
                    item = %self.path,
                    expression,
                    error = %e,
                    "Hysteresis expression did not evaluate to a number, using 0"
                );
                0.0
            }
        }
    }

    /// Decide the output for a new input value
    pub fn run_hysteresis(&self, input: &Value, caller: &str, source: Option<&str>, dest: Option<&str>) {
        let Some(config) = &self.config.hysteresis else {
            return;
        };
        let Some(input) = as_f64(input) else {
            warn!(item = %self.path, input = %input, "Hysteresis input is not numeric");
            return;
        };
        let upper = self.hysteresis_number(&config.upper);
        let lower = self.hysteresis_number(&config.lower);

        let mut disarmed = Vec::new();
        {
            let mut state = self.state.lock();
            if state.hysteresis.upper_timer_active && input <= upper {
                state.hysteresis.upper_timer_active = false;
                state.hysteresis.active_timer_ends = None;
                disarmed.push(Edge::Upper);
            }
            if state.hysteresis.lower_timer_active && input >= lower {
                state.hysteresis.lower_timer_active = false;
                state.hysteresis.active_timer_ends = None;
                disarmed.push(Edge::Lower);
            }
        }
        for edge in disarmed {
            self.runtime.scheduler.remove(&self.hysteresis_job(edge));
        }

        if input > upper {
            self.hysteresis_edge(Edge::Upper, config.upper_timer.as_deref(), caller, source, dest);
        }
        if input < lower {
            self.hysteresis_edge(Edge::Lower, config.lower_timer.as_deref(), caller, source, dest);
        }
    }

    fn hysteresis_edge(
        &self,
        edge: Edge,
        timer: Option<&str>,
        caller: &str,
        source: Option<&str>,
        dest: Option<&str>,
    ) {
        let Some(timer) = timer else {
            self.update(Value::Bool(edge.output()), caller, source, dest, None);
            return;
        };

        let seconds = self.hysteresis_number(timer);
        let next = {
            let mut state = self.state.lock();
            let armed = match edge {
                Edge::Upper => state.hysteresis.upper_timer_active,
                Edge::Lower => state.hysteresis.lower_timer_active,
            };
            if armed || state.value.as_bool() == Some(edge.output()) {
                return;
            }
            let seconds = if seconds < 0.0 {
                warn!(item = %self.path, timer = seconds, "Hysteresis timer is negative, using 0");
                0.0
            } else {
                seconds
            };
            let next = self.runtime.clock.now()
                + ChronoDuration::milliseconds((seconds * 1000.0).round() as i64);
            match edge {
                Edge::Upper => state.hysteresis.upper_timer_active = true,
                Edge::Lower => state.hysteresis.lower_timer_active = true,
            }
            state.hysteresis.active_timer_ends = Some(next);
            next
        };

        let Some(item) = self.self_arc() else {
            return;
        };
        let name = self.hysteresis_job(edge);
        debug!(item = %self.path, job = %name, next = %next, "Arming hysteresis timer");
        let spec = JobSpec::new(name, JobTarget::Item(item))
            .value(Value::Bool(edge.output()))
            .caller(HYSTERESIS_CALLER)
            .next(next);
        if let Err(e) = self.runtime.scheduler.add(spec) {
            warn!(item = %self.path, error = %e, "Unable to arm hysteresis timer");
        }
    }

    fn hysteresis_input_value(&self, config: &HysteresisConfig) -> Option<f64> {
        self.registry()
            .and_then(|registry| registry.item_value(&config.input))
            .as_ref()
            .and_then(as_f64)
    }

    /// Readable state: `On`, `Off`, `Timer -> On`, `Stay (Off)`, `Cached (On)`, ...
    pub fn hysteresis_state(&self) -> Option<String> {
        let config = self.config.hysteresis.as_ref()?;
        let upper = self.hysteresis_number(&config.upper);
        let lower = self.hysteresis_number(&config.lower);
        let input = self.hysteresis_input_value(config)?;
        Some(self.hysteresis_state_string(lower, upper, input))
    }

    fn hysteresis_state_string(&self, lower: f64, upper: f64, input: f64) -> String {
        let updated_by = self.updated_by();
        let state = self.state.lock();
        let output = on_off(&state.value);
        let timers = &state.hysteresis;

        let text = if input > upper {
            let prefix = if timers.upper_timer_active { "Timer -> " } else { "" };
            format!("{prefix}On")
        } else if input < lower {
            let prefix = if timers.lower_timer_active { "Timer -> " } else { "" };
            format!("{prefix}Off")
        } else {
            format!("Stay ({output})")
        };

        let no_timers = !timers.upper_timer_active && !timers.lower_timer_active;
        if no_timers
            && updated_by.to_lowercase() == "init:cache"
            && !text.starts_with("Stay")
            && text != output
        {
            return format!("Cached ({output})");
        }
        text
    }

    /// Thresholds, timers, input, output and state as a JSON map
    pub fn hysteresis_data(&self) -> Option<Value> {
        let config = self.config.hysteresis.as_ref()?;
        let upper = self.hysteresis_number(&config.upper);
        let lower = self.hysteresis_number(&config.lower);
        let timer = |expr: &Option<String>| -> Value {
            expr.as_deref()
                .map(|e| json!(self.hysteresis_number(e)))
                .unwrap_or(Value::Null)
        };
        let lower_timer = timer(&config.lower_timer);
        let upper_timer = timer(&config.upper_timer);
        let input = self.hysteresis_input_value(config);
        let state = input.map(|input| self.hysteresis_state_string(lower, upper, input));

        let guard = self.state.lock();
        Some(json!({
            "lower_threshold": lower,
            "lower_timer": lower_timer,
            "upper_threshold": upper,
            "upper_timer": upper_timer,
            "input": input,
            "output": guard.value,
            "state": state,
            "lower_timer_active": guard.hysteresis.lower_timer_active,
            "upper_timer_active": guard.hysteresis.upper_timer_active,
            "active_timer_ends": guard.hysteresis.active_timer_ends.map(|t| t.to_rfc3339()),
        }))
    }
}
