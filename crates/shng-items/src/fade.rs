//! Stepwise fading of numeric items
//!
//! A fade is a [`FadeState`] stored in the item plus a one-shot scheduler
//! job that writes the next step and reschedules itself. Writes from other
//! callers while a fade runs go through [`FadeState::gate`].

use crate::item::{Item, ItemState, FADER_CALLER};
use chrono::Duration as ChronoDuration;
use regex::Regex;
use serde_json::Value;
use shng_core::value::{as_f64, number_value};
use shng_scheduler::{JobRun, JobTarget, Trigger};
use tracing::{debug, warn};

/// Parameters of [`Item::fade`]
#[derive(Debug, Clone, PartialEq)]
pub struct FadeRequest {
    pub dest: f64,
    pub step: f64,
    /// Seconds between steps
    pub delta: f64,
    pub caller: Option<String>,
    /// Callers whose writes stop the fade
    pub stop_fade: Option<Vec<String>>,
    /// Callers whose writes do not stop the fade
    pub continue_fade: Option<Vec<String>>,
    /// Write the first step immediately instead of after `delta`
    pub instant_set: bool,
    /// Replace the parameters of a running fade
    pub update: bool,
}

impl FadeRequest {
    pub fn new(dest: f64, step: f64, delta: f64) -> Self {
        Self {
            dest,
            step,
            delta,
            caller: None,
            stop_fade: None,
            continue_fade: None,
            instant_set: true,
            update: false,
        }
    }

    pub fn caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }

    pub fn stop_fade(mut self, callers: Vec<String>) -> Self {
        self.stop_fade = Some(callers);
        self
    }

    pub fn continue_fade(mut self, callers: Vec<String>) -> Self {
        self.continue_fade = Some(callers);
        self
    }

    pub fn instant_set(mut self, instant_set: bool) -> Self {
        self.instant_set = instant_set;
        self
    }

    pub fn update(mut self, update: bool) -> Self {
        self.update = update;
        self
    }
}

/// A caller name or regular expression
#[derive(Debug, Clone)]
pub(crate) struct CallerPattern {
    raw: String,
    regex: Option<Regex>,
}

impl CallerPattern {
    fn new(raw: &str) -> Self {
        Self {
            raw: raw.to_string(),
            regex: Regex::new(&format!("^(?:{raw})$")).ok(),
        }
    }

    fn matches(&self, caller: &str) -> bool {
        match &self.regex {
            Some(regex) => regex.is_match(caller),
            None => self.raw == caller,
        }
    }
}

fn patterns(callers: &Option<Vec<String>>) -> Option<Vec<CallerPattern>> {
    callers
        .as_ref()
        .map(|list| list.iter().map(|c| CallerPattern::new(c)).collect())
}

/// Outcome of a write arriving while the item fades
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GateDecision {
    /// Stop the fade and apply the write
    Cancel,
    /// The write is the fade's own step
    Tick,
    Drop,
}

#[derive(Debug, Clone)]
pub(crate) struct FadeState {
    pub dest: f64,
    pub step: f64,
    pub delta: ChronoDuration,
    pub caller: Option<String>,
    stop_fade: Option<Vec<CallerPattern>>,
    continue_fade: Option<Vec<CallerPattern>>,
    /// Value of the step currently being written
    pub current_step: Option<f64>,
    pub generation: u64,
}

impl FadeState {
    fn new(request: &FadeRequest, generation: u64) -> Self {
        Self {
            dest: request.dest,
            step: request.step,
            delta: ChronoDuration::milliseconds((request.delta * 1000.0).round() as i64),
            caller: request.caller.clone(),
            stop_fade: patterns(&request.stop_fade),
            continue_fade: patterns(&request.continue_fade),
            current_step: None,
            generation,
        }
    }

    pub(crate) fn gate(&self, caller: &str, value: &Value) -> GateDecision {
        if caller != FADER_CALLER {
            let listed = |list: &Vec<CallerPattern>| list.iter().any(|p| p.matches(caller));
            match (&self.stop_fade, &self.continue_fade) {
                (Some(stop), _) if listed(stop) => return GateDecision::Cancel,
                (_, Some(cont)) if !listed(cont) => return GateDecision::Cancel,
                (None, None) => return GateDecision::Cancel,
                _ => {}
            }
        }
        match (self.current_step, as_f64(value)) {
            (Some(step), Some(v)) if step == v => GateDecision::Tick,
            _ => GateDecision::Drop,
        }
    }

    /// The next value from `current`, `None` once the next step would reach `dest`
    fn next_value(&self, current: f64) -> Option<f64> {
        if current < self.dest {
            let next = current + self.step;
            (next < self.dest).then_some(next)
        } else if current > self.dest {
            let next = current - self.step;
            (next > self.dest).then_some(next)
        } else {
            None
        }
    }
}

impl Item {
    /// Fade the value towards `request.dest`
    ///
    /// Returns false when the fade was not started: the item value is not
    /// numeric, the step is not positive, or a fade is running and
    /// `update` was not requested.
    pub fn fade(&self, request: FadeRequest) -> bool {
        if request.step <= 0.0 || !request.step.is_finite() {
            warn!(item = %self.path, step = request.step, "Fade step must be positive");
            return false;
        }
        let generation = {
            let mut state = self.state.lock();
            if as_f64(&state.value).is_none() {
                warn!(item = %self.path, value = %state.value, "Cannot fade a non-numeric value");
                return false;
            }
            if let Some(running) = &state.fade {
                if !request.update {
                    debug!(item = %self.path, "Already fading, ignoring fade request");
                    return false;
                }
                let mut updated = FadeState::new(&request, running.generation);
                updated.current_step = running.current_step;
                state.fade = Some(updated);
                debug!(item = %self.path, dest = request.dest, "Fade parameters updated");
                return true;
            }
            state.fade_generation += 1;
            let generation = state.fade_generation;
            state.fade = Some(FadeState::new(&request, generation));
            generation
        };

        debug!(
            item = %self.path,
            dest = request.dest,
            step = request.step,
            delta = request.delta,
            "Starting fade"
        );
        let delay = if request.instant_set {
            ChronoDuration::zero()
        } else {
            ChronoDuration::milliseconds((request.delta * 1000.0).round() as i64)
        };
        self.schedule_fade_step(generation, delay);
        true
    }

    /// Stop a running fade where it is
    pub fn stop_fade(&self) -> bool {
        self.state.lock().fade.take().is_some()
    }

    /// Apply the fade gate for a write arriving while fading
    pub(crate) fn pass_fade_gate(&self, state: &mut ItemState, caller: &str, value: &Value) -> bool {
        let Some(fade) = &state.fade else {
            return true;
        };
        match fade.gate(caller, value) {
            GateDecision::Cancel => {
                debug!(item = %self.path, caller, "Write stops fade");
                state.fade = None;
                true
            }
            GateDecision::Tick => true,
            GateDecision::Drop => {
                debug!(item = %self.path, caller, value = %value, "Ignoring write while fading");
                false
            }
        }
    }

    fn schedule_fade_step(&self, generation: u64, delay: ChronoDuration) {
        let item = self.self_ref.clone();
        let mut trigger = Trigger::new(FADER_CALLER)
            .source(self.path.clone())
            .target(JobTarget::callable(move |_run: &JobRun| {
                if let Some(item) = item.upgrade() {
                    item.fade_step(generation);
                }
                Ok(())
            }));
        if delay > ChronoDuration::zero() {
            trigger = trigger.at(self.runtime.clock.now() + delay);
        }
        self.runtime
            .scheduler
            .trigger(&format!("items.{}-fade", self.path), trigger);
    }

    /// Write one step and reschedule, or finish on `dest`
    fn fade_step(&self, generation: u64) {
        let (next, caller, delta) = {
            let mut state = self.state.lock();
            let current = as_f64(&state.value);
            let Some(fade) = state.fade.as_mut().filter(|f| f.generation == generation) else {
                return;
            };
            match current.and_then(|c| fade.next_value(c)) {
                Some(next) => {
                    fade.current_step = Some(next);
                    (next, fade.caller.clone(), fade.delta)
                }
                None => {
                    let dest = fade.dest;
                    let caller = fade.caller.clone();
                    state.fade = None;
                    drop(state);
                    debug!(item = %self.path, dest, "Fade finished");
                    self.update(number_value(dest), FADER_CALLER, caller.as_deref(), None, None);
                    return;
                }
            }
        };

        self.update(number_value(next), FADER_CALLER, caller.as_deref(), None, None);

        let still_fading = self
            .state
            .lock()
            .fade
            .as_ref()
            .is_some_and(|f| f.generation == generation);
        if still_fading {
            self.schedule_fade_step(generation, delta);
        }
    }
}
