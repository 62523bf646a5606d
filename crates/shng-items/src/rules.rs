//! `on_change` and `on_update` rules

use crate::attributes::OnRule;
use crate::item::Item;
use serde_json::Value;
use tracing::{debug, error, info, warn};

impl Item {
    /// Evaluate rules for a written value
    ///
    /// A rule with a destination writes its result to that item under
    /// `attr` as caller; a rule without one runs for its side effects, with
    /// `set_item` writes recorded under `attr` as well.
    pub(crate) fn run_rules(&self, rules: &[OnRule], value: &Value, attr: &str) {
        for rule in rules {
            info!(
                item = %self.path,
                rule = attr,
                dest = ?rule.dest,
                expression = %rule.expression,
                "Evaluating rule"
            );
            let scope = self
                .scope()
                .with_value(value.clone())
                .with_trigger(attr, Some(self.path.as_str()), None)
                .with_write_caller(attr);
            let result = match self.runtime.evaluator.evaluate(&rule.expression, &scope) {
                Ok(result) => result,
                Err(e) => {
                    warn!(
                        item = %self.path,
                        rule = attr,
                        value = %value,
                        error = %e,
                        "Problem evaluating rule"
                    );
                    continue;
                }
            };
            if result.is_null() {
                debug!(item = %self.path, rule = attr, dest = ?rule.dest, "Rule result is empty, nothing set");
                continue;
            }
            let Some(dest) = &rule.dest else {
                continue;
            };
            match self.registry().and_then(|registry| registry.get(dest)) {
                Some(dest_item) => {
                    dest_item.update(result, attr, Some(self.path.as_str()), None, None);
                }
                None => error!(
                    item = %self.path,
                    rule = attr,
                    dest = %dest,
                    "Destination item of rule not found"
                ),
            }
        }
    }
}
