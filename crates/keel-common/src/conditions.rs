//! Condition bookkeeping for cluster and machine status
//!
//! Conditions are keyed by step name: recording a step replaces its previous
//! condition, keeping the transition time when the status did not change.

use crate::crd::{Condition, ConditionStatus};

/// Record a condition, replacing any existing condition of the same type
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            let transition = if existing.status == condition.status {
                existing.last_transition_time
            } else {
                condition.last_transition_time
            };
            *existing = Condition {
                last_transition_time: transition,
                ..condition
            };
        }
        None => conditions.push(condition),
    }
}

/// Look up the condition recorded for a step
pub fn find_condition<'a>(conditions: &'a [Condition], step: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == step)
}

/// True when the step's last recorded outcome was success
pub fn is_succeeded(conditions: &[Condition], step: &str) -> bool {
    find_condition(conditions, step)
        .map(|c| c.status == ConditionStatus::Success)
        .unwrap_or(false)
}

/// One condition per known step, in step order
///
/// Steps that have not reported yet appear with status `Unknown`.
pub fn step_report(steps: &[&str], conditions: &[Condition]) -> Vec<Condition> {
    steps
        .iter()
        .map(|step| {
            find_condition(conditions, step).cloned().unwrap_or_else(|| {
                Condition::new(*step, ConditionStatus::Unknown, "Pending", "not run yet")
            })
        })
        .collect()
}
