//! Rule registry and evaluator.
//!
//! Rules are a tagged [`crate::model::Rule`] enum dispatched through an
//! exhaustive `match` in [`evaluate`], so adding a rule kind without a
//! handler is a compile error rather than a runtime lookup miss.

mod accident_presence;
mod class_count;
mod class_presence;
mod count_at_least;

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::model::{Detections, MatchResult, Rule};

/// Per-rule scratch state, addressed by the rule's position in the agent's
/// rule list. Each handler owns the shape of its own entry; the engine never
/// inspects it — state stays a private bag owned by the rule handler that
/// created it.
#[derive(Debug, Default)]
pub enum RuleScratch {
    #[default]
    Empty,
    DurationGate(DurationGateState),
    AccidentPresence(accident_presence::AccidentState),
}

#[derive(Debug, Default, Clone)]
pub struct DurationGateState {
    pub last_matched_since: Option<DateTime<Utc>>,
}

/// Owns one [`RuleScratch`] per rule index for one agent. Reset wholesale at
/// the start of each patrol window, which drops duration-gate progress
/// along with it.
#[derive(Debug, Default)]
pub struct RuleEngineState {
    per_rule: HashMap<usize, RuleScratch>,
}

impl RuleEngineState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.per_rule.clear();
    }

    fn slot(&mut self, index: usize) -> &mut RuleScratch {
        self.per_rule.entry(index).or_default()
    }
}

/// Outcome of one evaluation pass over an agent's rule list.
#[derive(Debug, Default)]
pub struct EvaluationOutcome {
    /// The first non-report-only rule to match this frame, if any. This is
    /// what "first rule matches wins" refers to.
    pub primary: Option<MatchResult>,
    /// `class_count` matches encountered along the way. These never consume
    /// the "first match wins" slot and never suppress rules after them —
    /// `class_count` is modeled as a report-only variant.
    pub reports: Vec<MatchResult>,
}

/// Evaluate `rules` against `detections` in order, mutating `state`.
/// Stops scanning as soon as a non-report-only rule matches.
pub fn evaluate(
    rules: &[Rule],
    detections: &Detections,
    state: &mut RuleEngineState,
    now: DateTime<Utc>,
) -> EvaluationOutcome {
    let mut outcome = EvaluationOutcome::default();

    for (index, rule) in rules.iter().enumerate() {
        match rule {
            Rule::ClassCount { class, label } => {
                if let Some(m) = class_count::evaluate(index, class, label.as_deref(), detections) {
                    outcome.reports.push(m);
                }
                // never suppresses, never stops the scan
            }
            Rule::ClassPresence {
                r#match,
                classes,
                duration_s,
                label,
            } => {
                let gate = duration_gate(state.slot(index));
                if let Some(m) = class_presence::evaluate(
                    index,
                    *r#match,
                    classes,
                    *duration_s,
                    label.as_deref(),
                    detections,
                    gate,
                    now,
                ) {
                    outcome.primary = Some(m);
                    break;
                }
            }
            Rule::CountAtLeast {
                class,
                min_count,
                duration_s,
                label,
            } => {
                let gate = duration_gate(state.slot(index));
                if let Some(m) = count_at_least::evaluate(
                    index,
                    class,
                    *min_count,
                    *duration_s,
                    label.as_deref(),
                    detections,
                    gate,
                    now,
                ) {
                    outcome.primary = Some(m);
                    break;
                }
            }
            Rule::AccidentPresence { label } => {
                let slot = state.slot(index);
                if !matches!(slot, RuleScratch::AccidentPresence(_)) {
                    *slot = RuleScratch::AccidentPresence(Default::default());
                }
                let RuleScratch::AccidentPresence(accident_state) = slot else {
                    unreachable!()
                };
                if let Some(m) = accident_presence::evaluate(
                    index,
                    label.as_deref(),
                    detections,
                    accident_state,
                ) {
                    outcome.primary = Some(m);
                    break;
                }
            }
        }
    }

    outcome
}

fn duration_gate(slot: &mut RuleScratch) -> &mut DurationGateState {
    if !matches!(slot, RuleScratch::DurationGate(_)) {
        *slot = RuleScratch::DurationGate(DurationGateState::default());
    }
    match slot {
        RuleScratch::DurationGate(s) => s,
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MatchMode;
    use std::collections::HashSet;

    fn detections_with(classes: &[&str]) -> Detections {
        Detections {
            classes: classes.iter().map(|s| s.to_string()).collect(),
            scores: vec![0.9; classes.len()],
            boxes: vec![[0.0, 0.0, 10.0, 10.0]; classes.len()],
            keypoints: vec![None; classes.len()],
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn first_match_wins_and_class_count_never_suppresses() {
        let rules = vec![
            Rule::ClassCount {
                class: "person".to_string(),
                label: None,
            },
            Rule::ClassPresence {
                r#match: MatchMode::Any,
                classes: HashSet::from(["dog".to_string()]),
                duration_s: None,
                label: None,
            },
        ];
        let mut state = RuleEngineState::new();
        let outcome = evaluate(&rules, &detections_with(&["person", "dog"]), &mut state, Utc::now());
        assert_eq!(outcome.reports.len(), 1);
        assert!(outcome.primary.is_some());
        assert_eq!(outcome.primary.unwrap().rule_index, 1);
    }

    #[test]
    fn no_match_produces_no_primary() {
        let rules = vec![Rule::ClassPresence {
            r#match: MatchMode::Any,
            classes: HashSet::from(["cat".to_string()]),
            duration_s: None,
            label: None,
        }];
        let mut state = RuleEngineState::new();
        let outcome = evaluate(&rules, &detections_with(&["person"]), &mut state, Utc::now());
        assert!(outcome.primary.is_none());
    }
}
