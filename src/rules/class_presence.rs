//! `class_presence` handler: normalize class names, `any`/`all` match mode,
//! optional duration gate that resets on any gap in matching.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use super::DurationGateState;
use crate::model::{Detections, MatchMode, MatchResult};

pub fn evaluate(
    rule_index: usize,
    mode: MatchMode,
    classes: &HashSet<String>,
    duration_s: Option<i64>,
    label: Option<&str>,
    detections: &Detections,
    gate: &mut DurationGateState,
    now: DateTime<Utc>,
) -> Option<MatchResult> {
    let mut matched_indices = Vec::new();
    let present: HashSet<&str> = detections
        .classes
        .iter()
        .enumerate()
        .filter_map(|(i, c)| {
            let normalized = c.trim().to_ascii_lowercase();
            if classes.contains(&normalized) {
                matched_indices.push(i);
                Some(c.as_str())
            } else {
                None
            }
        })
        .collect();

    let matched_now = match mode {
        MatchMode::Any => !present.is_empty(),
        MatchMode::All => classes
            .iter()
            .all(|needed| present.contains(needed.as_str())),
    };

    if !matched_now {
        gate.last_matched_since = None;
        return None;
    }

    let fires = match duration_s {
        None | Some(..=0) => true,
        Some(threshold) => {
            let since = *gate.last_matched_since.get_or_insert(now);
            (now - since).num_seconds() >= threshold
        }
    };

    if !fires {
        return None;
    }

    let label = label
        .map(str::to_string)
        .unwrap_or_else(|| format!("class_presence: {}", classes.iter().cloned().collect::<Vec<_>>().join(",")));

    Some(MatchResult {
        label,
        rule_index,
        matched_indices,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detections(classes: &[&str]) -> Detections {
        Detections {
            classes: classes.iter().map(|s| s.to_string()).collect(),
            scores: vec![0.9; classes.len()],
            boxes: vec![[0.0, 0.0, 1.0, 1.0]; classes.len()],
            keypoints: vec![None; classes.len()],
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn fires_immediately_without_duration_gate() {
        let mut gate = DurationGateState::default();
        let classes = HashSet::from(["person".to_string()]);
        let result = evaluate(
            0,
            MatchMode::Any,
            &classes,
            None,
            None,
            &detections(&["person"]),
            &mut gate,
            Utc::now(),
        );
        assert!(result.is_some());
    }

    #[test]
    fn non_match_clears_gate() {
        let mut gate = DurationGateState {
            last_matched_since: Some(Utc::now()),
        };
        let classes = HashSet::from(["person".to_string()]);
        let result = evaluate(
            0,
            MatchMode::Any,
            &classes,
            Some(10),
            None,
            &detections(&["dog"]),
            &mut gate,
            Utc::now(),
        );
        assert!(result.is_none());
        assert!(gate.last_matched_since.is_none());
    }

    #[test]
    fn all_mode_requires_every_class() {
        let classes = HashSet::from(["person".to_string(), "dog".to_string()]);
        let mut gate = DurationGateState::default();
        assert!(evaluate(0, MatchMode::All, &classes, None, None, &detections(&["person"]), &mut gate, Utc::now()).is_none());
        assert!(evaluate(0, MatchMode::All, &classes, None, None, &detections(&["person", "dog"]), &mut gate, Utc::now()).is_some());
    }
}
