//! `count_at_least` handler: count occurrences of the target class, fire
//! past a threshold, same optional duration gate as `class_presence`.

use chrono::{DateTime, Utc};

use super::DurationGateState;
use crate::model::{Detections, MatchResult};

pub fn evaluate(
    rule_index: usize,
    class: &str,
    min_count: u32,
    duration_s: Option<i64>,
    label: Option<&str>,
    detections: &Detections,
    gate: &mut DurationGateState,
    now: DateTime<Utc>,
) -> Option<MatchResult> {
    let needle = class.trim().to_ascii_lowercase();
    let matched_indices: Vec<usize> = detections
        .classes
        .iter()
        .enumerate()
        .filter(|(_, c)| c.trim().to_ascii_lowercase() == needle)
        .map(|(i, _)| i)
        .collect();

    let matched_now = matched_indices.len() as u32 >= min_count;

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
        .unwrap_or_else(|| format!("count_at_least: {} >= {}", class, min_count));

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
    fn fires_when_count_meets_threshold() {
        let mut gate = DurationGateState::default();
        let result = evaluate(
            0,
            "car",
            3,
            None,
            None,
            &detections(&["car", "car", "car", "person"]),
            &mut gate,
            Utc::now(),
        );
        assert!(result.is_some());
        assert_eq!(result.unwrap().matched_indices.len(), 3);
    }

    #[test]
    fn below_threshold_clears_gate_and_does_not_fire() {
        let mut gate = DurationGateState {
            last_matched_since: Some(Utc::now()),
        };
        let result = evaluate(0, "car", 3, Some(5), None, &detections(&["car"]), &mut gate, Utc::now());
        assert!(result.is_none());
        assert!(gate.last_matched_since.is_none());
    }
}
