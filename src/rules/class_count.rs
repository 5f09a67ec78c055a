//! `class_count` handler. Always returns a label when
//! evaluated — it is a reporting rule, not an alerting one, so the engine
//! (`rules::evaluate`) treats its result specially and never lets it
//! suppress rules that come after it.

use crate::model::{Detections, MatchResult};

pub fn evaluate(
    rule_index: usize,
    class: &str,
    label: Option<&str>,
    detections: &Detections,
) -> Option<MatchResult> {
    let needle = class.trim().to_ascii_lowercase();
    let matched_indices: Vec<usize> = detections
        .classes
        .iter()
        .enumerate()
        .filter(|(_, c)| c.trim().to_ascii_lowercase() == needle)
        .map(|(i, _)| i)
        .collect();

    let count = matched_indices.len();
    let label = label
        .map(|l| format!("{}: {}", l, count))
        .unwrap_or_else(|| format!("{}: {}", class, count));

    Some(MatchResult {
        label,
        rule_index,
        matched_indices,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn reports_zero_count_too() {
        let detections = Detections::empty(Utc::now());
        let result = evaluate(0, "person", None, &detections).unwrap();
        assert_eq!(result.label, "person: 0");
    }

    #[test]
    fn counts_matching_class_only() {
        let detections = Detections {
            classes: vec!["person".into(), "dog".into(), "person".into()],
            scores: vec![0.9; 3],
            boxes: vec![[0.0, 0.0, 1.0, 1.0]; 3],
            keypoints: vec![None; 3],
            timestamp: Utc::now(),
        };
        let result = evaluate(0, "person", Some("people"), &detections).unwrap();
        assert_eq!(result.label, "people: 2");
    }
}
