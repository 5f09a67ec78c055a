//! `accident_presence` (human fall) handler.
//!
//! Per-person state is addressed by detection index within the frame, not by
//! identity — no track-identity source is available, so this is a known
//! limitation rather than an oversight; see `DESIGN.md`.

use std::collections::HashMap;

use crate::model::{Detections, MatchResult};

const FALL_MOTION_PX: f32 = 6.0;
const COLLAPSE_RATIO: f32 = 0.7;
const LYING_ANGLE_DEG: f32 = 45.0;
const LYING_HEIGHT_PX: f32 = 20.0;
const ACT_OF_FALLING_THRESHOLD: i32 = 2;
const STATE_OF_LYING_FRAMES: u32 = 3;

// COCO-17 keypoint layout: 5/6 = left/right shoulder, 11/12 = left/right hip.
const LEFT_SHOULDER: usize = 5;
const RIGHT_SHOULDER: usize = 6;
const LEFT_HIP: usize = 11;
const RIGHT_HIP: usize = 12;

#[derive(Debug, Clone, Default)]
struct PersonSlot {
    prev_hip_y: Option<f32>,
    prev_height: Option<f32>,
    fall_counter: i32,
    lying_streak: u32,
}

#[derive(Debug, Default)]
pub struct AccidentState {
    slots: HashMap<usize, PersonSlot>,
}

pub fn evaluate(
    rule_index: usize,
    label: Option<&str>,
    detections: &Detections,
    state: &mut AccidentState,
) -> Option<MatchResult> {
    let mut present = Vec::new();
    for (i, class) in detections.classes.iter().enumerate() {
        if class == "person" {
            if let Some(Some(kp)) = detections.keypoints.get(i) {
                if kp.len() > RIGHT_HIP {
                    present.push(i);
                }
            }
        }
    }

    state.slots.retain(|i, _| present.contains(i));

    let mut act_of_falling = Vec::new();
    let mut state_of_lying = Vec::new();

    for &i in &present {
        let kp = detections.keypoints[i].as_ref().unwrap();
        let height = detections.boxes[i][3] - detections.boxes[i][1];

        let shoulder_mid = midpoint(kp[LEFT_SHOULDER], kp[RIGHT_SHOULDER]);
        let hip_mid = midpoint(kp[LEFT_HIP], kp[RIGHT_HIP]);
        let hip_y = hip_mid.1;
        let angle = angle_from_vertical(shoulder_mid, hip_mid);

        let slot = state.slots.entry(i).or_default();

        let fall_motion = slot
            .prev_hip_y
            .map(|prev| hip_y - prev > FALL_MOTION_PX)
            .unwrap_or(false);
        let collapsed = slot
            .prev_height
            .map(|prev| prev > 0.0 && height / prev < COLLAPSE_RATIO)
            .unwrap_or(false);
        let lying = angle > LYING_ANGLE_DEG;

        if fall_motion && collapsed && lying {
            slot.fall_counter += 1;
        } else {
            slot.fall_counter = (slot.fall_counter - 1).max(0);
        }
        if slot.fall_counter >= ACT_OF_FALLING_THRESHOLD {
            act_of_falling.push(i);
        }

        if lying && height > LYING_HEIGHT_PX {
            slot.lying_streak += 1;
        } else {
            slot.lying_streak = 0;
        }
        if slot.lying_streak >= STATE_OF_LYING_FRAMES {
            state_of_lying.push(i);
        }

        slot.prev_hip_y = Some(hip_y);
        slot.prev_height = Some(height);
    }

    let mut matched_indices = act_of_falling;
    matched_indices.extend(state_of_lying.iter().filter(|i| !matched_indices.contains(i)));

    if matched_indices.is_empty() {
        return None;
    }

    let label = label.map(str::to_string).unwrap_or_else(|| "accident_presence: fall detected".to_string());

    Some(MatchResult {
        label,
        rule_index,
        matched_indices,
    })
}

fn midpoint(a: [f32; 3], b: [f32; 3]) -> (f32, f32) {
    ((a[0] + b[0]) / 2.0, (a[1] + b[1]) / 2.0)
}

fn angle_from_vertical(shoulder: (f32, f32), hip: (f32, f32)) -> f32 {
    let dx = (hip.0 - shoulder.0).abs();
    let dy = (hip.1 - shoulder.1).abs();
    dx.atan2(dy).to_degrees()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn person_frame(shoulder: (f32, f32), hip: (f32, f32), height: f32) -> Detections {
        let kp = vec![[0.0, 0.0, 1.0]; 13]
            .into_iter()
            .enumerate()
            .map(|(idx, mut p)| {
                if idx == LEFT_SHOULDER || idx == RIGHT_SHOULDER {
                    p = [shoulder.0, shoulder.1, 1.0];
                } else if idx == LEFT_HIP || idx == RIGHT_HIP {
                    p = [hip.0, hip.1, 1.0];
                }
                p
            })
            .collect();
        Detections {
            classes: vec!["person".to_string()],
            scores: vec![0.9],
            boxes: vec![[0.0, 0.0, 10.0, height]],
            keypoints: vec![Some(kp)],
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn act_of_falling_fires_once_counter_reaches_two() {
        let mut state = AccidentState::default();
        // frame 1: establishes baseline, no prior data so fall_motion=false yet.
        let f1 = person_frame((50.0, 0.0), (50.0, 100.0), 150.0);
        assert!(evaluate(0, None, &f1, &mut state).is_none());

        // frame 2: hip_y +8px, height collapses to 0.6x, steep lean angle -> counter=1.
        let f2 = person_frame((50.0, 0.0), (80.0, 108.0), 90.0);
        assert!(evaluate(0, None, &f2, &mut state).is_none());

        // frame 3: same conditions persist -> counter=2, fires.
        let f3 = person_frame((50.0, 0.0), (90.0, 116.0), 90.0);
        let r3 = evaluate(0, None, &f3, &mut state);
        assert!(r3.is_some());
    }

    #[test]
    fn slots_are_cleaned_up_when_person_disappears() {
        let mut state = AccidentState::default();
        let f1 = person_frame((50.0, 0.0), (50.0, 100.0), 150.0);
        let _ = evaluate(0, None, &f1, &mut state);
        assert_eq!(state.slots.len(), 1);

        let empty = Detections::empty(Utc::now());
        let _ = evaluate(0, None, &empty, &mut state);
        assert!(state.slots.is_empty());
    }
}
