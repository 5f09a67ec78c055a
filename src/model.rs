//! Canonical data model shared by every component.
//!
//! Documents coming off the persistence layer are not always in this shape —
//! see [`raw::RawAgentDocument`] for the field-alias normalization the HTTP
//! CRUD layer and older callers rely on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::RuleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Camera {
    pub camera_id: String,
    pub owner_user_id: String,
    pub stream_url: String,
    pub device_id: Option<String>,
    pub status: CameraStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Continuous,
    Patrol,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: String,
    pub camera_id: String,
    pub owner_user_id: String,
    pub model: String,
    pub fps: u32,
    pub run_mode: RunMode,
    /// Required iff `run_mode == Patrol`.
    pub patrol_interval_seconds: Option<u64>,
    /// Required iff `run_mode == Patrol`.
    pub patrol_window_seconds: Option<u64>,
    pub rules: Vec<Rule>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: AgentStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl Agent {
    /// Whether `now` falls in `[start_time, end_time)`.
    pub fn is_in_window(&self, now: DateTime<Utc>) -> bool {
        now >= self.start_time && now < self.end_time
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.end_time
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    Any,
    All,
}

impl Default for MatchMode {
    fn default() -> Self {
        MatchMode::Any
    }
}

/// Tagged rule variant. Order within `Agent::rules` is significant:
/// first match wins per frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Rule {
    ClassPresence {
        #[serde(default)]
        r#match: MatchMode,
        classes: HashSet<String>,
        duration_s: Option<i64>,
        label: Option<String>,
    },
    CountAtLeast {
        class: String,
        min_count: u32,
        duration_s: Option<i64>,
        label: Option<String>,
    },
    /// Always reports; never suppresses subsequent rules on its own merit —
    /// the engine special-cases this variant so "report only" rules don't
    /// short-circuit first-match-wins.
    ClassCount {
        class: String,
        label: Option<String>,
    },
    /// Only ever evaluated against `class == "person"` detections with
    /// keypoints present.
    AccidentPresence {
        label: Option<String>,
    },
}

/// Per-frame detections. All arrays are parallel.
#[derive(Debug, Clone, Default)]
pub struct Detections {
    pub classes: Vec<String>,
    pub scores: Vec<f32>,
    pub boxes: Vec<[f32; 4]>,
    /// `keypoints[i]` is the keypoint list for `classes[i]`, present only for
    /// pose models: `[[x, y, conf], ...]`.
    pub keypoints: Vec<Option<Vec<[f32; 3]>>>,
    pub timestamp: DateTime<Utc>,
}

impl Detections {
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Append another model's output, keeping arrays parallel.
    pub fn extend(&mut self, other: Detections) {
        self.classes.extend(other.classes);
        self.scores.extend(other.scores);
        self.boxes.extend(other.boxes);
        self.keypoints.extend(other.keypoints);
    }
}

/// Result of a rule handler matching on a given frame.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub label: String,
    pub rule_index: usize,
    /// Detection indices the match is derived from, if any (used for
    /// annotation and for per-person fall-detector bookkeeping).
    pub matched_indices: Vec<usize>,
}

/// Normalizes alternative field names/casings accepted from older callers or
/// the "web backend" request shape into the canonical [`Agent`]/[`Camera`]:
/// accepts `id` or `agent_id`, `start_time` or `start_at`, and tolerates
/// lower/upper-case status strings.
pub mod raw {
    use super::*;

    #[derive(Debug, Clone, Deserialize)]
    pub struct RawAgentDocument {
        #[serde(alias = "agent_id")]
        pub id: String,
        pub camera_id: String,
        pub owner_user_id: String,
        pub model: String,
        pub fps: u32,
        #[serde(default)]
        pub run_mode: Option<String>,
        #[serde(default)]
        pub interval_minutes: Option<f64>,
        #[serde(default)]
        pub check_duration_seconds: Option<u64>,
        #[serde(alias = "start_at")]
        pub start_time: DateTime<Utc>,
        #[serde(alias = "end_at")]
        pub end_time: DateTime<Utc>,
        /// Parsed leniently: each element is validated on its own in
        /// [`parse_rules`] so one malformed rule doesn't reject the whole
        /// document.
        #[serde(default)]
        pub rules: Vec<serde_json::Value>,
        #[serde(default)]
        pub status: Option<String>,
    }

    /// Rule kinds this crate knows how to evaluate. Kept in sync with the
    /// `#[serde(tag = "type")]` variants on [`Rule`] so `classify_rule_error`
    /// can tell "unknown type" apart from "known type, bad shape".
    const KNOWN_RULE_TYPES: [&str; 4] =
        ["class_presence", "count_at_least", "class_count", "accident_presence"];

    fn required_fields(rule_type: &str) -> &'static [&'static str] {
        match rule_type {
            "class_presence" => &["classes"],
            "count_at_least" => &["class", "min_count"],
            "class_count" => &["class"],
            "accident_presence" => &[],
            _ => &[],
        }
    }

    fn classify_rule_error(index: usize, value: &serde_json::Value) -> RuleError {
        let obj = value.as_object();
        let rule_type = obj.and_then(|o| o.get("type")).and_then(|t| t.as_str());
        let Some(rule_type) = rule_type else {
            return RuleError::MissingField { index, field: "type" };
        };
        if !KNOWN_RULE_TYPES.contains(&rule_type) {
            return RuleError::UnknownType(rule_type.to_string());
        }
        for &field in required_fields(rule_type) {
            if !obj.is_some_and(|o| o.contains_key(field)) {
                return RuleError::MissingField { index, field };
            }
        }
        RuleError::MissingField { index, field: "body" }
    }

    /// Parses each raw rule document independently, skipping and logging any
    /// that don't deserialize instead of rejecting the whole agent.
    fn parse_rules(raw: Vec<serde_json::Value>) -> Vec<Rule> {
        raw.into_iter()
            .enumerate()
            .filter_map(|(index, value)| match serde_json::from_value::<Rule>(value.clone()) {
                Ok(rule) => Some(rule),
                Err(_) => {
                    let err = classify_rule_error(index, &value);
                    tracing::warn!(index, error = %err, "skipping malformed rule");
                    None
                }
            })
            .collect()
    }

    impl RawAgentDocument {
        pub fn into_canonical(self) -> Agent {
            let run_mode = match self.run_mode.as_deref() {
                Some("patrol") | Some("PATROL") => RunMode::Patrol,
                _ => RunMode::Continuous,
            };
            let status = match self.status.as_deref().map(str::to_ascii_uppercase).as_deref() {
                Some("RUNNING") | Some("ACTIVE") => AgentStatus::Running,
                Some("COMPLETED") => AgentStatus::Completed,
                Some("CANCELLED") => AgentStatus::Cancelled,
                _ => AgentStatus::Pending,
            };
            Agent {
                agent_id: self.id,
                camera_id: self.camera_id,
                owner_user_id: self.owner_user_id,
                model: self.model,
                fps: self.fps,
                run_mode,
                patrol_interval_seconds: self.interval_minutes.map(|m| (m * 60.0) as u64),
                patrol_window_seconds: self.check_duration_seconds,
                rules: parse_rules(self.rules),
                start_time: self.start_time,
                end_time: self.end_time,
                status,
                last_heartbeat: None,
            }
        }
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct RawCameraDocument {
        #[serde(alias = "camera_id")]
        pub id: String,
        pub owner_user_id: String,
        #[serde(alias = "rtsp_url", alias = "source_uri")]
        pub stream_url: String,
        #[serde(default)]
        pub device_id: Option<String>,
        #[serde(default)]
        pub status: Option<String>,
        pub created_at: DateTime<Utc>,
        pub updated_at: DateTime<Utc>,
    }

    impl RawCameraDocument {
        pub fn into_canonical(self) -> Camera {
            let status = match self.status.as_deref() {
                Some("inactive") => CameraStatus::Inactive,
                _ => CameraStatus::Active,
            };
            Camera {
                camera_id: self.id,
                owner_user_id: self.owner_user_id,
                stream_url: self.stream_url,
                device_id: self.device_id,
                status,
                created_at: self.created_at,
                updated_at: self.updated_at,
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn accepts_legacy_field_aliases() {
            let json = r#"{
                "agent_id": "a1",
                "camera_id": "c1",
                "owner_user_id": "u1",
                "model": "yolov8n",
                "fps": 5,
                "start_at": "2026-01-01T00:00:00Z",
                "end_at": "2026-01-01T01:00:00Z",
                "status": "running"
            }"#;
            let raw: RawAgentDocument = serde_json::from_str(json).unwrap();
            let agent = raw.into_canonical();
            assert_eq!(agent.agent_id, "a1");
            assert_eq!(agent.status, AgentStatus::Running);
        }

        #[test]
        fn malformed_rules_are_skipped_not_fatal() {
            let json = r#"{
                "agent_id": "a1",
                "camera_id": "c1",
                "owner_user_id": "u1",
                "model": "yolov8n",
                "fps": 5,
                "start_at": "2026-01-01T00:00:00Z",
                "end_at": "2026-01-01T01:00:00Z",
                "rules": [
                    {"type": "class_presence", "classes": ["person"]},
                    {"type": "flying_saucer_detector"},
                    {"type": "count_at_least", "min_count": 2}
                ]
            }"#;
            let raw: RawAgentDocument = serde_json::from_str(json).unwrap();
            let agent = raw.into_canonical();
            assert_eq!(agent.rules.len(), 1);
        }

        #[test]
        fn classify_rule_error_distinguishes_unknown_type_from_missing_field() {
            let unknown = serde_json::json!({"type": "flying_saucer_detector"});
            assert!(matches!(
                classify_rule_error(1, &unknown),
                RuleError::UnknownType(t) if t == "flying_saucer_detector"
            ));

            let missing = serde_json::json!({"type": "count_at_least", "min_count": 2});
            assert!(matches!(
                classify_rule_error(2, &missing),
                RuleError::MissingField { index: 2, field: "class" }
            ));
        }
    }
}
