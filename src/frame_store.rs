//! Latest-frame-wins store shared between `FrameHub` producers, detection
//! workers, and the WebRTC/WS-fMP4 publishers.
//!
//! Readers never want history: a viewer that attaches mid-stream should see
//! the most recent frame, not a backlog, so this is not a broadcast fan-out
//! queue. It keys on a small `dashmap::DashMap` sharded by camera/agent id,
//! each slot holding an `arc_swap::ArcSwapOption` so publish is a single
//! atomic pointer swap with no lock held across readers.

use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use dashmap::DashMap;

/// One decoded frame plus the bookkeeping rule handlers, annotators, and
/// publishers need.
#[derive(Debug, Clone)]
pub struct FrameEnvelope {
    pub camera_id: String,
    pub frame_index: u64,
    pub produced_at: SystemTime,
    pub width: u32,
    pub height: u32,
    /// Tightly packed BGR8 rows, `height * width * 3` bytes.
    pub pixels: Bytes,
    pub measured_fps: f32,
    /// Native source frame rate, when the ingest source advertises one.
    /// Opportunistic — `measured_fps` is always computed regardless.
    pub source_fps_hint: Option<f32>,
    /// `Some(message)` marks this envelope as the error variant published
    /// when ingest is broken. The zero-dimension, empty-pixels sentinel
    /// still accompanies it so old dimension-based checks keep working,
    /// but consumers that want the reason should read this field.
    pub error: Option<String>,
}

impl FrameEnvelope {
    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }

    /// True for the error variant a `FrameHub` publishes when ingest is
    /// broken (open/decode/read failure).
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A store key is a camera id for raw frames, or `"{camera_id}:{agent_id}"`
/// for per-agent annotated frames (distinct consumers never collide).
pub type StoreKey = String;

#[derive(Default)]
pub struct FrameStore {
    slots: DashMap<StoreKey, Arc<ArcSwapOption<FrameEnvelope>>>,
}

impl FrameStore {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    /// Replace the latest frame under `key`. Never blocks on readers.
    pub fn put(&self, key: impl Into<StoreKey>, frame: FrameEnvelope) {
        let key = key.into();
        let slot = self
            .slots
            .entry(key)
            .or_insert_with(|| Arc::new(ArcSwapOption::from(None)))
            .clone();
        slot.store(Some(Arc::new(frame)));
    }

    /// Snapshot the latest frame under `key`, if any has ever been published.
    pub fn get(&self, key: &str) -> Option<Arc<FrameEnvelope>> {
        self.slots.get(key).and_then(|slot| slot.load_full())
    }

    /// Drop a key entirely, e.g. when a camera's agent is torn down. Readers
    /// holding an `Arc` from a prior `get` keep their snapshot valid.
    pub fn remove(&self, key: &str) {
        self.slots.remove(key);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn keys(&self) -> Vec<StoreKey> {
        self.slots.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(index: u64) -> FrameEnvelope {
        FrameEnvelope {
            camera_id: "cam-1".to_string(),
            frame_index: index,
            produced_at: SystemTime::now(),
            width: 4,
            height: 4,
            pixels: Bytes::from_static(&[0u8; 48]),
            measured_fps: 5.0,
            source_fps_hint: None,
            error: None,
        }
    }

    #[test]
    fn get_before_any_put_is_none() {
        let store = FrameStore::new();
        assert!(store.get("cam-1").is_none());
    }

    #[test]
    fn put_then_get_returns_latest_only() {
        let store = FrameStore::new();
        store.put("cam-1", frame(1));
        store.put("cam-1", frame(2));
        let latest = store.get("cam-1").expect("frame present");
        assert_eq!(latest.frame_index, 2);
    }

    #[test]
    fn distinct_keys_do_not_collide() {
        let store = FrameStore::new();
        store.put("cam-1", frame(1));
        store.put("cam-1:agent-a", frame(99));
        assert_eq!(store.get("cam-1").unwrap().frame_index, 1);
        assert_eq!(store.get("cam-1:agent-a").unwrap().frame_index, 99);
    }

    #[test]
    fn remove_clears_the_slot() {
        let store = FrameStore::new();
        store.put("cam-1", frame(1));
        store.remove("cam-1");
        assert!(store.get("cam-1").is_none());
    }
}
