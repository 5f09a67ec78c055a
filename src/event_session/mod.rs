//! EventSessionManager: sessions keyed by `(agent_id, rule_index)`, an
//! `Active -> Encoding -> Active | Closing` state machine, a bounded frame
//! ring, a bounded encode queue, a background sweeper, and immediate
//! single-frame notification plus chunked video on a separate channel. The
//! single `sessions` mutex guards bookkeeping only — encoding and bus I/O
//! always happen after the guard is dropped.

pub mod encoder;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::config::{SessionConfig, VideoConfig};
use crate::detection::annotate;
use crate::error::SessionError;
use crate::frame_store::FrameEnvelope;

/// Metadata a [`crate::detection`] worker attaches to every fired rule so
/// the session manager can build bus messages without reaching back into
/// the agent/camera registries itself.
#[derive(Debug, Clone)]
pub struct EventContext {
    pub agent_id: String,
    pub agent_name: Option<String>,
    pub camera_id: String,
    pub owner_user_id: String,
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Active,
    Encoding,
    Closing,
}

type SessionKey = (String, usize);

struct EventSession {
    session_id: String,
    state: SessionState,
    last_event_at: DateTime<Utc>,
    chunk_opened_at: DateTime<Utc>,
    chunk_number: u32,
    ring: VecDeque<FrameEnvelope>,
    ring_capacity: usize,
    chunk_frame_limit: usize,
    fps: u32,
    width: u32,
    height: u32,
    label: String,
    rule_index: usize,
    ctx: EventContext,
}

struct EncodeJob {
    session_key: SessionKey,
    session_id: String,
    chunk_number: u32,
    is_final: bool,
    frames: Vec<FrameEnvelope>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    fps: u32,
    width: u32,
    height: u32,
    label: String,
    rule_index: usize,
    ctx: EventContext,
}

pub struct EventSessionManager {
    sessions: Mutex<HashMap<SessionKey, EventSession>>,
    encode_tx: mpsc::Sender<EncodeJob>,
    bus: Arc<EventBus>,
    config: SessionConfig,
    video: VideoConfig,
    bus_max_message_bytes: usize,
    /// Process-wide timezone all bus-payload timestamps are formatted in.
    timezone: chrono_tz::Tz,
}

impl EventSessionManager {
    pub fn start(
        bus: Arc<EventBus>,
        config: SessionConfig,
        video: VideoConfig,
        bus_max_message_bytes: usize,
        timezone: chrono_tz::Tz,
    ) -> Arc<Self> {
        let (encode_tx, encode_rx) = mpsc::channel(config.encode_queue_capacity.max(1));
        let manager = Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            encode_tx,
            bus,
            config,
            video,
            bus_max_message_bytes,
            timezone,
        });

        let worker = Arc::clone(&manager);
        tokio::spawn(async move { worker.encode_worker_loop(encode_rx).await });

        let sweeper = Arc::clone(&manager);
        let check_interval = Duration::from_secs(sweeper.config.check_interval_secs.max(1));
        tokio::spawn(async move { sweeper.sweeper_loop(check_interval).await });

        manager
    }

    /// Non-blocking aside from the bounded ring/queue pushes.
    #[allow(clippy::too_many_arguments)]
    pub async fn handle_event_frame(
        &self,
        ctx: EventContext,
        rule_index: usize,
        label: String,
        frame: FrameEnvelope,
        detections_summary: Vec<String>,
        fps: u32,
        now: DateTime<Utc>,
    ) {
        let key = (ctx.agent_id.clone(), rule_index);
        let mut new_session_id = None;

        {
            let mut sessions = self.sessions.lock().await;
            if !sessions.contains_key(&key) {
                let session_id = Uuid::new_v4().to_string();
                let chunk_frame_limit =
                    ((fps as u64) * self.config.chunk_duration_secs).max(1) as usize;
                let ring_capacity = ((chunk_frame_limit as f64) * 1.1).ceil() as usize;
                sessions.insert(
                    key.clone(),
                    EventSession {
                        session_id: session_id.clone(),
                        state: SessionState::Active,
                        last_event_at: now,
                        chunk_opened_at: now,
                        chunk_number: 0,
                        ring: VecDeque::new(),
                        ring_capacity: ring_capacity.max(1),
                        chunk_frame_limit,
                        fps,
                        width: frame.width,
                        height: frame.height,
                        label: label.clone(),
                        rule_index,
                        ctx: ctx.clone(),
                    },
                );
                new_session_id = Some(session_id);
            }
        }

        if let Some(session_id) = new_session_id {
            self.send_immediate_notification(
                ctx.clone(),
                rule_index,
                label.clone(),
                frame.clone(),
                detections_summary,
                session_id,
                now,
            );
        }

        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(&key) else {
            return;
        };
        if session.state == SessionState::Closing {
            // the old session under this key is tearing down; a new one
            // opens on the next call once it's removed.
            return;
        }

        session.last_event_at = now;
        session.label = label;
        if session.ring.len() >= session.ring_capacity {
            session.ring.pop_front();
        }
        session.ring.push_back(frame);

        let boundary_by_count = session.ring.len() >= session.chunk_frame_limit;
        let boundary_by_time = (now - session.chunk_opened_at).num_seconds() as u64
            >= self.config.chunk_duration_secs;

        if session.state == SessionState::Active && (boundary_by_count || boundary_by_time) {
            self.split_chunk(session, false, now);
        }
    }

    /// Moves the current ring into an encode job, flips state to `Encoding`.
    /// Returns whether the job was actually enqueued — on a full queue the
    /// chunk is dropped and state reverts to `Active` — a dropped
    /// chunk is preferable to unbounded memory growth.
    fn split_chunk(&self, session: &mut EventSession, is_final: bool, now: DateTime<Utc>) -> bool {
        let frames: Vec<FrameEnvelope> = session.ring.drain(..).collect();
        let chunk_number = session.chunk_number;
        let job = EncodeJob {
            session_key: (session.ctx.agent_id.clone(), session.rule_index),
            session_id: session.session_id.clone(),
            chunk_number,
            is_final,
            frames,
            start: session.chunk_opened_at,
            end: now,
            fps: session.fps,
            width: session.width,
            height: session.height,
            label: session.label.clone(),
            rule_index: session.rule_index,
            ctx: session.ctx.clone(),
        };

        session.state = SessionState::Encoding;
        session.chunk_number += 1;
        session.chunk_opened_at = now;

        match self.encode_tx.try_send(job) {
            Ok(()) => true,
            Err(_) => {
                let err = SessionError::QueueFull {
                    session_id: session.session_id.clone(),
                    chunk_number,
                };
                warn!(error = %err, "chunk dropped");
                session.state = SessionState::Active;
                false
            }
        }
    }

    async fn sweeper_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            let mut to_remove = Vec::new();
            {
                let mut sessions = self.sessions.lock().await;
                for (key, session) in sessions.iter_mut() {
                    if session.state != SessionState::Active {
                        continue;
                    }
                    let idle = (now - session.last_event_at).num_seconds() as u64;
                    if idle >= self.config.timeout_secs {
                        if session.ring.is_empty() && session.chunk_number == 0 {
                            // nothing was ever buffered for a final chunk; the
                            // immediate notification already fired, just close.
                            to_remove.push(key.clone());
                            continue;
                        }
                        let enqueued = self.split_chunk(session, true, now);
                        if enqueued {
                            session.state = SessionState::Closing;
                        } else {
                            to_remove.push(key.clone());
                        }
                    }
                }
                for key in &to_remove {
                    sessions.remove(key);
                }
            }
        }
    }

    /// Flush every `Active` session on shutdown.
    pub async fn flush_all(&self) {
        let now = Utc::now();
        let mut jobs = Vec::new();
        {
            let mut sessions = self.sessions.lock().await;
            for session in sessions.values_mut() {
                if session.state != SessionState::Active {
                    continue;
                }
                let frames: Vec<FrameEnvelope> = session.ring.drain(..).collect();
                if frames.is_empty() {
                    continue;
                }
                jobs.push(EncodeJob {
                    session_key: (session.ctx.agent_id.clone(), session.rule_index),
                    session_id: session.session_id.clone(),
                    chunk_number: session.chunk_number,
                    is_final: true,
                    frames,
                    start: session.chunk_opened_at,
                    end: now,
                    fps: session.fps,
                    width: session.width,
                    height: session.height,
                    label: session.label.clone(),
                    rule_index: session.rule_index,
                    ctx: session.ctx.clone(),
                });
                session.state = SessionState::Closing;
            }
        }
        for job in jobs {
            let _ = self.encode_tx.send(job).await;
        }
    }

    async fn encode_worker_loop(self: Arc<Self>, mut rx: mpsc::Receiver<EncodeJob>) {
        while let Some(job) = rx.recv().await {
            self.run_encode_job(job).await;
        }
    }

    async fn run_encode_job(&self, job: EncodeJob) {
        let result = encoder::encode_chunk(
            &self.video.encoder_binary,
            &job.frames,
            job.fps,
            job.width,
            job.height,
        )
        .await;

        match result {
            Ok(bytes) => {
                if self.video.save_enabled {
                    self.write_local_file(&job, &bytes).await;
                }
                self.emit_chunk(&job, &bytes);
            }
            Err(err) => {
                let err = SessionError::EncoderFailed(err);
                warn!(session_id = %job.session_id, error = %err, "dropping chunk");
            }
        }

        self.complete_job(&job).await;
    }

    async fn complete_job(&self, job: &EncodeJob) {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get(&job.session_key) else {
            return;
        };
        if session.session_id != job.session_id {
            return; // a new session has since opened under this key
        }
        if job.is_final {
            sessions.remove(&job.session_key);
        } else if let Some(session) = sessions.get_mut(&job.session_key) {
            session.state = SessionState::Active;
        }
    }

    fn send_immediate_notification(
        &self,
        ctx: EventContext,
        rule_index: usize,
        label: String,
        frame: FrameEnvelope,
        detections_summary: Vec<String>,
        session_id: String,
        now: DateTime<Utc>,
    ) {
        let bus = self.bus.clone();
        let timezone = self.timezone;
        tokio::spawn(async move {
            let jpeg = match tokio::task::spawn_blocking(move || annotate::encode_jpeg_q85(&frame))
                .await
            {
                Ok(Ok(bytes)) => bytes,
                _ => {
                    warn!(session_id = %session_id, "immediate notification encode failed, session still opens");
                    return;
                }
            };

            let agent_id = ctx.agent_id.clone();
            let timestamp = now.with_timezone(&timezone).to_rfc3339();
            let payload = serde_json::json!({
                "event": {"label": label, "rule_index": rule_index, "timestamp": timestamp},
                "agent": {"agent_id": ctx.agent_id, "agent_name": ctx.agent_name, "camera_id": ctx.camera_id},
                "camera": {"owner_user_id": ctx.owner_user_id, "device_id": ctx.device_id},
                "frame": {"image_base64": BASE64.encode(jpeg), "format": "jpeg"},
                "metadata": {"video_timestamp": timestamp, "detections": detections_summary, "session_id": session_id},
            });
            bus.publish_notification("event_notification", &agent_id, payload);
        });
    }

    fn emit_chunk(&self, job: &EncodeJob, bytes: &[u8]) {
        if bytes.len() > self.bus_max_message_bytes {
            let err = SessionError::ChunkTooLarge {
                session_id: job.session_id.clone(),
                chunk_number: job.chunk_number,
                size: bytes.len(),
            };
            error!(error = %err, "dropped (local file remains authoritative if enabled)");
            return;
        }

        let duration_s = (job.end - job.start).num_milliseconds() as f64 / 1000.0;
        let start_time = job.start.with_timezone(&self.timezone).to_rfc3339();
        let end_time = job.end.with_timezone(&self.timezone).to_rfc3339();
        let payload = serde_json::json!({
            "type": "event_video",
            "session_id": job.session_id,
            "sequence_number": job.chunk_number,
            "is_final_chunk": job.is_final,
            "chunk": {
                "chunk_number": job.chunk_number,
                "start_time": start_time,
                "end_time": end_time.clone(),
                "duration_seconds": duration_s,
            },
            "event": {"label": job.label, "rule_index": job.rule_index, "timestamp": end_time},
            "agent": {"agent_id": job.ctx.agent_id, "agent_name": job.ctx.agent_name, "camera_id": job.ctx.camera_id},
            "camera": {"owner_user_id": job.ctx.owner_user_id, "device_id": job.ctx.device_id},
            "video": {
                "data_base64": BASE64.encode(bytes),
                "format": "mp4",
                "fps": job.fps,
                "resolution": {"width": job.width, "height": job.height},
            },
            "metadata": {"session_id": job.session_id, "chunk_sequence": job.chunk_number},
        });
        self.bus.publish_video_chunk("event_video", &job.session_id, payload);
    }

    async fn write_local_file(&self, job: &EncodeJob, bytes: &[u8]) {
        let phase = if job.is_final { "final" } else { "partial" };
        let filename = sanitize_filename(&format!(
            "{}_chunk{:03}_{}_{}.mp4",
            job.session_id,
            job.chunk_number,
            job.end.timestamp(),
            phase
        ));
        let path = std::path::Path::new(&self.video.save_directory).join(filename);
        if let Some(dir) = path.parent() {
            if let Err(err) = tokio::fs::create_dir_all(dir).await {
                warn!(error = %err, "failed to create event video directory");
                return;
            }
        }
        if let Err(err) = tokio::fs::write(&path, bytes).await {
            warn!(error = %err, path = %path.display(), "failed to write local chunk file");
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub fn encode_queue_depth(&self) -> usize {
        self.config
            .encode_queue_capacity
            .saturating_sub(self.encode_tx.capacity())
    }
}

/// Keeps on-disk chunk filenames restricted to a safe character set.
fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_filename_strips_unsafe_characters() {
        assert_eq!(sanitize_filename("a/b c:d.mp4"), "a_b_c_d.mp4");
    }

    #[tokio::test]
    async fn opening_a_session_increments_count() {
        let bus = Arc::new(crate::bus::EventBus::start_noop());
        let manager = EventSessionManager::start(
            bus,
            SessionConfig {
                timeout_secs: 30,
                check_interval_secs: 5,
                chunk_duration_secs: 300,
                encode_queue_capacity: 4,
            },
            VideoConfig::default(),
            8 * 1024 * 1024,
            chrono_tz::UTC,
        );
        let ctx = EventContext {
            agent_id: "a1".to_string(),
            agent_name: None,
            camera_id: "c1".to_string(),
            owner_user_id: "u1".to_string(),
            device_id: None,
        };
        let frame = FrameEnvelope {
            camera_id: "c1".to_string(),
            frame_index: 1,
            produced_at: std::time::SystemTime::now(),
            width: 4,
            height: 4,
            pixels: bytes::Bytes::from(vec![0u8; 48]),
            measured_fps: 5.0,
            source_fps_hint: None,
            error: None,
        };
        manager
            .handle_event_frame(ctx, 0, "person".to_string(), frame, vec![], 5, Utc::now())
            .await;
        assert_eq!(manager.session_count().await, 1);
    }
}
