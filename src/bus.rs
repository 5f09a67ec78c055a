//! EventBus: single producer to an external message bus.
//!
//! Frames each outgoing message as `"{topic} {json_payload}"` over a ZeroMQ
//! PUB socket bound at startup. `zmq` is synchronous, so the socket lives on
//! a dedicated blocking task — callers post through an unbounded channel and
//! never touch the socket directly, the same split `frame_hub` uses for its
//! gstreamer pipeline.

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, warn};

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum BusMessage {
    #[serde(rename = "event_notification")]
    Notification(serde_json::Value),
    #[serde(rename = "event_video")]
    VideoChunk(serde_json::Value),
}

struct Envelope {
    partition_key: String,
    topic: String,
    message: BusMessage,
}

#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl EventBus {
    /// Bind a PUB socket at `endpoint` and spawn its owning task.
    pub fn start(endpoint: String, topic: String) -> Result<Self> {
        let ctx = zmq::Context::new();
        let socket = ctx.socket(zmq::PUB).context("failed to create zmq PUB socket")?;
        socket.bind(&endpoint).context("failed to bind zmq PUB socket")?;

        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

        std::thread::spawn(move || {
            while let Some(envelope) = rx.blocking_recv() {
                let payload = match serde_json::to_string(&envelope.message) {
                    Ok(p) => p,
                    Err(err) => {
                        error!(error = %err, "failed to serialize bus message, dropping");
                        continue;
                    }
                };
                // Partition key travels as the first word so subscribers can
                // filter on it the way they would a ZMQ topic prefix.
                let framed = format!("{} {} {}", envelope.topic, envelope.partition_key, payload);
                if let Err(err) = socket.send(framed.as_bytes(), 0) {
                    warn!(error = %err, "bus send failed");
                }
            }
        });

        Ok(Self { tx })
    }

    /// A bus with no socket behind it, draining and discarding everything
    /// sent. Used by tests that exercise `EventSessionManager` without a
    /// running ZeroMQ broker.
    pub fn start_noop() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        Self { tx }
    }

    /// Immediate single-frame notification, partitioned by `agent_id`.
    pub fn publish_notification(&self, topic: &str, agent_id: &str, payload: serde_json::Value) {
        self.send(topic, agent_id, BusMessage::Notification(payload));
    }

    /// Event video chunk, partitioned by `session_id` to preserve ordering.
    pub fn publish_video_chunk(&self, topic: &str, session_id: &str, payload: serde_json::Value) {
        self.send(topic, session_id, BusMessage::VideoChunk(payload));
    }

    fn send(&self, topic: &str, partition_key: &str, message: BusMessage) {
        let envelope = Envelope {
            partition_key: partition_key.to_string(),
            topic: topic.to_string(),
            message,
        };
        // The core performs no retries beyond the bus client library's own;
        // a full channel here just means the producer is gone.
        if self.tx.send(envelope).is_err() {
            error!("event bus producer task is gone, message dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_serializes_with_expected_tag() {
        let msg = BusMessage::Notification(serde_json::json!({"label": "person"}));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"event_notification\""));
    }

    #[test]
    fn video_chunk_serializes_with_expected_tag() {
        let msg = BusMessage::VideoChunk(serde_json::json!({"chunk_number": 0}));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"event_video\""));
    }
}
