//! WsFmp4Publisher: per-agent fragmented-MP4 encoder fanned out to N
//! WebSocket viewers. Lifecycle is tied to the viewer count —
//! the encoder only runs while at least one viewer is attached, mirroring
//! the "start on first connection, tear down on last disconnect" shape of
//! `web-live.rs`'s live stream handling, adapted here to own the encoder
//! process instead of reading from an already-recorded ring buffer.

pub mod mp4_box;

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::VideoConfig;
use crate::error::PublisherError;
use crate::frame_store::FrameStore;
use mp4_box::InitSegmentCollector;

const FIRST_FRAME_WAIT: Duration = Duration::from_secs(2);
const MEDIA_CHUNK_BYTES: usize = 4096;
const MEDIA_CHANNEL_CAPACITY: usize = 64;

struct Fmp4Session {
    viewers: AtomicUsize,
    media_tx: broadcast::Sender<Bytes>,
    init_rx: watch::Receiver<Option<Bytes>>,
    stop_tx: watch::Sender<bool>,
}

pub struct WsFmp4Publisher {
    frame_store: Arc<FrameStore>,
    video: VideoConfig,
    sessions: Mutex<HashMap<String, Arc<Fmp4Session>>>,
}

/// A live viewer's subscription to one agent's fMP4 stream. Dropping this
/// decrements the session's viewer count and, if it was the last one,
/// tears the encoder down.
pub struct ViewerHandle {
    agent_key: String,
    media_rx: broadcast::Receiver<Bytes>,
    init_rx: watch::Receiver<Option<Bytes>>,
    publisher: Arc<WsFmp4Publisher>,
}

impl ViewerHandle {
    /// Waits up to `timeout` for the init segment, returning it immediately
    /// if it is already captured — the caller picks the budget (e.g. a short
    /// poll first, then a longer wait before giving up).
    pub async fn init_segment(&mut self, timeout: Duration) -> Option<Bytes> {
        if let Some(seg) = self.init_rx.borrow().clone() {
            return Some(seg);
        }
        let wait = async {
            loop {
                if self.init_rx.changed().await.is_err() {
                    return None;
                }
                if let Some(seg) = self.init_rx.borrow().clone() {
                    return Some(seg);
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            match self.media_rx.recv().await {
                Ok(chunk) => return Some(chunk),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(agent_key = %self.agent_key, skipped, "ws fmp4 viewer lagged, skipping");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for ViewerHandle {
    fn drop(&mut self) {
        let publisher = Arc::clone(&self.publisher);
        let agent_key = self.agent_key.clone();
        tokio::spawn(async move { publisher.remove_viewer(&agent_key).await });
    }
}

impl WsFmp4Publisher {
    pub fn new(frame_store: Arc<FrameStore>, video: VideoConfig) -> Arc<Self> {
        Arc::new(Self {
            frame_store,
            video,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Attaches a viewer for `agent_id` fed by `camera_id`'s annotated frame
    /// stream. Starts the encoder on the first viewer; fails if no annotated
    /// frame appears within `FIRST_FRAME_WAIT`.
    pub async fn add_viewer(
        self: &Arc<Self>,
        camera_id: &str,
        agent_id: &str,
        fps: u32,
    ) -> Result<ViewerHandle> {
        let key = format!("{}:{}", camera_id, agent_id);
        let mut sessions = self.sessions.lock().await;

        let session = match sessions.get(&key) {
            Some(s) => Arc::clone(s),
            None => {
                let session = self.start_session(key.clone(), fps).await?;
                sessions.insert(key.clone(), Arc::clone(&session));
                session
            }
        };
        session.viewers.fetch_add(1, Ordering::SeqCst);

        Ok(ViewerHandle {
            agent_key: key,
            media_rx: session.media_tx.subscribe(),
            init_rx: session.init_rx.clone(),
            publisher: Arc::clone(self),
        })
    }

    async fn remove_viewer(&self, key: &str) {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get(key) else {
            return;
        };
        if session.viewers.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _ = session.stop_tx.send(true);
            sessions.remove(key);
            info!(agent_key = %key, "ws fmp4 encoder stopped, last viewer left");
        }
    }

    async fn start_session(&self, key: String, fps: u32) -> Result<Arc<Fmp4Session>> {
        let deadline = tokio::time::Instant::now() + FIRST_FRAME_WAIT;
        let frame = loop {
            if let Some(f) = self.frame_store.get(&key) {
                break f;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(PublisherError::NoFrameAvailable(FIRST_FRAME_WAIT).into());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        };

        let width = frame.width;
        let height = frame.height;

        let mut child = Command::new(&self.video.encoder_binary)
            .args([
                "-f",
                "rawvideo",
                "-pixel_format",
                "bgr24",
                "-video_size",
                &format!("{}x{}", width, height),
                "-framerate",
                &fps.to_string(),
                "-i",
                "pipe:0",
                "-c:v",
                "libx264",
                "-preset",
                "veryfast",
                "-tune",
                "zerolatency",
                "-pix_fmt",
                "yuv420p",
                "-movflags",
                "frag_keyframe+empty_moov+default_base_moof",
                "-f",
                "mp4",
                "pipe:1",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| PublisherError::EncoderStart(anyhow::Error::new(e)))?;

        let stdin = child.stdin.take().context("encoder stdin unavailable")?;
        let stdout = child.stdout.take().context("encoder stdout unavailable")?;

        let (media_tx, _) = broadcast::channel(MEDIA_CHANNEL_CAPACITY);
        let (init_tx, init_rx) = watch::channel(None);
        let (stop_tx, stop_rx) = watch::channel(false);

        tokio::spawn(feeder_task(
            Arc::clone(&self.frame_store),
            key.clone(),
            stdin,
            fps,
            stop_rx.clone(),
        ));
        tokio::spawn(broadcast_task(stdout, media_tx.clone(), init_tx, stop_rx.clone()));
        tokio::spawn(supervise_child(child, stop_rx));

        Ok(Arc::new(Fmp4Session {
            viewers: AtomicUsize::new(0),
            media_tx,
            init_rx,
            stop_tx,
        }))
    }

}

async fn feeder_task(
    frame_store: Arc<FrameStore>,
    key: String,
    mut stdin: tokio::process::ChildStdin,
    fps: u32,
    mut stop_rx: watch::Receiver<bool>,
) {
    let interval = Duration::from_secs_f64(1.0 / fps.max(1) as f64);
    let mut last_seen: Option<u64> = None;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    return;
                }
            }
        }
        let Some(frame) = frame_store.get(&key) else {
            continue;
        };
        if last_seen == Some(frame.frame_index) {
            continue;
        }
        let expected = (frame.width as usize) * (frame.height as usize) * 3;
        if frame.pixels.len() != expected {
            debug!(agent_key = %key, "dropping shape-mismatched frame in ws fmp4 feeder");
            continue;
        }
        last_seen = Some(frame.frame_index);
        if stdin.write_all(&frame.pixels).await.is_err() {
            return;
        }
    }
}

async fn broadcast_task(
    mut stdout: tokio::process::ChildStdout,
    media_tx: broadcast::Sender<Bytes>,
    init_tx: watch::Sender<Option<Bytes>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut collector = InitSegmentCollector::new();
    let mut buf = vec![0u8; MEDIA_CHUNK_BYTES];
    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    return;
                }
            }
            read = stdout.read(&mut buf) => {
                let n = match read {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                if collector.is_ready() {
                    let _ = media_tx.send(Bytes::copy_from_slice(&buf[..n]));
                    continue;
                }
                match collector.feed(&buf[..n]) {
                    Ok(trailing) => {
                        if collector.is_ready() {
                            let _ = init_tx.send(collector.init_segment());
                        }
                        if let Some(media) = trailing {
                            let _ = media_tx.send(media);
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "tearing down ws fmp4 session");
                        return;
                    }
                }
            }
        }
    }
}

async fn supervise_child(mut child: Child, mut stop_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    let _ = child.kill().await;
                    return;
                }
            }
            status = child.wait() => {
                if let Ok(status) = status {
                    warn!(?status, "ws fmp4 encoder exited unexpectedly");
                }
                return;
            }
        }
    }
}
