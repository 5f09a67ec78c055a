//! Per-camera ingest task: decodes an RTSP network source via `rtspsrc` on a
//! gstreamer `appsink` pull loop, with a reconnect delay and
//! frame_index/measured_fps bookkeeping on each fault.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use gstreamer as gst;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use gst::prelude::*;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::FrameHubError;
use crate::frame_store::{FrameEnvelope, FrameStore};

const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Handle the Orchestrator holds for one running ingest task.
pub struct FrameHubHandle {
    pub camera_id: String,
    stop_tx: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
}

impl FrameHubHandle {
    /// Best-effort stop with a 1s join timeout.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if tokio::time::timeout(Duration::from_secs(1), self.join)
            .await
            .is_err()
        {
            warn!(camera_id = %self.camera_id, "frame hub join timed out, abandoning");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Spawn a decode loop for `camera_id` reading `stream_url`, publishing into
/// `store[camera_id]` until stopped.
pub fn spawn(camera_id: String, stream_url: String, store: Arc<FrameStore>) -> FrameHubHandle {
    let (stop_tx, stop_rx) = watch::channel(false);
    let cam_for_task = camera_id.clone();
    let join = tokio::task::spawn_blocking(move || {
        run_ingest_loop(cam_for_task, stream_url, store, stop_rx);
    });
    FrameHubHandle {
        camera_id,
        stop_tx,
        join,
    }
}

fn stopped(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow()
}

/// Blocking decode loop, run on a dedicated blocking thread since gstreamer's
/// appsink pull and pipeline state changes are synchronous and must not
/// stall the whole system.
fn run_ingest_loop(
    camera_id: String,
    stream_url: String,
    store: Arc<FrameStore>,
    stop_rx: watch::Receiver<bool>,
) {
    let _ = gst::init();

    loop {
        if stopped(&stop_rx) {
            return;
        }

        match open_pipeline(&stream_url) {
            Ok((pipeline, appsink)) => {
                info!(camera_id = %camera_id, "rtsp source opened");
                if let Err(err) = decode_until_error(&camera_id, &appsink, &store, &stop_rx) {
                    warn!(camera_id = %camera_id, error = %err, "ingest error, reconnecting");
                    publish_error(&store, &camera_id, &err.to_string());
                }
                let _ = pipeline.set_state(gst::State::Null);
            }
            Err(err) => {
                warn!(camera_id = %camera_id, error = %err, "failed to open rtsp source");
                publish_error(&store, &camera_id, &err.to_string());
            }
        }

        if stopped(&stop_rx) {
            return;
        }
        std::thread::sleep(DEFAULT_RECONNECT_DELAY);
        if stopped(&stop_rx) {
            return;
        }
    }
}

fn open_pipeline(stream_url: &str) -> Result<(gst::Pipeline, gst_app::AppSink), FrameHubError> {
    let description = format!(
        "rtspsrc location={} latency=100 protocols=tcp ! decodebin ! videoconvert ! video/x-raw,format=BGR ! \
         appsink name=sink max-buffers=2 drop=true sync=false",
        gstreamer::glib::markup_escape_text(stream_url)
    );

    let pipeline = gst::parse::launch(&description)
        .map_err(|e| FrameHubError::Open {
            url: stream_url.to_string(),
            source: anyhow::anyhow!(e),
        })?
        .downcast::<gst::Pipeline>()
        .map_err(|_| FrameHubError::Open {
            url: stream_url.to_string(),
            source: anyhow::anyhow!("parsed graph is not a top-level pipeline"),
        })?;

    let appsink = pipeline
        .by_name("sink")
        .and_then(|e| e.downcast::<gst_app::AppSink>().ok())
        .ok_or_else(|| FrameHubError::Open {
            url: stream_url.to_string(),
            source: anyhow::anyhow!("appsink element not found"),
        })?;

    pipeline
        .set_state(gst::State::Playing)
        .map_err(|e| FrameHubError::Open {
            url: stream_url.to_string(),
            source: anyhow::anyhow!(e),
        })?;

    Ok((pipeline, appsink))
}

/// Pull frames until the stream errors, EOS, or stop is signalled. On success
/// each frame is stamped and written to the store; this function only
/// returns `Err` for a genuine decode fault, never for a clean stop.
fn decode_until_error(
    camera_id: &str,
    appsink: &gst_app::AppSink,
    store: &Arc<FrameStore>,
    stop_rx: &watch::Receiver<bool>,
) -> Result<(), FrameHubError> {
    let mut frame_index: u64 = 0;
    let mut last_tick: Option<Instant> = None;

    loop {
        if stopped(stop_rx) {
            return Ok(());
        }

        let sample = match appsink.try_pull_sample(gst::ClockTime::from_mseconds(200)) {
            Some(sample) => sample,
            None if appsink.is_eos() => {
                return Err(FrameHubError::Decode {
                    camera_id: camera_id.to_string(),
                    source: anyhow::anyhow!("end of stream"),
                });
            }
            None => continue,
        };

        let buffer = sample.buffer().ok_or_else(|| FrameHubError::Decode {
            camera_id: camera_id.to_string(),
            source: anyhow::anyhow!("sample had no buffer"),
        })?;
        let caps = sample.caps().ok_or_else(|| FrameHubError::Decode {
            camera_id: camera_id.to_string(),
            source: anyhow::anyhow!("sample had no caps"),
        })?;
        let info = gst_video::VideoInfo::from_caps(caps).map_err(|e| FrameHubError::Decode {
            camera_id: camera_id.to_string(),
            source: anyhow::anyhow!(e),
        })?;
        let map = buffer.map_readable().map_err(|e| FrameHubError::Decode {
            camera_id: camera_id.to_string(),
            source: anyhow::anyhow!(e),
        })?;

        let width = info.width();
        let height = info.height();
        let expected = (width * height * 3) as usize;
        if map.size() < expected {
            debug!(camera_id, expected, actual = map.size(), "short frame buffer, dropping");
            continue;
        }

        frame_index += 1;
        let now = Instant::now();
        let measured_fps = last_tick
            .map(|prev| 1.0 / now.duration_since(prev).as_secs_f32().max(1e-6))
            .unwrap_or(0.0);
        last_tick = Some(now);

        // Opportunistic: the source may not advertise a framerate at all
        // (numerator 0), in which case only `measured_fps` is trustworthy.
        let fps_fraction = info.fps();
        let source_fps_hint = if fps_fraction.numer() > 0 && fps_fraction.denom() > 0 {
            Some(fps_fraction.numer() as f32 / fps_fraction.denom() as f32)
        } else {
            None
        };

        let envelope = FrameEnvelope {
            camera_id: camera_id.to_string(),
            frame_index,
            produced_at: SystemTime::now(),
            width,
            height,
            pixels: bytes::Bytes::copy_from_slice(&map.as_slice()[..expected]),
            measured_fps,
            source_fps_hint,
            error: None,
        };
        store.put(camera_id.to_string(), envelope);
    }
}

fn publish_error(store: &Arc<FrameStore>, camera_id: &str, message: &str) {
    error!(camera_id, message, "publishing error envelope");
    // Zero dimensions keep old width/height checks working; `error` carries
    // the actual reason to consumers instead of leaving it in local logs only.
    store.put(
        camera_id.to_string(),
        FrameEnvelope {
            camera_id: camera_id.to_string(),
            frame_index: 0,
            produced_at: SystemTime::now(),
            width: 0,
            height: 0,
            pixels: bytes::Bytes::new(),
            measured_fps: 0.0,
            source_fps_hint: None,
            error: Some(message.to_string()),
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_reconnect_delay_is_two_seconds() {
        assert_eq!(DEFAULT_RECONNECT_DELAY, Duration::from_secs(2));
    }
}
