//! FrameTrack: a `TrackLocalStaticSample`-backed video track fed by
//! FrameStore reads. Encoding happens here,
//! one `openh264` encoder instance per track — distinct from the WsFmp4
//! encoder, deliberately, so the two never share encoder state.

use std::sync::Arc;
use std::time::Duration;

use openh264::encoder::{
    BitRate, Encoder, EncoderConfig, FrameRate, IntraFramePeriod, RateControlMode,
    SpsPpsStrategy, UsageType,
};
use openh264::formats::{RgbSliceU8, YUVBuffer};
use openh264::OpenH264API;
use tokio::sync::watch;
use tracing::{debug, warn};
use webrtc::api::media_engine::MIME_TYPE_H264;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::frame_store::FrameStore;

const BACKOFF_WHEN_IDLE: Duration = Duration::from_millis(100);

pub fn new_track(stream_id: &str, track_id: &str) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H264.to_owned(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                .to_owned(),
            rtcp_feedback: vec![],
        },
        track_id.to_owned(),
        stream_id.to_owned(),
    ))
}

/// Polls `frame_store[key]`, skipping duplicate `frame_index`s, encodes each
/// new frame to H.264, and writes the sample to `track`. PTS is implicit in
/// `Sample::duration` (1/fps); the track's own clock rate supplies the time
/// base rather than a manually stamped timestamp.
pub async fn run_track_feeder(
    track: Arc<TrackLocalStaticSample>,
    frame_store: Arc<FrameStore>,
    key: String,
    fps: u32,
    mut stop_rx: watch::Receiver<bool>,
) {
    let api = OpenH264API::from_source();
    let config = EncoderConfig::new()
        .usage_type(UsageType::CameraVideoRealTime)
        .max_frame_rate(FrameRate::from_hz(fps.max(1) as f32))
        .bitrate(BitRate::from_bps(1_500_000))
        .rate_control_mode(RateControlMode::Bitrate)
        .sps_pps_strategy(SpsPpsStrategy::ConstantId)
        .intra_frame_period(IntraFramePeriod::from_num_frames(fps.max(1) * 2));

    let mut encoder = match Encoder::with_api_config(api, config) {
        Ok(enc) => enc,
        Err(err) => {
            warn!(key = %key, error = %err, "failed to initialize h264 encoder, track stays silent");
            return;
        }
    };

    let mut last_seen: Option<u64> = None;
    let frame_duration = Duration::from_secs_f64(1.0 / fps.max(1) as f64);

    loop {
        if wait_or_stop(BACKOFF_WHEN_IDLE, &mut stop_rx).await {
            return;
        }

        let Some(frame) = frame_store.get(&key) else {
            continue;
        };
        if frame.width == 0 || frame.height == 0 || Some(frame.frame_index) == last_seen {
            continue;
        }
        last_seen = Some(frame.frame_index);

        let rgb = bgr_to_rgb(&frame.pixels);
        let slice = RgbSliceU8::new(&rgb, (frame.width as usize, frame.height as usize));
        let yuv = YUVBuffer::from_rgb_source(slice);

        match encoder.encode(&yuv) {
            Ok(bitstream) => {
                let sample = Sample {
                    data: bitstream.to_vec().into(),
                    duration: frame_duration,
                    ..Default::default()
                };
                if let Err(err) = track.write_sample(&sample).await {
                    debug!(key = %key, error = %err, "write_sample failed, peer likely gone");
                    return;
                }
            }
            Err(err) => {
                warn!(key = %key, error = %err, "h264 encode failed, skipping frame");
            }
        }
    }
}

/// Sleeps `dur` unless `stop_rx` trips first. Returns `true` if stop fired.
async fn wait_or_stop(dur: Duration, stop_rx: &mut watch::Receiver<bool>) -> bool {
    if *stop_rx.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(dur) => false,
        _ = stop_rx.changed() => *stop_rx.borrow(),
    }
}

fn bgr_to_rgb(pixels: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; pixels.len()];
    for (src, dst) in pixels.chunks_exact(3).zip(out.chunks_exact_mut(3)) {
        dst[0] = src[2];
        dst[1] = src[1];
        dst[2] = src[0];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bgr_to_rgb_swaps_channels() {
        let bgr = [10u8, 20, 30, 40, 50, 60];
        let rgb = bgr_to_rgb(&bgr);
        assert_eq!(rgb, vec![30, 20, 10, 60, 50, 40]);
    }
}
