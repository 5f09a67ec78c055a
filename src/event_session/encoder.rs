//! Chunk-encoder subprocess: spawns the configured encoder binary with piped
//! stdio, feeds raw BGR24 frames on stdin, and reads fragmented MP4 bytes
//! back on stdout, so nothing ever touches disk unless `video.save-enabled`
//! asks for a copy.
//!
//! This is a short-lived, per-chunk process: distinct from the WsFmp4
//! publisher's long-lived encoder, deliberately, so the two never share
//! encoder state.

use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::warn;

use crate::frame_store::FrameEnvelope;

pub async fn encode_chunk(
    encoder_binary: &str,
    frames: &[FrameEnvelope],
    fps: u32,
    width: u32,
    height: u32,
) -> Result<Vec<u8>> {
    if frames.is_empty() {
        bail!("cannot encode an empty chunk");
    }

    let mut child = Command::new(encoder_binary)
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
            "-pix_fmt",
            "yuv420p",
            "-movflags",
            "frag_keyframe+empty_moov",
            "-f",
            "mp4",
            "pipe:1",
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("failed to spawn chunk encoder subprocess")?;

    let mut stdin = child.stdin.take().context("encoder stdin unavailable")?;
    let frames_owned: Vec<bytes::Bytes> = frames.iter().map(|f| f.pixels.clone()).collect();
    let writer = tokio::spawn(async move {
        for pixels in frames_owned {
            if stdin.write_all(&pixels).await.is_err() {
                break;
            }
        }
        drop(stdin);
    });

    let output = child
        .wait_with_output()
        .await
        .context("chunk encoder subprocess failed")?;
    let _ = writer.await;

    if !output.status.success() {
        warn!(
            stderr = %String::from_utf8_lossy(&output.stderr),
            "chunk encoder exited non-zero"
        );
        bail!("encoder exited with status {:?}", output.status.code());
    }

    Ok(output.stdout)
}
