//! Frame annotation: boxes for rule-relevant classes, skeleton overlay for
//! pose-consuming rules. Text labels are tracked as data
//! (`MatchResult::label`) and shipped in bus metadata rather than rasterized
//! onto the frame — drawing readable text needs an embedded font asset this
//! crate doesn't carry.

use std::collections::HashSet;

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;

use crate::frame_store::FrameEnvelope;
use crate::model::Detections;

const BOX_COLOR: Rgb<u8> = Rgb([0, 220, 0]);
const SKELETON_COLOR: Rgb<u8> = Rgb([0, 160, 255]);

// COCO-17 skeleton edges.
const SKELETON_EDGES: [(usize, usize); 10] = [
    (5, 6),
    (5, 7),
    (7, 9),
    (6, 8),
    (8, 10),
    (5, 11),
    (6, 12),
    (11, 12),
    (11, 13),
    (12, 14),
];

/// Draw boxes for detections whose class is in `target_classes` (empty set
/// means "all"), plus skeleton lines when `draw_skeleton` and keypoints are
/// present. Returns a new envelope; `frame.frame_index` is preserved so the
/// caller can publish it under the agent key unmodified.
pub fn annotate(
    frame: &FrameEnvelope,
    detections: &Detections,
    target_classes: &HashSet<String>,
    draw_skeleton: bool,
) -> FrameEnvelope {
    let mut rgb = bgr_to_rgb_image(frame);

    for (i, class) in detections.classes.iter().enumerate() {
        if !target_classes.is_empty() && !target_classes.contains(class.as_str()) {
            continue;
        }
        let [x1, y1, x2, y2] = detections.boxes[i];
        let w = (x2 - x1).max(1.0) as u32;
        let h = (y2 - y1).max(1.0) as u32;
        let rect = Rect::at(x1 as i32, y1 as i32).of_size(w, h);
        draw_hollow_rect_mut(&mut rgb, rect, BOX_COLOR);

        if draw_skeleton {
            if let Some(Some(kp)) = detections.keypoints.get(i) {
                for &(a, b) in &SKELETON_EDGES {
                    if a < kp.len() && b < kp.len() && kp[a][2] > 0.3 && kp[b][2] > 0.3 {
                        draw_line_segment_mut(
                            &mut rgb,
                            (kp[a][0], kp[a][1]),
                            (kp[b][0], kp[b][1]),
                            SKELETON_COLOR,
                        );
                    }
                }
            }
        }
    }

    rgb_image_to_envelope(frame, rgb)
}

fn bgr_to_rgb_image(frame: &FrameEnvelope) -> RgbImage {
    let mut buf = vec![0u8; frame.pixels.len()];
    for (src, dst) in frame.pixels.chunks_exact(3).zip(buf.chunks_exact_mut(3)) {
        dst[0] = src[2];
        dst[1] = src[1];
        dst[2] = src[0];
    }
    RgbImage::from_raw(frame.width, frame.height, buf)
        .expect("buffer length matches width*height*3, validated before annotate is called")
}

fn rgb_image_to_envelope(source: &FrameEnvelope, rgb: RgbImage) -> FrameEnvelope {
    let mut bgr = rgb.into_raw();
    for px in bgr.chunks_exact_mut(3) {
        px.swap(0, 2);
    }
    FrameEnvelope {
        camera_id: source.camera_id.clone(),
        frame_index: source.frame_index,
        produced_at: source.produced_at,
        width: source.width,
        height: source.height,
        pixels: bytes::Bytes::from(bgr),
        measured_fps: source.measured_fps,
        source_fps_hint: source.source_fps_hint,
        error: None,
    }
}

/// JPEG-encode a frame at quality 85 for the immediate notification payload,
/// which carries a single JPEG frame rather than a video clip.
pub fn encode_jpeg_q85(frame: &FrameEnvelope) -> anyhow::Result<Vec<u8>> {
    let rgb = bgr_to_rgb_image(frame);
    let mut out = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 85);
    encoder.encode(
        rgb.as_raw(),
        frame.width,
        frame.height,
        image::ExtendedColorType::Rgb8,
    )?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn solid_frame(width: u32, height: u32) -> FrameEnvelope {
        FrameEnvelope {
            camera_id: "cam-1".to_string(),
            frame_index: 1,
            produced_at: std::time::SystemTime::now(),
            width,
            height,
            pixels: bytes::Bytes::from(vec![10u8; (width * height * 3) as usize]),
            measured_fps: 5.0,
            source_fps_hint: None,
            error: None,
        }
    }

    #[test]
    fn annotate_preserves_dimensions_and_index() {
        let frame = solid_frame(16, 16);
        let detections = Detections {
            classes: vec!["person".to_string()],
            scores: vec![0.9],
            boxes: vec![[2.0, 2.0, 10.0, 10.0]],
            keypoints: vec![None],
            timestamp: Utc::now(),
        };
        let target: HashSet<String> = HashSet::from(["person".to_string()]);
        let out = annotate(&frame, &detections, &target, false);
        assert_eq!(out.width, 16);
        assert_eq!(out.height, 16);
        assert_eq!(out.frame_index, 1);
        assert_eq!(out.pixels.len(), frame.pixels.len());
    }

    #[test]
    fn jpeg_encoding_produces_nonempty_bytes() {
        let frame = solid_frame(8, 8);
        let bytes = encode_jpeg_q85(&frame).unwrap();
        assert!(!bytes.is_empty());
    }
}
