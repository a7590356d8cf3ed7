// src/visualizer.rs

use crate::store::FrameRecord;
use anyhow::{anyhow, Result};
use opencv::{
    core::{Mat, Point, Rect, Scalar, Size},
    imgproc,
    prelude::*,
};

/// Skeleton edges over the 17 COCO keypoints.
const SKELETON_CONNECTIONS: [(usize, usize); 16] = [
    // face
    (3, 1),
    (1, 0),
    (0, 2),
    (2, 4),
    // arms
    (5, 6),
    (5, 7),
    (7, 9),
    (6, 8),
    (8, 10),
    // torso
    (5, 11),
    (6, 12),
    (11, 12),
    // legs
    (11, 13),
    (13, 15),
    (12, 14),
    (14, 16),
];

/// Renders the per-frame visualization panel: the raw frame scaled to the
/// panel size, with track geometry and action labels drawn on top.
pub struct Visualizer {
    panel_width: i32,
    colors: Vec<Scalar>,
}

impl Visualizer {
    pub fn new(panel_width: u32) -> Self {
        let colors = vec![
            Scalar::new(0.0, 0.0, 255.0, 0.0),   // Red
            Scalar::new(0.0, 255.0, 0.0, 0.0),   // Green
            Scalar::new(255.0, 0.0, 0.0, 0.0),   // Blue
            Scalar::new(0.0, 255.0, 255.0, 0.0), // Yellow
            Scalar::new(255.0, 0.0, 255.0, 0.0), // Magenta
            Scalar::new(255.0, 255.0, 0.0, 0.0), // Cyan
        ];
        Self {
            panel_width: panel_width as i32,
            colors,
        }
    }

    /// Panel size for a given source frame: configured width, height scaled
    /// to preserve the source aspect ratio.
    pub fn panel_size(&self, frame_width: usize, frame_height: usize) -> Size {
        let height =
            (frame_height as f64 * self.panel_width as f64 / frame_width as f64).round() as i32;
        Size::new(self.panel_width, height.max(1))
    }

    /// Render one frame's panel. The record must carry its transient raw
    /// frame; the caller attaches it right before rendering and drops it
    /// after.
    pub fn render_panel(&self, record: &FrameRecord) -> Result<Mat> {
        let frame = record
            .frame
            .as_ref()
            .ok_or_else(|| anyhow!("no raw frame attached to record"))?;

        let mat = Mat::from_slice(&frame.data)?;
        let mat = mat.reshape(3, frame.height as i32)?;

        let mut bgr_mat = Mat::default();
        imgproc::cvt_color(&mat, &mut bgr_mat, imgproc::COLOR_RGB2BGR, 0)?;

        let size = self.panel_size(frame.width, frame.height);
        let mut output = Mat::default();
        imgproc::resize(
            &bgr_mat,
            &mut output,
            size,
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )?;

        let scale = size.width as f32 / frame.width as f32;

        for (track_id, track) in &record.tracks {
            let color = self.colors[*track_id as usize % self.colors.len()];

            let x1 = (track.bbox[0] * scale) as i32;
            let y1 = (track.bbox[1] * scale) as i32;
            let x2 = (track.bbox[2] * scale) as i32;
            let y2 = (track.bbox[3] * scale) as i32;

            imgproc::rectangle(
                &mut output,
                Rect::new(x1, y1, (x2 - x1).max(1), (y2 - y1).max(1)),
                color,
                2,
                imgproc::LINE_8,
                0,
            )?;

            for (a, b) in SKELETON_CONNECTIONS {
                if a >= track.joints_2d.len() || b >= track.joints_2d.len() {
                    continue;
                }
                let pa = Point::new(
                    (track.joints_2d[a][0] * scale) as i32,
                    (track.joints_2d[a][1] * scale) as i32,
                );
                let pb = Point::new(
                    (track.joints_2d[b][0] * scale) as i32,
                    (track.joints_2d[b][1] * scale) as i32,
                );
                imgproc::line(&mut output, pa, pb, color, 2, imgproc::LINE_AA, 0)?;
            }

            for joint in &track.joints_2d {
                let pt = Point::new((joint[0] * scale) as i32, (joint[1] * scale) as i32);
                imgproc::circle(&mut output, pt, 3, color, -1, imgproc::LINE_8, 0)?;
            }

            let mut caption = format!("ID {}", track_id);
            if let Some(scores) = record.labels.get(track_id) {
                if let Some(top) = scores.first() {
                    caption = format!("ID {} | {} {:.2}", track_id, top.label, top.score);
                }
            }

            imgproc::put_text(
                &mut output,
                &caption,
                Point::new(x1, (y1 - 8).max(12)),
                imgproc::FONT_HERSHEY_SIMPLEX,
                0.5,
                color,
                1,
                imgproc::LINE_8,
                false,
            )?;
        }

        // Frame-level footer: how many people are tracked and labeled
        let footer = format!(
            "tracks: {} | labeled: {}",
            record.tracks.len(),
            record.labels.len()
        );
        imgproc::put_text(
            &mut output,
            &footer,
            Point::new(10, size.height - 12),
            imgproc::FONT_HERSHEY_SIMPLEX,
            0.5,
            Scalar::new(200.0, 200.0, 200.0, 0.0),
            1,
            imgproc::LINE_8,
            false,
        )?;

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FrameRecord, PoseParams, TrackRecord};
    use crate::types::Frame;
    use std::collections::BTreeMap;

    fn test_frame(width: usize, height: usize) -> Frame {
        Frame {
            data: vec![64u8; width * height * 3],
            width,
            height,
            timestamp_ms: 0.0,
        }
    }

    fn test_record(width: usize, height: usize) -> FrameRecord {
        let track = TrackRecord {
            track_id: 1,
            bbox: [8.0, 8.0, 40.0, 56.0],
            confidence: 0.9,
            pose: PoseParams {
                global_orient: [0.0; 3],
                body_pose: vec![0.0; 69],
                betas: vec![0.0; 10],
                camera: [1.0, 0.0, 0.0],
            },
            joints_2d: (0..17).map(|i| [10.0 + i as f32, 12.0 + i as f32]).collect(),
            embedding: vec![0.0; 8],
        };
        FrameRecord {
            frame: Some(test_frame(width, height)),
            tracks: BTreeMap::from([(1, track)]),
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn panel_size_preserves_aspect_ratio() {
        let viz = Visualizer::new(640);
        let size = viz.panel_size(1280, 720);
        assert_eq!(size.width, 640);
        assert_eq!(size.height, 360);
    }

    #[test]
    fn render_panel_has_configured_dimensions() {
        let viz = Visualizer::new(128);
        let panel = viz.render_panel(&test_record(64, 48)).unwrap();
        assert_eq!(panel.cols(), 128);
        assert_eq!(panel.rows(), 96);
    }

    #[test]
    fn render_panel_requires_attached_frame() {
        let viz = Visualizer::new(128);
        let mut record = test_record(64, 48);
        record.frame = None;
        assert!(viz.render_panel(&record).is_err());
    }
}
