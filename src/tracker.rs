// src/tracker.rs

use crate::store::{PoseParams, TrackRecord};
use crate::types::{Config, Frame};
use anyhow::{Context, Result};
use ort::{
    execution_providers::CUDAExecutionProvider,
    session::{builder::GraphOptimizationLevel, Session},
};
use tracing::{debug, info};

const DETECTOR_INPUT_SIZE: usize = 640;
const DETECTOR_CLASSES: usize = 80;
const DETECTOR_ANCHORS: usize = 8400;

// COCO class ID for person
const PERSON_CLASS: usize = 0;

const POSE_INPUT_SIZE: usize = 256;
const NUM_JOINTS: usize = 17;
const BODY_POSE_DIM: usize = 69;
const BETAS_DIM: usize = 10;
const EMBEDDING_DIM: usize = 128;
// orient(3) + body_pose(69) + betas(10) + camera(3) + joints(17*2) + embedding(128)
const POSE_OUTPUT_DIM: usize = 3 + BODY_POSE_DIM + BETAS_DIM + 3 + NUM_JOINTS * 2 + EMBEDDING_DIM;

// A track survives this many consecutive missed frames before retirement.
const MAX_MISSED_FRAMES: u32 = 30;

/// Tracking model collaborator: one call per frame, track identity
/// assignment is internal state the pipeline never second-guesses.
pub trait TrackModel {
    fn infer(&mut self, frame: &Frame) -> Result<Vec<TrackRecord>>;
}

#[derive(Debug, Clone)]
struct Detection {
    bbox: [f32; 4], // [x1, y1, x2, y2] in original image coordinates
    confidence: f32,
}

struct ActiveTrack {
    track_id: u32,
    bbox: [f32; 4],
    embedding: Vec<f32>,
    missed: u32,
    matched_this_frame: bool,
}

/// Per-frame human detection + 3D pose estimation + identity continuity.
pub struct PoseTracker {
    detector: Session,
    pose: Session,
    confidence_threshold: f32,
    min_box_width: f32,
    min_box_height: f32,
    reid_similarity_threshold: f32,
    next_track_id: u32,
    active: Vec<ActiveTrack>,
}

impl PoseTracker {
    pub fn new(config: &Config) -> Result<Self> {
        info!("Loading detector model: {}", config.checkpoints.detector);
        let detector = build_session(&config.checkpoints.detector, config.inference.num_threads)
            .context("Failed to load detector model")?;

        info!("Loading pose model: {}", config.checkpoints.pose);
        let pose = build_session(&config.checkpoints.pose, config.inference.num_threads)
            .context("Failed to load pose model")?;

        info!("✓ Pose tracker initialized");
        Ok(Self {
            detector,
            pose,
            confidence_threshold: config.inference.confidence_threshold,
            min_box_width: config.inference.min_box_width,
            min_box_height: config.inference.min_box_height,
            reid_similarity_threshold: config.inference.reid_similarity_threshold,
            next_track_id: 1,
            active: Vec::new(),
        })
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let (input, scale, pad_x, pad_y) = letterbox(
            &frame.data,
            frame.width,
            frame.height,
            DETECTOR_INPUT_SIZE,
        );

        let shape = [1, 3, DETECTOR_INPUT_SIZE, DETECTOR_INPUT_SIZE];
        let input_value =
            ort::value::Value::from_array((shape.as_slice(), input.into_boxed_slice()))?;
        let outputs = self.detector.run(ort::inputs!["images" => input_value])?;
        let (_, output) = outputs[0].try_extract_tensor::<f32>()?;

        // YOLO output: [1, 84, 8400], row-major over predictions
        let mut detections = Vec::new();
        for i in 0..DETECTOR_ANCHORS {
            let cx = output[i];
            let cy = output[DETECTOR_ANCHORS + i];
            let w = output[DETECTOR_ANCHORS * 2 + i];
            let h = output[DETECTOR_ANCHORS * 3 + i];

            let mut max_conf = 0.0f32;
            let mut best_class = 0;
            for c in 0..DETECTOR_CLASSES {
                let conf = output[DETECTOR_ANCHORS * (4 + c) + i];
                if conf > max_conf {
                    max_conf = conf;
                    best_class = c;
                }
            }

            if max_conf < self.confidence_threshold || best_class != PERSON_CLASS {
                continue;
            }

            // Center format -> corners, then reverse the letterbox transform
            let x1 = (cx - w / 2.0 - pad_x) / scale;
            let y1 = (cy - h / 2.0 - pad_y) / scale;
            let x2 = (cx + w / 2.0 - pad_x) / scale;
            let y2 = (cy + h / 2.0 - pad_y) / scale;

            detections.push(Detection {
                bbox: [x1, y1, x2, y2],
                confidence: max_conf,
            });
        }

        let detections = nms(detections, 0.45);

        // Boxes too small to carry a usable pose crop are dropped here,
        // before they can spawn short garbage tracks.
        let detections: Vec<Detection> = detections
            .into_iter()
            .filter(|d| {
                d.bbox[2] - d.bbox[0] >= self.min_box_width
                    && d.bbox[3] - d.bbox[1] >= self.min_box_height
            })
            .collect();

        debug!("Detected {} people", detections.len());
        Ok(detections)
    }

    fn estimate_pose(
        &mut self,
        frame: &Frame,
        detection: &Detection,
    ) -> Result<(PoseParams, Vec<[f32; 2]>, Vec<f32>)> {
        let input = crop_and_normalize(frame, &detection.bbox, POSE_INPUT_SIZE);

        let shape = [1, 3, POSE_INPUT_SIZE, POSE_INPUT_SIZE];
        let input_value =
            ort::value::Value::from_array((shape.as_slice(), input.into_boxed_slice()))?;
        let outputs = self.pose.run(ort::inputs!["input" => input_value])?;
        let (_, output) = outputs[0].try_extract_tensor::<f32>()?;

        anyhow::ensure!(
            output.len() >= POSE_OUTPUT_DIM,
            "pose model output too small: {} (expected {})",
            output.len(),
            POSE_OUTPUT_DIM
        );

        let mut offset = 0;
        let global_orient = [output[0], output[1], output[2]];
        offset += 3;
        let body_pose = output[offset..offset + BODY_POSE_DIM].to_vec();
        offset += BODY_POSE_DIM;
        let betas = output[offset..offset + BETAS_DIM].to_vec();
        offset += BETAS_DIM;
        let camera = [output[offset], output[offset + 1], output[offset + 2]];
        offset += 3;

        // Joints are predicted in normalized crop coordinates; map them back
        // into source pixel coordinates via the detection box.
        let [x1, y1, x2, y2] = detection.bbox;
        let (bw, bh) = (x2 - x1, y2 - y1);
        let mut joints_2d = Vec::with_capacity(NUM_JOINTS);
        for j in 0..NUM_JOINTS {
            let jx = output[offset + j * 2];
            let jy = output[offset + j * 2 + 1];
            joints_2d.push([x1 + jx * bw, y1 + jy * bh]);
        }
        offset += NUM_JOINTS * 2;

        let embedding = output[offset..offset + EMBEDDING_DIM].to_vec();

        Ok((
            PoseParams {
                global_orient,
                body_pose,
                betas,
                camera,
            },
            joints_2d,
            embedding,
        ))
    }

    /// Greedy association of fresh detections against active tracks by IoU
    /// with an appearance-similarity floor; unmatched detections spawn new
    /// identities, unmatched tracks age out after MAX_MISSED_FRAMES.
    fn assign_identity(&mut self, bbox: [f32; 4], embedding: &[f32]) -> u32 {
        let mut best: Option<(usize, f32)> = None;
        for (idx, track) in self.active.iter().enumerate() {
            if track.matched_this_frame {
                continue;
            }
            let overlap = calculate_iou(&track.bbox, &bbox);
            let similarity = cosine_similarity(&track.embedding, embedding);
            if overlap < 0.1 && similarity < self.reid_similarity_threshold {
                continue;
            }
            let score = overlap + similarity;
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((idx, score));
            }
        }

        if let Some((idx, _)) = best {
            let track = &mut self.active[idx];
            track.bbox = bbox;
            track.embedding = embedding.to_vec();
            track.matched_this_frame = true;
            return track.track_id;
        }

        let track_id = self.next_track_id;
        self.next_track_id += 1;
        self.active.push(ActiveTrack {
            track_id,
            bbox,
            embedding: embedding.to_vec(),
            missed: 0,
            matched_this_frame: true,
        });
        track_id
    }

    fn end_frame(&mut self) {
        for track in &mut self.active {
            if track.matched_this_frame {
                track.missed = 0;
                track.matched_this_frame = false;
            } else {
                track.missed += 1;
            }
        }
        self.active.retain(|t| t.missed <= MAX_MISSED_FRAMES);
    }
}

impl TrackModel for PoseTracker {
    fn infer(&mut self, frame: &Frame) -> Result<Vec<TrackRecord>> {
        let detections = self.detect(frame)?;

        let mut records = Vec::with_capacity(detections.len());
        for detection in &detections {
            let (pose, joints_2d, embedding) = self.estimate_pose(frame, detection)?;
            let track_id = self.assign_identity(detection.bbox, &embedding);
            records.push(TrackRecord {
                track_id,
                bbox: detection.bbox,
                confidence: detection.confidence,
                pose,
                joints_2d,
                embedding,
            });
        }
        self.end_frame();

        Ok(records)
    }
}

fn build_session(model_path: &str, num_threads: usize) -> Result<Session> {
    let session = Session::builder()?
        .with_execution_providers([CUDAExecutionProvider::default().with_device_id(0).build()])?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(num_threads)?
        .commit_from_file(model_path)?;
    Ok(session)
}

/// Letterbox an RGB frame into a square model input: aspect-preserving
/// resize, gray padding, [0,1] normalization, HWC -> CHW.
fn letterbox(src: &[u8], src_w: usize, src_h: usize, target: usize) -> (Vec<f32>, f32, f32, f32) {
    let scale = (target as f32 / src_w as f32).min(target as f32 / src_h as f32);
    let scaled_w = ((src_w as f32 * scale) as usize).max(1);
    let scaled_h = ((src_h as f32 * scale) as usize).max(1);

    let pad_x = (target - scaled_w) as f32 / 2.0;
    let pad_y = (target - scaled_h) as f32 / 2.0;

    let resized = resize_bilinear(src, src_w, src_h, scaled_w, scaled_h);

    let mut canvas = vec![114u8; target * target * 3];
    for y in 0..scaled_h {
        for x in 0..scaled_w {
            let src_idx = (y * scaled_w + x) * 3;
            let dst_x = x + pad_x as usize;
            let dst_y = y + pad_y as usize;
            let dst_idx = (dst_y * target + dst_x) * 3;
            canvas[dst_idx..dst_idx + 3].copy_from_slice(&resized[src_idx..src_idx + 3]);
        }
    }

    let mut input = vec![0.0f32; 3 * target * target];
    for c in 0..3 {
        for h in 0..target {
            for w in 0..target {
                let hwc_idx = (h * target + w) * 3 + c;
                let chw_idx = c * target * target + h * target + w;
                input[chw_idx] = canvas[hwc_idx] as f32 / 255.0;
            }
        }
    }

    (input, scale, pad_x, pad_y)
}

/// Crop the detection box out of the frame (clamped to frame bounds) and
/// resize to the pose model input, normalized CHW.
fn crop_and_normalize(frame: &Frame, bbox: &[f32; 4], target: usize) -> Vec<f32> {
    let x1 = bbox[0].max(0.0) as usize;
    let y1 = bbox[1].max(0.0) as usize;
    let x2 = (bbox[2] as usize).min(frame.width.saturating_sub(1));
    let y2 = (bbox[3] as usize).min(frame.height.saturating_sub(1));
    let crop_w = (x2.saturating_sub(x1)).max(1);
    let crop_h = (y2.saturating_sub(y1)).max(1);

    let mut crop = vec![0u8; crop_w * crop_h * 3];
    for y in 0..crop_h {
        let src_row = ((y1 + y) * frame.width + x1) * 3;
        let dst_row = y * crop_w * 3;
        crop[dst_row..dst_row + crop_w * 3]
            .copy_from_slice(&frame.data[src_row..src_row + crop_w * 3]);
    }

    let resized = resize_bilinear(&crop, crop_w, crop_h, target, target);

    let mut input = vec![0.0f32; 3 * target * target];
    for c in 0..3 {
        for h in 0..target {
            for w in 0..target {
                let hwc_idx = (h * target + w) * 3 + c;
                let chw_idx = c * target * target + h * target + w;
                input[chw_idx] = resized[hwc_idx] as f32 / 255.0;
            }
        }
    }
    input
}

fn resize_bilinear(src: &[u8], src_w: usize, src_h: usize, dst_w: usize, dst_h: usize) -> Vec<u8> {
    let mut dst = vec![0u8; dst_h * dst_w * 3];
    let x_ratio = src_w as f32 / dst_w as f32;
    let y_ratio = src_h as f32 / dst_h as f32;

    for dy in 0..dst_h {
        for dx in 0..dst_w {
            let sx = dx as f32 * x_ratio;
            let sy = dy as f32 * y_ratio;
            let sx0 = sx.floor() as usize;
            let sy0 = sy.floor() as usize;
            let sx1 = (sx0 + 1).min(src_w - 1);
            let sy1 = (sy0 + 1).min(src_h - 1);
            let fx = sx - sx0 as f32;
            let fy = sy - sy0 as f32;

            for c in 0..3 {
                let p00 = src[(sy0 * src_w + sx0) * 3 + c] as f32;
                let p10 = src[(sy0 * src_w + sx1) * 3 + c] as f32;
                let p01 = src[(sy1 * src_w + sx0) * 3 + c] as f32;
                let p11 = src[(sy1 * src_w + sx1) * 3 + c] as f32;

                let val = p00 * (1.0 - fx) * (1.0 - fy)
                    + p10 * fx * (1.0 - fy)
                    + p01 * (1.0 - fx) * fy
                    + p11 * fx * fy;

                dst[(dy * dst_w + dx) * 3 + c] = val.round() as u8;
            }
        }
    }
    dst
}

fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    if detections.is_empty() {
        return detections;
    }

    detections.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap());

    let mut keep = Vec::new();

    while !detections.is_empty() {
        let current = detections.remove(0);
        keep.push(current.clone());

        detections.retain(|det| {
            let iou = calculate_iou(&current.bbox, &det.bbox);
            iou < iou_threshold
        });
    }

    keep
}

fn calculate_iou(box1: &[f32; 4], box2: &[f32; 4]) -> f32 {
    let x1 = box1[0].max(box2[0]);
    let y1 = box1[1].max(box2[1]);
    let x2 = box1[2].min(box2[2]);
    let y2 = box1[3].min(box2[3]);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area1 = (box1[2] - box1[0]) * (box1[3] - box1[1]);
    let area2 = (box2[2] - box2[0]) * (box2[3] - box2[1]);
    let union = area1 + area2 - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = [10.0, 10.0, 50.0, 90.0];
        assert!((calculate_iou(&b, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = [0.0, 0.0, 10.0, 10.0];
        let b = [20.0, 20.0, 30.0, 30.0];
        assert_eq!(calculate_iou(&a, &b), 0.0);
    }

    #[test]
    fn nms_suppresses_overlapping_detections() {
        let detections = vec![
            Detection {
                bbox: [0.0, 0.0, 100.0, 100.0],
                confidence: 0.9,
            },
            Detection {
                bbox: [5.0, 5.0, 105.0, 105.0],
                confidence: 0.8,
            },
            Detection {
                bbox: [200.0, 200.0, 300.0, 300.0],
                confidence: 0.7,
            },
        ];

        let kept = nms(detections, 0.45);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].confidence, 0.7);
    }

    #[test]
    fn cosine_similarity_bounds() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        let c = vec![0.0, 1.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&a, &c).abs() < 1e-6);
    }

    #[test]
    fn letterbox_preserves_aspect_ratio() {
        let src = vec![0u8; 200 * 100 * 3];
        let (input, scale, pad_x, pad_y) = letterbox(&src, 200, 100, 640);
        assert_eq!(input.len(), 3 * 640 * 640);
        assert!((scale - 3.2).abs() < 1e-6);
        assert_eq!(pad_x, 0.0);
        assert_eq!(pad_y, 160.0);
    }
}
