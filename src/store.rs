// src/store.rs

use crate::error::PipelineError;
use crate::types::Frame;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

/// Bumped whenever the persisted layout changes incompatibly.
pub const SCHEMA_VERSION: u32 = 1;

/// Stable per-frame key, identical across all three stages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameId {
    pub video: String,
    pub index: u32,
}

impl FrameId {
    pub fn new(video: &str, index: u32) -> Self {
        Self {
            video: video.to_string(),
            index,
        }
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{:06}", self.video, self.index)
    }
}

/// SMPL-style pose parameters for one person in one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseParams {
    pub global_orient: [f32; 3],
    /// 69 axis-angle body joint values.
    pub body_pose: Vec<f32>,
    /// 10 shape coefficients.
    pub betas: Vec<f32>,
    /// Weak-perspective camera (s, tx, ty).
    pub camera: [f32; 3],
}

impl PoseParams {
    /// Flat feature vector consumed by the temporal action model:
    /// global orientation, body pose, camera.
    pub fn features(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(3 + self.body_pose.len() + 3);
        out.extend_from_slice(&self.global_orient);
        out.extend_from_slice(&self.body_pose);
        out.extend_from_slice(&self.camera);
        out
    }
}

/// Per-track data attached to one frame. Written once by the tracking
/// stage; read-only afterward except for label augmentation on the frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackRecord {
    pub track_id: u32,
    /// [x1, y1, x2, y2] in source pixel coordinates.
    pub bbox: [f32; 4],
    pub confidence: f32,
    pub pose: PoseParams,
    /// 17 COCO keypoints in source pixel coordinates.
    pub joints_2d: Vec<[f32; 2]>,
    /// Appearance embedding used by the tracker for re-identification.
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionScore {
    pub label: String,
    pub score: f32,
}

/// Everything known about one frame. The raw frame reference is transient:
/// the store persists metadata only, and the render stage re-attaches
/// pixels right before drawing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameRecord {
    #[serde(skip)]
    pub frame: Option<Frame>,
    pub tracks: BTreeMap<u32, TrackRecord>,
    /// Invariant: keys are a subset of `tracks` keys for this frame.
    #[serde(default)]
    pub labels: BTreeMap<u32, Vec<ActionScore>>,
}

impl PartialEq for FrameRecord {
    fn eq(&self, other: &Self) -> bool {
        // The transient frame reference is not part of record identity.
        self.tracks == other.tracks && self.labels == other.labels
    }
}

impl FrameRecord {
    pub fn from_tracks(tracks: Vec<TrackRecord>) -> Self {
        Self {
            frame: None,
            tracks: tracks.into_iter().map(|t| (t.track_id, t)).collect(),
            labels: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct FrameEntry {
    id: FrameId,
    record: FrameRecord,
}

/// Ordered mapping from frame id to frame record, persisted between stages.
///
/// Entry order equals temporal frame order and is the sole ordering
/// guarantee consumed downstream; ids are never sorted on. Entries are
/// appended by the tracking stage and label-augmented in place by the
/// temporal stage, never reordered or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultStore {
    pub schema_version: u32,
    pub source: String,
    entries: Vec<FrameEntry>,
}

impl ResultStore {
    pub fn new(source: &str) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            source: source.to_string(),
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append the record for the next frame in temporal order.
    pub fn push(&mut self, id: FrameId, record: FrameRecord) {
        self.entries.push(FrameEntry { id, record });
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FrameId, &FrameRecord)> {
        self.entries.iter().map(|e| (&e.id, &e.record))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&FrameId, &mut FrameRecord)> {
        self.entries.iter_mut().map(|e| (&e.id, &mut e.record))
    }

    pub fn get(&self, id: &FrameId) -> Option<&FrameRecord> {
        self.entries.iter().find(|e| &e.id == id).map(|e| &e.record)
    }

    /// Serialize the whole store to `path` as one JSON blob.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)
            .with_context(|| format!("failed to create store file {}", path.display()))?;
        let writer = BufWriter::new(file);
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    /// Deserialize a store persisted by an earlier stage. Order of entries
    /// is preserved exactly as written.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(PipelineError::MissingStore {
                path: path.to_path_buf(),
            }
            .into());
        }
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let store: ResultStore =
            serde_json::from_reader(reader).map_err(|e| PipelineError::CorruptStore {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        if store.schema_version != SCHEMA_VERSION {
            return Err(PipelineError::CorruptStore {
                path: path.to_path_buf(),
                reason: format!(
                    "schema version {} (expected {})",
                    store.schema_version, SCHEMA_VERSION
                ),
            }
            .into());
        }
        Ok(store)
    }
}

pub fn video_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string())
}

/// `<output_dir>/results/<stem>.json`, the tracking-only store.
pub fn tracking_store_path(output_dir: &Path, video: &Path) -> PathBuf {
    output_dir
        .join("results")
        .join(format!("{}.json", video_stem(video)))
}

/// `<output_dir>/results_temporal/<stem>.json`, the label-augmented store.
/// Distinct from the tracking path so the raw artifact stays reproducible.
pub fn temporal_store_path(output_dir: &Path, video: &Path) -> PathBuf {
    output_dir
        .join("results_temporal")
        .join(format!("{}.json", video_stem(video)))
}

/// `<output_dir>/results_temporal_videos/<stem>.mp4`, the rendered output.
pub fn output_video_path(output_dir: &Path, video: &Path) -> PathBuf {
    output_dir
        .join("results_temporal_videos")
        .join(format!("{}.mp4", video_stem(video)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pose(seed: f32) -> PoseParams {
        PoseParams {
            global_orient: [seed, 0.1, -0.2],
            body_pose: (0..69).map(|i| seed + i as f32 * 0.01).collect(),
            betas: (0..10).map(|i| i as f32 * 0.1).collect(),
            camera: [0.9, seed * 0.5, -0.3],
        }
    }

    fn sample_track(track_id: u32, seed: f32) -> TrackRecord {
        TrackRecord {
            track_id,
            bbox: [10.0, 20.0, 110.0, 220.0],
            confidence: 0.9,
            pose: sample_pose(seed),
            joints_2d: (0..17).map(|i| [i as f32 * 3.0, i as f32 * 5.0]).collect(),
            embedding: vec![0.25; 16],
        }
    }

    fn sample_store(frames: u32) -> ResultStore {
        let mut store = ResultStore::new("clip");
        for i in 0..frames {
            let record = FrameRecord::from_tracks(vec![sample_track(1, i as f32)]);
            store.push(FrameId::new("clip", i), record);
        }
        store
    }

    #[test]
    fn push_preserves_insertion_order() {
        let store = sample_store(10);
        let indices: Vec<u32> = store.iter().map(|(id, _)| id.index).collect();
        assert_eq!(indices, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn round_trip_is_lossless() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results").join("clip.json");

        let store = sample_store(5);
        store.save(&path).unwrap();
        let loaded = ResultStore::load(&path).unwrap();

        assert_eq!(loaded, store);
        // Pose values must survive exactly, not approximately.
        let (_, first) = loaded.iter().next().unwrap();
        let original = sample_pose(0.0);
        assert_eq!(first.tracks[&1].pose, original);
    }

    #[test]
    fn load_missing_store_reports_expected_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results").join("absent.json");
        let err = ResultStore::load(&path).unwrap_err();
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::MissingStore { path: reported }) => {
                assert_eq!(reported, &path)
            }
            other => panic!("expected MissingStore, got {:?}", other),
        }
    }

    #[test]
    fn load_rejects_schema_version_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.json");

        let mut store = sample_store(1);
        store.schema_version = SCHEMA_VERSION + 1;
        store.save(&path).unwrap();

        let err = ResultStore::load(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::CorruptStore { .. })
        ));
    }

    #[test]
    fn load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.json");
        std::fs::write(&path, b"not json").unwrap();
        let err = ResultStore::load(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::CorruptStore { .. })
        ));
    }

    #[test]
    fn stage_paths_follow_base_name_convention() {
        let out = Path::new("outputs");
        let video = Path::new("videos/walking.mp4");
        assert_eq!(
            tracking_store_path(out, video),
            Path::new("outputs/results/walking.json")
        );
        assert_eq!(
            temporal_store_path(out, video),
            Path::new("outputs/results_temporal/walking.json")
        );
        assert_eq!(
            output_video_path(out, video),
            Path::new("outputs/results_temporal_videos/walking.mp4")
        );
    }

    #[test]
    fn frame_id_display_is_stable() {
        assert_eq!(FrameId::new("clip", 12).to_string(), "clip_000012");
    }
}
