// src/temporal_stage.rs

use crate::action::ActionModel;
use crate::store::{self, PoseParams, ResultStore};
use anyhow::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub struct TemporalStats {
    pub tracks_labeled: usize,
    pub tracks_skipped: usize,
}

/// Stage 2: load the tracking-only store, classify each track's pose
/// sequence, write labels back into every frame the track appears in, and
/// persist the augmented store to its own path. The tracking-only artifact
/// on disk is never touched, so re-renders and re-runs stay reproducible.
pub fn run<M: ActionModel>(
    tracking_store_path: &Path,
    video_path: &Path,
    model: &mut M,
    output_dir: &Path,
) -> Result<(PathBuf, TemporalStats)> {
    let mut store = ResultStore::load(tracking_store_path)?;
    info!(
        "Loaded tracking store: {} ({} frames)",
        tracking_store_path.display(),
        store.len()
    );

    let stats = augment(&mut store, model)?;

    let temporal_path = store::temporal_store_path(output_dir, video_path);
    store.save(&temporal_path)?;
    info!(
        "Temporal store saved: {} ({} tracks labeled, {} skipped)",
        temporal_path.display(),
        stats.tracks_labeled,
        stats.tracks_skipped
    );

    Ok((temporal_path, stats))
}

/// Label augmentation over an in-memory store. Purely a function of each
/// track's pose sequence and frame order, so repeated runs on the same
/// store produce identical labels.
pub fn augment<M: ActionModel>(store: &mut ResultStore, model: &mut M) -> Result<TemporalStats> {
    // Assemble per-track pose sequences in frame order; track order is
    // first appearance, which is itself derived from frame order.
    let mut order: Vec<u32> = Vec::new();
    let mut sequences: HashMap<u32, Vec<PoseParams>> = HashMap::new();

    for (_, record) in store.iter() {
        for (track_id, track) in &record.tracks {
            let sequence = sequences.entry(*track_id).or_insert_with(|| {
                order.push(*track_id);
                Vec::new()
            });
            sequence.push(track.pose.clone());
        }
    }

    let mut tracks_labeled = 0;
    let mut tracks_skipped = 0;

    for track_id in order {
        let sequence = &sequences[&track_id];
        if sequence.len() < model.min_window() {
            debug!(
                "Track {} observed in {} frames, below minimum window {} - skipping",
                track_id,
                sequence.len(),
                model.min_window()
            );
            tracks_skipped += 1;
            continue;
        }

        let scores = model.predict(sequence)?;
        for (_, record) in store.iter_mut() {
            // Labels may only name identities present in this frame.
            if record.tracks.contains_key(&track_id) {
                record.labels.insert(track_id, scores.clone());
            }
        }
        tracks_labeled += 1;
    }

    Ok(TemporalStats {
        tracks_labeled,
        tracks_skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ActionScore, FrameId, FrameRecord, TrackRecord};

    struct StubActionModel {
        min_window: usize,
    }

    impl ActionModel for StubActionModel {
        fn min_window(&self) -> usize {
            self.min_window
        }

        fn predict(&mut self, sequence: &[PoseParams]) -> Result<Vec<ActionScore>> {
            // Deterministic function of the sequence, like the real model.
            Ok(vec![ActionScore {
                label: "walk".to_string(),
                score: 1.0 / sequence.len() as f32,
            }])
        }
    }

    fn track(track_id: u32, seed: f32) -> TrackRecord {
        TrackRecord {
            track_id,
            bbox: [0.0, 0.0, 10.0, 20.0],
            confidence: 0.9,
            pose: PoseParams {
                global_orient: [seed, 0.0, 0.0],
                body_pose: vec![seed; 69],
                betas: vec![0.0; 10],
                camera: [1.0, 0.0, 0.0],
            },
            joints_2d: vec![[0.0, 0.0]; 17],
            embedding: vec![1.0; 4],
        }
    }

    /// Store with track 1 in every frame and track 2 only in frames 0-1.
    fn two_track_store(frames: u32) -> ResultStore {
        let mut store = ResultStore::new("clip");
        for i in 0..frames {
            let mut tracks = vec![track(1, i as f32)];
            if i < 2 {
                tracks.push(track(2, i as f32));
            }
            store.push(FrameId::new("clip", i), FrameRecord::from_tracks(tracks));
        }
        store
    }

    #[test]
    fn long_track_is_labeled_in_every_frame() {
        let mut store = two_track_store(10);
        let mut model = StubActionModel { min_window: 5 };

        let stats = augment(&mut store, &mut model).unwrap();
        assert_eq!(stats.tracks_labeled, 1);

        for (_, record) in store.iter() {
            assert!(record.labels.contains_key(&1));
            assert_eq!(record.labels[&1][0].label, "walk");
        }
    }

    #[test]
    fn short_track_is_skipped_without_error() {
        // Track 2 appears only in frames 0-1, below the window of 5.
        let mut store = two_track_store(10);
        let mut model = StubActionModel { min_window: 5 };

        let stats = augment(&mut store, &mut model).unwrap();
        assert_eq!(stats.tracks_skipped, 1);

        for (_, record) in store.iter() {
            assert!(!record.labels.contains_key(&2));
        }
    }

    #[test]
    fn frames_with_only_short_tracks_have_empty_label_maps() {
        let mut store = ResultStore::new("clip");
        for i in 0..10 {
            let tracks = if i < 2 { vec![track(2, i as f32)] } else { vec![] };
            store.push(FrameId::new("clip", i), FrameRecord::from_tracks(tracks));
        }

        let mut model = StubActionModel { min_window: 5 };
        augment(&mut store, &mut model).unwrap();

        for (_, record) in store.iter() {
            assert!(record.labels.is_empty());
        }
    }

    #[test]
    fn rerunning_on_unmodified_store_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let video = Path::new("videos/clip.mp4");
        let tracking_path = store::tracking_store_path(dir.path(), video);
        two_track_store(10).save(&tracking_path).unwrap();

        let mut model = StubActionModel { min_window: 5 };

        let (temporal_path, _) = run(&tracking_path, video, &mut model, dir.path()).unwrap();
        let first = std::fs::read(&temporal_path).unwrap();

        let (temporal_path, _) = run(&tracking_path, video, &mut model, dir.path()).unwrap();
        let second = std::fs::read(&temporal_path).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn labels_reference_only_tracks_present_in_the_frame() {
        let mut store = two_track_store(10);
        let mut model = StubActionModel { min_window: 1 };

        augment(&mut store, &mut model).unwrap();

        for (_, record) in store.iter() {
            for track_id in record.labels.keys() {
                assert!(record.tracks.contains_key(track_id));
            }
        }
    }

    #[test]
    fn run_fails_on_missing_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = StubActionModel { min_window: 5 };
        let missing = dir.path().join("results").join("clip.json");

        let err = run(
            &missing,
            Path::new("videos/clip.mp4"),
            &mut model,
            dir.path(),
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::error::PipelineError>(),
            Some(crate::error::PipelineError::MissingStore { .. })
        ));
    }

    #[test]
    fn run_preserves_original_store_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let video = Path::new("videos/clip.mp4");
        let tracking_path = store::tracking_store_path(dir.path(), video);

        let original = two_track_store(10);
        original.save(&tracking_path).unwrap();
        let bytes_before = std::fs::read(&tracking_path).unwrap();

        let mut model = StubActionModel { min_window: 5 };
        let (temporal_path, _) = run(&tracking_path, video, &mut model, dir.path()).unwrap();

        assert_ne!(temporal_path, tracking_path);
        assert_eq!(std::fs::read(&tracking_path).unwrap(), bytes_before);

        let augmented = ResultStore::load(&temporal_path).unwrap();
        assert_eq!(augmented.len(), original.len());
    }
}
