// src/tracking_stage.rs

use crate::store::{self, FrameId, FrameRecord, ResultStore};
use crate::tracker::TrackModel;
use crate::video_io::{FrameSource, VideoSource};
use anyhow::Result;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub struct TrackingStats {
    pub frames: usize,
    pub tracks_seen: usize,
}

/// Stage 1: run detection/tracking/pose estimation over the whole video and
/// persist the result store. Returns the store path so later stages can
/// resume from disk without any in-memory hand-off.
pub fn run<M: TrackModel>(
    video_path: &Path,
    model: &mut M,
    output_dir: &Path,
) -> Result<(PathBuf, TrackingStats)> {
    // Fail fast on an unreadable source, before any store is written.
    let mut source = VideoSource::open(video_path)?;

    let stem = store::video_stem(video_path);
    let (store, stats) = track_frames(&mut source, model, &stem)?;

    let store_path = store::tracking_store_path(output_dir, video_path);
    store.save(&store_path)?;
    info!(
        "Tracking store saved: {} ({} frames)",
        store_path.display(),
        store.len()
    );

    Ok((store_path, stats))
}

/// Core tracking loop over any frame source, one record per frame in
/// stream order.
pub fn track_frames<S: FrameSource, M: TrackModel>(
    source: &mut S,
    model: &mut M,
    stem: &str,
) -> Result<(ResultStore, TrackingStats)> {
    let expected_frames = source.frame_count();
    let mut store = ResultStore::new(stem);
    let mut tracks_seen: BTreeSet<u32> = BTreeSet::new();

    let mut index: u32 = 0;
    while let Some(frame) = source.read_next()? {
        let records = model.infer(&frame)?;
        for record in &records {
            tracks_seen.insert(record.track_id);
        }

        let id = FrameId::new(stem, index);
        store.push(id, FrameRecord::from_tracks(records));

        // The reported frame count only sizes progress reporting; a
        // mismatch degrades the percentage, nothing else.
        if expected_frames > 0 && (index as usize) < expected_frames {
            info!(
                "Tracking {}: frame {}/{} ({:.1}%)",
                stem,
                index + 1,
                expected_frames,
                100.0 * (index + 1) as f64 / expected_frames as f64
            );
        } else {
            info!("Tracking {}: frame {}", stem, index + 1);
        }

        index += 1;
    }

    if expected_frames != store.len() {
        warn!(
            "Frame count mismatch for {}: container reported {}, decoded {}",
            stem,
            expected_frames,
            store.len()
        );
    }

    Ok((
        store,
        TrackingStats {
            frames: store.len(),
            tracks_seen: tracks_seen.len(),
        },
    ))
}
