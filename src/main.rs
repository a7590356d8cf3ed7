// src/main.rs

mod action;
mod config;
mod error;
mod render_stage;
mod store;
mod temporal_stage;
mod tracker;
mod tracking_stage;
mod types;
mod video_io;
mod visualizer;

use action::ActionClassifier;
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info};
use tracker::PoseTracker;
use types::Config;

fn main() -> Result<()> {
    let config = Config::load("config.yaml")?;
    config.validate()?;

    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "action_tracking={},ort=warn",
            config.logging.level
        ))
        .init();

    info!("Human tracking + action recognition pipeline starting");
    info!("✓ Configuration loaded");
    info!(
        "Render: resolution={}, scale={:.2}, mode={:?}",
        config.render.output_resolution, config.render.render_scale, config.render.composite_mode
    );

    let video_files = video_io::find_video_files(&config.video.input_dir)?;
    if video_files.is_empty() {
        error!("No video files found in {}", config.video.input_dir);
        return Ok(());
    }

    let mut tracker = PoseTracker::new(&config)?;
    info!("✓ Pose tracker ready");

    let mut classifier = ActionClassifier::new(
        &config.checkpoints.action,
        config.temporal.min_window,
        config.inference.num_threads,
    )?;
    info!("✓ Action classifier ready");

    for (idx, video_path) in video_files.iter().enumerate() {
        info!("========================================");
        info!(
            "Processing video {}/{}: {}",
            idx + 1,
            video_files.len(),
            video_path.display()
        );
        info!("========================================");

        match process_video(video_path, &mut tracker, &mut classifier, &config) {
            Ok(stats) => {
                info!("✓ Video processed successfully!");
                info!("  Frames tracked: {}", stats.frames);
                info!("  Unique tracks: {}", stats.tracks_seen);
                info!(
                    "  Tracks labeled: {} ({} below temporal window)",
                    stats.tracks_labeled, stats.tracks_skipped
                );
                info!("  Output frames: {}", stats.frames_written);
                info!("  Output video: {}", stats.output_video.display());
                info!("  Processing speed: {:.1} FPS", stats.avg_fps);
            }
            Err(e) => {
                // Stage-boundary failures abort the whole run.
                error!("Failed to process {}: {:#}", video_path.display(), e);
                return Err(e);
            }
        }
    }

    Ok(())
}

struct PipelineStats {
    frames: usize,
    tracks_seen: usize,
    tracks_labeled: usize,
    tracks_skipped: usize,
    frames_written: u32,
    output_video: PathBuf,
    avg_fps: f64,
}

fn process_video(
    video_path: &Path,
    tracker: &mut PoseTracker,
    classifier: &mut ActionClassifier,
    config: &Config,
) -> Result<PipelineStats> {
    let start_time = Instant::now();
    let output_dir = Path::new(&config.video.output_dir);

    // Stage 1: track, staging results to disk. The reader handle is
    // released when the stage returns, before the render stage reopens it.
    let (tracking_path, tracking_stats) = tracking_stage::run(video_path, tracker, output_dir)?;

    // Stage 2: action prediction over the staged store only; no raw frames.
    let (temporal_path, temporal_stats) =
        temporal_stage::run(&tracking_path, video_path, classifier, output_dir)?;

    // Stage 3: compose the annotated output video from the augmented store.
    let (output_video, render_stats) =
        render_stage::run(&temporal_path, video_path, config, output_dir)?;

    let duration = start_time.elapsed();
    let avg_fps = tracking_stats.frames as f64 / duration.as_secs_f64().max(1e-6);

    Ok(PipelineStats {
        frames: tracking_stats.frames,
        tracks_seen: tracking_stats.tracks_seen,
        tracks_labeled: temporal_stats.tracks_labeled,
        tracks_skipped: temporal_stats.tracks_skipped,
        frames_written: render_stats.frames_written,
        output_video,
        avg_fps,
    })
}
