// src/render_stage.rs

use crate::error::PipelineError;
use crate::store::{self, ResultStore};
use crate::types::{CompositeMode, Config, Frame};
use crate::video_io::{FrameSource, VideoSink, VideoSource};
use crate::visualizer::Visualizer;
use anyhow::Result;
use opencv::{
    core::{self, Mat, Size},
    imgproc,
    prelude::*,
};
use std::path::{Path, PathBuf};
use tracing::info;

pub struct RenderStats {
    pub frames_written: u32,
}

/// Stage 3: iterate the (augmented) store in entry order, re-read each raw
/// frame, render the visualization panel, composite, and stream frames to
/// the output video. The store carries no pixels, so this stage owns its
/// own reader handle for the lifetime of the loop.
pub fn run(
    store_path: &Path,
    video_path: &Path,
    config: &Config,
    output_dir: &Path,
) -> Result<(PathBuf, RenderStats)> {
    let store = ResultStore::load(store_path)?;
    let mut source = VideoSource::open(video_path)?;

    let panel_width = if config.render.output_resolution == 0 {
        source.width() as u32
    } else {
        config.render.output_resolution
    };
    let panel_width = ((panel_width as f32 * config.render.render_scale) as u32).max(1);
    let visualizer = Visualizer::new(panel_width);

    // Raw frames are resized to this configured target; the panel size
    // stays the authority when the two disagree.
    let target_size = visualizer.panel_size(source.width(), source.height());

    let output_path = store::output_video_path(output_dir, video_path);
    let mut sink = VideoSink::create(&output_path, source.fps())?;

    let stem = store::video_stem(video_path);
    let total = store.len();

    for (t, (id, record)) in store.iter().enumerate() {
        let frame = source.read_at(id.index)?;
        info!("Rendering {}: frame {}/{}", stem, t + 1, total);

        let raw_resized = match config.render.composite_mode {
            CompositeMode::SideBySide => Some(resize_raw_frame(&frame, target_size)?),
            CompositeMode::Panel => None,
        };

        // Attach the transient raw frame for rendering only; it is dropped
        // with the clone and never persisted.
        let mut record = record.clone();
        record.frame = Some(frame);
        let panel = visualizer.render_panel(&record)?;

        let composite = match raw_resized {
            None => panel,
            Some(resized) => compose_side_by_side(&panel, &resized)?,
        };

        sink.append(&composite, t as u32)?;
    }

    // Explicit finalize on the success path; Drop covers error exits.
    sink.close()?;
    let frames_written = sink.frames_written();
    info!(
        "Rendered {} of {} frames for {}",
        frames_written, total, stem
    );

    Ok((output_path, RenderStats { frames_written }))
}

/// Resize the raw frame to the panel's output size. Area-averaging
/// interpolation avoids aliasing when downscaling.
fn resize_raw_frame(frame: &Frame, target: Size) -> Result<Mat> {
    let mat = Mat::from_slice(&frame.data)?;
    let mat = mat.reshape(3, frame.height as i32)?;

    let mut bgr_mat = Mat::default();
    imgproc::cvt_color(&mat, &mut bgr_mat, imgproc::COLOR_RGB2BGR, 0)?;

    let mut resized = Mat::default();
    imgproc::resize(&bgr_mat, &mut resized, target, 0.0, 0.0, imgproc::INTER_AREA)?;
    Ok(resized)
}

/// Concatenate the resized raw frame and the rendered panel horizontally.
/// The panel size is the authority; any disagreement is a configuration
/// defect and aborts the render loop.
fn compose_side_by_side(panel: &Mat, raw_resized: &Mat) -> Result<Mat> {
    let panel_size = panel.size()?;
    let raw_size = raw_resized.size()?;
    if raw_size != panel_size {
        return Err(PipelineError::CompositionSizeMismatch {
            expected_w: panel_size.width,
            expected_h: panel_size.height,
            actual_w: raw_size.width,
            actual_h: raw_size.height,
        }
        .into());
    }

    let mut composite = Mat::default();
    core::hconcat2(raw_resized, panel, &mut composite)?;
    Ok(composite)
}
