// src/video_io.rs

use crate::error::PipelineError;
use crate::types::Frame;
use anyhow::{bail, Result};
use opencv::{
    core::{Mat, Size},
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait, VideoCaptureTraitConst, VideoWriter},
};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Frame Source collaborator. Opening and releasing the decoder handle is
/// scoped to the implementation's lifetime; no two stages share one handle.
pub trait FrameSource {
    fn frame_count(&self) -> usize;
    fn fps(&self) -> f64;
    fn width(&self) -> usize;
    fn height(&self) -> usize;
    /// Next frame in stream order, or `None` at end of stream.
    fn read_next(&mut self) -> Result<Option<Frame>>;
    /// Frame at an absolute index; out of range is an unreadable-source error.
    fn read_at(&mut self, index: u32) -> Result<Frame>;
}

pub fn find_video_files(input_dir: &str) -> Result<Vec<PathBuf>> {
    let mut videos = Vec::new();

    let video_extensions = vec!["mp4", "avi", "mov", "mkv", "MP4", "AVI", "MOV", "MKV"];

    for entry in WalkDir::new(input_dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if let Some(ext) = path.extension() {
            if video_extensions.contains(&ext.to_str().unwrap_or("")) {
                videos.push(path.to_path_buf());
            }
        }
    }

    videos.sort();
    info!("Found {} video files", videos.len());
    Ok(videos)
}

pub struct VideoSource {
    cap: VideoCapture,
    path: PathBuf,
    fps: f64,
    total_frames: i32,
    next_frame: i32,
    width: i32,
    height: i32,
}

impl VideoSource {
    pub fn open(path: &Path) -> Result<Self> {
        info!("Opening video: {}", path.display());

        let cap = VideoCapture::from_file(
            path.to_str()
                .ok_or_else(|| PipelineError::unreadable(path, "non-UTF8 path"))?,
            videoio::CAP_ANY,
        )
        .map_err(|e| PipelineError::unreadable(path, e.to_string()))?;

        if !cap.is_opened()? {
            return Err(PipelineError::unreadable(path, "failed to open container").into());
        }

        let fps = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FPS)?;
        let total_frames = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_COUNT)? as i32;
        let width = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_WIDTH)? as i32;
        let height = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_HEIGHT)? as i32;

        info!(
            "Video properties: {}x{} @ {:.1} FPS, {} frames",
            width, height, fps, total_frames
        );

        Ok(Self {
            cap,
            path: path.to_path_buf(),
            fps,
            total_frames,
            next_frame: 0,
            width,
            height,
        })
    }

    fn decode_next(&mut self) -> Result<Option<Frame>> {
        let mut mat = Mat::default();

        if !self.cap.read(&mut mat)? || mat.empty() {
            return Ok(None);
        }

        let timestamp_ms = if self.fps > 0.0 {
            (self.next_frame as f64 / self.fps) * 1000.0
        } else {
            0.0
        };
        self.next_frame += 1;

        let mut rgb_mat = Mat::default();
        imgproc::cvt_color(&mat, &mut rgb_mat, imgproc::COLOR_BGR2RGB, 0)?;

        let data = rgb_mat.data_bytes()?.to_vec();

        Ok(Some(Frame {
            data,
            width: self.width as usize,
            height: self.height as usize,
            timestamp_ms,
        }))
    }
}

impl FrameSource for VideoSource {
    fn frame_count(&self) -> usize {
        self.total_frames.max(0) as usize
    }

    fn fps(&self) -> f64 {
        self.fps
    }

    fn width(&self) -> usize {
        self.width as usize
    }

    fn height(&self) -> usize {
        self.height as usize
    }

    fn read_next(&mut self) -> Result<Option<Frame>> {
        self.decode_next()
    }

    fn read_at(&mut self, index: u32) -> Result<Frame> {
        if index as i32 != self.next_frame {
            self.cap
                .set(videoio::CAP_PROP_POS_FRAMES, index as f64)?;
            self.next_frame = index as i32;
        }
        match self.decode_next()? {
            Some(frame) => Ok(frame),
            None => Err(PipelineError::unreadable(
                &self.path,
                format!("frame index {} out of range", index),
            )
            .into()),
        }
    }
}

impl Drop for VideoSource {
    fn drop(&mut self) {
        let _ = self.cap.release();
        debug!("Released video reader for {}", self.path.display());
    }
}

/// Streaming writer for the composited output video.
///
/// The underlying container is opened lazily on the first append so the
/// stream dimensions come from the first composited frame, and finalized on
/// every exit path: explicitly via `close`, or by `Drop` if the render loop
/// aborts.
pub struct VideoSink {
    writer: Option<VideoWriter>,
    path: PathBuf,
    fps: f64,
    size: Size,
    frames_written: u32,
}

impl VideoSink {
    pub fn create(path: &Path, fps: f64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!("Output video: {}", path.display());

        Ok(Self {
            writer: None,
            path: path.to_path_buf(),
            fps,
            size: Size::default(),
            frames_written: 0,
        })
    }

    /// Append one composited frame tagged with its sequence index `t`.
    /// Appends must arrive in strict order; `t` guards against reordered or
    /// dropped frames upstream.
    pub fn append(&mut self, frame: &Mat, t: u32) -> Result<()> {
        if t != self.frames_written {
            bail!(
                "out-of-order append to {}: got t={}, expected t={}",
                self.path.display(),
                t,
                self.frames_written
            );
        }

        let frame_size = frame.size()?;
        if self.writer.is_none() {
            let fourcc = VideoWriter::fourcc('m', 'p', '4', 'v')?;
            let fps = if self.fps > 0.0 { self.fps } else { 30.0 };
            let writer = VideoWriter::new(
                self.path
                    .to_str()
                    .ok_or_else(|| PipelineError::unreadable(&self.path, "non-UTF8 path"))?,
                fourcc,
                fps,
                frame_size,
                true,
            )?;
            if !writer.is_opened()? {
                bail!("failed to open video writer at {}", self.path.display());
            }
            self.size = frame_size;
            debug!(
                "Opened video writer: {}x{} @ {:.1} FPS",
                frame_size.width, frame_size.height, fps
            );
            self.writer = Some(writer);
        } else if frame_size != self.size {
            bail!(
                "frame {} size {}x{} does not match stream size {}x{}",
                t,
                frame_size.width,
                frame_size.height,
                self.size.width,
                self.size.height
            );
        }

        self.writer
            .as_mut()
            .expect("writer opened above")
            .write(frame)?;
        self.frames_written += 1;
        Ok(())
    }

    pub fn frames_written(&self) -> u32 {
        self.frames_written
    }

    /// Finalize the container. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.release()?;
            info!(
                "Finalized output video: {} ({} frames)",
                self.path.display(),
                self.frames_written
            );
        }
        Ok(())
    }
}

impl Drop for VideoSink {
    fn drop(&mut self) {
        if self.writer.is_some() {
            debug!("Releasing video writer for {} on drop", self.path.display());
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Scalar, CV_8UC3};

    #[test]
    fn find_video_files_filters_extensions() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.mp4", "b.txt", "c.MOV", "d.json"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        let videos = find_video_files(dir.path().to_str().unwrap()).unwrap();
        let names: Vec<_> = videos
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.mp4", "c.MOV"]);
    }

    #[test]
    fn sink_rejects_out_of_order_append() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = VideoSink::create(&dir.path().join("out.mp4"), 30.0).unwrap();

        let frame =
            Mat::new_rows_cols_with_default(32, 32, CV_8UC3, Scalar::all(0.0)).unwrap();
        // First append must be tagged t=0; the order check fires before the
        // writer is even opened.
        assert!(sink.append(&frame, 3).is_err());
        assert_eq!(sink.frames_written(), 0);
    }
}
