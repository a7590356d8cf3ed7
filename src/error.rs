// src/error.rs

use std::path::PathBuf;
use thiserror::Error;

/// Stage-boundary and frame-level failures of the pipeline.
///
/// Stage-boundary errors (`UnreadableSource`, `MissingStore`, `CorruptStore`)
/// abort the whole run. `CompositionSizeMismatch` aborts the render loop: it
/// signals a configuration defect, not a data defect.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unreadable source {path}: {reason}")]
    UnreadableSource { path: PathBuf, reason: String },

    #[error("missing result store at {path}")]
    MissingStore { path: PathBuf },

    #[error("corrupt result store at {path}: {reason}")]
    CorruptStore { path: PathBuf, reason: String },

    #[error("composition size mismatch: panel {expected_w}x{expected_h}, frame {actual_w}x{actual_h}")]
    CompositionSizeMismatch {
        expected_w: i32,
        expected_h: i32,
        actual_w: i32,
        actual_h: i32,
    },
}

impl PipelineError {
    pub fn unreadable(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::UnreadableSource {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
