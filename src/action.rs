// src/action.rs

use crate::store::{ActionScore, PoseParams};
use anyhow::{ensure, Context, Result};
use ndarray::Array3;
use ort::{
    execution_providers::CUDAExecutionProvider,
    session::{builder::GraphOptimizationLevel, Session},
};
use tracing::{debug, info};

// orient(3) + body_pose(69) + camera(3)
const POSE_FEATURE_DIM: usize = 75;

const TOP_K: usize = 3;

// AVA-style atomic action vocabulary, in model output order.
const ACTION_LABELS: [&str; 20] = [
    "stand",
    "sit",
    "walk",
    "run",
    "bend",
    "crouch",
    "dance",
    "jump",
    "lie down",
    "get up",
    "carry object",
    "hold object",
    "touch object",
    "eat",
    "drink",
    "talk to person",
    "listen to person",
    "watch person",
    "hug person",
    "fight person",
];

/// Action-classification collaborator: a pure function of the pose sequence
/// it is given. Tracks shorter than `min_window` are never submitted.
pub trait ActionModel {
    fn min_window(&self) -> usize;
    fn predict(&mut self, sequence: &[PoseParams]) -> Result<Vec<ActionScore>>;
}

/// Temporal action classifier over a single track's pose sequence.
pub struct ActionClassifier {
    session: Session,
    min_window: usize,
}

impl ActionClassifier {
    pub fn new(model_path: &str, min_window: usize, num_threads: usize) -> Result<Self> {
        info!("Loading action model: {}", model_path);

        let session = Session::builder()?
            .with_execution_providers([CUDAExecutionProvider::default().with_device_id(0).build()])?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(num_threads)?
            .commit_from_file(model_path)
            .context("Failed to load action model")?;

        info!("✓ Action classifier initialized (min window: {})", min_window);
        Ok(Self {
            session,
            min_window,
        })
    }
}

impl ActionModel for ActionClassifier {
    fn min_window(&self) -> usize {
        self.min_window
    }

    fn predict(&mut self, sequence: &[PoseParams]) -> Result<Vec<ActionScore>> {
        ensure!(
            sequence.len() >= self.min_window,
            "sequence of {} frames is below the minimum window of {}",
            sequence.len(),
            self.min_window
        );

        // [1, T, D] pose-feature tensor in frame order
        let mut features = Array3::<f32>::zeros((1, sequence.len(), POSE_FEATURE_DIM));
        for (t, pose) in sequence.iter().enumerate() {
            let feat = pose.features();
            ensure!(
                feat.len() == POSE_FEATURE_DIM,
                "pose feature dim {} (expected {})",
                feat.len(),
                POSE_FEATURE_DIM
            );
            for (d, value) in feat.iter().enumerate() {
                features[[0, t, d]] = *value;
            }
        }

        let shape = [1usize, sequence.len(), POSE_FEATURE_DIM];
        let (data, _) = features.into_raw_vec_and_offset();
        let input_value =
            ort::value::Value::from_array((shape.as_slice(), data.into_boxed_slice()))?;
        let outputs = self.session.run(ort::inputs!["poses" => input_value])?;
        let (_, logits) = outputs[0].try_extract_tensor::<f32>()?;

        ensure!(
            logits.len() >= ACTION_LABELS.len(),
            "action model output too small: {} (expected {})",
            logits.len(),
            ACTION_LABELS.len()
        );

        let scores = top_scores(&softmax(&logits[..ACTION_LABELS.len()]), TOP_K);
        debug!(
            "Predicted {} action(s) over {} frames",
            scores.len(),
            sequence.len()
        );
        Ok(scores)
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|x| x / sum).collect()
}

/// Highest-probability labels, best first, ties broken by label order.
fn top_scores(probs: &[f32], k: usize) -> Vec<ActionScore> {
    let mut indexed: Vec<(usize, f32)> = probs.iter().cloned().enumerate().collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    indexed
        .into_iter()
        .take(k)
        .map(|(i, score)| ActionScore {
            label: ACTION_LABELS[i].to_string(),
            score,
        })
        .collect()
}
