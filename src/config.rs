use crate::types::Config;
use anyhow::{bail, Result};
use std::fs;

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Validate render and temporal options once, before any stage runs.
    pub fn validate(&self) -> Result<()> {
        if self.video.output_dir.is_empty() {
            bail!("video.output_dir must not be empty");
        }
        if !(self.render.render_scale > 0.0) || self.render.render_scale > 8.0 {
            bail!(
                "render.render_scale must be in (0, 8], got {}",
                self.render.render_scale
            );
        }
        if self.temporal.min_window == 0 {
            bail!("temporal.min_window must be at least 1");
        }
        if self.inference.num_threads == 0 {
            bail!("inference.num_threads must be at least 1");
        }
        if self.checkpoints.detector.is_empty()
            || self.checkpoints.pose.is_empty()
            || self.checkpoints.action.is_empty()
        {
            bail!("all checkpoint paths must be set");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::types::{CompositeMode, Config};

    const SAMPLE: &str = r#"
video:
  input_dir: "videos"
  output_dir: "outputs"
checkpoints:
  detector: "models/det.onnx"
  pose: "models/pose.onnx"
  action: "models/action.onnx"
render:
  output_resolution: 1280
  render_scale: 1.0
  composite_mode: side_by_side
temporal:
  min_window: 5
inference:
  num_threads: 4
  confidence_threshold: 0.3
  min_box_width: 25.0
  min_box_height: 50.0
  reid_similarity_threshold: 0.8
logging:
  level: "info"
"#;

    #[test]
    fn parses_sample_config() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(config.render.output_resolution, 1280);
        assert_eq!(config.render.composite_mode, CompositeMode::SideBySide);
        assert_eq!(config.temporal.min_window, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_render_scale() {
        let mut config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.render.render_scale = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_min_window() {
        let mut config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.temporal.min_window = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_composite_mode() {
        let text = SAMPLE.replace("side_by_side", "mosaic");
        assert!(serde_yaml::from_str::<Config>(&text).is_err());
    }
}
