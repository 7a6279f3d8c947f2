use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

use crate::camera::{CaptureRequest, FacingMode};
use crate::decision::CONFIDENCE_THRESHOLD;
use crate::frame::FRAME_SIZE;
use crate::models::{InputLayout, ModelSource};
use crate::pipeline::{LoopSettings, CYCLE_DELAY};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSightConfig {
    pub model: ModelConfig,
    pub camera: CameraConfig,
    pub detection: DetectionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model graph, local path or http(s) URL
    pub model_path: String,
    /// Teachable Machine metadata.json, local path or http(s) URL
    pub metadata_path: String,
    /// Image tensor layout expected by the model
    pub input_layout: InputLayout,
    /// Timeout for fetching remote model resources
    pub fetch_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Explicit camera index; unset picks by facing
    pub device_index: Option<u32>,
    pub facing: FacingMode,
    pub width: u32,
    pub height: u32,
    /// Give up on camera negotiation after this long
    pub negotiation_timeout_ms: u64,
    /// Try to switch on the torch once streaming
    pub illumination: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Minimum top-class probability, as a fraction
    pub confidence_threshold: f32,
    /// Delay between classification cycles
    pub cycle_delay_ms: u64,
}

impl Default for ToolSightConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig {
                model_path: "model/model.onnx".to_string(),
                metadata_path: "model/metadata.json".to_string(),
                input_layout: InputLayout::Nhwc,
                fetch_timeout_seconds: 30,
            },
            camera: CameraConfig {
                device_index: None,
                facing: FacingMode::Environment,
                width: FRAME_SIZE,
                height: FRAME_SIZE,
                negotiation_timeout_ms: 10_000,
                illumination: true,
            },
            detection: DetectionConfig {
                confidence_threshold: CONFIDENCE_THRESHOLD,
                cycle_delay_ms: CYCLE_DELAY.as_millis() as u64,
            },
        }
    }
}

impl ToolSightConfig {
    /// Load `path`, layering `TOOLSIGHT_<SECTION>__<KEY>` environment overrides.
    ///
    /// A missing file is created with the defaults.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            let default_config = Self::default();
            default_config.save(path).await?;
            return Ok(default_config);
        }

        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path).format(::config::FileFormat::Toml))
            .add_source(
                ::config::Environment::with_prefix("TOOLSIGHT")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let threshold = self.detection.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            bail!("confidence_threshold must be a fraction in [0, 1], got {}", threshold);
        }
        if self.detection.cycle_delay_ms == 0 {
            bail!("cycle_delay_ms must be greater than zero");
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            bail!("camera frame size must be non-zero");
        }
        if self.camera.negotiation_timeout_ms == 0 {
            bail!("negotiation_timeout_ms must be greater than zero");
        }
        if self.model.model_path.trim().is_empty() || self.model.metadata_path.trim().is_empty() {
            bail!("model_path and metadata_path must be set");
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.model.fetch_timeout_seconds)
    }

    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            model: ModelSource::parse(&self.model.model_path),
            metadata: ModelSource::parse(&self.model.metadata_path),
            capture: CaptureRequest {
                device_index: self.camera.device_index,
                facing: self.camera.facing,
                width: self.camera.width,
                height: self.camera.height,
                negotiation_timeout: Duration::from_millis(self.camera.negotiation_timeout_ms),
                illumination: self.camera.illumination,
            },
            confidence_threshold: self.detection.confidence_threshold,
            cycle_delay: Duration::from_millis(self.detection.cycle_delay_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_detector_constants() {
        let settings = ToolSightConfig::default().loop_settings();
        assert_eq!(settings.confidence_threshold, 0.60);
        assert_eq!(settings.cycle_delay, Duration::from_millis(150));
        assert_eq!(settings.capture.negotiation_timeout, Duration::from_secs(10));
        assert_eq!((settings.capture.width, settings.capture.height), (224, 224));
        assert_eq!(settings.capture.facing, FacingMode::Environment);
    }

    #[test]
    fn parses_toml_with_remote_model() {
        let config = ToolSightConfig::from_toml_str(
            r#"
            [model]
            model_path = "https://example.com/tm/model.onnx"
            metadata_path = "https://example.com/tm/metadata.json"
            input_layout = "nchw"
            fetch_timeout_seconds = 5

            [camera]
            device_index = 2
            facing = "user"
            width = 224
            height = 224
            negotiation_timeout_ms = 3000
            illumination = false

            [detection]
            confidence_threshold = 0.75
            cycle_delay_ms = 200
            "#,
        )
        .unwrap();

        assert_eq!(config.model.input_layout, InputLayout::Nchw);
        let settings = config.loop_settings();
        assert!(matches!(settings.model, ModelSource::Url(_)));
        assert_eq!(settings.capture.device_index, Some(2));
        assert_eq!(settings.capture.facing, FacingMode::User);
        assert!(!settings.capture.illumination);
        assert_eq!(settings.confidence_threshold, 0.75);
    }

    #[test]
    fn rejects_percentage_thresholds() {
        let mut config = ToolSightConfig::default();
        config.detection.confidence_threshold = 60.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_delay() {
        let mut config = ToolSightConfig::default();
        config.detection.cycle_delay_ms = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("toolsight.toml");

        let created = ToolSightConfig::load(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(created.model.model_path, "model/model.onnx");

        let reloaded = ToolSightConfig::load(&path).await.unwrap();
        assert_eq!(reloaded.detection.cycle_delay_ms, 150);
        assert_eq!(reloaded.camera.negotiation_timeout_ms, 10_000);
    }

    #[tokio::test]
    async fn save_then_load_keeps_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("toolsight.toml");

        let mut config = ToolSightConfig::default();
        config.model.metadata_path = "tm/metadata.json".to_string();
        config.camera.illumination = false;
        config.save(&path).await.unwrap();

        let loaded = ToolSightConfig::load(&path).await.unwrap();
        assert_eq!(loaded.model.metadata_path, "tm/metadata.json");
        assert!(!loaded.camera.illumination);
    }
}
