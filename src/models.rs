use async_trait::async_trait;
use image::{imageops, imageops::FilterType};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tract_onnx::prelude::*;

use crate::decision::{ClassPrediction, PredictionBatch};
use crate::error::{DetectorError, DetectorResult};
use crate::frame::{Frame, FRAME_SIZE};

/// Where a model resource lives: a local path or an http(s) URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    Path(PathBuf),
    Url(String),
}

impl ModelSource {
    pub fn parse(reference: &str) -> Self {
        if reference.starts_with("http://") || reference.starts_with("https://") {
            ModelSource::Url(reference.to_string())
        } else {
            ModelSource::Path(PathBuf::from(reference))
        }
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSource::Path(path) => write!(f, "{}", path.display()),
            ModelSource::Url(url) => f.write_str(url),
        }
    }
}

/// Label metadata exported next to a Teachable Machine image model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelMetadata {
    /// Class labels in classifier output order
    pub labels: Vec<String>,
    #[serde(default)]
    pub image_size: Option<u32>,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub tfjs_version: Option<String>,
    #[serde(default)]
    pub package_version: Option<String>,
    #[serde(default)]
    pub package_name: Option<String>,
    #[serde(default)]
    pub time_stamp: Option<String>,
    #[serde(default)]
    pub user_metadata: Option<serde_json::Value>,
}

impl ModelMetadata {
    pub fn from_json(bytes: &[u8]) -> DetectorResult<Self> {
        let metadata: Self = serde_json::from_slice(bytes)
            .map_err(|e| DetectorError::ModelUnavailable(format!("invalid metadata: {}", e)))?;
        if metadata.labels.is_empty() {
            return Err(DetectorError::ModelUnavailable(
                "metadata lists no class labels".to_string(),
            ));
        }
        Ok(metadata)
    }

    pub fn input_size(&self) -> u32 {
        self.image_size.filter(|size| *size > 0).unwrap_or(FRAME_SIZE)
    }
}

/// Memory layout of the model's image input tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputLayout {
    #[default]
    Nhwc,
    Nchw,
}

impl InputLayout {
    fn shape(self, size: usize) -> [usize; 4] {
        match self {
            InputLayout::Nhwc => [1, size, size, 3],
            InputLayout::Nchw => [1, 3, size, size],
        }
    }
}

/// An initialised classifier: frame in, one probability per known class out.
pub trait ImageClassifier: Send + Sync {
    fn class_labels(&self) -> &[String];

    fn classify(&self, frame: &Frame) -> DetectorResult<PredictionBatch>;
}

#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn initialize(
        &self,
        model: &ModelSource,
        metadata: &ModelSource,
    ) -> DetectorResult<Arc<dyn ImageClassifier>>;
}

/// Loads ONNX exports of Teachable Machine image models with tract.
pub struct OnnxModelLoader {
    client: reqwest::Client,
    layout: InputLayout,
}

impl OnnxModelLoader {
    pub fn new(layout: InputLayout, fetch_timeout: Duration) -> DetectorResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .user_agent("toolsight/0.1")
            .build()
            .map_err(|e| DetectorError::ModelUnavailable(format!("http client: {}", e)))?;

        Ok(Self { client, layout })
    }

    async fn fetch(&self, source: &ModelSource) -> DetectorResult<Vec<u8>> {
        debug!("Fetching model resource {}", source);
        match source {
            ModelSource::Path(path) => tokio::fs::read(path).await.map_err(|e| {
                DetectorError::ModelUnavailable(format!("{}: {}", path.display(), e))
            }),
            ModelSource::Url(url) => {
                let unavailable = |e: reqwest::Error| {
                    DetectorError::ModelUnavailable(format!("{}: {}", url, e))
                };
                let response = self
                    .client
                    .get(url)
                    .send()
                    .await
                    .and_then(|response| response.error_for_status())
                    .map_err(unavailable)?;
                let bytes = response.bytes().await.map_err(unavailable)?;
                Ok(bytes.to_vec())
            }
        }
    }
}

#[async_trait]
impl ModelLoader for OnnxModelLoader {
    async fn initialize(
        &self,
        model: &ModelSource,
        metadata: &ModelSource,
    ) -> DetectorResult<Arc<dyn ImageClassifier>> {
        let load_start = std::time::Instant::now();
        info!("Loading classifier from {} (metadata {})", model, metadata);

        let metadata = ModelMetadata::from_json(&self.fetch(metadata).await?)?;
        let model_bytes = self.fetch(model).await?;
        if model_bytes.is_empty() {
            return Err(DetectorError::ModelUnavailable(format!("{} is empty", model)));
        }

        let layout = self.layout;
        let classifier = tokio::task::spawn_blocking(move || {
            TractClassifier::from_bytes(&model_bytes, metadata, layout)
        })
        .await
        .map_err(|e| DetectorError::ModelUnavailable(format!("model load task failed: {}", e)))??;

        info!(
            "Classifier ready with {} classes in {:.3}s",
            classifier.class_labels().len(),
            load_start.elapsed().as_secs_f64()
        );
        Ok(Arc::new(classifier))
    }
}

type OnnxPlan = SimplePlan<TypedFact, Box<dyn TypedOp>, TypedModel>;

pub struct TractClassifier {
    plan: OnnxPlan,
    metadata: ModelMetadata,
    layout: InputLayout,
}

impl TractClassifier {
    pub fn from_bytes(
        bytes: &[u8],
        metadata: ModelMetadata,
        layout: InputLayout,
    ) -> DetectorResult<Self> {
        let size = metadata.input_size() as usize;
        let plan = tract_onnx::onnx()
            .model_for_read(&mut Cursor::new(bytes))
            .and_then(|model| model.with_input_fact(0, f32::fact(layout.shape(size)).into()))
            .and_then(|model| model.into_optimized())
            .and_then(|model| model.into_runnable())
            .map_err(|e| DetectorError::ModelUnavailable(format!("invalid ONNX model: {}", e)))?;

        Ok(Self {
            plan,
            metadata,
            layout,
        })
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    fn input_tensor(&self, frame: &Frame) -> Tensor {
        let size = self.metadata.input_size();
        let image = if frame.image.dimensions() == (size, size) {
            Cow::Borrowed(&frame.image)
        } else {
            Cow::Owned(imageops::resize(&frame.image, size, size, FilterType::Triangle))
        };
        let size = size as usize;

        match self.layout {
            InputLayout::Nhwc => {
                tract_ndarray::Array4::from_shape_fn((1, size, size, 3), |(_, y, x, c)| {
                    normalize_pixel(image.get_pixel(x as u32, y as u32)[c])
                })
                .into_tensor()
            }
            InputLayout::Nchw => {
                tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
                    normalize_pixel(image.get_pixel(x as u32, y as u32)[c])
                })
                .into_tensor()
            }
        }
    }
}

impl ImageClassifier for TractClassifier {
    fn class_labels(&self) -> &[String] {
        &self.metadata.labels
    }

    fn classify(&self, frame: &Frame) -> DetectorResult<PredictionBatch> {
        let input = self.input_tensor(frame);
        let outputs = self
            .plan
            .run(tvec!(input.into_tvalue()))
            .map_err(|e| DetectorError::Inference(e.to_string()))?;
        let output = outputs
            .first()
            .ok_or_else(|| DetectorError::Inference("model produced no outputs".to_string()))?;
        let scores: Vec<f32> = output
            .to_array_view::<f32>()
            .map_err(|e| DetectorError::Inference(format!("output is not f32: {}", e)))?
            .iter()
            .copied()
            .collect();

        labelled_batch(&self.metadata.labels, normalize_scores(scores))
    }
}

/// Teachable Machine image models expect pixels in [-1, 1].
fn normalize_pixel(value: u8) -> f32 {
    value as f32 / 127.5 - 1.0
}

/// Pass probabilities through; softmax raw logits.
pub fn normalize_scores(scores: Vec<f32>) -> Vec<f32> {
    if scores.iter().all(|s| (0.0..=1.0).contains(s)) {
        return scores;
    }

    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum > 0.0 && sum.is_finite() {
        exps.into_iter().map(|e| e / sum).collect()
    } else {
        exps
    }
}

/// Pair scores with labels in classifier order.
pub fn labelled_batch(labels: &[String], scores: Vec<f32>) -> DetectorResult<PredictionBatch> {
    if scores.len() != labels.len() {
        return Err(DetectorError::Inference(format!(
            "model produced {} scores for {} labels",
            scores.len(),
            labels.len()
        )));
    }

    PredictionBatch::new(
        labels
            .iter()
            .zip(scores)
            .map(|(label, probability)| ClassPrediction::new(label.clone(), probability))
            .collect(),
    )
}
