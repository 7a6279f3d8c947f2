//! Stand-in capture sources and classifiers.
//!
//! `StillImageOpener` and `SimulatedModelLoader` back the `--still` and
//! `--simulate` modes. `ScriptedClassifier` and `FixedModelLoader` are test
//! doubles for driving the classification loop deterministically; the binary
//! never uses them.

use async_trait::async_trait;
use image::{DynamicImage, ImageBuffer, Rgb};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::camera::{CaptureOpener, CaptureRequest, FrameSource};
use crate::decision::{ClassPrediction, PredictionBatch};
use crate::error::{DetectorError, DetectorResult};
use crate::frame::Frame;
use crate::models::{ImageClassifier, ModelLoader, ModelSource};

/// Capture source that repeats one still image forever.
pub struct StillFrameSource {
    frame: Frame,
    name: String,
    served: AtomicU64,
}

impl StillFrameSource {
    pub fn new(image: &DynamicImage, request: &CaptureRequest, name: impl Into<String>) -> Self {
        Self {
            frame: Frame::render(image, request.width, request.height, 0),
            name: name.into(),
            served: AtomicU64::new(0),
        }
    }

    pub fn frames_served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl FrameSource for StillFrameSource {
    fn current_frame(&self) -> DetectorResult<Frame> {
        self.served.fetch_add(1, Ordering::Relaxed);
        Ok(self.frame.clone())
    }

    fn stop(&mut self) {
        info!("Still image source {} stopped after {} frames", self.name, self.frames_served());
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// Opens a [`StillFrameSource`] from an image file, or a synthetic test card.
#[derive(Debug, Clone, Default)]
pub struct StillImageOpener {
    path: Option<PathBuf>,
}

impl StillImageOpener {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
        }
    }

    pub fn synthetic() -> Self {
        Self { path: None }
    }
}

#[async_trait]
impl CaptureOpener for StillImageOpener {
    async fn open(&self, request: &CaptureRequest) -> DetectorResult<Box<dyn FrameSource>> {
        let source = match &self.path {
            Some(path) => {
                let image = image::open(path).map_err(|e| {
                    DetectorError::CaptureUnavailable(format!("{}: {}", path.display(), e))
                })?;
                StillFrameSource::new(&image, request, path.display().to_string())
            }
            None => StillFrameSource::new(&test_card(request.width, request.height), request, "synthetic"),
        };
        Ok(Box::new(source))
    }
}

/// Red square on a blue background.
pub fn test_card(width: u32, height: u32) -> DynamicImage {
    let mut img = ImageBuffer::new(width.max(1), height.max(1));
    let (w, h) = img.dimensions();
    for (x, y, pixel) in img.enumerate_pixels_mut() {
        let inside = x >= w / 4 && x < w * 3 / 4 && y >= h / 4 && y < h * 3 / 4;
        *pixel = if inside { Rgb([255, 0, 0]) } else { Rgb([0, 0, 255]) };
    }
    DynamicImage::ImageRgb8(img)
}

/// Random probability distribution over a fixed label set.
pub struct SimulatedClassifier {
    labels: Vec<String>,
}

impl SimulatedClassifier {
    pub fn new(labels: Vec<String>) -> Self {
        Self { labels }
    }
}

impl ImageClassifier for SimulatedClassifier {
    fn class_labels(&self) -> &[String] {
        &self.labels
    }

    fn classify(&self, _frame: &Frame) -> DetectorResult<PredictionBatch> {
        let mut rng = rand::thread_rng();
        // Skew towards one class so confident frames actually occur
        let favoured = rng.gen_range(0..self.labels.len().max(1));
        let weights: Vec<f32> = (0..self.labels.len())
            .map(|i| {
                let base: f32 = rng.gen_range(0.0..1.0);
                if i == favoured { base * 6.0 } else { base }
            })
            .collect();
        let total: f32 = weights.iter().sum::<f32>().max(f32::EPSILON);

        PredictionBatch::new(
            self.labels
                .iter()
                .zip(weights)
                .map(|(label, w)| ClassPrediction::new(label.clone(), w / total))
                .collect(),
        )
    }
}

/// Hands out a [`SimulatedClassifier`] without fetching anything.
pub struct SimulatedModelLoader {
    labels: Vec<String>,
}

impl SimulatedModelLoader {
    pub fn new(labels: Vec<String>) -> Self {
        Self { labels }
    }
}

#[async_trait]
impl ModelLoader for SimulatedModelLoader {
    async fn initialize(
        &self,
        _model: &ModelSource,
        _metadata: &ModelSource,
    ) -> DetectorResult<Arc<dyn ImageClassifier>> {
        if self.labels.is_empty() {
            return Err(DetectorError::ModelUnavailable(
                "simulated classifier has no labels".to_string(),
            ));
        }
        Ok(Arc::new(SimulatedClassifier::new(self.labels.clone())))
    }
}

/// Test double: replays queued results, then repeats the last one.
pub struct ScriptedClassifier {
    labels: Vec<String>,
    script: Mutex<VecDeque<DetectorResult<Vec<ClassPrediction>>>>,
    last: Mutex<Option<Vec<ClassPrediction>>>,
    calls: AtomicU64,
}

impl ScriptedClassifier {
    pub fn new(script: Vec<DetectorResult<Vec<ClassPrediction>>>) -> Self {
        let labels = script
            .iter()
            .flatten()
            .flatten()
            .map(|p| p.label.clone())
            .fold(Vec::new(), |mut labels, label| {
                if !labels.contains(&label) {
                    labels.push(label);
                }
                labels
            });

        Self {
            labels,
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            calls: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ImageClassifier for ScriptedClassifier {
    fn class_labels(&self) -> &[String] {
        &self.labels
    }

    fn classify(&self, _frame: &Frame) -> DetectorResult<PredictionBatch> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().pop_front() {
            Some(Ok(predictions)) => {
                *self.last.lock() = Some(predictions.clone());
                PredictionBatch::new(predictions)
            }
            Some(Err(e)) => Err(e),
            None => match self.last.lock().clone() {
                Some(predictions) => PredictionBatch::new(predictions),
                None => Err(DetectorError::Inference("script exhausted".to_string())),
            },
        }
    }
}

/// Test double: loader that always returns the same classifier handle.
pub struct FixedModelLoader {
    classifier: Arc<dyn ImageClassifier>,
}

impl FixedModelLoader {
    pub fn new(classifier: Arc<dyn ImageClassifier>) -> Self {
        Self { classifier }
    }
}

#[async_trait]
impl ModelLoader for FixedModelLoader {
    async fn initialize(
        &self,
        _model: &ModelSource,
        _metadata: &ModelSource,
    ) -> DetectorResult<Arc<dyn ImageClassifier>> {
        Ok(Arc::clone(&self.classifier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FRAME_SIZE;

    fn frame() -> Frame {
        Frame::render(&test_card(8, 8), FRAME_SIZE, FRAME_SIZE, 0)
    }

    #[test]
    fn simulated_batches_are_distributions() {
        let labels = vec!["1-2".to_string(), "7-8".to_string(), "00-no".to_string()];
        let classifier = SimulatedClassifier::new(labels.clone());
        for _ in 0..20 {
            let batch = classifier.classify(&frame()).unwrap();
            assert_eq!(batch.len(), labels.len());
            let sum: f32 = batch.predictions().iter().map(|p| p.probability).sum();
            assert!((sum - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn scripted_classifier_replays_then_repeats() {
        let classifier = ScriptedClassifier::new(vec![
            Ok(vec![ClassPrediction::new("1-2", 0.9)]),
            Err(DetectorError::Inference("backend hiccup".to_string())),
            Ok(vec![ClassPrediction::new("7-8", 0.8)]),
        ]);
        assert_eq!(classifier.class_labels(), &["1-2".to_string(), "7-8".to_string()]);

        assert_eq!(classifier.classify(&frame()).unwrap().top().label, "1-2");
        assert!(classifier.classify(&frame()).is_err());
        assert_eq!(classifier.classify(&frame()).unwrap().top().label, "7-8");
        assert_eq!(classifier.classify(&frame()).unwrap().top().label, "7-8");
        assert_eq!(classifier.calls(), 4);
    }

    #[tokio::test]
    async fn fixed_loader_shares_one_classifier() {
        let classifier: Arc<dyn ImageClassifier> =
            Arc::new(ScriptedClassifier::new(vec![Ok(vec![ClassPrediction::new("1-2", 0.9)])]));
        let loader = FixedModelLoader::new(Arc::clone(&classifier));
        let source = ModelSource::parse("model/model.onnx");

        let first = loader.initialize(&source, &source).await.unwrap();
        let second = loader.initialize(&source, &source).await.unwrap();
        assert!(Arc::ptr_eq(&first, &classifier));
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn still_opener_repeats_the_same_frame() {
        let request = CaptureRequest::default();
        let source = StillImageOpener::synthetic().open(&request).await.unwrap();
        let a = source.current_frame().unwrap();
        let b = source.current_frame().unwrap();
        assert_eq!(a.image, b.image);
        assert_eq!(a.image.dimensions(), (FRAME_SIZE, FRAME_SIZE));
    }

    #[tokio::test]
    async fn missing_still_image_is_capture_unavailable() {
        let result = StillImageOpener::from_file("/nonexistent/tool.png")
            .open(&CaptureRequest::default())
            .await;
        assert!(matches!(result, Err(DetectorError::CaptureUnavailable(_))));
    }
}
