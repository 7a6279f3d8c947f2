use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::camera::{CaptureOpener, CaptureRequest, FrameSource};
use crate::decision::{format_confidence, DecisionPolicy, PredictionBatch, CONFIDENCE_THRESHOLD};
use crate::error::{DetectorError, DetectorResult};
use crate::labels::LabelRegistry;
use crate::models::{ImageClassifier, ModelLoader, ModelSource};
use crate::presentation::PresentationSink;

/// Pause between the end of one cycle and the start of the next.
pub const CYCLE_DELAY: Duration = Duration::from_millis(150);

/// How long a torch request may hold up the start sequence.
const ILLUMINATION_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub model: ModelSource,
    pub metadata: ModelSource,
    pub capture: CaptureRequest,
    pub confidence_threshold: f32,
    pub cycle_delay: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            model: ModelSource::parse("model/model.onnx"),
            metadata: ModelSource::parse("model/metadata.json"),
            capture: CaptureRequest::default(),
            confidence_threshold: CONFIDENCE_THRESHOLD,
            cycle_delay: CYCLE_DELAY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub cycles: u64,
    pub decisions: u64,
    pub failures: u64,
}

/// Resources owned for the lifetime of one Running period.
struct DetectionSession {
    classifier: Arc<dyn ImageClassifier>,
    capture: Box<dyn FrameSource>,
    registry: Arc<LabelRegistry>,
    policy: DecisionPolicy,
    cycle_delay: Duration,
    stats: LoopStats,
}

impl DetectionSession {
    async fn run(mut self, sink: Arc<dyn PresentationSink>, cancel: CancellationToken) -> LoopStats {
        info!(
            "Classification loop running on {} (threshold {})",
            self.capture.describe(),
            self.policy.threshold()
        );

        while !cancel.is_cancelled() {
            self.run_cycle(sink.as_ref()).await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.cycle_delay) => {}
            }
        }

        self.capture.stop();
        info!(
            "Classification loop stopped after {} cycles ({} decisions, {} failures)",
            self.stats.cycles, self.stats.decisions, self.stats.failures
        );
        self.stats
    }

    async fn run_cycle(&mut self, sink: &dyn PresentationSink) {
        self.stats.cycles += 1;

        match self.classify_current_frame().await {
            Ok(batch) => {
                let decision = self.policy.decide(&batch, &self.registry);
                debug!(
                    "Detected: {} at {}",
                    decision.label,
                    format_confidence(decision.confidence)
                );

                sink.show_decision(&decision);
                if decision.is_match() {
                    sink.show_status(&format!("✓ {} detected!", decision.shown_name), false);
                }
                self.stats.decisions += 1;
            }
            Err(e) => {
                self.stats.failures += 1;
                sink.show_status(&format!("Prediction error: {}", e), true);
            }
        }
    }

    async fn classify_current_frame(&mut self) -> DetectorResult<PredictionBatch> {
        let frame = self.capture.current_frame()?;
        let classifier = Arc::clone(&self.classifier);

        tokio::task::spawn_blocking(move || classifier.classify(&frame))
            .await
            .map_err(|e| DetectorError::Inference(format!("inference task failed: {}", e)))?
    }
}

struct RunningLoop {
    cancel: CancellationToken,
    task: JoinHandle<LoopStats>,
}

/// Drives the Idle → Running → Idle lifecycle of the detector.
pub struct ClassificationLoop {
    settings: LoopSettings,
    registry: Arc<LabelRegistry>,
    sink: Arc<dyn PresentationSink>,
    running: Option<RunningLoop>,
}

impl ClassificationLoop {
    pub fn new(settings: LoopSettings, registry: LabelRegistry, sink: Arc<dyn PresentationSink>) -> Self {
        Self {
            settings,
            registry: Arc::new(registry),
            sink,
            running: None,
        }
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    pub fn state(&self) -> LoopState {
        match &self.running {
            Some(running) if !running.task.is_finished() => LoopState::Running,
            _ => LoopState::Idle,
        }
    }

    /// Acquire the classifier and the camera, then start cycling.
    ///
    /// Either acquisition failing leaves the loop Idle with nothing held.
    /// Starting an already running loop does nothing.
    pub async fn start(
        &mut self,
        loader: &dyn ModelLoader,
        opener: &dyn CaptureOpener,
    ) -> DetectorResult<()> {
        if self.state() == LoopState::Running {
            warn!("Classification loop already running");
            return Ok(());
        }
        // Reap a loop that ended on its own
        self.running = None;

        let classifier = self.load_classifier(loader).await?;
        let mut capture = self.open_capture(opener).await?;

        if self.settings.capture.illumination {
            match tokio::time::timeout(ILLUMINATION_TIMEOUT, capture.enable_illumination()).await {
                Ok(Ok(())) => {
                    info!("✓ Torch enabled");
                    self.sink.show_status("Camera started with flash!", false);
                }
                Ok(Err(e)) => debug!("Torch not available: {}", e),
                Err(_) => debug!("Torch request timed out"),
            }
        }
        self.sink.show_status("Ready to detect tools!", false);

        let session = DetectionSession {
            classifier,
            capture,
            registry: Arc::clone(&self.registry),
            policy: DecisionPolicy::new(self.settings.confidence_threshold),
            cycle_delay: self.settings.cycle_delay,
            stats: LoopStats::default(),
        };

        let cancel = CancellationToken::new();
        let task = tokio::spawn(session.run(Arc::clone(&self.sink), cancel.clone()));
        self.running = Some(RunningLoop { cancel, task });
        Ok(())
    }

    /// Cancel the running loop and wait for it to release its resources.
    pub async fn stop(&mut self) -> Option<LoopStats> {
        let running = self.running.take()?;
        running.cancel.cancel();

        match running.task.await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!("Classification loop task ended abnormally: {}", e);
                None
            }
        }
    }

    async fn load_classifier(&self, loader: &dyn ModelLoader) -> DetectorResult<Arc<dyn ImageClassifier>> {
        self.sink.show_status("Loading AI model...", false);

        let classifier = match loader
            .initialize(&self.settings.model, &self.settings.metadata)
            .await
        {
            Ok(classifier) => classifier,
            Err(e) => {
                self.sink
                    .show_status(&format!("Failed to load model: {}", e), true);
                return Err(e);
            }
        };

        let labels = classifier.class_labels();
        info!("Available classes: {}", labels.join(", "));
        for label in self.registry.unregistered(labels) {
            warn!("Classifier label '{}' has no registry entry", label);
        }

        self.sink
            .show_status("Model loaded! Ready to detect tools.", false);
        Ok(classifier)
    }

    async fn open_capture(&self, opener: &dyn CaptureOpener) -> DetectorResult<Box<dyn FrameSource>> {
        self.sink.show_status("Requesting camera access...", false);

        let request = &self.settings.capture;
        let opened = match tokio::time::timeout(request.negotiation_timeout, opener.open(request)).await {
            Ok(result) => result,
            Err(_) => Err(DetectorError::CaptureUnavailable(format!(
                "camera negotiation timed out after {}ms",
                request.negotiation_timeout.as_millis()
            ))),
        };

        match opened {
            Ok(capture) => {
                self.sink.show_status("Camera started!", false);
                Ok(capture)
            }
            Err(e) => {
                self.sink.show_status(&format!("Camera error: {}", e), true);
                Err(e)
            }
        }
    }
}

impl Drop for ClassificationLoop {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.cancel.cancel();
        }
    }
}
