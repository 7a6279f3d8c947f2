use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{DetectorError, DetectorResult};
use crate::labels::LabelRegistry;

/// Minimum top-class probability for a registered label to be shown.
pub const CONFIDENCE_THRESHOLD: f32 = 0.60;

/// Shown when the top prediction carries an empty label.
pub const UNCERTAIN_PLACEHOLDER: &str = "Uncertain";

pub const LOW_CONFIDENCE_TEXT: &str = "Low confidence - adjust tool position and lighting";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassPrediction {
    pub label: String,
    pub probability: f32,
}

impl ClassPrediction {
    pub fn new(label: impl Into<String>, probability: f32) -> Self {
        Self {
            label: label.into(),
            probability,
        }
    }
}

/// One classifier result covering every known class. Never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionBatch {
    predictions: Vec<ClassPrediction>,
}

impl PredictionBatch {
    pub fn new(predictions: Vec<ClassPrediction>) -> DetectorResult<Self> {
        if predictions.is_empty() {
            return Err(DetectorError::Inference(
                "classifier returned no predictions".to_string(),
            ));
        }
        Ok(Self { predictions })
    }

    /// Highest-probability prediction. Ties go to the earliest entry.
    pub fn top(&self) -> &ClassPrediction {
        let mut best = &self.predictions[0];
        for prediction in &self.predictions[1..] {
            if prediction.probability > best.probability {
                best = prediction;
            }
        }
        best
    }

    pub fn predictions(&self) -> &[ClassPrediction] {
        &self.predictions
    }

    pub fn len(&self) -> usize {
        self.predictions.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    LowConfidence,
    UnknownClass(String),
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::LowConfidence => f.write_str(LOW_CONFIDENCE_TEXT),
            Warning::UnknownClass(label) => write!(f, "Unknown class: {}", label),
        }
    }
}

/// What the presentation surface should show for one classification.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayDecision {
    pub shown_name: String,
    /// Diagram to display, `None` hides the diagram region
    pub diagram: Option<String>,
    pub warning: Option<Warning>,
    /// Raw label of the top prediction
    pub label: String,
    /// Probability of the top prediction
    pub confidence: f32,
}

impl DisplayDecision {
    /// True when a registered label passed the confidence gate.
    pub fn is_match(&self) -> bool {
        self.warning.is_none()
    }

    pub fn confidence_readout(&self) -> String {
        format_confidence(self.confidence)
    }
}

/// Percentage with one decimal place, e.g. `82.0%`.
pub fn format_confidence(confidence: f32) -> String {
    format!("{:.1}%", confidence * 100.0)
}

/// Confidence gate applied to the top prediction of each batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionPolicy {
    threshold: f32,
}

impl DecisionPolicy {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn decide(&self, batch: &PredictionBatch, registry: &LabelRegistry) -> DisplayDecision {
        let top = batch.top();
        let confidence = top.probability;
        let label = top.label.as_str();
        let confident = confidence >= self.threshold;

        match registry.lookup(label) {
            Some(entry) if confident => DisplayDecision {
                shown_name: entry.display_name.clone(),
                diagram: Some(entry.diagram.clone()),
                warning: None,
                label: label.to_string(),
                confidence,
            },
            _ => {
                let shown_name = if label.is_empty() {
                    UNCERTAIN_PLACEHOLDER.to_string()
                } else {
                    label.to_string()
                };
                let warning = if confident {
                    Warning::UnknownClass(label.to_string())
                } else {
                    Warning::LowConfidence
                };
                DisplayDecision {
                    shown_name,
                    diagram: None,
                    warning: Some(warning),
                    label: label.to_string(),
                    confidence,
                }
            }
        }
    }
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self::new(CONFIDENCE_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(entries: &[(&str, f32)]) -> PredictionBatch {
        PredictionBatch::new(
            entries
                .iter()
                .map(|(label, p)| ClassPrediction::new(*label, *p))
                .collect(),
        )
        .unwrap()
    }

    fn decide(entries: &[(&str, f32)]) -> DisplayDecision {
        DecisionPolicy::default().decide(&batch(entries), &LabelRegistry::tools())
    }

    #[test]
    fn empty_batch_is_rejected() {
        assert!(matches!(
            PredictionBatch::new(Vec::new()),
            Err(DetectorError::Inference(_))
        ));
    }

    #[test]
    fn top_picks_strict_maximum() {
        let b = batch(&[("a", 0.1), ("b", 0.7), ("c", 0.2)]);
        assert_eq!(b.top().label, "b");
    }

    #[test]
    fn top_breaks_ties_by_first_occurrence() {
        let b = batch(&[("a", 0.1), ("b", 0.45), ("c", 0.45)]);
        assert_eq!(b.top().label, "b");

        let b = batch(&[("x", 0.5), ("y", 0.5)]);
        assert_eq!(b.top().label, "x");
    }

    #[test]
    fn confident_registered_label_shows_entry() {
        let d = decide(&[("1-2", 0.82), ("00-no", 0.10), ("7-8", 0.08)]);
        assert_eq!(d.shown_name, "Tool 1-2");
        assert_eq!(d.diagram.as_deref(), Some("./mouth-diagrams/1-2.png"));
        assert_eq!(d.warning, None);
        assert!(d.is_match());
        assert_eq!(d.confidence_readout(), "82.0%");
    }

    #[test]
    fn threshold_is_inclusive() {
        let d = decide(&[("9-10", 0.60), ("00-no", 0.40)]);
        assert_eq!(d.shown_name, "Tool 9-10");
        assert!(d.is_match());
    }

    #[test]
    fn low_confidence_shows_raw_label_without_diagram() {
        let d = decide(&[("1-2", 0.40), ("00-no", 0.35)]);
        assert_eq!(d.shown_name, "1-2");
        assert_eq!(d.diagram, None);
        assert_eq!(d.warning, Some(Warning::LowConfidence));
        assert_eq!(
            d.warning.unwrap().to_string(),
            "Low confidence - adjust tool position and lighting"
        );
    }

    #[test]
    fn low_confidence_wins_over_unknown_class() {
        let d = decide(&[("mystery", 0.30), ("1-2", 0.20)]);
        assert_eq!(d.shown_name, "mystery");
        assert_eq!(d.warning, Some(Warning::LowConfidence));
    }

    #[test]
    fn confident_unknown_label_is_flagged() {
        let d = decide(&[("unknown-x", 0.91)]);
        assert_eq!(d.shown_name, "unknown-x");
        assert_eq!(d.diagram, None);
        assert_eq!(d.warning.as_ref().unwrap().to_string(), "Unknown class: unknown-x");
        assert!(!d.is_match());
    }

    #[test]
    fn empty_label_shows_placeholder() {
        let d = decide(&[("", 0.2)]);
        assert_eq!(d.shown_name, UNCERTAIN_PLACEHOLDER);
        assert_eq!(d.warning, Some(Warning::LowConfidence));
    }

    #[test]
    fn no_tool_class_keeps_its_diagram() {
        let d = decide(&[("00-no", 0.95)]);
        assert_eq!(d.shown_name, "No Tool");
        assert_eq!(d.diagram.as_deref(), Some("./mouth-diagrams/00-no.png"));
    }

    #[test]
    fn decisions_are_repeatable() {
        let b = batch(&[("13-14", 0.61), ("17-18", 0.39)]);
        let registry = LabelRegistry::tools();
        let policy = DecisionPolicy::default();
        assert_eq!(policy.decide(&b, &registry), policy.decide(&b, &registry));
    }

    #[test]
    fn readout_rounds_to_one_decimal() {
        assert_eq!(format_confidence(0.0), "0.0%");
        assert_eq!(format_confidence(1.0), "100.0%");
        assert_eq!(format_confidence(0.4567), "45.7%");
    }
}
