use thiserror::Error;

/// Failures surfaced by the detection pipeline.
///
/// `ModelUnavailable` and `CaptureUnavailable` abort a start attempt;
/// `Inference` is reported per cycle and never stops a running loop.
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("camera unavailable: {0}")]
    CaptureUnavailable(String),

    #[error("inference failed: {0}")]
    Inference(String),
}

pub type DetectorResult<T> = std::result::Result<T, DetectorError>;

impl DetectorError {
    /// Whether this error must abort the start sequence.
    pub fn is_blocking(&self) -> bool {
        !matches!(self, DetectorError::Inference(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_inference_errors_are_non_blocking() {
        assert!(DetectorError::ModelUnavailable("x".into()).is_blocking());
        assert!(DetectorError::CaptureUnavailable("x".into()).is_blocking());
        assert!(!DetectorError::Inference("x".into()).is_blocking());
    }

    #[test]
    fn messages_carry_the_cause() {
        let err = DetectorError::CaptureUnavailable("permission denied".into());
        assert_eq!(err.to_string(), "camera unavailable: permission denied");
    }
}
