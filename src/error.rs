// src/error.rs
use thiserror::Error;
use uuid::Uuid;

/// Sequence or frame that does not have the shape the model was trained on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("shape mismatch: expected ({expected_frames}, {expected_features}), got ({frames}, {features})")]
pub struct ShapeMismatch {
    pub expected_frames: usize,
    pub expected_features: usize,
    pub frames: usize,
    /// Width of the first frame that disagrees (or of the first frame when the
    /// frame count is wrong).
    pub features: usize,
}

#[derive(Debug, Error)]
pub enum NormalizationError {
    #[error("normalization file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid normalization json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid normalization csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("invalid npy data: {0}")]
    Npy(String),
    #[error("expected {expected} features, found {found}")]
    WidthMismatch { expected: usize, found: usize },
    #[error("non-finite value at feature {index}")]
    NonFinite { index: usize },
    #[error("negative standard deviation at feature {index}")]
    NegativeStd { index: usize },
    #[error("no frames to fit normalization statistics")]
    EmptyCorpus,
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid model weights: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid model definition: {0}")]
    Definition(String),
    #[error("model output is not a probability distribution: {0}")]
    NotADistribution(String),
}

#[derive(Debug, Error)]
pub enum LabelError {
    #[error("class mapping file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid class mapping json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("class mapping is empty")]
    Empty,
    #[error("class mapping key {0:?} is not an integer index")]
    BadIndex(String),
    #[error("class indices are not contiguous: missing index {0}")]
    Gap(usize),
    #[error("label {label:?} is used by both {first} and {second}")]
    DuplicateLabel { label: String, first: usize, second: usize },
    #[error("class_to_index disagrees with index_to_class for {0:?}")]
    Inconsistent(String),
}

/// Sequence-level failures surfaced to the caller. Per-frame problems never
/// end up here; they are absorbed as zero-filled frames.
#[derive(Debug, Error)]
pub enum RecognitionError {
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),
    #[error("no landmarks detected in any of {frames} frames")]
    DetectionEmpty { frames: usize },
    #[error(transparent)]
    Shape(#[from] ShapeMismatch),
    #[error("class index {index} has no label (vocabulary size {vocabulary})")]
    UnknownClass { index: usize, vocabulary: usize },
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Labels(#[from] LabelError),
    #[error("required resource {0} not found in any configured location")]
    ResourceUnresolved(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("session {0} is unknown or unusable")]
    SessionUnavailable(Uuid),
    #[error("session {0} was reset while the request was in flight")]
    SessionReset(Uuid),
    #[error("worker task failed: {0}")]
    Worker(String),
}

impl RecognitionError {
    /// Stable machine-readable reason code.
    pub fn reason_code(&self) -> &'static str {
        match self {
            RecognitionError::ExtractionFailed(_) => "extraction_failed",
            RecognitionError::DetectionEmpty { .. } => "detection_empty",
            RecognitionError::Shape(_) => "shape_mismatch",
            RecognitionError::UnknownClass { .. } => "unknown_class",
            RecognitionError::Model(_) => "model_error",
            RecognitionError::Labels(_) => "label_mapping_error",
            RecognitionError::ResourceUnresolved(_) => "resource_unresolved",
            RecognitionError::Config(_) => "config_error",
            RecognitionError::SessionUnavailable(_) => "session_unavailable",
            RecognitionError::SessionReset(_) => "session_reset",
            RecognitionError::Worker(_) => "worker_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes_are_stable() {
        let err = RecognitionError::DetectionEmpty { frames: 3 };
        assert_eq!(err.reason_code(), "detection_empty");

        let err: RecognitionError = ShapeMismatch {
            expected_frames: 30,
            expected_features: 288,
            frames: 29,
            features: 288,
        }
        .into();
        assert_eq!(err.reason_code(), "shape_mismatch");
        assert!(err.to_string().contains("(29, 288)"));
    }
}
