// src/lib.rs
pub mod assembler;
pub mod classifier;
pub mod config;
pub mod data;
pub mod error;
pub mod features;
pub mod labels;
pub mod landmarks;
pub mod live;
pub mod model;
pub mod normalization;
pub mod npy;
pub mod pipeline;
pub mod quality;
pub mod video;

pub use assembler::{PoseSequence, SamplingStrategy, SequenceAssembler};
pub use classifier::{ConfidenceBand, PredictionResult, SequenceClassifier};
pub use config::{RecognizerConfig, ResourceLocator};
pub use error::{RecognitionError, ShapeMismatch};
pub use features::{FeatureEncoder, FeatureLayout, FrameFeatureVector, FEATURE_DIM};
pub use landmarks::{FrameLandmarks, LandmarkAdapter, LandmarkDetector};
pub use model::{LstmNetwork, SequenceModel};
pub use normalization::{NormalizationParameters, NormalizedSequence, Normalizer};
pub use pipeline::{Recognition, RecognitionRequest, Recognizer};
pub use quality::{QualityScore, QualityScorer};
