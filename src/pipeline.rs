// src/pipeline.rs - End-to-end recognition: frames -> sequence -> normalized -> label
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::assembler::{AssembledSequence, AssemblyStats, ScoredFrame, SequenceAssembler};
use crate::classifier::{ConfidenceAnalysis, PredictionResult, SequenceClassifier};
use crate::config::{RecognizerConfig, ResolvedResources, ResourceLocator};
use crate::error::RecognitionError;
use crate::labels::ClassLabelMap;
use crate::landmarks::{FrameLandmarks, LandmarkAdapter, LandmarkDetector};
use crate::model::{LstmNetwork, SequenceModel};
use crate::normalization::{NormalizationParameters, Normalizer};
use crate::video::FrameSource;

/// One clip to recognize.
pub struct RecognitionRequest {
    pub source: FrameSource,
    /// Vocabulary size the caller was built against, if it cares.
    pub expected_classes: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recognition {
    pub prediction: PredictionResult,
    pub analysis: ConfidenceAnalysis,
    pub stats: AssemblyStats,
}

pub struct Recognizer {
    config: RecognizerConfig,
    assembler: SequenceAssembler,
    normalizer: Normalizer,
    classifier: SequenceClassifier,
}

impl Recognizer {
    pub fn new(
        config: RecognizerConfig,
        model: Arc<dyn SequenceModel>,
        labels: Arc<ClassLabelMap>,
        params: Option<Arc<NormalizationParameters>>,
    ) -> Result<Self, RecognitionError> {
        config.validate()?;

        let params = params.filter(|p| usable_params(p, &config));
        let normalizer = Normalizer::new(params, config.normalization.clip);
        let classifier =
            SequenceClassifier::new(model, labels, config.sequence_length, config.feature_dim)?;
        let assembler = SequenceAssembler::new(
            config.encoder(),
            config.quality_scorer(),
            config.assembly_options(),
        );

        Ok(Self {
            config,
            assembler,
            normalizer,
            classifier,
        })
    }

    /// Resolves artifacts through the configured search path and loads them.
    pub fn from_config(config: RecognizerConfig) -> Result<Self, RecognitionError> {
        let resources = ResourceLocator::from_settings(&config.resources).resolve(&config.resources)?;
        Self::from_resources(config, &resources)
    }

    pub fn from_resources(
        config: RecognizerConfig,
        resources: &ResolvedResources,
    ) -> Result<Self, RecognitionError> {
        let model = LstmNetwork::load_json(&resources.model)?;
        let labels = ClassLabelMap::load_json(&resources.labels)?;

        // broken statistics downgrade to unnormalized inference
        let params = match &resources.normalization {
            Some(source) => match source.load(config.normalization.std_epsilon) {
                Ok(params) => Some(Arc::new(params)),
                Err(e) => {
                    warn!("Ignoring normalization parameters from {:?}: {}", source, e);
                    None
                }
            },
            None => None,
        };

        Self::new(config, Arc::new(model), Arc::new(labels), params)
    }

    pub fn config(&self) -> &RecognizerConfig {
        &self.config
    }

    pub fn assembler(&self) -> &SequenceAssembler {
        &self.assembler
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub fn classifier(&self) -> &SequenceClassifier {
        &self.classifier
    }

    pub fn new_adapter(
        &self,
        detector: Box<dyn LandmarkDetector>,
    ) -> Result<LandmarkAdapter, RecognitionError> {
        LandmarkAdapter::new(
            detector,
            self.config.detector.settings.clone(),
            self.config.detector.max_frame_width,
        )
        .map_err(|e| RecognitionError::Config(format!("detector rejected settings: {:#}", e)))
    }

    pub fn recognize(
        &self,
        request: RecognitionRequest,
        detector: Box<dyn LandmarkDetector>,
    ) -> Result<Recognition, RecognitionError> {
        if let Some(expected) = request.expected_classes {
            if expected != self.classifier.num_classes() {
                return Err(RecognitionError::Config(format!(
                    "request expects {} classes but the model has {}",
                    expected,
                    self.classifier.num_classes()
                )));
            }
        }
        let mut source = request.source;
        let mut adapter = self.new_adapter(detector)?;
        self.recognize_source(&mut source, &mut adapter)
    }

    pub fn recognize_source(
        &self,
        source: &mut FrameSource,
        adapter: &mut LandmarkAdapter,
    ) -> Result<Recognition, RecognitionError> {
        let assembled = self.assembler.assemble_source(source, adapter)?;
        let adapter_stats = adapter.stats();
        if adapter_stats.failed > 0 {
            warn!(
                "Detector failed on {} of {} frames",
                adapter_stats.failed, adapter_stats.processed
            );
        }
        self.infer(assembled)
    }

    pub fn recognize_landmarks(&self, frames: &[FrameLandmarks]) -> Result<Recognition, RecognitionError> {
        let assembled = self.assembler.assemble_landmarks(frames)?;
        self.infer(assembled)
    }

    pub fn recognize_scored(&self, frames: Vec<ScoredFrame>) -> Result<Recognition, RecognitionError> {
        let assembled = self.assembler.assemble_scored(frames)?;
        self.infer(assembled)
    }

    /// Normalizes and classifies an assembled sequence.
    pub fn infer(&self, assembled: AssembledSequence) -> Result<Recognition, RecognitionError> {
        let AssembledSequence { sequence, stats } = assembled;
        let normalized = self.normalizer.apply(sequence)?;
        if !normalized.is_applied() {
            warn!("Normalization parameters unavailable; classifying raw features");
        }

        let classification = self.classifier.classify(&normalized)?;

        info!(
            "Recognized {:?} ({:.3}) from {} raw / {} kept frames, {} padded, avg quality {:.2}, normalized={}",
            classification.prediction.label,
            classification.prediction.confidence,
            stats.raw_frames,
            stats.filtered_frames,
            stats.padding,
            stats.avg_quality,
            classification.prediction.normalized
        );

        Ok(Recognition {
            prediction: classification.prediction,
            analysis: classification.analysis,
            stats,
        })
    }
}

fn usable_params(params: &NormalizationParameters, config: &RecognizerConfig) -> bool {
    if let Err(e) = params.check_width(config.feature_dim) {
        warn!("Normalization parameters unusable: {}", e);
        return false;
    }
    match &params.metadata().detector {
        Some(fitted) if *fitted != config.detector.settings => {
            warn!(
                "Normalization parameters were fitted with detector settings {:?}, running with {:?}; ignoring them",
                fitted, config.detector.settings
            );
            false
        }
        _ => true,
    }
}
