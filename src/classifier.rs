// src/classifier.rs - Shape-checked sequence classification and confidence reporting
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{ModelError, RecognitionError};
use crate::labels::ClassLabelMap;
use crate::model::SequenceModel;
use crate::normalization::NormalizedSequence;

/// Allowed drift of the output sum away from 1.
const DISTRIBUTION_TOLERANCE: f32 = 1e-2;
const LOW_CONFIDENCE_WARNING: f32 = 0.3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResult {
    pub label: String,
    pub confidence: f32,
    pub class_index: usize,
    /// Whether normalization statistics were applied to the input.
    pub normalized: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConfidenceBand {
    High,
    Medium,
    Low,
}

impl ConfidenceBand {
    pub fn from_confidence(confidence: f32) -> Self {
        if confidence >= 0.85 {
            ConfidenceBand::High
        } else if confidence >= 0.5 {
            ConfidenceBand::Medium
        } else {
            ConfidenceBand::Low
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub class_index: usize,
    pub label: String,
    pub probability: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfidenceAnalysis {
    pub top: Vec<Candidate>,
    pub entropy: f32,
    /// Best minus second-best probability.
    pub gap: f32,
    pub band: ConfidenceBand,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub prediction: PredictionResult,
    pub analysis: ConfidenceAnalysis,
}

pub struct SequenceClassifier {
    model: Arc<dyn SequenceModel>,
    labels: Arc<ClassLabelMap>,
    sequence_length: usize,
    feature_dim: usize,
}

impl SequenceClassifier {
    pub fn new(
        model: Arc<dyn SequenceModel>,
        labels: Arc<ClassLabelMap>,
        sequence_length: usize,
        feature_dim: usize,
    ) -> Result<Self, RecognitionError> {
        let expected = (sequence_length, feature_dim);
        if model.input_shape() != expected {
            return Err(RecognitionError::Model(ModelError::Definition(format!(
                "model expects input {:?}, pipeline produces {:?}",
                model.input_shape(),
                expected
            ))));
        }
        if model.num_classes() != labels.len() {
            return Err(RecognitionError::Config(format!(
                "model has {} outputs but the class mapping has {} labels",
                model.num_classes(),
                labels.len()
            )));
        }
        Ok(Self {
            model,
            labels,
            sequence_length,
            feature_dim,
        })
    }

    pub fn labels(&self) -> &ClassLabelMap {
        &self.labels
    }

    pub fn num_classes(&self) -> usize {
        self.model.num_classes()
    }

    /// Rejects anything that is not (sequence_length, feature_dim).
    pub fn validate(&self, input: &NormalizedSequence) -> Result<(), RecognitionError> {
        input
            .sequence()
            .check_shape(self.sequence_length, self.feature_dim)
            .map_err(RecognitionError::from)
    }

    pub fn predict(&self, input: &NormalizedSequence) -> Result<PredictionResult, RecognitionError> {
        let probabilities = self.probabilities(input)?;
        self.result_for(&probabilities, input.is_applied())
    }

    /// Prediction plus the top candidates and spread of the distribution.
    pub fn classify(&self, input: &NormalizedSequence) -> Result<Classification, RecognitionError> {
        let probabilities = self.probabilities(input)?;
        let prediction = self.result_for(&probabilities, input.is_applied())?;
        let analysis = self.analyze(&probabilities);
        Ok(Classification { prediction, analysis })
    }

    fn probabilities(&self, input: &NormalizedSequence) -> Result<Vec<f32>, RecognitionError> {
        self.validate(input)?;
        let probabilities = self.model.predict(input.sequence())?;
        check_distribution(&probabilities)?;

        let vocabulary = self.labels.len();
        if probabilities.len() != vocabulary {
            let (index, _) = argmax(&probabilities);
            if index >= vocabulary {
                return Err(RecognitionError::UnknownClass { index, vocabulary });
            }
            return Err(ModelError::NotADistribution(format!(
                "{} outputs for {} classes",
                probabilities.len(),
                vocabulary
            ))
            .into());
        }
        Ok(probabilities)
    }

    fn result_for(
        &self,
        probabilities: &[f32],
        normalized: bool,
    ) -> Result<PredictionResult, RecognitionError> {
        let (class_index, confidence) = argmax(probabilities);
        let label = self
            .labels
            .label(class_index)
            .ok_or(RecognitionError::UnknownClass {
                index: class_index,
                vocabulary: self.labels.len(),
            })?;

        if confidence < LOW_CONFIDENCE_WARNING {
            warn!("Low confidence prediction: {} ({:.3})", label, confidence);
        } else {
            debug!("Predicted {} ({:.3})", label, confidence);
        }

        Ok(PredictionResult {
            label: label.to_string(),
            confidence: confidence.clamp(0.0, 1.0),
            class_index,
            normalized,
        })
    }

    fn analyze(&self, probabilities: &[f32]) -> ConfidenceAnalysis {
        let mut order: Vec<usize> = (0..probabilities.len()).collect();
        // stable sort keeps lower indices first among equals
        order.sort_by(|a, b| probabilities[*b].total_cmp(&probabilities[*a]));

        let top = order
            .iter()
            .take(3)
            .map(|i| Candidate {
                class_index: *i,
                label: self
                    .labels
                    .label(*i)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("class_{}", i)),
                probability: probabilities[*i],
            })
            .collect::<Vec<_>>();

        let entropy = -probabilities
            .iter()
            .map(|p| p * (p + 1e-8).ln())
            .sum::<f32>();
        let best = top.first().map_or(0.0, |c| c.probability);
        let second = top.get(1).map_or(0.0, |c| c.probability);

        ConfidenceAnalysis {
            top,
            entropy,
            gap: best - second,
            band: ConfidenceBand::from_confidence(best),
        }
    }
}

/// First index wins on ties.
fn argmax(values: &[f32]) -> (usize, f32) {
    let mut best = (0, f32::NEG_INFINITY);
    for (i, v) in values.iter().enumerate() {
        if *v > best.1 {
            best = (i, *v);
        }
    }
    best
}

fn check_distribution(probabilities: &[f32]) -> Result<(), ModelError> {
    if probabilities.is_empty() {
        return Err(ModelError::NotADistribution("empty output".to_string()));
    }
    if let Some(i) = probabilities.iter().position(|p| !p.is_finite() || *p < 0.0) {
        return Err(ModelError::NotADistribution(format!(
            "entry {} is {}",
            i, probabilities[i]
        )));
    }
    let sum: f32 = probabilities.iter().sum();
    if (sum - 1.0).abs() > DISTRIBUTION_TOLERANCE {
        return Err(ModelError::NotADistribution(format!("sums to {}", sum)));
    }
    Ok(())
}
