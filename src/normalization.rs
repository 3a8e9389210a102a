// src/normalization.rs - Z-score statistics: fitting, persistence and application
use chrono::{DateTime, Utc};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::assembler::PoseSequence;
use crate::error::{NormalizationError, ShapeMismatch};
use crate::features::FrameFeatureVector;
use crate::landmarks::DetectorSettings;
use crate::npy;

pub const PARAMS_VERSION: &str = "1.0";

/// Summary of the corpus the parameters were fitted on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamsStatistics {
    pub total_frames: u64,
    pub feature_dimension: usize,
    pub mean_range: [f32; 2],
    pub std_range: [f32; 2],
    pub zero_std_features: usize,
    pub data_range: [f32; 2],
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamsMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<ParamsStatistics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Detector settings the corpus was extracted with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detector: Option<DetectorSettings>,
}

#[derive(Serialize, Deserialize)]
struct ParamsFile {
    feature_means: Vec<f32>,
    feature_stds: Vec<f32>,
    #[serde(flatten)]
    metadata: ParamsMetadata,
}

#[derive(Serialize, Deserialize)]
struct ParamsRow {
    index: usize,
    mean: f32,
    std: f32,
}

/// Per-feature means and standard deviations. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizationParameters {
    means: Vec<f32>,
    stds: Vec<f32>,
    metadata: ParamsMetadata,
}

impl NormalizationParameters {
    /// Validates the arrays; standard deviations below `std_epsilon` are
    /// replaced by it.
    pub fn new(
        means: Vec<f32>,
        mut stds: Vec<f32>,
        std_epsilon: f32,
    ) -> Result<Self, NormalizationError> {
        if means.len() != stds.len() {
            return Err(NormalizationError::WidthMismatch {
                expected: means.len(),
                found: stds.len(),
            });
        }
        if let Some(index) = means
            .iter()
            .chain(stds.iter())
            .position(|v| !v.is_finite())
        {
            return Err(NormalizationError::NonFinite {
                index: index % means.len().max(1),
            });
        }

        if let Some(index) = stds.iter().position(|s| *s < 0.0) {
            return Err(NormalizationError::NegativeStd { index });
        }

        let mut replaced = 0;
        for s in stds.iter_mut() {
            if s.abs() < std_epsilon {
                *s = std_epsilon;
                replaced += 1;
            }
        }
        if replaced > 0 {
            debug!("Replaced {} near-zero standard deviations", replaced);
        }

        Ok(Self {
            means,
            stds,
            metadata: ParamsMetadata::default(),
        })
    }

    pub fn with_metadata(mut self, metadata: ParamsMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn dim(&self) -> usize {
        self.means.len()
    }

    pub fn means(&self) -> &[f32] {
        &self.means
    }

    pub fn stds(&self) -> &[f32] {
        &self.stds
    }

    pub fn metadata(&self) -> &ParamsMetadata {
        &self.metadata
    }

    pub fn check_width(&self, expected: usize) -> Result<(), NormalizationError> {
        if self.dim() != expected {
            return Err(NormalizationError::WidthMismatch {
                expected,
                found: self.dim(),
            });
        }
        Ok(())
    }

    /// What an all-zero raw frame turns into: -mean/std, clipped.
    pub fn normalized_zero_frame(&self, clip: f32) -> FrameFeatureVector {
        FrameFeatureVector::from_vec(
            self.means
                .iter()
                .zip(&self.stds)
                .map(|(m, s)| (-m / s).clamp(-clip, clip))
                .collect(),
        )
    }

    pub fn load_json(path: impl AsRef<Path>, std_epsilon: f32) -> Result<Self, NormalizationError> {
        let file = File::open(path.as_ref())?;
        let raw: ParamsFile = serde_json::from_reader(std::io::BufReader::new(file))?;
        Ok(Self::new(raw.feature_means, raw.feature_stds, std_epsilon)?.with_metadata(raw.metadata))
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<(), NormalizationError> {
        let raw = ParamsFile {
            feature_means: self.means.clone(),
            feature_stds: self.stds.clone(),
            metadata: self.metadata.clone(),
        };
        let file = File::create(path.as_ref())?;
        serde_json::to_writer_pretty(file, &raw)?;
        Ok(())
    }

    pub fn load_csv(path: impl AsRef<Path>, std_epsilon: f32) -> Result<Self, NormalizationError> {
        let mut reader = csv::Reader::from_path(path.as_ref())?;
        let mut rows: Vec<ParamsRow> = reader.deserialize().collect::<Result<_, _>>()?;
        rows.sort_by_key(|r| r.index);
        if let Some(gap) = rows.iter().enumerate().find(|(i, r)| r.index != *i) {
            return Err(NormalizationError::WidthMismatch {
                expected: gap.0,
                found: gap.1.index,
            });
        }
        let (means, stds) = rows.into_iter().map(|r| (r.mean, r.std)).unzip();
        Self::new(means, stds, std_epsilon)
    }

    pub fn save_csv(&self, path: impl AsRef<Path>) -> Result<(), NormalizationError> {
        let mut writer = csv::Writer::from_path(path.as_ref())?;
        for (index, (mean, std)) in self.means.iter().zip(&self.stds).enumerate() {
            writer.serialize(ParamsRow {
                index,
                mean: *mean,
                std: *std,
            })?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Reads a `feature_means.npy` / `feature_stds.npy` pair.
    pub fn load_npy(
        means_path: impl AsRef<Path>,
        stds_path: impl AsRef<Path>,
        std_epsilon: f32,
    ) -> Result<Self, NormalizationError> {
        let means = npy::read_f32_vector(means_path)?;
        let stds = npy::read_f32_vector(stds_path)?;
        Self::new(means, stds, std_epsilon)
    }

    pub fn save_npy(
        &self,
        means_path: impl AsRef<Path>,
        stds_path: impl AsRef<Path>,
    ) -> Result<(), NormalizationError> {
        npy::write_f32_vector(means_path, &self.means)?;
        npy::write_f32_vector(stds_path, &self.stds)
    }
}

/// Streaming mean/variance (Welford) over frames of a fixed width.
#[derive(Debug, Clone)]
pub struct StatsAccumulator {
    count: u64,
    mean: DVector<f64>,
    m2: DVector<f64>,
    min: f64,
    max: f64,
}

impl StatsAccumulator {
    pub fn new(dim: usize) -> Self {
        Self {
            count: 0,
            mean: DVector::zeros(dim),
            m2: DVector::zeros(dim),
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn push(&mut self, frame: &[f32]) -> Result<(), NormalizationError> {
        if frame.len() != self.mean.len() {
            return Err(NormalizationError::WidthMismatch {
                expected: self.mean.len(),
                found: frame.len(),
            });
        }
        if let Some(index) = frame.iter().position(|v| !v.is_finite()) {
            return Err(NormalizationError::NonFinite { index });
        }

        let x = DVector::from_iterator(frame.len(), frame.iter().map(|v| *v as f64));
        self.count += 1;
        let delta = &x - &self.mean;
        self.mean += &delta / self.count as f64;
        let delta2 = &x - &self.mean;
        self.m2 += delta.component_mul(&delta2);

        self.min = self.min.min(x.min());
        self.max = self.max.max(x.max());
        Ok(())
    }

    /// Population statistics of everything pushed so far.
    pub fn finish(&self, std_epsilon: f32) -> Result<NormalizationParameters, NormalizationError> {
        if self.count == 0 {
            return Err(NormalizationError::EmptyCorpus);
        }

        let n = self.count as f64;
        let means: Vec<f32> = self.mean.iter().map(|m| *m as f32).collect();
        let raw_stds: Vec<f32> = self.m2.iter().map(|m2| (m2 / n).sqrt() as f32).collect();
        let zero_std_features = raw_stds.iter().filter(|s| **s == 0.0).count();

        let range = |values: &[f32]| {
            let lo = values.iter().copied().fold(f32::INFINITY, f32::min);
            let hi = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            [lo, hi]
        };
        let statistics = ParamsStatistics {
            total_frames: self.count,
            feature_dimension: means.len(),
            mean_range: range(&means),
            std_range: range(&raw_stds),
            zero_std_features,
            data_range: [self.min as f32, self.max as f32],
        };

        info!(
            "Fitted normalization over {} frames ({} features, {} zero-variance)",
            self.count,
            means.len(),
            zero_std_features
        );

        Ok(NormalizationParameters::new(means, raw_stds, std_epsilon)?.with_metadata(ParamsMetadata {
            statistics: Some(statistics),
            generated_at: Some(Utc::now()),
            version: Some(PARAMS_VERSION.to_string()),
            detector: None,
        }))
    }
}

/// Fits parameters over a corpus of raw frames.
pub fn fit<'a>(
    frames: impl IntoIterator<Item = &'a FrameFeatureVector>,
    dim: usize,
    std_epsilon: f32,
) -> Result<NormalizationParameters, NormalizationError> {
    let mut acc = StatsAccumulator::new(dim);
    for frame in frames {
        acc.push(frame.as_slice())?;
    }
    acc.finish(std_epsilon)
}

/// A sequence that has been through the normalizer exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedSequence {
    sequence: PoseSequence,
    applied: bool,
}

impl NormalizedSequence {
    pub fn sequence(&self) -> &PoseSequence {
        &self.sequence
    }

    /// False when no statistics were available and the raw values passed through.
    pub fn is_applied(&self) -> bool {
        self.applied
    }

    pub fn into_inner(self) -> PoseSequence {
        self.sequence
    }
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    params: Option<Arc<NormalizationParameters>>,
    clip: f32,
}

impl Normalizer {
    pub fn new(params: Option<Arc<NormalizationParameters>>, clip: f32) -> Self {
        Self { params, clip }
    }

    /// Pass-through normalizer; results are flagged unnormalized.
    pub fn identity() -> Self {
        Self::new(None, 5.0)
    }

    pub fn params(&self) -> Option<&Arc<NormalizationParameters>> {
        self.params.as_ref()
    }

    pub fn is_available(&self) -> bool {
        self.params.is_some()
    }

    pub fn clip(&self) -> f32 {
        self.clip
    }

    /// Consumes the sequence so it cannot be normalized twice.
    pub fn apply(&self, mut sequence: PoseSequence) -> Result<NormalizedSequence, ShapeMismatch> {
        let Some(params) = &self.params else {
            return Ok(NormalizedSequence {
                sequence,
                applied: false,
            });
        };

        let dim = params.dim();
        if let Some(bad) = sequence.frames().iter().find(|f| f.len() != dim) {
            return Err(ShapeMismatch {
                expected_frames: sequence.len(),
                expected_features: dim,
                frames: sequence.len(),
                features: bad.len(),
            });
        }

        for frame in sequence.frames_mut() {
            for ((v, m), s) in frame
                .as_mut_slice()
                .iter_mut()
                .zip(params.means())
                .zip(params.stds())
            {
                let z = (*v - m) / s;
                *v = if z.is_nan() { 0.0 } else { z.clamp(-self.clip, self.clip) };
            }
        }

        Ok(NormalizedSequence {
            sequence,
            applied: true,
        })
    }

    /// Maps normalized values back to raw feature space. Clipped values do
    /// not round-trip.
    pub fn denormalize(&self, sequence: &PoseSequence) -> Result<PoseSequence, ShapeMismatch> {
        let mut out = sequence.clone();
        let Some(params) = &self.params else {
            return Ok(out);
        };

        let dim = params.dim();
        if let Some(bad) = out.frames().iter().find(|f| f.len() != dim) {
            return Err(ShapeMismatch {
                expected_frames: out.len(),
                expected_features: dim,
                frames: out.len(),
                features: bad.len(),
            });
        }
        for frame in out.frames_mut() {
            for ((v, m), s) in frame
                .as_mut_slice()
                .iter_mut()
                .zip(params.means())
                .zip(params.stds())
            {
                *v = *v * s + m;
            }
        }
        Ok(out)
    }
}
