// src/assembler.rs - Frame sampling, quality filtering and fixed-length sequences
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{RecognitionError, ShapeMismatch};
use crate::features::{FeatureEncoder, FrameFeatureVector};
use crate::landmarks::{FrameLandmarks, LandmarkAdapter};
use crate::quality::{QualityScore, QualityScorer};
use crate::video::FrameSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingStrategy {
    /// Dense middle 60%, sparse first and last 20%.
    #[default]
    Smart,
    Uniform,
    /// Every frame; length is fixed later by truncation.
    All,
}

/// Indices (ascending, unique) of the frames to process out of `total`.
pub fn sample_indices(total: usize, max_frames: usize, strategy: SamplingStrategy) -> Vec<usize> {
    if total <= max_frames || strategy == SamplingStrategy::All {
        return (0..total).collect();
    }
    if max_frames == 0 {
        return Vec::new();
    }

    match strategy {
        SamplingStrategy::Uniform => {
            let step = total as f64 / max_frames as f64;
            (0..max_frames).map(|i| (i as f64 * step) as usize).collect()
        }
        _ => smart_indices(total, max_frames),
    }
}

fn smart_indices(total: usize, max_frames: usize) -> Vec<usize> {
    let start = (total as f64 * 0.2) as usize;
    let end = (total as f64 * 0.8) as usize;
    let middle = ((max_frames as f64 * 0.7) as usize).max(1).min(end - start);

    let rest = max_frames - middle;
    let before = (rest / 2).min(start);
    let after = (rest - before).min(total - end);

    let mut taken = vec![false; total];
    for i in spread(start, end, middle)
        .chain(spread(0, start, before))
        .chain(spread(end, total, after))
    {
        taken[i] = true;
    }

    // fill any slot the windows could not cover, middle first
    let mut missing = max_frames.saturating_sub(taken.iter().filter(|t| **t).count());
    for i in (start..end).chain(0..start).chain(end..total) {
        if missing == 0 {
            break;
        }
        if !taken[i] {
            taken[i] = true;
            missing -= 1;
        }
    }

    taken
        .iter()
        .enumerate()
        .filter_map(|(i, t)| t.then_some(i))
        .collect()
}

/// `n` distinct indices spread evenly over `lo..hi` (`n <= hi - lo`).
fn spread(lo: usize, hi: usize, n: usize) -> impl Iterator<Item = usize> {
    (0..n).map(move |k| lo + k * (hi - lo) / n)
}

/// A frame after encoding and scoring.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredFrame {
    pub features: FrameFeatureVector,
    pub quality: QualityScore,
    /// At least one landmark group was found.
    pub detected: bool,
}

/// Fixed-length, chronological run of feature vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseSequence {
    frames: Vec<FrameFeatureVector>,
    padding: usize,
}

impl PoseSequence {
    pub fn from_frames(frames: Vec<FrameFeatureVector>) -> Self {
        Self { frames, padding: 0 }
    }

    pub fn frames(&self) -> &[FrameFeatureVector] {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut [FrameFeatureVector] {
        &mut self.frames
    }

    pub fn into_frames(self) -> Vec<FrameFeatureVector> {
        self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Trailing frames that were appended as padding.
    pub fn padding(&self) -> usize {
        self.padding
    }

    /// (frames, width of the first frame).
    pub fn shape(&self) -> (usize, usize) {
        (self.frames.len(), self.frames.first().map_or(0, |f| f.len()))
    }

    pub fn check_shape(&self, frames: usize, features: usize) -> Result<(), ShapeMismatch> {
        let mismatch = |width: usize| ShapeMismatch {
            expected_frames: frames,
            expected_features: features,
            frames: self.frames.len(),
            features: width,
        };
        if self.frames.len() != frames {
            return Err(mismatch(self.shape().1));
        }
        match self.frames.iter().find(|f| f.len() != features) {
            Some(bad) => Err(mismatch(bad.len())),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityFilter {
    pub threshold: f32,
    /// Below this many survivors the filter is abandoned.
    pub min_frames: usize,
}

impl Default for QualityFilter {
    fn default() -> Self {
        Self {
            threshold: 0.4,
            min_frames: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssemblyOptions {
    pub sequence_length: usize,
    pub sampling: SamplingStrategy,
    pub filter: Option<QualityFilter>,
}

impl Default for AssemblyOptions {
    fn default() -> Self {
        Self {
            sequence_length: 30,
            sampling: SamplingStrategy::Smart,
            filter: Some(QualityFilter::default()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AssemblyStats {
    /// Frames that went through the detector.
    pub raw_frames: usize,
    pub detected_frames: usize,
    /// Frames kept after the quality filter.
    pub filtered_frames: usize,
    pub filter_relaxed: bool,
    pub truncated: usize,
    pub padding: usize,
    pub min_quality: f32,
    pub avg_quality: f32,
    pub max_quality: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssembledSequence {
    pub sequence: PoseSequence,
    pub stats: AssemblyStats,
}

pub struct SequenceAssembler {
    encoder: FeatureEncoder,
    scorer: QualityScorer,
    options: AssemblyOptions,
}

impl SequenceAssembler {
    pub fn new(encoder: FeatureEncoder, scorer: QualityScorer, options: AssemblyOptions) -> Self {
        Self {
            encoder,
            scorer,
            options,
        }
    }

    pub fn options(&self) -> &AssemblyOptions {
        &self.options
    }

    pub fn encoder(&self) -> &FeatureEncoder {
        &self.encoder
    }

    pub fn score_landmarks(&self, landmarks: &FrameLandmarks) -> ScoredFrame {
        let encoded = self.encoder.encode(landmarks);
        let quality = self.scorer.score(&encoded.features, &encoded.presence);
        ScoredFrame {
            features: encoded.features,
            quality,
            detected: encoded.presence.any(),
        }
    }

    pub fn process_frame(&self, adapter: &mut LandmarkAdapter, frame: &DynamicImage) -> ScoredFrame {
        let landmarks = adapter.process(frame);
        self.score_landmarks(&landmarks)
    }

    /// Frames already run through a detector, in capture order.
    pub fn assemble_landmarks(
        &self,
        frames: &[FrameLandmarks],
    ) -> Result<AssembledSequence, RecognitionError> {
        let scored = self
            .sample(frames.len())
            .into_iter()
            .map(|i| self.score_landmarks(&frames[i]))
            .collect();
        self.finalize(scored)
    }

    /// Decodes the sampled frames of `source` and runs each through the adapter.
    pub fn assemble_source(
        &self,
        source: &mut FrameSource,
        adapter: &mut LandmarkAdapter,
    ) -> Result<AssembledSequence, RecognitionError> {
        let total = source.total_frames();
        let indices = self.sample(total);
        debug!("Sampling {} of {} frames", indices.len(), total);

        let images = source
            .load_frames(&indices)
            .map_err(|e| RecognitionError::ExtractionFailed(format!("{:#}", e)))?;

        if !images.is_empty() && images.iter().all(Option::is_none) {
            return Err(RecognitionError::ExtractionFailed(format!(
                "none of {} sampled frames could be decoded",
                images.len()
            )));
        }

        // an undecodable frame counts as a frame without landmarks
        let scored = images
            .iter()
            .map(|img| match img {
                Some(img) => self.process_frame(adapter, img),
                None => self.score_landmarks(&FrameLandmarks::empty()),
            })
            .collect();
        self.finalize(scored)
    }

    /// Samples a buffer of already scored frames, then finalizes it.
    pub fn assemble_scored(
        &self,
        frames: Vec<ScoredFrame>,
    ) -> Result<AssembledSequence, RecognitionError> {
        let indices = self.sample(frames.len());
        let selected = if indices.len() == frames.len() {
            frames
        } else {
            indices.into_iter().map(|i| frames[i].clone()).collect()
        };
        self.finalize(selected)
    }

    fn sample(&self, total: usize) -> Vec<usize> {
        sample_indices(total, self.options.sequence_length, self.options.sampling)
    }

    /// Quality filter and length normalization over processed frames.
    pub fn finalize(&self, frames: Vec<ScoredFrame>) -> Result<AssembledSequence, RecognitionError> {
        if frames.is_empty() {
            return Err(RecognitionError::ExtractionFailed(
                "no frames could be read".to_string(),
            ));
        }

        let raw_frames = frames.len();
        let detected_frames = frames.iter().filter(|f| f.detected).count();
        if detected_frames == 0 {
            return Err(RecognitionError::DetectionEmpty { frames: raw_frames });
        }

        let qualities: Vec<f32> = frames.iter().map(|f| f.quality.value()).collect();
        let mut stats = AssemblyStats {
            raw_frames,
            detected_frames,
            min_quality: qualities.iter().copied().fold(f32::INFINITY, f32::min),
            max_quality: qualities.iter().copied().fold(f32::NEG_INFINITY, f32::max),
            avg_quality: qualities.iter().sum::<f32>() / raw_frames as f32,
            ..Default::default()
        };

        let kept: Vec<FrameFeatureVector> = match self.options.filter {
            Some(filter) => {
                let passing = frames
                    .iter()
                    .filter(|f| f.quality.value() >= filter.threshold)
                    .count();
                if passing < filter.min_frames {
                    warn!(
                        "Only {} of {} frames reach quality {:.2}; keeping all frames",
                        passing, raw_frames, filter.threshold
                    );
                    stats.filter_relaxed = true;
                    frames.into_iter().map(|f| f.features).collect()
                } else {
                    frames
                        .into_iter()
                        .filter(|f| f.quality.value() >= filter.threshold)
                        .map(|f| f.features)
                        .collect()
                }
            }
            None => frames.into_iter().map(|f| f.features).collect(),
        };
        stats.filtered_frames = kept.len();

        let (sequence, truncated) = normalize_length(
            kept,
            self.options.sequence_length,
            self.encoder.feature_dim(),
        );
        stats.truncated = truncated;
        stats.padding = sequence.padding();

        debug!(
            "Assembled sequence: {} raw, {} kept, {} truncated, {} padded",
            stats.raw_frames, stats.filtered_frames, stats.truncated, stats.padding
        );

        Ok(AssembledSequence { sequence, stats })
    }
}

/// Drops the oldest frames beyond `target` and appends zero frames up to it.
/// Returns the sequence and how many frames were dropped.
pub fn normalize_length(
    mut frames: Vec<FrameFeatureVector>,
    target: usize,
    feature_dim: usize,
) -> (PoseSequence, usize) {
    let truncated = frames.len().saturating_sub(target);
    if truncated > 0 {
        frames.drain(..truncated);
    }

    let padding = target - frames.len();
    frames.extend(std::iter::repeat_with(|| FrameFeatureVector::zeros(feature_dim)).take(padding));

    (PoseSequence { frames, padding }, truncated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FEATURE_DIM;

    fn frame(value: f32, quality: f32) -> ScoredFrame {
        let mut features = FrameFeatureVector::zeros(FEATURE_DIM);
        features.as_mut_slice()[0] = value;
        ScoredFrame {
            features,
            quality: QualityScore::new(quality),
            detected: true,
        }
    }

    fn assembler(options: AssemblyOptions) -> SequenceAssembler {
        SequenceAssembler::new(FeatureEncoder::default(), QualityScorer::default(), options)
    }

    #[test]
    fn short_inputs_use_every_frame() {
        assert_eq!(sample_indices(12, 30, SamplingStrategy::Smart), (0..12).collect::<Vec<_>>());
        assert_eq!(sample_indices(45, 30, SamplingStrategy::All).len(), 45);
    }

    #[test]
    fn smart_sampling_favors_the_middle() {
        let indices = sample_indices(100, 30, SamplingStrategy::Smart);
        assert!(indices.len() <= 30);
        assert!(indices.windows(2).all(|w| w[0] < w[1]));

        assert_eq!(indices.len(), 30);
        let middle = indices.iter().filter(|i| (20..80).contains(*i)).count();
        assert!(middle >= 20);
        assert!(indices.iter().any(|i| *i < 20));
        assert!(indices.iter().any(|i| *i >= 80));
    }

    #[test]
    fn smart_sampling_always_fills_the_window() {
        for total in 31..=400 {
            let indices = sample_indices(total, 30, SamplingStrategy::Smart);
            assert_eq!(indices.len(), 30, "total {}", total);
            assert!(indices.windows(2).all(|w| w[0] < w[1]), "total {}", total);
            assert!(*indices.last().unwrap() < total);
        }

        // the dense window reaches its far end
        let indices = sample_indices(100, 30, SamplingStrategy::Smart);
        assert!(indices.iter().filter(|i| (60..80).contains(*i)).count() >= 6);
    }

    #[test]
    fn a_long_clip_needs_no_padding() {
        let frames: Vec<_> = (0..100).map(|i| frame(i as f32 + 1.0, 0.9)).collect();
        let out = assembler(AssemblyOptions::default()).assemble_scored(frames).unwrap();
        assert_eq!(out.stats.raw_frames, 30);
        assert_eq!(out.stats.padding, 0);
    }

    #[test]
    fn uniform_sampling_strides_evenly() {
        let indices = sample_indices(60, 30, SamplingStrategy::Uniform);
        assert_eq!(indices, (0..30).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[test]
    fn long_sequences_keep_the_most_recent_frames() {
        let frames = (0..45)
            .map(|i| FrameFeatureVector::from_vec(vec![i as f32; 4]))
            .collect();
        let (seq, truncated) = normalize_length(frames, 30, 4);
        assert_eq!(truncated, 15);
        assert_eq!(seq.len(), 30);
        assert_eq!(seq.frames()[0].as_slice()[0], 15.0);
        assert_eq!(seq.frames()[29].as_slice()[0], 44.0);
        assert_eq!(seq.padding(), 0);
    }

    #[test]
    fn short_sequences_are_padded_with_zero_frames() {
        let frames = (0..5)
            .map(|i| FrameFeatureVector::from_vec(vec![i as f32 + 1.0; 4]))
            .collect();
        let (seq, _) = normalize_length(frames, 30, 4);
        assert_eq!(seq.shape(), (30, 4));
        assert_eq!(seq.padding(), 25);
        // padding never repeats the last real frame
        assert!(seq.frames()[5..].iter().all(|f| f.as_slice() == [0.0; 4]));
    }

    #[test]
    fn filter_relaxes_when_too_few_frames_survive() {
        let asm = assembler(AssemblyOptions::default());
        let frames = vec![frame(1.0, 0.9), frame(2.0, 0.1), frame(3.0, 0.2), frame(4.0, 0.8)];
        let out = asm.finalize(frames).unwrap();
        assert!(out.stats.filter_relaxed);
        assert_eq!(out.stats.filtered_frames, 4);
        assert_eq!(out.sequence.padding(), 26);
    }

    #[test]
    fn filter_drops_low_quality_frames() {
        let asm = assembler(AssemblyOptions::default());
        let mut frames: Vec<ScoredFrame> = (0..6).map(|i| frame(i as f32, 0.7)).collect();
        frames.insert(2, frame(99.0, 0.1));
        let out = asm.finalize(frames).unwrap();
        assert!(!out.stats.filter_relaxed);
        assert_eq!(out.stats.filtered_frames, 6);
        assert!(out
            .sequence
            .frames()
            .iter()
            .all(|f| f.as_slice()[0] != 99.0));
    }

    #[test]
    fn empty_and_undetected_inputs_fail() {
        let asm = assembler(AssemblyOptions::default());
        assert_eq!(
            asm.finalize(Vec::new()).unwrap_err().reason_code(),
            "extraction_failed"
        );

        let blank = asm.score_landmarks(&FrameLandmarks::empty());
        assert!(!blank.detected);
        assert_eq!(blank.quality.value(), 0.0);
        let err = asm.finalize(vec![blank.clone(), blank]).unwrap_err();
        assert!(matches!(err, RecognitionError::DetectionEmpty { frames: 2 }));
    }

    #[test]
    fn shape_check_reports_the_offending_width() {
        let seq = PoseSequence::from_frames(vec![
            FrameFeatureVector::zeros(288),
            FrameFeatureVector::zeros(287),
        ]);
        let err = seq.check_shape(2, 288).unwrap_err();
        assert_eq!(err.features, 287);
        assert!(seq.check_shape(30, 288).is_err());
    }
}
