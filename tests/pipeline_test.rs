use std::sync::{Arc, Mutex};

use bdsl_recognizer::assembler::{PoseSequence, SamplingStrategy};
use bdsl_recognizer::config::RecognizerConfig;
use bdsl_recognizer::error::ModelError;
use bdsl_recognizer::features::FeatureEncoder;
use bdsl_recognizer::labels::ClassLabelMap;
use bdsl_recognizer::landmarks::{FrameLandmarks, GroupKind, LandmarkGroup, LandmarkPoint};
use bdsl_recognizer::model::SequenceModel;
use bdsl_recognizer::normalization::NormalizationParameters;
use bdsl_recognizer::pipeline::Recognizer;

/// Returns a uniform distribution and keeps every input it was given.
struct Recording {
    classes: usize,
    seen: Mutex<Vec<PoseSequence>>,
}

impl Recording {
    fn new(classes: usize) -> Arc<Self> {
        Arc::new(Self {
            classes,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn last_input(&self) -> PoseSequence {
        self.seen.lock().unwrap().last().cloned().unwrap()
    }

    fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

impl SequenceModel for Recording {
    fn input_shape(&self) -> (usize, usize) {
        (30, 288)
    }

    fn num_classes(&self) -> usize {
        self.classes
    }

    fn predict(&self, sequence: &PoseSequence) -> Result<Vec<f32>, ModelError> {
        self.seen.lock().unwrap().push(sequence.clone());
        Ok(vec![1.0 / self.classes as f32; self.classes])
    }
}

fn labels(n: usize) -> Arc<ClassLabelMap> {
    let names = ["আমি", "তুমি", "ধন্যবাদ", "বাড়ি", "খাবার", "পানি"];
    Arc::new(ClassLabelMap::from_labels(names[..n].iter().map(|s| s.to_string()).collect()).unwrap())
}

/// Signer with the right hand raised and a visible upper body; `t` moves the hand.
fn signing_frame(t: usize) -> FrameLandmarks {
    let hand = (0..21)
        .map(|p| LandmarkPoint::new(0.2 + 0.01 * t as f32 + 0.001 * p as f32, 0.5, 0.0))
        .collect();
    let pose = (0..33)
        .map(|p| LandmarkPoint::with_visibility(0.3 + 0.01 * p as f32, 0.6, 0.0, 0.9))
        .collect();
    FrameLandmarks::empty()
        .with_group(GroupKind::RightHand, LandmarkGroup::new(hand))
        .with_group(GroupKind::Pose, LandmarkGroup::new(pose))
}

fn params() -> NormalizationParameters {
    let means = (0..288).map(|i| 0.05 * (i % 7) as f32).collect();
    let stds = (0..288).map(|i| 0.25 + 0.1 * (i % 3) as f32).collect();
    NormalizationParameters::new(means, stds, 1e-8).unwrap()
}

#[test]
fn long_clip_keeps_the_most_recent_frames() {
    let mut config = RecognizerConfig::default();
    config.sampling = SamplingStrategy::All;
    config.quality.enabled = false;

    let model = Recording::new(4);
    let recognizer = Recognizer::new(config, model.clone(), labels(4), None).unwrap();

    let frames: Vec<_> = (0..45).map(signing_frame).collect();
    let result = recognizer.recognize_landmarks(&frames).unwrap();
    assert_eq!(result.stats.truncated, 15);
    assert_eq!(result.stats.padding, 0);

    let input = model.last_input();
    assert_eq!(input.shape(), (30, 288));
    let encoder = FeatureEncoder::default();
    assert_eq!(input.frames()[0], encoder.encode_frame(&frames[15]));
    assert_eq!(input.frames()[29], encoder.encode_frame(&frames[44]));
}

#[test]
fn smart_sampling_never_needs_truncation() {
    let model = Recording::new(4);
    let recognizer = Recognizer::new(RecognizerConfig::default(), model.clone(), labels(4), None).unwrap();

    let frames: Vec<_> = (0..45).map(signing_frame).collect();
    let result = recognizer.recognize_landmarks(&frames).unwrap();
    assert_eq!(result.stats.truncated, 0);
    assert!(result.stats.raw_frames <= 30);
    assert_eq!(model.last_input().len(), 30);
}

#[test]
fn short_clip_is_padded_with_normalized_zero_frames() {
    let model = Recording::new(4);
    let params = params();
    let expected_pad = params.normalized_zero_frame(5.0);
    let recognizer = Recognizer::new(
        RecognizerConfig::default(),
        model.clone(),
        labels(4),
        Some(Arc::new(params.clone())),
    )
    .unwrap();

    let frames: Vec<_> = (0..5).map(signing_frame).collect();
    let result = recognizer.recognize_landmarks(&frames).unwrap();
    assert!(result.prediction.normalized);
    assert_eq!(result.stats.filtered_frames, 5);
    assert_eq!(result.stats.padding, 25);

    let input = model.last_input();
    assert_eq!(input.len(), 30);
    for pad in &input.frames()[5..] {
        assert_eq!(pad, &expected_pad);
        // not a copy of the last real frame
        assert_ne!(pad, &input.frames()[4]);
    }
}

#[test]
fn normalization_is_applied_exactly_once() {
    let model = Recording::new(4);
    let params = params();
    let recognizer = Recognizer::new(
        RecognizerConfig::default(),
        model.clone(),
        labels(4),
        Some(Arc::new(params.clone())),
    )
    .unwrap();

    let frames: Vec<_> = (0..5).map(signing_frame).collect();
    recognizer.recognize_landmarks(&frames).unwrap();

    let raw = FeatureEncoder::default().encode_frame(&frames[0]);
    let seen = model.last_input();
    for i in 0..288 {
        let expected = ((raw.as_slice()[i] - params.means()[i]) / params.stds()[i]).clamp(-5.0, 5.0);
        assert!((seen.frames()[0].as_slice()[i] - expected).abs() < 1e-6, "feature {}", i);
    }
}

#[test]
fn missing_statistics_send_raw_features_to_the_model() {
    let model = Recording::new(4);
    let recognizer = Recognizer::new(RecognizerConfig::default(), model.clone(), labels(4), None).unwrap();

    let frames: Vec<_> = (0..8).map(signing_frame).collect();
    let result = recognizer.recognize_landmarks(&frames).unwrap();
    assert!(!result.prediction.normalized);

    let input = model.last_input();
    let encoder = FeatureEncoder::default();
    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(input.frames()[i], encoder.encode_frame(frame));
    }
    // padding stays all-zero without statistics
    assert!(input.frames()[8..]
        .iter()
        .all(|f| f.as_slice().iter().all(|v| *v == 0.0)));
}

#[test]
fn uniform_output_gives_one_over_n_confidence() {
    for n in [2, 4, 6] {
        let recognizer =
            Recognizer::new(RecognizerConfig::default(), Recording::new(n), labels(n), None).unwrap();
        let frames: Vec<_> = (0..12).map(signing_frame).collect();
        let result = recognizer.recognize_landmarks(&frames).unwrap();

        assert!((result.prediction.confidence - 1.0 / n as f32).abs() < 1e-6);
        assert_eq!(result.prediction.class_index, 0);
        assert_eq!(result.prediction.label, "আমি");
        assert!((result.analysis.gap).abs() < 1e-6);
    }
}

#[test]
fn clip_without_landmarks_is_reported_not_classified() {
    let model = Recording::new(4);
    let recognizer = Recognizer::new(RecognizerConfig::default(), model.clone(), labels(4), None).unwrap();

    let frames = vec![FrameLandmarks::empty(); 20];
    let err = recognizer.recognize_landmarks(&frames).unwrap_err();
    assert_eq!(err.reason_code(), "detection_empty");

    let err = recognizer.recognize_landmarks(&[]).unwrap_err();
    assert_eq!(err.reason_code(), "extraction_failed");
    assert_eq!(model.calls(), 0);
}

#[test]
fn sparse_detections_still_produce_a_prediction() {
    let model = Recording::new(4);
    let recognizer = Recognizer::new(RecognizerConfig::default(), model.clone(), labels(4), None).unwrap();

    // only 2 of 10 frames have anything in them: the filter gives up and keeps all
    let mut frames = vec![FrameLandmarks::empty(); 10];
    frames[3] = signing_frame(3);
    frames[7] = signing_frame(7);
    let result = recognizer.recognize_landmarks(&frames).unwrap();
    assert!(result.stats.filter_relaxed);
    assert_eq!(result.stats.filtered_frames, 10);
    assert_eq!(result.stats.detected_frames, 2);
    assert_eq!(model.last_input().len(), 30);
}
