// src/quality.rs - Per-frame quality heuristic
use serde::{Deserialize, Serialize};

use crate::features::FrameFeatureVector;

/// Which landmark groups made it into a frame's feature vector.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GroupPresence {
    pub left_hand: bool,
    pub right_hand: bool,
    pub pose: bool,
    pub face: bool,
    /// Mean pose visibility, when the detector reports one.
    pub pose_visibility: Option<f32>,
}

impl GroupPresence {
    pub fn any(&self) -> bool {
        self.left_hand || self.right_hand || self.pose || self.face
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityWeights {
    pub pose: f32,
    pub left_hand: f32,
    pub right_hand: f32,
    pub face: f32,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            pose: 0.4,
            left_hand: 0.3,
            right_hand: 0.3,
            face: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QualityScore(f32);

impl QualityScore {
    /// Clamps into [0, 1]; NaN becomes 0.
    pub fn new(value: f32) -> Self {
        if value.is_nan() {
            Self(0.0)
        } else {
            Self(value.clamp(0.0, 1.0))
        }
    }

    pub fn value(&self) -> f32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityBreakdown {
    pub component: f32,
    pub data: f32,
    pub motion: f32,
    pub score: QualityScore,
}

#[derive(Debug, Clone)]
pub struct QualityScorer {
    weights: QualityWeights,
    motion_scale: f32,
    zero_epsilon: f32,
}

impl Default for QualityScorer {
    fn default() -> Self {
        Self::new(QualityWeights::default(), 1000.0, 1e-6)
    }
}

impl QualityScorer {
    pub fn new(weights: QualityWeights, motion_scale: f32, zero_epsilon: f32) -> Self {
        Self {
            weights,
            motion_scale,
            zero_epsilon,
        }
    }

    pub fn score(&self, features: &FrameFeatureVector, presence: &GroupPresence) -> QualityScore {
        self.breakdown(features, presence).score
    }

    pub fn breakdown(&self, features: &FrameFeatureVector, presence: &GroupPresence) -> QualityBreakdown {
        let flag = |present: bool| if present { 1.0 } else { 0.0 };

        // Pose without visibility data counts as fully present.
        let pose_quality = if presence.pose {
            presence.pose_visibility.unwrap_or(1.0).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let component = self.weights.pose * pose_quality
            + self.weights.left_hand * flag(presence.left_hand)
            + self.weights.right_hand * flag(presence.right_hand)
            + self.weights.face * flag(presence.face);

        let values = features.as_slice();
        let (data, motion) = if values.is_empty() {
            (0.0, 0.0)
        } else {
            let zeros = values.iter().filter(|v| v.abs() < self.zero_epsilon).count();
            let data = (1.0 - zeros as f32 / values.len() as f32).max(0.0);
            let motion = (variance(values) as f32 * self.motion_scale).min(1.0);
            (data, motion)
        };

        let total = 0.5 * component + 0.3 * data + 0.2 * motion;

        QualityBreakdown {
            component,
            data,
            motion,
            score: QualityScore::new(total),
        }
    }
}

fn variance(values: &[f32]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().map(|v| *v as f64).sum::<f64>() / n;
    values.iter().map(|v| (*v as f64 - mean).powi(2)).sum::<f64>() / n
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_presence() -> GroupPresence {
        GroupPresence {
            left_hand: true,
            right_hand: true,
            pose: true,
            face: true,
            pose_visibility: Some(1.0),
        }
    }

    #[test]
    fn all_zero_frame_scores_zero() {
        let scorer = QualityScorer::default();
        let q = scorer.score(&FrameFeatureVector::zeros(288), &GroupPresence::default());
        assert_eq!(q.value(), 0.0);
    }

    #[test]
    fn components_follow_weights() {
        let scorer = QualityScorer::default();
        let features = FrameFeatureVector::from_vec(vec![1.0; 288]);
        let presence = GroupPresence {
            pose: true,
            pose_visibility: Some(0.5),
            left_hand: true,
            ..Default::default()
        };
        let b = scorer.breakdown(&features, &presence);
        assert!((b.component - (0.4 * 0.5 + 0.3)).abs() < 1e-6);
        assert_eq!(b.data, 1.0);
        // constant vector has no variance
        assert_eq!(b.motion, 0.0);
        assert!((b.score.value() - (0.5 * 0.5 + 0.3)).abs() < 1e-6);
    }

    #[test]
    fn face_does_not_contribute() {
        let scorer = QualityScorer::default();
        let features = FrameFeatureVector::zeros(288);
        let face_only = GroupPresence {
            face: true,
            ..Default::default()
        };
        assert_eq!(scorer.breakdown(&features, &face_only).component, 0.0);
    }

    #[test]
    fn score_stays_in_unit_interval() {
        let scorer = QualityScorer::default();
        let wild: Vec<f32> = (0..288).map(|i| if i % 2 == 0 { 1e6 } else { -1e6 }).collect();
        let q = scorer.score(&FrameFeatureVector::from_vec(wild), &full_presence());
        assert!((0.0..=1.0).contains(&q.value()));
        assert_eq!(q.value(), 1.0);

        let nan = FrameFeatureVector::from_vec(vec![f32::NAN; 288]);
        let q = scorer.score(&nan, &full_presence());
        assert!((0.0..=1.0).contains(&q.value()));
    }
}
