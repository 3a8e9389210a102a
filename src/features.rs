// src/features.rs - Fixed slot layout from landmarks to feature vectors
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::landmarks::{FrameLandmarks, GroupKind, LandmarkGroup};
use crate::quality::GroupPresence;

pub const HAND_POINTS: usize = 21;
pub const POSE_POINTS: usize = 33;
pub const FACE_SUBSET_POINTS: usize = 10;

/// Default feature width: 63 + 63 + 132 + 30.
pub const FEATURE_DIM: usize = 288;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channels {
    Xyz,
    XyzVisibility,
}

impl Channels {
    pub fn width(&self) -> usize {
        match self {
            Channels::Xyz => 3,
            Channels::XyzVisibility => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSpec {
    pub group: GroupKind,
    pub points: usize,
    pub channels: Channels,
}

impl BlockSpec {
    pub const fn new(group: GroupKind, points: usize, channels: Channels) -> Self {
        Self {
            group,
            points,
            channels,
        }
    }

    pub fn len(&self) -> usize {
        self.points * self.channels.width()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayoutPreset {
    /// left hand, right hand, pose with visibility, first 10 face points.
    #[serde(rename = "holistic_288")]
    Holistic288,
    /// pose xyz, left hand, right hand, first 21 face points.
    #[serde(rename = "legacy_pose_first_288")]
    LegacyPoseFirst288,
    /// pose with visibility, left hand, right hand.
    #[serde(rename = "compact_258")]
    Compact258,
}

/// Either a named preset or an explicit block list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LayoutSpec {
    Preset(LayoutPreset),
    Blocks(Vec<BlockSpec>),
}

impl Default for LayoutSpec {
    fn default() -> Self {
        LayoutSpec::Preset(LayoutPreset::Holistic288)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureLayout {
    blocks: Vec<BlockSpec>,
}

impl FeatureLayout {
    pub fn new(blocks: Vec<BlockSpec>) -> Self {
        Self { blocks }
    }

    pub fn holistic_288() -> Self {
        Self::new(vec![
            BlockSpec::new(GroupKind::LeftHand, HAND_POINTS, Channels::Xyz),
            BlockSpec::new(GroupKind::RightHand, HAND_POINTS, Channels::Xyz),
            BlockSpec::new(GroupKind::Pose, POSE_POINTS, Channels::XyzVisibility),
            BlockSpec::new(GroupKind::Face, FACE_SUBSET_POINTS, Channels::Xyz),
        ])
    }

    pub fn legacy_pose_first_288() -> Self {
        Self::new(vec![
            BlockSpec::new(GroupKind::Pose, POSE_POINTS, Channels::Xyz),
            BlockSpec::new(GroupKind::LeftHand, HAND_POINTS, Channels::Xyz),
            BlockSpec::new(GroupKind::RightHand, HAND_POINTS, Channels::Xyz),
            BlockSpec::new(GroupKind::Face, 21, Channels::Xyz),
        ])
    }

    pub fn compact_258() -> Self {
        Self::new(vec![
            BlockSpec::new(GroupKind::Pose, POSE_POINTS, Channels::XyzVisibility),
            BlockSpec::new(GroupKind::LeftHand, HAND_POINTS, Channels::Xyz),
            BlockSpec::new(GroupKind::RightHand, HAND_POINTS, Channels::Xyz),
        ])
    }

    pub fn from_spec(spec: &LayoutSpec) -> Self {
        match spec {
            LayoutSpec::Preset(LayoutPreset::Holistic288) => Self::holistic_288(),
            LayoutSpec::Preset(LayoutPreset::LegacyPoseFirst288) => Self::legacy_pose_first_288(),
            LayoutSpec::Preset(LayoutPreset::Compact258) => Self::compact_258(),
            LayoutSpec::Blocks(blocks) => Self::new(blocks.clone()),
        }
    }

    pub fn blocks(&self) -> &[BlockSpec] {
        &self.blocks
    }

    pub fn dimension(&self) -> usize {
        self.blocks.iter().map(BlockSpec::len).sum()
    }

    /// Start offset of the block for `group`, if the layout has one.
    pub fn offset_of(&self, group: GroupKind) -> Option<usize> {
        let mut offset = 0;
        for block in &self.blocks {
            if block.group == group {
                return Some(offset);
            }
            offset += block.len();
        }
        None
    }
}

impl Default for FeatureLayout {
    fn default() -> Self {
        Self::holistic_288()
    }
}

/// One frame's feature vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameFeatureVector(Vec<f32>);

impl FrameFeatureVector {
    pub fn zeros(dim: usize) -> Self {
        Self(vec![0.0; dim])
    }

    pub fn from_vec(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<f32> {
        self.0
    }
}

/// Records a pad/truncate applied to reach the configured width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthFix {
    pub produced: usize,
    pub expected: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncodedFrame {
    pub features: FrameFeatureVector,
    pub presence: GroupPresence,
    pub length_fix: Option<LengthFix>,
}

#[derive(Debug, Clone)]
pub struct FeatureEncoder {
    layout: FeatureLayout,
    feature_dim: usize,
}

impl Default for FeatureEncoder {
    fn default() -> Self {
        Self::new(FeatureLayout::default(), FEATURE_DIM)
    }
}

impl FeatureEncoder {
    pub fn new(layout: FeatureLayout, feature_dim: usize) -> Self {
        if layout.dimension() != feature_dim {
            warn!(
                "Feature layout produces {} values but {} are expected; frames will be padded or truncated",
                layout.dimension(),
                feature_dim
            );
        }
        Self { layout, feature_dim }
    }

    pub fn layout(&self) -> &FeatureLayout {
        &self.layout
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    pub fn encode_frame(&self, landmarks: &FrameLandmarks) -> FrameFeatureVector {
        self.encode(landmarks).features
    }

    pub fn encode(&self, landmarks: &FrameLandmarks) -> EncodedFrame {
        let mut values = Vec::with_capacity(self.feature_dim.max(self.layout.dimension()));
        let mut presence = GroupPresence::default();

        for block in self.layout.blocks() {
            let used = match landmarks.group(block.group) {
                Some(group) if group.len() >= block.points => {
                    push_block(&mut values, group, block);
                    Some(group)
                }
                _ => {
                    values.extend(std::iter::repeat(0.0).take(block.len()));
                    None
                }
            };

            if let Some(group) = used {
                match block.group {
                    GroupKind::LeftHand => presence.left_hand = true,
                    GroupKind::RightHand => presence.right_hand = true,
                    GroupKind::Face => presence.face = true,
                    GroupKind::Pose => {
                        presence.pose = true;
                        let visible: Vec<f32> = group.points[..block.points]
                            .iter()
                            .filter_map(|p| p.visibility)
                            .collect();
                        presence.pose_visibility = if visible.is_empty() {
                            None
                        } else {
                            Some(visible.iter().sum::<f32>() / visible.len() as f32)
                        };
                    }
                }
            }
        }

        let length_fix = if values.len() != self.feature_dim {
            let fix = LengthFix {
                produced: values.len(),
                expected: self.feature_dim,
            };
            warn!(
                "Feature count mismatch: got {}, expected {}; adjusting",
                fix.produced, fix.expected
            );
            values.resize(self.feature_dim, 0.0);
            Some(fix)
        } else {
            None
        };

        EncodedFrame {
            features: FrameFeatureVector(values),
            presence,
            length_fix,
        }
    }
}

fn push_block(values: &mut Vec<f32>, group: &LandmarkGroup, block: &BlockSpec) {
    for point in &group.points[..block.points] {
        values.push(point.x);
        values.push(point.y);
        values.push(point.z);
        if block.channels == Channels::XyzVisibility {
            values.push(point.visibility.unwrap_or(0.0));
        }
    }
}
