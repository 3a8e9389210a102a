// src/landmarks.rs - Landmark records and the detector adapter boundary
use anyhow::Result;
use image::{imageops::FilterType, DynamicImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    LeftHand,
    RightHand,
    Pose,
    Face,
}

impl GroupKind {
    pub const ALL: [GroupKind; 4] = [
        GroupKind::LeftHand,
        GroupKind::RightHand,
        GroupKind::Pose,
        GroupKind::Face,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GroupKind::LeftHand => "left_hand",
            GroupKind::RightHand => "right_hand",
            GroupKind::Pose => "pose",
            GroupKind::Face => "face",
        }
    }
}

/// One detected keypoint. x/y are image-relative (usually 0-1), z is relative depth.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LandmarkPoint {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    #[serde(default)]
    pub visibility: Option<f32>,
}

impl LandmarkPoint {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z, visibility: None }
    }

    pub fn with_visibility(x: f32, y: f32, z: f32, visibility: f32) -> Self {
        Self {
            x,
            y,
            z,
            visibility: Some(visibility),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LandmarkGroup {
    pub points: Vec<LandmarkPoint>,
}

impl LandmarkGroup {
    pub fn new(points: Vec<LandmarkPoint>) -> Self {
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Mean visibility over points that report one.
    pub fn mean_visibility(&self) -> Option<f32> {
        let (sum, count) = self
            .points
            .iter()
            .filter_map(|p| p.visibility)
            .fold((0.0f32, 0usize), |(s, n), v| (s + v, n + 1));
        if count == 0 {
            None
        } else {
            Some(sum / count as f32)
        }
    }
}

/// Everything the detector found in one frame. A `None` group was not detected.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FrameLandmarks {
    #[serde(default)]
    pub left_hand: Option<LandmarkGroup>,
    #[serde(default)]
    pub right_hand: Option<LandmarkGroup>,
    #[serde(default)]
    pub pose: Option<LandmarkGroup>,
    #[serde(default)]
    pub face: Option<LandmarkGroup>,
}

impl FrameLandmarks {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn group(&self, kind: GroupKind) -> Option<&LandmarkGroup> {
        match kind {
            GroupKind::LeftHand => self.left_hand.as_ref(),
            GroupKind::RightHand => self.right_hand.as_ref(),
            GroupKind::Pose => self.pose.as_ref(),
            GroupKind::Face => self.face.as_ref(),
        }
    }

    pub fn with_group(mut self, kind: GroupKind, group: LandmarkGroup) -> Self {
        let slot = match kind {
            GroupKind::LeftHand => &mut self.left_hand,
            GroupKind::RightHand => &mut self.right_hand,
            GroupKind::Pose => &mut self.pose,
            GroupKind::Face => &mut self.face,
        };
        *slot = Some(group);
        self
    }

    pub fn is_empty(&self) -> bool {
        GroupKind::ALL.iter().all(|k| self.group(*k).is_none())
    }
}

/// Raw holistic output in the shape detectors usually hand back: parallel
/// coordinate arrays, empty when the part was not found.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HolisticOutput {
    #[serde(default)]
    pub pose_landmarks: Vec<[f32; 3]>,
    #[serde(default)]
    pub pose_visibility: Vec<f32>,
    #[serde(default)]
    pub left_hand_landmarks: Vec<[f32; 3]>,
    #[serde(default)]
    pub right_hand_landmarks: Vec<[f32; 3]>,
    #[serde(default)]
    pub face_landmarks: Vec<[f32; 3]>,
}

impl HolisticOutput {
    /// One-time conversion into the crate's landmark records.
    pub fn into_landmarks(self) -> FrameLandmarks {
        fn group(points: Vec<[f32; 3]>) -> Option<LandmarkGroup> {
            if points.is_empty() {
                None
            } else {
                Some(LandmarkGroup::new(
                    points.into_iter().map(|p| LandmarkPoint::new(p[0], p[1], p[2])).collect(),
                ))
            }
        }

        let pose = if self.pose_landmarks.is_empty() {
            None
        } else {
            let visibility = self.pose_visibility;
            Some(LandmarkGroup::new(
                self.pose_landmarks
                    .into_iter()
                    .enumerate()
                    .map(|(i, p)| LandmarkPoint {
                        x: p[0],
                        y: p[1],
                        z: p[2],
                        visibility: visibility.get(i).copied(),
                    })
                    .collect(),
            ))
        };

        FrameLandmarks {
            left_hand: group(self.left_hand_landmarks),
            right_hand: group(self.right_hand_landmarks),
            pose,
            face: group(self.face_landmarks),
        }
    }
}

/// Detector thresholds. These have to be identical when normalization
/// statistics are fitted and when they are used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSettings {
    pub min_detection_confidence: f32,
    pub min_tracking_confidence: f32,
    pub model_complexity: u8,
    pub static_image_mode: bool,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            min_detection_confidence: 0.7,
            min_tracking_confidence: 0.7,
            model_complexity: 1,
            static_image_mode: false,
        }
    }
}

/// External pose/landmark detector.
pub trait LandmarkDetector: Send {
    fn configure(&mut self, _settings: &DetectorSettings) -> Result<()> {
        Ok(())
    }

    fn detect(&mut self, frame: &RgbImage) -> Result<HolisticOutput>;
}

/// Replays landmark dumps recorded by an external holistic detector, one
/// entry per frame. Frames past the end of the dump yield nothing.
pub struct ReplayDetector {
    frames: VecDeque<HolisticOutput>,
}

impl ReplayDetector {
    pub fn new(frames: Vec<HolisticOutput>) -> Self {
        Self {
            frames: frames.into(),
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let frames: Vec<HolisticOutput> = serde_json::from_str(&content)?;
        Ok(Self::new(frames))
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl LandmarkDetector for ReplayDetector {
    fn detect(&mut self, _frame: &RgbImage) -> Result<HolisticOutput> {
        Ok(self.frames.pop_front().unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdapterStats {
    pub processed: usize,
    pub empty: usize,
    pub failed: usize,
}

pub struct LandmarkAdapter {
    detector: Box<dyn LandmarkDetector>,
    settings: DetectorSettings,
    max_frame_width: u32,
    stats: AdapterStats,
}

impl LandmarkAdapter {
    pub fn new(
        mut detector: Box<dyn LandmarkDetector>,
        settings: DetectorSettings,
        max_frame_width: u32,
    ) -> Result<Self> {
        detector.configure(&settings)?;
        Ok(Self {
            detector,
            settings,
            max_frame_width,
            stats: AdapterStats::default(),
        })
    }

    pub fn settings(&self) -> &DetectorSettings {
        &self.settings
    }

    pub fn stats(&self) -> AdapterStats {
        self.stats
    }

    /// Detects landmarks in one frame. A detector failure is logged and
    /// reported as a frame without landmarks.
    pub fn process(&mut self, frame: &DynamicImage) -> FrameLandmarks {
        self.stats.processed += 1;
        let rgb = self.preprocess(frame);

        match self.detector.detect(&rgb) {
            Ok(output) => {
                let landmarks = output.into_landmarks();
                if landmarks.is_empty() {
                    self.stats.empty += 1;
                    debug!("No landmarks in frame {}", self.stats.processed);
                }
                landmarks
            }
            Err(e) => {
                self.stats.failed += 1;
                warn!("Detector failed on frame {}: {:#}", self.stats.processed, e);
                FrameLandmarks::empty()
            }
        }
    }

    fn preprocess(&self, frame: &DynamicImage) -> RgbImage {
        let (w, h) = (frame.width(), frame.height());
        if self.max_frame_width > 0 && w > self.max_frame_width {
            let scale = self.max_frame_width as f32 / w as f32;
            let new_h = ((h as f32 * scale) as u32).max(1);
            frame
                .resize_exact(self.max_frame_width, new_h, FilterType::Triangle)
                .to_rgb8()
        } else {
            frame.to_rgb8()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SizeProbe {
        seen: std::sync::Arc<std::sync::Mutex<Vec<(u32, u32)>>>,
    }

    impl LandmarkDetector for SizeProbe {
        fn detect(&mut self, frame: &RgbImage) -> Result<HolisticOutput> {
            self.seen.lock().unwrap().push(frame.dimensions());
            Ok(HolisticOutput::default())
        }
    }

    struct Failing;

    impl LandmarkDetector for Failing {
        fn detect(&mut self, _frame: &RgbImage) -> Result<HolisticOutput> {
            anyhow::bail!("graph crashed")
        }
    }

    #[test]
    fn holistic_output_converts_empty_parts_to_absent_groups() {
        let output = HolisticOutput {
            pose_landmarks: vec![[0.1, 0.2, 0.3]; 33],
            pose_visibility: vec![0.5; 33],
            ..Default::default()
        };
        let lm = output.into_landmarks();
        assert!(lm.left_hand.is_none());
        assert!(lm.face.is_none());
        let pose = lm.pose.unwrap();
        assert_eq!(pose.len(), 33);
        assert_eq!(pose.points[0].visibility, Some(0.5));
        assert_eq!(pose.mean_visibility(), Some(0.5));
    }

    #[test]
    fn adapter_downscales_wide_frames() {
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut adapter = LandmarkAdapter::new(
            Box::new(SizeProbe { seen: seen.clone() }),
            DetectorSettings::default(),
            640,
        )
        .unwrap();

        adapter.process(&DynamicImage::new_rgb8(1280, 720));
        adapter.process(&DynamicImage::new_rgb8(320, 240));

        assert_eq!(*seen.lock().unwrap(), vec![(640, 360), (320, 240)]);
        assert_eq!(adapter.stats().empty, 2);
    }

    #[test]
    fn detector_failure_becomes_empty_frame() {
        let mut adapter =
            LandmarkAdapter::new(Box::new(Failing), DetectorSettings::default(), 640).unwrap();
        let lm = adapter.process(&DynamicImage::new_rgb8(8, 8));
        assert!(lm.is_empty());
        assert_eq!(adapter.stats().failed, 1);
    }

    #[test]
    fn replay_detector_runs_dry() {
        let mut replay = ReplayDetector::new(vec![HolisticOutput {
            left_hand_landmarks: vec![[0.5, 0.5, 0.0]; 21],
            ..Default::default()
        }]);
        let frame = RgbImage::new(2, 2);
        assert_eq!(replay.detect(&frame).unwrap().left_hand_landmarks.len(), 21);
        assert_eq!(replay.detect(&frame).unwrap(), HolisticOutput::default());
        assert_eq!(replay.remaining(), 0);
    }
}
