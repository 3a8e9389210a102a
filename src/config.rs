// src/config.rs - Recognizer settings and resource resolution
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::assembler::{AssemblyOptions, QualityFilter, SamplingStrategy};
use crate::error::{NormalizationError, RecognitionError};
use crate::features::{FeatureEncoder, FeatureLayout, LayoutSpec, FEATURE_DIM};
use crate::landmarks::DetectorSettings;
use crate::normalization::NormalizationParameters;
use crate::quality::{QualityScorer, QualityWeights};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognizerConfig {
    pub sequence_length: usize,
    pub feature_layout: LayoutSpec,
    pub feature_dim: usize,
    pub sampling: SamplingStrategy,
    pub quality: QualitySettings,
    pub normalization: NormalizationSettings,
    pub detector: DetectorConfig,
    pub resources: ResourceSettings,
    pub live: LiveSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualitySettings {
    pub enabled: bool,
    pub threshold: f32,
    pub min_frames: usize,
    pub motion_scale: f32,
    pub zero_epsilon: f32,
    pub weights: QualityWeights,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationSettings {
    pub clip: f32,
    pub std_epsilon: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    #[serde(flatten)]
    pub settings: DetectorSettings,
    /// Frames wider than this are downscaled before detection.
    pub max_frame_width: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSettings {
    /// Searched first, in order.
    pub search_dirs: Vec<PathBuf>,
    /// Also search the per-user data directory.
    pub use_user_data_dir: bool,
    pub model_file: String,
    pub labels_file: String,
    pub normalization_json: String,
    pub normalization_csv: String,
    pub means_npy: String,
    pub stds_npy: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveSettings {
    /// Frames kept per session; older frames are dropped.
    pub buffer_capacity: usize,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            sequence_length: 30,
            feature_layout: LayoutSpec::default(),
            feature_dim: FEATURE_DIM,
            sampling: SamplingStrategy::default(),
            quality: QualitySettings::default(),
            normalization: NormalizationSettings::default(),
            detector: DetectorConfig::default(),
            resources: ResourceSettings::default(),
            live: LiveSettings::default(),
        }
    }
}

impl Default for QualitySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.4,
            min_frames: 5,
            motion_scale: 1000.0,
            zero_epsilon: 1e-6,
            weights: QualityWeights::default(),
        }
    }
}

impl Default for NormalizationSettings {
    fn default() -> Self {
        Self {
            clip: 5.0,
            std_epsilon: 1e-8,
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            settings: DetectorSettings::default(),
            max_frame_width: 640,
        }
    }
}

impl Default for ResourceSettings {
    fn default() -> Self {
        Self {
            search_dirs: Vec::new(),
            use_user_data_dir: true,
            model_file: "bangla_lstm.json".to_string(),
            labels_file: "class_mappings.json".to_string(),
            normalization_json: "normalization_params.json".to_string(),
            normalization_csv: "normalization_params.csv".to_string(),
            means_npy: "feature_means.npy".to_string(),
            stds_npy: "feature_stds.npy".to_string(),
        }
    }
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self { buffer_capacity: 50 }
    }
}

impl RecognizerConfig {
    /// Missing fields take their defaults; a file that is not valid JSON is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RecognitionError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            RecognitionError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            RecognitionError::Config(format!("invalid config {}: {}", path.display(), e))
        })?;
        config.validate()?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), RecognitionError> {
        let fail = |msg: &str| Err(RecognitionError::Config(msg.to_string()));

        if self.sequence_length == 0 {
            return fail("sequence_length must be positive");
        }
        if self.feature_dim == 0 {
            return fail("feature_dim must be positive");
        }
        if !(0.0..=1.0).contains(&self.quality.threshold) {
            return fail("quality.threshold must lie in [0, 1]");
        }
        if !(self.normalization.clip.is_finite() && self.normalization.clip > 0.0) {
            return fail("normalization.clip must be a positive number");
        }
        if !(self.normalization.std_epsilon > 0.0) {
            return fail("normalization.std_epsilon must be positive");
        }
        if self.live.buffer_capacity == 0 {
            return fail("live.buffer_capacity must be positive");
        }

        let layout_dim = self.feature_layout().dimension();
        if layout_dim != self.feature_dim {
            warn!(
                "Layout width {} differs from feature_dim {}; frames will be resized",
                layout_dim, self.feature_dim
            );
        }
        Ok(())
    }

    pub fn feature_layout(&self) -> FeatureLayout {
        FeatureLayout::from_spec(&self.feature_layout)
    }

    pub fn encoder(&self) -> FeatureEncoder {
        FeatureEncoder::new(self.feature_layout(), self.feature_dim)
    }

    pub fn quality_scorer(&self) -> QualityScorer {
        QualityScorer::new(
            self.quality.weights.clone(),
            self.quality.motion_scale,
            self.quality.zero_epsilon,
        )
    }

    pub fn assembly_options(&self) -> AssemblyOptions {
        AssemblyOptions {
            sequence_length: self.sequence_length,
            sampling: self.sampling,
            filter: self.quality.enabled.then(|| QualityFilter {
                threshold: self.quality.threshold,
                min_frames: self.quality.min_frames,
            }),
        }
    }
}

/// Where a set of normalization statistics was found.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizationSource {
    Json(PathBuf),
    Csv(PathBuf),
    Npy { means: PathBuf, stds: PathBuf },
}

impl NormalizationSource {
    pub fn load(&self, std_epsilon: f32) -> Result<NormalizationParameters, NormalizationError> {
        match self {
            NormalizationSource::Json(path) => NormalizationParameters::load_json(path, std_epsilon),
            NormalizationSource::Csv(path) => NormalizationParameters::load_csv(path, std_epsilon),
            NormalizationSource::Npy { means, stds } => {
                NormalizationParameters::load_npy(means, stds, std_epsilon)
            }
        }
    }
}

/// Files picked once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedResources {
    pub model: PathBuf,
    pub labels: PathBuf,
    /// `None` runs the pipeline unnormalized.
    pub normalization: Option<NormalizationSource>,
}

/// Ordered list of directories that may hold model artifacts.
#[derive(Debug, Clone)]
pub struct ResourceLocator {
    dirs: Vec<PathBuf>,
}

impl ResourceLocator {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    /// Configured directories, then the user data directory, then `./data`.
    pub fn from_settings(settings: &ResourceSettings) -> Self {
        let mut dirs = settings.search_dirs.clone();
        if settings.use_user_data_dir {
            if let Some(project) = directories::ProjectDirs::from("org", "bdsl", "bdsl-recognizer") {
                dirs.push(project.data_dir().to_path_buf());
            }
        }
        dirs.push(PathBuf::from("./data"));
        Self::new(dirs)
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    pub fn find(&self, file_name: &str) -> Option<PathBuf> {
        self.dirs
            .iter()
            .map(|dir| dir.join(file_name))
            .find(|path| path.is_file())
    }

    pub fn resolve(&self, settings: &ResourceSettings) -> Result<ResolvedResources, RecognitionError> {
        let required = |name: &str| {
            self.find(name).ok_or_else(|| {
                RecognitionError::ResourceUnresolved(format!(
                    "{} (searched {})",
                    name,
                    self.describe()
                ))
            })
        };

        let model = required(&settings.model_file)?;
        let labels = required(&settings.labels_file)?;
        let normalization = self.find_normalization(settings);

        info!("Model weights: {}", model.display());
        info!("Class mapping: {}", labels.display());
        match &normalization {
            Some(source) => info!("Normalization parameters: {:?}", source),
            None => warn!("No normalization parameters found; predictions will be unnormalized"),
        }

        Ok(ResolvedResources {
            model,
            labels,
            normalization,
        })
    }

    fn find_normalization(&self, settings: &ResourceSettings) -> Option<NormalizationSource> {
        for dir in &self.dirs {
            let json = dir.join(&settings.normalization_json);
            if json.is_file() {
                return Some(NormalizationSource::Json(json));
            }
            let csv = dir.join(&settings.normalization_csv);
            if csv.is_file() {
                return Some(NormalizationSource::Csv(csv));
            }
            let means = dir.join(&settings.means_npy);
            let stds = dir.join(&settings.stds_npy);
            if means.is_file() && stds.is_file() {
                return Some(NormalizationSource::Npy { means, stds });
            }
            debug!("No normalization parameters in {}", dir.display());
        }
        None
    }

    fn describe(&self) -> String {
        self.dirs
            .iter()
            .map(|d| d.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("bdsl_{}_{}", tag, uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let config: RecognizerConfig =
            serde_json::from_str(r#"{"sequence_length": 20, "quality": {"threshold": 0.5}}"#).unwrap();
        assert_eq!(config.sequence_length, 20);
        assert_eq!(config.quality.threshold, 0.5);
        assert_eq!(config.quality.min_frames, 5);
        assert_eq!(config.feature_dim, 288);
        assert_eq!(config.detector.max_frame_width, 640);
        assert_eq!(config.detector.settings.model_complexity, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn malformed_or_invalid_config_is_a_config_error() {
        let dir = temp_dir("cfg");
        let path = dir.join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(
            RecognizerConfig::load(&path).unwrap_err().reason_code(),
            "config_error"
        );

        fs::write(&path, r#"{"normalization": {"clip": -1.0}}"#).unwrap();
        assert!(RecognizerConfig::load(&path).is_err());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = temp_dir("cfg_save");
        let path = dir.join("config.json");
        let mut config = RecognizerConfig::default();
        config.sampling = SamplingStrategy::Uniform;
        config.save(&path).unwrap();
        assert_eq!(RecognizerConfig::load(&path).unwrap(), config);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn disabled_quality_filter_yields_no_filter() {
        let mut config = RecognizerConfig::default();
        assert!(config.assembly_options().filter.is_some());
        config.quality.enabled = false;
        assert!(config.assembly_options().filter.is_none());
    }

    #[test]
    fn earlier_directories_win() {
        let first = temp_dir("res_a");
        let second = temp_dir("res_b");
        let settings = ResourceSettings::default();
        fs::write(second.join(&settings.model_file), "{}").unwrap();
        fs::write(second.join(&settings.labels_file), "[]").unwrap();
        fs::write(first.join(&settings.labels_file), "[]").unwrap();
        fs::write(second.join(&settings.means_npy), "").unwrap();
        fs::write(second.join(&settings.stds_npy), "").unwrap();

        let locator = ResourceLocator::new(vec![first.clone(), second.clone()]);
        let resolved = locator.resolve(&settings).unwrap();
        assert_eq!(resolved.model, second.join(&settings.model_file));
        assert_eq!(resolved.labels, first.join(&settings.labels_file));
        assert!(matches!(resolved.normalization, Some(NormalizationSource::Npy { .. })));

        let _ = fs::remove_dir_all(&first);
        let _ = fs::remove_dir_all(&second);
    }

    #[test]
    fn missing_model_is_unresolved() {
        let dir = temp_dir("res_empty");
        let locator = ResourceLocator::new(vec![dir.clone()]);
        let err = locator.resolve(&ResourceSettings::default()).unwrap_err();
        assert_eq!(err.reason_code(), "resource_unresolved");
        let _ = fs::remove_dir_all(&dir);
    }
}
