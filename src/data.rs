// src/data.rs - Feature corpus CSV export/import for fitting normalization statistics
use anyhow::{Context, Result};
use chrono::Local;
use csv::{ReaderBuilder, StringRecord, Writer};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::assembler::PoseSequence;
use crate::features::FrameFeatureVector;
use crate::normalization::{NormalizationParameters, StatsAccumulator};

const META_COLUMNS: [&str; 4] = ["sample_id", "label", "frame_index", "quality"];

/// One raw frame of a labelled training sample.
#[derive(Debug, Clone, PartialEq)]
pub struct CorpusFrame {
    pub sample_id: String,
    pub label: String,
    pub frame_index: usize,
    pub quality: Option<f32>,
    pub features: FrameFeatureVector,
}

pub struct FeatureCorpusWriter {
    output_dir: PathBuf,
    session_name: String,
    feature_dim: usize,
    frames: Vec<CorpusFrame>,
}

impl FeatureCorpusWriter {
    pub fn new(output_dir: impl AsRef<Path>, session_name: Option<String>, feature_dim: usize) -> Self {
        let session_name = session_name
            .unwrap_or_else(|| format!("corpus_{}", Local::now().format("%Y%m%d_%H%M%S")));

        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
            session_name,
            feature_dim,
            frames: Vec::new(),
        }
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn add_frame(&mut self, frame: CorpusFrame) -> Result<()> {
        if frame.features.len() != self.feature_dim {
            anyhow::bail!(
                "frame {} of {} has {} features, expected {}",
                frame.frame_index,
                frame.sample_id,
                frame.features.len(),
                self.feature_dim
            );
        }
        self.frames.push(frame);
        Ok(())
    }

    /// Adds the real frames of an assembled sequence; padding is left out.
    pub fn add_sequence(&mut self, sample_id: &str, label: &str, sequence: &PoseSequence) -> Result<()> {
        let real = sequence.len() - sequence.padding();
        for (frame_index, features) in sequence.frames()[..real].iter().enumerate() {
            self.add_frame(CorpusFrame {
                sample_id: sample_id.to_string(),
                label: label.to_string(),
                frame_index,
                quality: None,
                features: features.clone(),
            })?;
        }
        Ok(())
    }

    pub fn export_csv(&self) -> Result<PathBuf> {
        let csv_path = self.output_dir.join(&self.session_name).join("features.csv");

        if let Some(parent) = csv_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = File::create(&csv_path)
            .with_context(|| format!("Cannot create {}", csv_path.display()))?;
        let mut writer = Writer::from_writer(file);

        let mut header: Vec<String> = META_COLUMNS.iter().map(|c| c.to_string()).collect();
        header.extend((0..self.feature_dim).map(|i| format!("f{}", i)));
        writer.write_record(&header)?;

        for frame in &self.frames {
            let mut record = vec![
                frame.sample_id.clone(),
                frame.label.clone(),
                frame.frame_index.to_string(),
                frame.quality.map(|q| q.to_string()).unwrap_or_default(),
            ];
            record.extend(frame.features.as_slice().iter().map(|v| v.to_string()));
            writer.write_record(&record)?;
        }

        writer.flush()?;
        info!("Wrote {} frames to {}", self.frames.len(), csv_path.display());
        Ok(csv_path)
    }
}

fn parse_row(record: &StringRecord, line: usize) -> Result<CorpusFrame> {
    if record.len() < META_COLUMNS.len() {
        anyhow::bail!("row {} has only {} columns", line, record.len());
    }
    let quality = match record[3].trim() {
        "" => None,
        q => Some(q.parse().with_context(|| format!("row {}: bad quality {:?}", line, q))?),
    };
    let features = record
        .iter()
        .skip(META_COLUMNS.len())
        .enumerate()
        .map(|(i, v)| {
            v.trim()
                .parse::<f32>()
                .with_context(|| format!("row {}: bad value in column f{}", line, i))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(CorpusFrame {
        sample_id: record[0].to_string(),
        label: record[1].to_string(),
        frame_index: record[2]
            .trim()
            .parse()
            .with_context(|| format!("row {}: bad frame index", line))?,
        quality,
        features: FrameFeatureVector::from_vec(features),
    })
}

pub fn read_feature_corpus(path: impl AsRef<Path>) -> Result<Vec<CorpusFrame>> {
    let mut reader = ReaderBuilder::new()
        .from_path(path.as_ref())
        .with_context(|| format!("Cannot open corpus {}", path.as_ref().display()))?;

    let mut frames = Vec::new();
    for (i, record) in reader.records().enumerate() {
        frames.push(parse_row(&record?, i + 2)?);
    }
    Ok(frames)
}

/// Streams a corpus file into normalization statistics without loading it whole.
pub fn fit_corpus(
    path: impl AsRef<Path>,
    feature_dim: usize,
    std_epsilon: f32,
) -> Result<NormalizationParameters> {
    let mut reader = ReaderBuilder::new()
        .from_path(path.as_ref())
        .with_context(|| format!("Cannot open corpus {}", path.as_ref().display()))?;

    let mut acc = StatsAccumulator::new(feature_dim);
    for (i, record) in reader.records().enumerate() {
        let frame = parse_row(&record?, i + 2)?;
        acc.push(frame.features.as_slice())
            .with_context(|| format!("row {} of {}", i + 2, path.as_ref().display()))?;
    }
    Ok(acc.finish(std_epsilon)?)
}
