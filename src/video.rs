// src/video.rs - Frame sources: video files via ffmpeg, image lists, in-memory frames
use anyhow::{Context, Result};
use image::DynamicImage;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

pub struct VideoFileReader {
    path: PathBuf,
    total_frames: usize,
    width: u32,
    height: u32,
    fps: f32,
}

impl VideoFileReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            anyhow::bail!("Video file does not exist: {}", path.display());
        }
        fs::File::open(&path)
            .with_context(|| format!("Cannot read video file {}", path.display()))?;

        if Command::new("ffprobe").arg("-version").output().is_err() {
            anyhow::bail!("ffprobe is not installed or not in PATH");
        }

        let output = Command::new("ffprobe")
            .args(["-v", "error", "-select_streams", "v:0", "-count_frames"])
            .args(["-show_entries", "stream=width,height,r_frame_rate,nb_read_frames"])
            .args(["-of", "csv=p=0"])
            .arg(&path)
            .output()
            .context("Failed to run ffprobe")?;

        let info = String::from_utf8_lossy(&output.stdout);
        let probe = parse_probe(&info)?;
        info!(
            "Opened {} ({}x{}, {:.1} fps, {} frames)",
            path.display(),
            probe.width,
            probe.height,
            probe.fps,
            probe.total_frames
        );

        Ok(Self {
            path,
            total_frames: probe.total_frames,
            width: probe.width,
            height: probe.height,
            fps: probe.fps,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn fps(&self) -> f32 {
        self.fps
    }

    /// Decodes only the requested frames. The result is parallel to `indices`;
    /// a frame ffmpeg did not produce or that fails to decode is `None`.
    pub fn extract_frames(&self, indices: &[usize]) -> Result<Vec<Option<DynamicImage>>> {
        if indices.is_empty() {
            return Ok(Vec::new());
        }
        if Command::new("ffmpeg").arg("-version").output().is_err() {
            anyhow::bail!("ffmpeg is not installed or not in PATH");
        }

        let temp_dir = std::env::temp_dir().join(format!("bdsl_{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&temp_dir)
            .with_context(|| format!("Cannot create temporary directory {}", temp_dir.display()))?;

        let select = indices
            .iter()
            .map(|i| format!("eq(n\\,{})", i))
            .collect::<Vec<_>>()
            .join("+");
        let filter = format!("select={}", select);

        let status = Command::new("ffmpeg")
            .args(["-v", "error", "-i"])
            .arg(&self.path)
            .args(["-vf", filter.as_str(), "-vsync", "vfr"])
            .arg(temp_dir.join("frame_%04d.png"))
            .status()
            .context("Failed to extract frames with ffmpeg");

        let status = match status {
            Ok(s) => s,
            Err(e) => {
                let _ = fs::remove_dir_all(&temp_dir);
                return Err(e);
            }
        };
        if !status.success() {
            let _ = fs::remove_dir_all(&temp_dir);
            anyhow::bail!("ffmpeg frame extraction failed for {}", self.path.display());
        }

        // ffmpeg numbers its output from 1 in selection order
        let frames = (1..=indices.len())
            .map(|n| {
                let frame_path = temp_dir.join(format!("frame_{:04}.png", n));
                if !frame_path.exists() {
                    return None;
                }
                match image::open(&frame_path) {
                    Ok(img) => Some(img),
                    Err(e) => {
                        warn!("Failed to decode frame {}: {}", indices[n - 1], e);
                        None
                    }
                }
            })
            .collect();

        let _ = fs::remove_dir_all(&temp_dir);
        Ok(frames)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Probe {
    width: u32,
    height: u32,
    fps: f32,
    total_frames: usize,
}

fn parse_probe(info: &str) -> Result<Probe> {
    let parts: Vec<&str> = info.trim().split(',').map(str::trim).collect();
    if parts.len() < 4 {
        anyhow::bail!("Invalid video format or corrupted file");
    }

    let width = parts[0].parse().context("Invalid video width")?;
    let height = parts[1].parse().context("Invalid video height")?;
    let fps = match parts[2].split_once('/') {
        Some((num, den)) => {
            let num: f32 = num.parse().unwrap_or(30.0);
            let den: f32 = den.parse().unwrap_or(1.0);
            if den > 0.0 {
                num / den
            } else {
                30.0
            }
        }
        None => parts[2].parse().unwrap_or(30.0),
    };
    let total_frames: usize = parts[3].parse().context("Invalid frame count")?;
    if total_frames == 0 {
        anyhow::bail!("Video has no frames");
    }

    Ok(Probe {
        width,
        height,
        fps,
        total_frames,
    })
}

/// Where the frames of one recognition request come from.
pub enum FrameSource {
    Video(VideoFileReader),
    Files(Vec<PathBuf>),
    Images(Vec<DynamicImage>),
}

impl FrameSource {
    pub fn video(path: impl AsRef<Path>) -> Result<Self> {
        Ok(FrameSource::Video(VideoFileReader::open(path)?))
    }

    pub fn total_frames(&self) -> usize {
        match self {
            FrameSource::Video(reader) => reader.total_frames(),
            FrameSource::Files(paths) => paths.len(),
            FrameSource::Images(images) => images.len(),
        }
    }

    /// Loads the frames at `indices`, in order. Unreadable frames come back as
    /// `None`; an error means the source as a whole could not be read.
    pub fn load_frames(&mut self, indices: &[usize]) -> Result<Vec<Option<DynamicImage>>> {
        match self {
            FrameSource::Video(reader) => reader.extract_frames(indices),
            FrameSource::Files(paths) => Ok(indices
                .iter()
                .map(|i| {
                    let path = paths.get(*i)?;
                    match image::open(path) {
                        Ok(img) => Some(img),
                        Err(e) => {
                            warn!("Failed to load frame {}: {}", path.display(), e);
                            None
                        }
                    }
                })
                .collect()),
            FrameSource::Images(images) => {
                debug!("Using {} of {} in-memory frames", indices.len(), images.len());
                Ok(indices.iter().map(|i| images.get(*i).cloned()).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_output_parses() {
        let probe = parse_probe("1280,720,30000/1001,95\n").unwrap();
        assert_eq!(probe.width, 1280);
        assert_eq!(probe.total_frames, 95);
        assert!((probe.fps - 29.97).abs() < 0.01);

        assert!(parse_probe("1280,720,30/1,0").is_err());
        assert!(parse_probe("garbage").is_err());
    }

    #[test]
    fn missing_video_is_an_error() {
        assert!(VideoFileReader::open("/definitely/not/here.mp4").is_err());
    }

    #[test]
    fn file_list_marks_unreadable_frames() {
        let dir = std::env::temp_dir().join(format!("bdsl_frames_{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let good = dir.join("a.png");
        DynamicImage::new_rgb8(4, 4).save(&good).unwrap();
        let bad = dir.join("b.png");
        fs::write(&bad, b"not a png").unwrap();

        let mut source = FrameSource::Files(vec![good, bad]);
        assert_eq!(source.total_frames(), 2);
        let frames = source.load_frames(&[0, 1, 5]).unwrap();
        assert!(frames[0].is_some());
        assert!(frames[1].is_none());
        assert!(frames[2].is_none());

        let _ = fs::remove_dir_all(&dir);
    }
}
