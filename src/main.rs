// src/main.rs
use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

use bdsl_recognizer::config::RecognizerConfig;
use bdsl_recognizer::data::fit_corpus;
use bdsl_recognizer::landmarks::HolisticOutput;
use bdsl_recognizer::pipeline::Recognizer;

const USAGE: &str = "usage:
  bdsl-recognizer fit-normalization <features.csv> <out_dir> [config.json]
  bdsl-recognizer predict-landmarks <landmarks.json> [config.json]";

fn main() {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let result = match args.first().map(String::as_str) {
        Some("fit-normalization") if args.len() >= 3 => {
            fit_normalization(Path::new(&args[1]), Path::new(&args[2]), args.get(3))
        }
        Some("predict-landmarks") if args.len() >= 2 => predict_landmarks(Path::new(&args[1]), args.get(2)),
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_config(path: Option<&String>) -> Result<RecognizerConfig> {
    match path {
        Some(p) => Ok(RecognizerConfig::load(p)?),
        None => Ok(RecognizerConfig::default()),
    }
}

fn fit_normalization(corpus: &Path, out_dir: &Path, config: Option<&String>) -> Result<()> {
    let config = load_config(config)?;
    let params = fit_corpus(corpus, config.feature_dim, config.normalization.std_epsilon)?;
    // stamp the detector settings the corpus was extracted with
    let mut metadata = params.metadata().clone();
    metadata.detector = Some(config.detector.settings.clone());
    let params = params.with_metadata(metadata);

    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("Cannot create {}", out_dir.display()))?;
    let res = &config.resources;
    params.save_json(out_dir.join(&res.normalization_json))?;
    params.save_csv(out_dir.join(&res.normalization_csv))?;
    params.save_npy(out_dir.join(&res.means_npy), out_dir.join(&res.stds_npy))?;

    info!("Normalization parameters written to {}", out_dir.display());
    Ok(())
}

fn predict_landmarks(dump: &Path, config: Option<&String>) -> Result<()> {
    let recognizer = Recognizer::from_config(load_config(config)?)?;

    let content = std::fs::read_to_string(dump)
        .with_context(|| format!("Cannot read {}", dump.display()))?;
    let outputs: Vec<HolisticOutput> = serde_json::from_str(&content)
        .with_context(|| format!("Invalid landmark dump {}", dump.display()))?;
    let frames: Vec<_> = outputs.into_iter().map(HolisticOutput::into_landmarks).collect();

    let recognition = recognizer.recognize_landmarks(&frames)?;
    println!("{}", serde_json::to_string_pretty(&recognition)?);
    Ok(())
}
