use bdsl_recognizer::config::RecognizerConfig;
use bdsl_recognizer::normalization::NormalizationParameters;

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(path) = args.first() else {
        eprintln!("usage: inspect_params <normalization_params.json|.csv> [config.json]");
        std::process::exit(2);
    };

    let config = match args.get(1) {
        Some(p) => match RecognizerConfig::load(p) {
            Ok(c) => c,
            Err(e) => {
                println!("✗ Failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => RecognizerConfig::default(),
    };
    let eps = config.normalization.std_epsilon;

    println!("Inspecting {}...\n", path);

    let loaded = if path.ends_with(".csv") {
        NormalizationParameters::load_csv(path, eps)
    } else {
        NormalizationParameters::load_json(path, eps)
    };

    let params = match loaded {
        Ok(p) => {
            println!("✓ Parameters loaded ({} features)", p.dim());
            p
        }
        Err(e) => {
            println!("✗ Failed to load parameters: {}", e);
            std::process::exit(1);
        }
    };

    match params.check_width(config.feature_dim) {
        Ok(()) => println!("✓ Width matches feature_dim {}", config.feature_dim),
        Err(e) => println!("✗ {}", e),
    }

    let range = |v: &[f32]| {
        v.iter().fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), x| (lo.min(*x), hi.max(*x)))
    };
    let (mlo, mhi) = range(params.means());
    let (slo, shi) = range(params.stds());
    println!("  means: [{:.4}, {:.4}]", mlo, mhi);
    println!("  stds:  [{:.3e}, {:.4}]", slo, shi);
    let floor = params.stds().iter().filter(|s| **s <= eps).count();
    println!("  features at the std floor: {}", floor);

    let zero = params.normalized_zero_frame(config.normalization.clip);
    let clipped = zero
        .as_slice()
        .iter()
        .filter(|v| v.abs() >= config.normalization.clip)
        .count();
    println!("  padding frame values at the clip bound: {}", clipped);

    let meta = params.metadata();
    if let Some(at) = &meta.generated_at {
        println!("  generated: {}", at.to_rfc3339());
    }
    if let Some(version) = &meta.version {
        println!("  version: {}", version);
    }
    if let Some(stats) = &meta.statistics {
        println!("  fitted on {} frames", stats.total_frames);
    }

    match &meta.detector {
        Some(d) if *d == config.detector.settings => println!("✓ Detector settings match"),
        Some(d) => {
            println!("✗ Detector settings differ: fitted with {:?}", d);
            println!("  running with {:?}", config.detector.settings);
        }
        None => println!("? No detector settings recorded"),
    }
}
