//! Predict command.
//!
//! # Usage
//!
//! ```bash
//! intent-embeddings predict --model-dir models --name intent_classifier \
//!     --features 0.1,0.0,0.7
//! ```
//!
//! Prints `{"intent": {"name", "confidence"}, "intent_ranking": [..]}`.

use std::path::PathBuf;

use clap::Args;
use tracing::error;

use intent_embeddings::{ArtifactDescriptor, EmbeddingIntentClassifier};

use super::{load_config, EXIT_ERROR, EXIT_OK};

/// Arguments for the predict command.
#[derive(Args, Debug)]
pub struct PredictArgs {
    /// Directory holding the model artifacts
    #[arg(long)]
    pub model_dir: PathBuf,

    /// Base file name of the model artifacts
    #[arg(long, default_value = "intent_classifier")]
    pub name: String,

    /// Comma-separated feature vector, e.g. 0.1,0,0.7
    #[arg(long)]
    pub features: String,

    /// TOML hyperparameter file (only `ranking_length` affects prediction)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Parse a comma-separated list of floats.
pub fn parse_features(raw: &str) -> Result<Vec<f32>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<f32>()
                .map_err(|e| format!("invalid feature value '{}': {}", s, e))
        })
        .collect()
}

/// Execute the predict command.
///
/// # Returns
///
/// Exit code:
/// - 0: Prediction printed (possibly the unknown intent when no model exists)
/// - 1: Unparsable features, dimension mismatch, or corrupt model
pub fn handle_predict(args: PredictArgs) -> i32 {
    let features = match parse_features(&args.features) {
        Ok(features) if !features.is_empty() => features,
        Ok(_) => {
            error!("No feature values given");
            return EXIT_ERROR;
        }
        Err(e) => {
            error!("{}", e);
            return EXIT_ERROR;
        }
    };

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return EXIT_ERROR;
        }
    };

    let descriptor = ArtifactDescriptor::new(&args.model_dir, args.name.as_str());
    let classifier = match EmbeddingIntentClassifier::load(&descriptor, config) {
        Ok(classifier) => classifier,
        Err(e) => {
            error!("Failed to load model: {}", e);
            return EXIT_ERROR;
        }
    };

    let result = match classifier.process(&features) {
        Ok(result) => result,
        Err(e) => {
            error!("Prediction failed: {}", e);
            return EXIT_ERROR;
        }
    };

    match serde_json::to_string_pretty(&result) {
        Ok(json) => {
            println!("{}", json);
            EXIT_OK
        }
        Err(e) => {
            error!("Failed to serialize prediction: {}", e);
            EXIT_ERROR
        }
    }
}
