//! Train command.
//!
//! # Usage
//!
//! ```bash
//! intent-embeddings train --data examples.jsonl --config intents.toml \
//!     --model-dir models --name intent_classifier
//! ```

use std::path::PathBuf;

use clap::Args;
use serde::Serialize;
use tracing::{error, info};

use intent_embeddings::training::load_examples_jsonl;
use intent_embeddings::{
    ArtifactDescriptor, EmbeddingIntentClassifier, TrainingHistory, TrainingOutcome,
};

use super::{load_config, EXIT_ERROR, EXIT_OK, EXIT_SKIPPED};

/// Arguments for the train command.
#[derive(Args, Debug)]
pub struct TrainArgs {
    /// JSONL file with one {"features": [..], "label": ".."} record per line
    #[arg(long)]
    pub data: PathBuf,

    /// TOML hyperparameter file (defaults apply when omitted)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Directory to write the model artifacts into (created if missing)
    #[arg(long)]
    pub model_dir: PathBuf,

    /// Base file name of the model artifacts
    #[arg(long, default_value = "intent_classifier")]
    pub name: String,
}

/// Summary printed to stdout after training.
#[derive(Debug, Serialize)]
struct TrainReport {
    trained: bool,
    num_examples: usize,
    artifact: ArtifactDescriptor,
    #[serde(skip_serializing_if = "Option::is_none")]
    history: Option<TrainingHistory>,
}

/// Execute the train command.
///
/// # Returns
///
/// Exit code:
/// - 0: Model trained and persisted
/// - 1: Invalid input, configuration, or I/O failure
/// - 2: Fewer than two distinct labels; nothing was trained
pub fn handle_train(args: TrainArgs) -> i32 {
    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return EXIT_ERROR;
        }
    };

    let examples = match load_examples_jsonl(&args.data) {
        Ok(examples) => examples,
        Err(e) => {
            error!("Failed to read examples from {}: {}", args.data.display(), e);
            return EXIT_ERROR;
        }
    };
    info!("Loaded {} examples from {}", examples.len(), args.data.display());

    let mut classifier = match EmbeddingIntentClassifier::new(config) {
        Ok(classifier) => classifier,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return EXIT_ERROR;
        }
    };

    let (history, exit_code) = match classifier.train(&examples) {
        Ok(TrainingOutcome::Trained(history)) => (Some(history), EXIT_OK),
        Ok(TrainingOutcome::Skipped { .. }) => (None, EXIT_SKIPPED),
        Err(e) => {
            error!("Training failed: {}", e);
            return EXIT_ERROR;
        }
    };

    let artifact = match classifier.persist(&args.model_dir, &args.name) {
        Ok(descriptor) => descriptor,
        Err(e) => {
            error!("Failed to persist model to {}: {}", args.model_dir.display(), e);
            return EXIT_ERROR;
        }
    };

    let report = TrainReport {
        trained: history.is_some(),
        num_examples: examples.len(),
        artifact,
        history,
    };
    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            error!("Failed to serialize training report: {}", e);
            return EXIT_ERROR;
        }
    }

    exit_code
}
