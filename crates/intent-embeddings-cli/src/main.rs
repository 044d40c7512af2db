//! Intent Embeddings CLI
//!
//! Operator tools for training and querying the supervised embedding intent
//! classifier on pre-extracted feature vectors.
//!
//! # Commands
//!
//! - `train`: Train a model from a JSONL file of `{features, label}` records
//! - `predict`: Rank intents for one comma-separated feature vector
//!
//! Logs go to stderr; command output (JSON) goes to stdout.
//! Exit code 0 on success, 1 on error, 2 when training was skipped.

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

mod commands;

/// Intent Embeddings CLI - Train and Query Intent Classifiers
#[derive(Parser)]
#[command(name = "intent-embeddings")]
#[command(version)]
#[command(about = "Train and query supervised embedding intent classifiers")]
#[command(propagate_version = true)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a classifier and persist it
    ///
    /// Reads one JSON object per line: {"features": [..], "label": "greet"}
    Train(commands::train::TrainArgs),
    /// Predict the intent of a single feature vector
    Predict(commands::predict::PredictArgs),
}

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    let exit_code = match cli.command {
        Commands::Train(args) => commands::train::handle_train(args),
        Commands::Predict(args) => commands::predict::handle_predict(args),
    };

    std::process::exit(exit_code);
}
