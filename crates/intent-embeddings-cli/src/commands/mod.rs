//! CLI command handlers
//!
//! # Modules
//!
//! - `train`: Train from JSONL examples and persist the model
//! - `predict`: Load a persisted model and rank one feature vector

pub mod predict;
pub mod train;

use std::path::Path;

use intent_embeddings::{ClassifierConfig, ClassifierResult};

/// Exit code for success.
pub const EXIT_OK: i32 = 0;
/// Exit code for any failure.
pub const EXIT_ERROR: i32 = 1;
/// Exit code when training ran but produced no model.
pub const EXIT_SKIPPED: i32 = 2;

/// Configuration from an optional TOML file, then environment overrides.
pub fn load_config(path: Option<&Path>) -> ClassifierResult<ClassifierConfig> {
    let config = match path {
        Some(path) => ClassifierConfig::from_file(path)?,
        None => ClassifierConfig::default(),
    };
    Ok(config.with_env_overrides())
}
