//! Hyperparameter configuration for the embedding intent classifier.
//!
//! `ClassifierConfig` is the single source of named hyperparameters. It can
//! be built from defaults, a TOML file, a host-supplied key/value map, or
//! environment overrides. Unrecognized keys are ignored.
//!
//! # Loading Configuration
//!
//! ```rust,ignore
//! use intent_embeddings::ClassifierConfig;
//!
//! let (config, warnings) = ClassifierConfig::from_file("intents.toml")?
//!     .with_env_overrides()
//!     .normalized();
//! config.validate()?;
//! ```
//!
//! # TOML Structure
//!
//! ```toml
//! hidden_layers_sizes_a = [256, 128]
//! hidden_layers_sizes_b = []
//! batch_size = [64, 256]
//! batch_strategy = "balanced"
//! epochs = 300
//! embed_dim = 20
//! num_neg = 20
//! similarity_type = "auto"
//! loss_type = "softmax"
//! C2 = 0.002
//! C_emb = 0.8
//! ```

use std::collections::HashMap;
use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ClassifierError, ClassifierResult, ConfigWarning};

/// Loss family used to train the dual encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LossType {
    /// Cross-entropy over the correct label and sampled negatives.
    #[default]
    Softmax,
    /// Hinge loss with positive and negative similarity margins.
    Margin,
}

/// Requested similarity measure, possibly left to the loss family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityType {
    /// Pick from the loss type: softmax -> inner, margin -> cosine.
    #[default]
    Auto,
    /// Cosine similarity over L2-normalized embeddings.
    Cosine,
    /// Raw inner product.
    Inner,
}

/// Concrete similarity measure after resolving [`SimilarityType::Auto`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Similarity {
    /// Embeddings are L2-normalized; scores lie in `[-1, 1]`.
    Cosine,
    /// Embeddings are left unnormalized; scores are unbounded.
    Inner,
}

impl Similarity {
    /// Whether tower outputs are L2-normalized.
    pub fn normalizes_embeddings(self) -> bool {
        matches!(self, Self::Cosine)
    }
}

/// Resolve the concrete similarity measure for a loss family.
///
/// An explicit request always wins; `auto` maps softmax to inner product
/// and margin to cosine.
pub fn resolve_similarity(loss_type: LossType, requested: SimilarityType) -> Similarity {
    match (requested, loss_type) {
        (SimilarityType::Cosine, _) => Similarity::Cosine,
        (SimilarityType::Inner, _) => Similarity::Inner,
        (SimilarityType::Auto, LossType::Softmax) => Similarity::Inner,
        (SimilarityType::Auto, LossType::Margin) => Similarity::Cosine,
    }
}

/// How training examples are grouped into batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BatchStrategy {
    /// Contiguous slices of a freshly shuffled permutation.
    Sequence,
    /// Round-robin across label classes.
    #[default]
    Balanced,
}

/// Start and end batch size; the size grows linearly across epochs.
///
/// Deserializes from either a single integer (fixed size) or a
/// two-element list `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BatchSizeRepr", into = "[usize; 2]")]
pub struct BatchSizeRange {
    /// Batch size used on the first epoch.
    pub start: usize,
    /// Batch size used on the final epoch.
    pub end: usize,
}

impl BatchSizeRange {
    /// Constant batch size across all epochs.
    pub fn fixed(size: usize) -> Self {
        Self {
            start: size,
            end: size,
        }
    }
}

impl Default for BatchSizeRange {
    fn default() -> Self {
        Self { start: 64, end: 256 }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BatchSizeRepr {
    Fixed(usize),
    Range([usize; 2]),
}

impl From<BatchSizeRepr> for BatchSizeRange {
    fn from(repr: BatchSizeRepr) -> Self {
        match repr {
            BatchSizeRepr::Fixed(size) => Self::fixed(size),
            BatchSizeRepr::Range([start, end]) => Self { start, end },
        }
    }
}

impl From<BatchSizeRange> for [usize; 2] {
    fn from(range: BatchSizeRange) -> Self {
        [range.start, range.end]
    }
}

/// Named hyperparameters of the classifier.
///
/// Field names match the keys accepted from TOML files and host maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    // === Network topology ===
    /// Hidden layer sizes of the input tower. Empty means a direct projection.
    pub hidden_layers_sizes_a: Vec<usize>,
    /// Hidden layer sizes of the label tower.
    pub hidden_layers_sizes_b: Vec<usize>,
    /// Dimensionality of the shared embedding space.
    pub embed_dim: usize,

    // === Training schedule ===
    /// Batch size range, interpolated linearly over epochs.
    pub batch_size: BatchSizeRange,
    /// Batching strategy.
    pub batch_strategy: BatchStrategy,
    /// Number of epochs; training always runs all of them.
    pub epochs: usize,
    /// Seed for every random draw. `None` means nondeterministic.
    pub random_seed: Option<u64>,
    /// Adam step size.
    pub learning_rate: f64,

    // === Similarity and loss ===
    /// Number of negative labels sampled per example.
    pub num_neg: usize,
    /// Requested similarity measure.
    pub similarity_type: SimilarityType,
    /// Loss family.
    pub loss_type: LossType,
    /// Margin the correct-pair similarity should exceed.
    pub mu_pos: f32,
    /// Margin incorrect-pair similarities should stay under.
    pub mu_neg: f32,
    /// Only penalize the hardest negative per example.
    pub use_max_sim_neg: bool,
    /// Down-weight examples the model already ranks confidently.
    pub scale_loss: bool,

    // === Regularization ===
    /// L2 coefficient applied to every dense kernel.
    #[serde(rename = "C2")]
    pub c2: f32,
    /// Weight of the label-embedding separation penalty.
    #[serde(rename = "C_emb")]
    pub c_emb: f32,
    /// Dropout rate after each hidden layer.
    pub droprate: f32,

    // === Label representation ===
    /// Represent labels as bags of tokens split on `intent_split_symbol`.
    pub intent_tokenization_flag: bool,
    /// Delimiter for label tokenization.
    pub intent_split_symbol: String,

    // === Monitoring ===
    /// Evaluate every N epochs; values below 1 mean "only at the end".
    pub evaluate_every_num_epochs: i64,
    /// Size of the held-out evaluation subset; 0 disables evaluation.
    pub evaluate_on_num_examples: usize,

    // === Inference ===
    /// Number of entries in the returned intent ranking.
    pub ranking_length: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            hidden_layers_sizes_a: vec![256, 128],
            hidden_layers_sizes_b: Vec::new(),
            embed_dim: 20,
            batch_size: BatchSizeRange::default(),
            batch_strategy: BatchStrategy::Balanced,
            epochs: 300,
            random_seed: None,
            learning_rate: 0.001,
            num_neg: 20,
            similarity_type: SimilarityType::Auto,
            loss_type: LossType::Softmax,
            mu_pos: 0.8,
            mu_neg: -0.4,
            use_max_sim_neg: true,
            scale_loss: true,
            c2: 0.002,
            c_emb: 0.8,
            droprate: 0.2,
            intent_tokenization_flag: false,
            intent_split_symbol: "_".to_string(),
            evaluate_every_num_epochs: 20,
            evaluate_on_num_examples: 0,
            ranking_length: 10,
        }
    }
}

impl ClassifierConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// - `ClassifierError::ConfigError` if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> ClassifierResult<Self> {
        let path = path.as_ref();

        let contents =
            std::fs::read_to_string(path).map_err(|e| ClassifierError::ConfigError {
                message: format!("Failed to read config file '{}': {}", path.display(), e),
            })?;

        toml::from_str(&contents).map_err(|e| ClassifierError::ConfigError {
            message: format!("Failed to parse TOML in '{}': {}", path.display(), e),
        })
    }

    /// Build configuration from a host-supplied map of named hyperparameters.
    ///
    /// Keys missing from the map keep their defaults; unknown keys are ignored.
    pub fn from_map(map: &HashMap<String, serde_json::Value>) -> ClassifierResult<Self> {
        let object: serde_json::Map<String, serde_json::Value> =
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

        serde_json::from_value(serde_json::Value::Object(object)).map_err(|e| {
            ClassifierError::ConfigError {
                message: format!("Invalid hyperparameter value: {}", e),
            }
        })
    }

    /// Apply environment variable overrides. Prefix: `INTENT_EMBED_`.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `INTENT_EMBED_EPOCHS` | `epochs` |
    /// | `INTENT_EMBED_RANDOM_SEED` | `random_seed` |
    /// | `INTENT_EMBED_EMBED_DIM` | `embed_dim` |
    /// | `INTENT_EMBED_NUM_NEG` | `num_neg` |
    /// | `INTENT_EMBED_LOSS_TYPE` | `loss_type` (`softmax` or `margin`) |
    /// | `INTENT_EMBED_LEARNING_RATE` | `learning_rate` |
    /// | `INTENT_EMBED_EVALUATE_ON_NUM_EXAMPLES` | `evaluate_on_num_examples` |
    ///
    /// Values that fail to parse are ignored.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(n) = env_parse::<usize>("INTENT_EMBED_EPOCHS") {
            self.epochs = n;
        }
        if let Some(seed) = env_parse::<u64>("INTENT_EMBED_RANDOM_SEED") {
            self.random_seed = Some(seed);
        }
        if let Some(n) = env_parse::<usize>("INTENT_EMBED_EMBED_DIM") {
            self.embed_dim = n;
        }
        if let Some(n) = env_parse::<usize>("INTENT_EMBED_NUM_NEG") {
            self.num_neg = n;
        }
        if let Ok(val) = env::var("INTENT_EMBED_LOSS_TYPE") {
            match val.to_lowercase().as_str() {
                "softmax" => self.loss_type = LossType::Softmax,
                "margin" => self.loss_type = LossType::Margin,
                other => tracing::warn!("Ignoring unknown INTENT_EMBED_LOSS_TYPE '{}'", other),
            }
        }
        if let Some(lr) = env_parse::<f64>("INTENT_EMBED_LEARNING_RATE") {
            self.learning_rate = lr;
        }
        if let Some(n) = env_parse::<usize>("INTENT_EMBED_EVALUATE_ON_NUM_EXAMPLES") {
            self.evaluate_on_num_examples = n;
        }
        self
    }

    /// Resolve derived settings once and auto-correct recoverable issues.
    ///
    /// - `similarity_type = auto` is replaced by the concrete measure
    /// - tokenization without a delimiter is disabled
    /// - an evaluation interval below 1 becomes the epoch count
    ///
    /// Every correction is logged and returned.
    #[must_use]
    pub fn normalized(mut self) -> (Self, Vec<ConfigWarning>) {
        let mut warnings = Vec::new();

        self.similarity_type = match resolve_similarity(self.loss_type, self.similarity_type) {
            Similarity::Cosine => SimilarityType::Cosine,
            Similarity::Inner => SimilarityType::Inner,
        };

        if self.intent_tokenization_flag && self.intent_split_symbol.is_empty() {
            self.intent_tokenization_flag = false;
            warnings.push(ConfigWarning::TokenizationWithoutDelimiter);
        }

        if self.evaluate_every_num_epochs < 1 {
            warnings.push(ConfigWarning::EvaluationIntervalClamped {
                requested: self.evaluate_every_num_epochs,
                epochs: self.epochs,
            });
            self.evaluate_every_num_epochs = self.epochs as i64;
        }

        for warning in &warnings {
            tracing::warn!("{}", warning);
        }

        (self, warnings)
    }

    /// Concrete similarity measure for this configuration.
    pub fn similarity(&self) -> Similarity {
        resolve_similarity(self.loss_type, self.similarity_type)
    }

    /// Evaluation interval in epochs, never below 1.
    pub fn evaluation_interval(&self) -> usize {
        if self.evaluate_every_num_epochs < 1 {
            self.epochs.max(1)
        } else {
            self.evaluate_every_num_epochs as usize
        }
    }

    /// Validate value ranges.
    ///
    /// # Errors
    /// - `ClassifierError::ConfigError` naming the first invalid field
    pub fn validate(&self) -> ClassifierResult<()> {
        fn invalid(message: impl Into<String>) -> ClassifierResult<()> {
            Err(ClassifierError::ConfigError {
                message: message.into(),
            })
        }

        if self.epochs == 0 {
            return invalid("epochs must be > 0");
        }
        if self.embed_dim == 0 {
            return invalid("embed_dim must be > 0");
        }
        if self.batch_size.start == 0 || self.batch_size.end == 0 {
            return invalid(format!(
                "batch_size must be > 0, got [{}, {}]",
                self.batch_size.start, self.batch_size.end
            ));
        }
        if self.num_neg == 0 {
            return invalid("num_neg must be > 0");
        }
        if let Some(size) = self
            .hidden_layers_sizes_a
            .iter()
            .chain(self.hidden_layers_sizes_b.iter())
            .find(|&&s| s == 0)
        {
            return invalid(format!("hidden layer sizes must be > 0, got {}", size));
        }
        if !(0.0..1.0).contains(&self.droprate) {
            return invalid(format!("droprate must be in [0, 1), got {}", self.droprate));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return invalid(format!(
                "learning_rate must be > 0 and finite, got {}",
                self.learning_rate
            ));
        }
        if self.c2 < 0.0 || self.c2.is_nan() {
            return invalid(format!("C2 must be >= 0, got {}", self.c2));
        }
        if self.c_emb < 0.0 || self.c_emb.is_nan() {
            return invalid(format!("C_emb must be >= 0, got {}", self.c_emb));
        }
        if !self.mu_pos.is_finite() || !self.mu_neg.is_finite() {
            return invalid("mu_pos and mu_neg must be finite");
        }
        if self.ranking_length == 0 {
            return invalid("ranking_length must be > 0");
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = ClassifierConfig::default();
        assert_eq!(config.hidden_layers_sizes_a, vec![256, 128]);
        assert!(config.hidden_layers_sizes_b.is_empty());
        assert_eq!(config.batch_size, BatchSizeRange { start: 64, end: 256 });
        assert_eq!(config.batch_strategy, BatchStrategy::Balanced);
        assert_eq!(config.epochs, 300);
        assert_eq!(config.embed_dim, 20);
        assert_eq!(config.num_neg, 20);
        assert_eq!(config.loss_type, LossType::Softmax);
        assert!((config.mu_pos - 0.8).abs() < 1e-6);
        assert!((config.mu_neg + 0.4).abs() < 1e-6);
        assert!((config.c2 - 0.002).abs() < 1e-6);
        assert!((config.c_emb - 0.8).abs() < 1e-6);
        assert_eq!(config.evaluate_every_num_epochs, 20);
        assert_eq!(config.evaluate_on_num_examples, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_resolve_similarity_table() {
        use SimilarityType::*;
        assert_eq!(resolve_similarity(LossType::Softmax, Auto), Similarity::Inner);
        assert_eq!(resolve_similarity(LossType::Margin, Auto), Similarity::Cosine);
        assert_eq!(resolve_similarity(LossType::Softmax, Cosine), Similarity::Cosine);
        assert_eq!(resolve_similarity(LossType::Margin, Inner), Similarity::Inner);
    }

    #[test]
    fn test_from_map_ignores_unknown_keys() {
        let mut map = HashMap::new();
        map.insert("epochs".to_string(), serde_json::json!(5));
        map.insert("loss_type".to_string(), serde_json::json!("margin"));
        map.insert("C_emb".to_string(), serde_json::json!(0.5));
        map.insert("name".to_string(), serde_json::json!("EmbeddingIntentClassifier"));

        let config = ClassifierConfig::from_map(&map).unwrap();
        assert_eq!(config.epochs, 5);
        assert_eq!(config.loss_type, LossType::Margin);
        assert!((config.c_emb - 0.5).abs() < 1e-6);
        assert_eq!(config.embed_dim, 20);
    }

    #[test]
    fn test_from_map_rejects_wrong_type() {
        let mut map = HashMap::new();
        map.insert("epochs".to_string(), serde_json::json!("many"));
        assert!(ClassifierConfig::from_map(&map).is_err());
    }

    #[test]
    fn test_batch_size_accepts_scalar_and_pair() {
        let mut map = HashMap::new();
        map.insert("batch_size".to_string(), serde_json::json!(32));
        let config = ClassifierConfig::from_map(&map).unwrap();
        assert_eq!(config.batch_size, BatchSizeRange::fixed(32));

        map.insert("batch_size".to_string(), serde_json::json!([8, 16]));
        let config = ClassifierConfig::from_map(&map).unwrap();
        assert_eq!(config.batch_size, BatchSizeRange { start: 8, end: 16 });
    }

    #[test]
    fn test_from_file_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("intents.toml");
        std::fs::write(
            &path,
            r#"
hidden_layers_sizes_a = [64]
batch_size = [4, 8]
batch_strategy = "sequence"
similarity_type = "cosine"
C2 = 0.01
random_seed = 7
unknown_key = "ignored"
"#,
        )
        .unwrap();

        let config = ClassifierConfig::from_file(&path).unwrap();
        assert_eq!(config.hidden_layers_sizes_a, vec![64]);
        assert_eq!(config.batch_size, BatchSizeRange { start: 4, end: 8 });
        assert_eq!(config.batch_strategy, BatchStrategy::Sequence);
        assert_eq!(config.similarity_type, SimilarityType::Cosine);
        assert!((config.c2 - 0.01).abs() < 1e-6);
        assert_eq!(config.random_seed, Some(7));
    }

    #[test]
    fn test_from_file_missing_is_config_error() {
        let err = ClassifierConfig::from_file("/nonexistent/intents.toml").unwrap_err();
        assert!(matches!(err, ClassifierError::ConfigError { .. }));
    }

    #[test]
    fn test_normalized_resolves_auto_and_clamps() {
        let config = ClassifierConfig {
            loss_type: LossType::Margin,
            intent_tokenization_flag: true,
            intent_split_symbol: String::new(),
            evaluate_every_num_epochs: 0,
            epochs: 40,
            ..Default::default()
        };

        let (config, warnings) = config.normalized();
        assert_eq!(config.similarity_type, SimilarityType::Cosine);
        assert!(!config.intent_tokenization_flag);
        assert_eq!(config.evaluate_every_num_epochs, 40);
        assert_eq!(warnings.len(), 2);
        assert!(warnings.contains(&ConfigWarning::TokenizationWithoutDelimiter));
    }

    #[test]
    fn test_normalized_is_idempotent() {
        let (once, _) = ClassifierConfig::default().normalized();
        let (twice, warnings) = once.clone().normalized();
        assert_eq!(once, twice);
        assert!(warnings.is_empty());
        assert_eq!(twice.similarity(), Similarity::Inner);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad = [
            ClassifierConfig {
                epochs: 0,
                ..Default::default()
            },
            ClassifierConfig {
                droprate: 1.0,
                ..Default::default()
            },
            ClassifierConfig {
                batch_size: BatchSizeRange { start: 0, end: 4 },
                ..Default::default()
            },
            ClassifierConfig {
                hidden_layers_sizes_b: vec![0],
                ..Default::default()
            },
            ClassifierConfig {
                learning_rate: 0.0,
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(
                matches!(config.validate(), Err(ClassifierError::ConfigError { .. })),
                "expected config error for {:?}",
                config
            );
        }
    }

    #[test]
    fn test_env_overrides() {
        env::set_var("INTENT_EMBED_EPOCHS", "12");
        env::set_var("INTENT_EMBED_LOSS_TYPE", "margin");
        let config = ClassifierConfig::default().with_env_overrides();
        env::remove_var("INTENT_EMBED_EPOCHS");
        env::remove_var("INTENT_EMBED_LOSS_TYPE");

        assert_eq!(config.epochs, 12);
        assert_eq!(config.loss_type, LossType::Margin);
    }
}
