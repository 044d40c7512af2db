//! Supervised embedding intent classifier.
//!
//! Learns a joint embedding space for utterance feature vectors and a fixed
//! set of intent labels. At inference time the input's embedding is compared
//! against every label's embedding and the labels are ranked by similarity.
//!
//! # Architecture
//!
//! - **LabelIndex / LabelRepresentation**: label name <-> id map and the
//!   one-hot or bag-of-tokens label features
//! - **BatchDataset**: index-aligned feature/label batches, sequential or
//!   class-balanced, with a held-out evaluation split
//! - **DualEncoderNetwork**: input tower and label tower projecting into a
//!   shared `embed_dim` space
//! - **SimilarityLoss**: negative-sampling softmax or margin loss over cosine
//!   or inner-product similarity
//! - **Trainer**: epoch loop with linearly growing batch size and Adam
//! - **InferenceEngine**: ranked predictions against the frozen label table
//! - **ModelStore**: safetensors + JSON artifacts keyed by a base name
//! - **EmbeddingIntentClassifier**: train / process / persist / load facade
//!
//! # Example
//!
//! ```rust
//! use intent_embeddings::{ClassifierConfig, EmbeddingIntentClassifier, Example};
//! use intent_embeddings::config::BatchSizeRange;
//!
//! let config = ClassifierConfig {
//!     hidden_layers_sizes_a: vec![],
//!     embed_dim: 4,
//!     batch_size: BatchSizeRange::fixed(2),
//!     epochs: 2,
//!     random_seed: Some(1),
//!     ..ClassifierConfig::default()
//! };
//! let mut classifier = EmbeddingIntentClassifier::new(config).unwrap();
//! classifier
//!     .train(&[
//!         Example::new(vec![1.0, 0.0], "greet"),
//!         Example::new(vec![0.0, 1.0], "bye"),
//!     ])
//!     .unwrap();
//!
//! let result = classifier.process(&[1.0, 0.0]).unwrap();
//! assert!(result.intent.name.is_some());
//! assert!(classifier.process(&[0.0, 0.0]).unwrap().intent.is_unknown());
//! ```

pub mod classifier;
pub mod config;
pub mod error;
pub mod inference;
pub mod storage;
pub mod training;

pub use classifier::{EmbeddingIntentClassifier, TrainingOutcome};
pub use config::{
    resolve_similarity, BatchSizeRange, BatchStrategy, ClassifierConfig, LossType, Similarity,
    SimilarityType,
};
pub use error::{ClassifierError, ClassifierResult, ConfigWarning};
pub use inference::{
    InferenceEngine, IntentPrediction, PredictionResult, RankedIntent, Ranking,
    DEFAULT_RANKING_LENGTH,
};
pub use storage::{ArtifactDescriptor, ModelMetadata, ModelStore, TrainedModel, FORMAT_VERSION};
pub use training::{
    BatchDataset, DualEncoderNetwork, Example, LabelIndex, LabelRepresentation, SimilarityLoss,
    Trainer, TrainingHistory,
};
