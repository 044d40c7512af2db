//! Host-facing intent classifier component.
//!
//! `EmbeddingIntentClassifier` composes the pieces of this crate into the
//! four calls a pipeline host makes: `train`, `process`, `persist`, `load`.
//!
//! # Example
//!
//! ```rust,ignore
//! use intent_embeddings::{ClassifierConfig, EmbeddingIntentClassifier, Example};
//!
//! let mut classifier = EmbeddingIntentClassifier::new(ClassifierConfig::default())?;
//! classifier.train(&examples)?;
//! let descriptor = classifier.persist(Path::new("models"), "intent")?;
//!
//! let restored = EmbeddingIntentClassifier::load(&descriptor, ClassifierConfig::default())?;
//! let result = restored.process(&features)?;
//! println!("{:?}", result.intent);
//! ```

use std::path::Path;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::ClassifierConfig;
use crate::error::{ClassifierError, ClassifierResult, ConfigWarning};
use crate::inference::{InferenceEngine, PredictionResult};
use crate::storage::{ArtifactDescriptor, ModelStore, TrainedModel};
use crate::training::{
    split_session_data, BatchDataset, DualEncoderNetwork, Example, LabelIndex,
    LabelRepresentation, LossConfig, NetworkTopology, SessionData, SimilarityLoss, Trainer,
    TrainingConfig, TrainingHistory,
};

/// What a call to [`EmbeddingIntentClassifier::train`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainingOutcome {
    /// A model was trained and is now served.
    Trained(TrainingHistory),
    /// Too few distinct labels; no model is available.
    Skipped { distinct_labels: usize },
}

impl TrainingOutcome {
    pub fn is_trained(&self) -> bool {
        matches!(self, Self::Trained(_))
    }
}

/// Supervised embedding intent classifier.
#[derive(Debug)]
pub struct EmbeddingIntentClassifier {
    config: ClassifierConfig,
    warnings: Vec<ConfigWarning>,
    store: ModelStore,
    engine: InferenceEngine,
}

impl EmbeddingIntentClassifier {
    /// Create an untrained classifier.
    ///
    /// The configuration is normalized once here; corrections are logged and
    /// available through [`Self::warnings`].
    ///
    /// # Errors
    /// - `ClassifierError::ConfigError` if a value is out of range
    pub fn new(config: ClassifierConfig) -> ClassifierResult<Self> {
        Self::with_store(config, ModelStore::default())
    }

    /// Create an untrained classifier whose tensors live on the store's device.
    pub fn with_store(config: ClassifierConfig, store: ModelStore) -> ClassifierResult<Self> {
        let (config, warnings) = config.normalized();
        config.validate()?;
        let engine = InferenceEngine::empty().with_ranking_length(config.ranking_length);
        Ok(Self {
            config,
            warnings,
            store,
            engine,
        })
    }

    /// Normalized configuration.
    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Configuration corrections made so far.
    pub fn warnings(&self) -> &[ConfigWarning] {
        &self.warnings
    }

    pub fn model(&self) -> Option<&Arc<TrainedModel>> {
        self.engine.model()
    }

    pub fn is_trained(&self) -> bool {
        self.engine.is_loaded()
    }

    /// Engine serving the current model; clone it to share across threads.
    pub fn engine(&self) -> &InferenceEngine {
        &self.engine
    }

    /// Train on `examples`, replacing any current model.
    ///
    /// Fewer than two distinct labels is not an error: the classifier is left
    /// without a model and reports [`TrainingOutcome::Skipped`].
    ///
    /// # Errors
    /// - `ClassifierError::InvalidInput` if feature vectors are empty, ragged, or non-finite
    /// - `ClassifierError::TensorError` if the backend fails during training
    pub fn train(&mut self, examples: &[Example]) -> ClassifierResult<TrainingOutcome> {
        let labels: Vec<&str> = examples.iter().map(|e| e.label.as_str()).collect();
        let index = match LabelIndex::build(&labels) {
            Ok(index) => index,
            Err(ClassifierError::InsufficientLabels { found }) => {
                tracing::error!(
                    "Can not train an intent classifier: need at least 2 different intent classes, found {}; skipping training",
                    found
                );
                self.engine = InferenceEngine::empty().with_ranking_length(self.config.ranking_length);
                return Ok(TrainingOutcome::Skipped {
                    distinct_labels: found,
                });
            }
            Err(e) => return Err(e),
        };

        let (representation, warning) = LabelRepresentation::build(
            &index,
            self.config.intent_tokenization_flag,
            &self.config.intent_split_symbol,
        );
        self.warnings.extend(warning);

        let session = SessionData::from_examples(examples, &index, &representation)?;
        let mut rng = match self.config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let (train, eval) =
            split_session_data(session, self.config.evaluate_on_num_examples, &mut rng);
        let dataset = BatchDataset::new(train, eval, self.config.batch_strategy);

        let topology = NetworkTopology::from_config(
            &self.config,
            dataset.train().input_dim(),
            representation.dim(),
        );
        let network = DualEncoderNetwork::new(topology, &mut rng, self.store.device())?;

        let (loss_config, clamped) = LossConfig::from_config(&self.config, index.len());
        if let Some(warning) = clamped {
            tracing::debug!("{}", warning);
            self.warnings.push(warning);
        }

        let mut trainer = Trainer::new(
            TrainingConfig::from_config(&self.config),
            network,
            SimilarityLoss::new(loss_config),
            representation,
            rng,
        )?;
        let history = trainer.train(&dataset)?;
        let all_label_embeddings = trainer.all_label_embeddings()?;
        let (network, representation) = trainer.into_parts();

        let model = TrainedModel::new(
            network,
            index,
            representation,
            all_label_embeddings,
            self.config.loss_type,
        )?;
        tracing::info!(
            "Trained intent classifier: {} labels, final loss {:.4}",
            model.num_labels(),
            history.last().map(|e| e.loss).unwrap_or(f32::NAN)
        );
        self.engine =
            InferenceEngine::new(Arc::new(model)).with_ranking_length(self.config.ranking_length);

        Ok(TrainingOutcome::Trained(history))
    }

    /// Predict the intent of one feature vector.
    ///
    /// Without a model, or for an all-zero vector, the result is unknown.
    ///
    /// # Errors
    /// - `ClassifierError::DimensionMismatch` if `features` does not fit the trained input tower
    pub fn process(&self, features: &[f32]) -> ClassifierResult<PredictionResult> {
        self.engine.predict(features)
    }

    /// Persist the current model under `directory/base_file_name*`.
    ///
    /// Without a model nothing is written and the returned descriptor has no
    /// base file name, so loading it yields an untrained classifier.
    pub fn persist(
        &self,
        directory: &Path,
        base_file_name: &str,
    ) -> ClassifierResult<ArtifactDescriptor> {
        match self.engine.model() {
            Some(model) => self.store.save(model, directory, base_file_name),
            None => {
                tracing::warn!("No trained intent model to persist");
                Ok(ArtifactDescriptor {
                    base_file_name: None,
                    directory: Some(directory.to_path_buf()),
                })
            }
        }
    }

    /// Restore a classifier from `descriptor`.
    ///
    /// A missing artifact is not an error: the classifier comes back without
    /// a model and every prediction is unknown.
    ///
    /// # Errors
    /// - `ClassifierError::ConfigError` if `config` is invalid
    /// - `ClassifierError::SerializationError` if the artifact exists but is malformed
    pub fn load(descriptor: &ArtifactDescriptor, config: ClassifierConfig) -> ClassifierResult<Self> {
        Self::load_with_store(descriptor, config, ModelStore::default())
    }

    pub fn load_with_store(
        descriptor: &ArtifactDescriptor,
        config: ClassifierConfig,
        store: ModelStore,
    ) -> ClassifierResult<Self> {
        let mut classifier = Self::with_store(config, store)?;
        match classifier.store.load(descriptor) {
            Ok(model) => {
                classifier.engine = InferenceEngine::new(Arc::new(model))
                    .with_ranking_length(classifier.config.ranking_length);
            }
            Err(ClassifierError::ModelNotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        Ok(classifier)
    }
}
