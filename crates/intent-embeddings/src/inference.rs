//! Ranked intent prediction from a trained model.
//!
//! The input tower runs once per request; the label side is the frozen
//! all-label embedding table, so inference never touches the label tower.
//! A loaded model is immutable and the engine is `Send + Sync`; concurrent
//! predictions on one engine are safe.

use std::cmp::Ordering;
use std::sync::Arc;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{ClassifierError, ClassifierResult};
use crate::storage::TrainedModel;
use crate::training::loss::{similarity_matrix, similarity_to_confidence};

/// Default number of entries in the intent ranking.
pub const DEFAULT_RANKING_LENGTH: usize = 10;

/// Top prediction. `name == None` is the "unknown" result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentPrediction {
    pub name: Option<String>,
    pub confidence: f32,
}

impl IntentPrediction {
    /// No label, zero confidence.
    pub fn unknown() -> Self {
        Self {
            name: None,
            confidence: 0.0,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.name.is_none()
    }
}

/// One entry of the intent ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedIntent {
    pub name: String,
    pub confidence: f32,
}

/// Top prediction plus the leading entries of the ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub intent: IntentPrediction,
    pub intent_ranking: Vec<RankedIntent>,
}

impl PredictionResult {
    pub fn unknown() -> Self {
        Self {
            intent: IntentPrediction::unknown(),
            intent_ranking: Vec::new(),
        }
    }
}

/// Every label id sorted by descending confidence.
#[derive(Debug, Clone, PartialEq)]
pub struct Ranking {
    pub label_ids: Vec<usize>,
    pub confidences: Vec<f32>,
}

/// Serves predictions from at most one loaded model.
#[derive(Debug, Clone)]
pub struct InferenceEngine {
    model: Option<Arc<TrainedModel>>,
    ranking_length: usize,
}

impl Default for InferenceEngine {
    fn default() -> Self {
        Self::empty()
    }
}

impl InferenceEngine {
    /// Engine serving `model`.
    pub fn new(model: Arc<TrainedModel>) -> Self {
        Self {
            model: Some(model),
            ranking_length: DEFAULT_RANKING_LENGTH,
        }
    }

    /// Engine without a model; every prediction is unknown.
    pub fn empty() -> Self {
        Self {
            model: None,
            ranking_length: DEFAULT_RANKING_LENGTH,
        }
    }

    /// Limit the intent ranking to `length` entries (at least 1).
    #[must_use]
    pub fn with_ranking_length(mut self, length: usize) -> Self {
        self.ranking_length = length.max(1);
        self
    }

    pub fn model(&self) -> Option<&Arc<TrainedModel>> {
        self.model.as_ref()
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Rank every label for one feature vector.
    ///
    /// Returns `Ok(None)` when no model is loaded or the input is all zeros.
    ///
    /// # Errors
    /// - `ClassifierError::DimensionMismatch` if `features` does not match the input tower
    /// - `ClassifierError::InvalidInput` if `features` contains non-finite values
    pub fn rank(&self, features: &[f32]) -> ClassifierResult<Option<Ranking>> {
        let model = match &self.model {
            Some(model) => model,
            None => {
                tracing::error!(
                    "There is no trained intent model: component is either not trained or didn't receive enough training data"
                );
                return Ok(None);
            }
        };

        let expected = model.input_dim();
        if features.len() != expected {
            return Err(ClassifierError::DimensionMismatch {
                expected,
                actual: features.len(),
            });
        }
        if features.iter().any(|v| !v.is_finite()) {
            return Err(ClassifierError::InvalidInput {
                message: "Feature vector contains non-finite values".to_string(),
            });
        }
        if features.iter().all(|&v| v == 0.0) {
            tracing::debug!("All-zero feature vector, returning unknown intent");
            return Ok(None);
        }

        let device = model.network.device();
        let x = Tensor::from_slice(features, (1, expected), device).map_err(map_candle)?;
        let embedding = model.network.embed_inputs(&x, None)?;
        let sims = similarity_matrix(&embedding, &model.all_label_embeddings)?;
        let confidences: Vec<f32> = similarity_to_confidence(&sims, model.similarity())?
            .squeeze(0)
            .map_err(map_candle)?
            .to_vec1()
            .map_err(map_candle)?;

        let mut label_ids: Vec<usize> = (0..confidences.len()).collect();
        label_ids.sort_by(|&a, &b| {
            confidences[b]
                .partial_cmp(&confidences[a])
                .unwrap_or(Ordering::Equal)
                .then(a.cmp(&b))
        });
        let confidences = label_ids.iter().map(|&id| confidences[id]).collect();

        Ok(Some(Ranking {
            label_ids,
            confidences,
        }))
    }

    /// Predict the top intent and the leading ranking entries.
    ///
    /// # Errors
    /// Same as [`Self::rank`].
    pub fn predict(&self, features: &[f32]) -> ClassifierResult<PredictionResult> {
        let (model, ranking) = match (&self.model, self.rank(features)?) {
            (Some(model), Some(ranking)) => (model, ranking),
            _ => return Ok(PredictionResult::unknown()),
        };

        let intent_ranking: Vec<RankedIntent> = ranking
            .label_ids
            .iter()
            .zip(ranking.confidences.iter())
            .take(self.ranking_length)
            .filter_map(|(&id, &confidence)| {
                model.label_index.name(id).map(|name| RankedIntent {
                    name: name.to_string(),
                    confidence,
                })
            })
            .collect();

        let intent = match intent_ranking.first() {
            Some(top) => IntentPrediction {
                name: Some(top.name.clone()),
                confidence: top.confidence,
            },
            None => IntentPrediction::unknown(),
        };

        Ok(PredictionResult {
            intent,
            intent_ranking,
        })
    }
}

fn map_candle(e: candle_core::Error) -> ClassifierError {
    ClassifierError::TensorError {
        message: format!("Inference error: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LossType, Similarity};
    use crate::training::{DualEncoderNetwork, LabelIndex, LabelRepresentation, NetworkTopology};
    use candle_core::Device;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn model(similarity: Similarity, labels: &[&str]) -> Arc<TrainedModel> {
        let mut rng = StdRng::seed_from_u64(3);
        let index = LabelIndex::build(labels).unwrap();
        let representation = LabelRepresentation::identity(index.len());
        let topology = NetworkTopology {
            input_dim: 4,
            label_dim: index.len(),
            hidden_layers_a: vec![8],
            hidden_layers_b: vec![],
            embed_dim: 6,
            droprate: 0.0,
            similarity,
        };
        let network = DualEncoderNetwork::new(topology, &mut rng, &Device::Cpu).unwrap();
        let table = network
            .embed_labels(&representation.to_tensor(&Device::Cpu).unwrap(), None)
            .unwrap();
        Arc::new(TrainedModel::new(network, index, representation, table, LossType::Softmax).unwrap())
    }

    #[test]
    fn test_engine_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<InferenceEngine>();
    }

    #[test]
    fn test_no_model_gives_unknown() {
        let engine = InferenceEngine::empty();
        let result = engine.predict(&[1.0, 2.0]).unwrap();
        assert_eq!(result, PredictionResult::unknown());
        assert!(result.intent.is_unknown());
    }

    #[test]
    fn test_all_zero_input_gives_unknown() {
        let engine = InferenceEngine::new(model(Similarity::Inner, &["bye", "greet"]));
        let result = engine.predict(&[0.0; 4]).unwrap();
        assert_eq!(result.intent, IntentPrediction::unknown());
        assert!(result.intent_ranking.is_empty());
    }

    #[test]
    fn test_dimension_mismatch_is_error() {
        let engine = InferenceEngine::new(model(Similarity::Inner, &["bye", "greet"]));
        let err = engine.predict(&[1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(
            err,
            ClassifierError::DimensionMismatch {
                expected: 4,
                actual: 3
            }
        ));
    }

    #[test]
    fn test_inner_confidences_are_sorted_probabilities() {
        let engine = InferenceEngine::new(model(Similarity::Inner, &["a", "b", "c", "d"]));
        let ranking = engine.rank(&[0.5, -1.0, 2.0, 0.1]).unwrap().unwrap();

        assert_eq!(ranking.label_ids.len(), 4);
        let total: f32 = ranking.confidences.iter().sum();
        assert!((total - 1.0).abs() < 1e-5);
        for pair in ranking.confidences.windows(2) {
            assert!(pair[0] >= pair[1]);
        }
        let mut ids = ranking.label_ids.clone();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_cosine_confidences_bounded() {
        let engine = InferenceEngine::new(model(Similarity::Cosine, &["a", "b", "c"]));
        let ranking = engine.rank(&[3.0, -1.0, 2.0, 7.0]).unwrap().unwrap();
        for c in ranking.confidences {
            assert!((-1.0 - 1e-5..=1.0 + 1e-5).contains(&c), "cosine out of range: {}", c);
        }
    }

    #[test]
    fn test_ranking_truncated_and_top_matches() {
        let engine = InferenceEngine::new(model(Similarity::Inner, &["a", "b", "c", "d", "e"]))
            .with_ranking_length(3);
        let result = engine.predict(&[1.0, 0.0, 0.5, 0.2]).unwrap();

        assert_eq!(result.intent_ranking.len(), 3);
        assert_eq!(result.intent.name.as_deref(), Some(result.intent_ranking[0].name.as_str()));
        assert_eq!(result.intent.confidence, result.intent_ranking[0].confidence);
    }

    #[test]
    fn test_concurrent_predictions_agree() {
        let engine = InferenceEngine::new(model(Similarity::Inner, &["bye", "greet"]));
        let input = [0.2f32, 0.4, -0.1, 0.9];
        let expected = engine.predict(&input).unwrap();

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    assert_eq!(engine.predict(&input).unwrap(), expected);
                });
            }
        });
    }

    #[test]
    fn test_prediction_json_shape() {
        let result = PredictionResult {
            intent: IntentPrediction {
                name: Some("greet".into()),
                confidence: 0.75,
            },
            intent_ranking: vec![RankedIntent {
                name: "greet".into(),
                confidence: 0.75,
            }],
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["intent"]["name"], "greet");
        assert_eq!(json["intent_ranking"][0]["confidence"], 0.75);

        let unknown = serde_json::to_value(PredictionResult::unknown()).unwrap();
        assert!(unknown["intent"]["name"].is_null());
    }
}
