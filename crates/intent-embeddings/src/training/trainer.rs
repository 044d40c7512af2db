//! Epoch loop for the dual encoder.
//!
//! Implements the training loop with:
//! - Batch size interpolated linearly from start to end across epochs
//! - Forward through both towers with dropout, negative sampling, loss
//! - Candle autograd backward pass and Adam step, one per batch
//! - Held-out evaluation every N epochs and on the final epoch
//!
//! Training always runs the configured number of epochs.

use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::data::{BatchDataset, SessionData};
use super::labels::LabelRepresentation;
use super::loss::{LossComponents, NegativeSamples, SimilarityLoss};
use super::network::DualEncoderNetwork;
use super::optimizer::{Adam, AdamConfig};
use crate::config::{BatchSizeRange, ClassifierConfig};
use crate::error::{ClassifierError, ClassifierResult};

/// Epoch schedule settings.
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    /// Number of epochs.
    pub epochs: usize,
    /// Batch size at the first and last epoch.
    pub batch_size: BatchSizeRange,
    /// Evaluate every N epochs (and always on the last one).
    pub evaluate_every: usize,
    /// Optimizer settings.
    pub optimizer: AdamConfig,
}

impl TrainingConfig {
    pub fn from_config(config: &ClassifierConfig) -> Self {
        Self {
            epochs: config.epochs,
            batch_size: config.batch_size,
            evaluate_every: config.evaluation_interval(),
            optimizer: AdamConfig::with_learning_rate(config.learning_rate),
        }
    }
}

/// Where the trainer is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    Init,
    Running { epoch: usize },
    Evaluating { epoch: usize },
    Done,
}

/// Held-out loss and accuracy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvalMetrics {
    pub loss: f32,
    pub accuracy: f32,
    pub num_examples: usize,
}

/// Result of a single training epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochResult {
    /// Epoch number (1-indexed).
    pub epoch: usize,
    /// Batch size used this epoch.
    pub batch_size: usize,
    /// Number of optimizer steps taken.
    pub num_batches: usize,
    /// Mean batch loss including L2.
    pub loss: f32,
    /// Mean batch accuracy.
    pub accuracy: f32,
    /// Evaluation metrics, if evaluation ran this epoch.
    pub eval: Option<EvalMetrics>,
}

/// Metrics accumulated across all epochs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    /// Per-epoch results.
    pub epochs: Vec<EpochResult>,
    /// Optimizer steps across all epochs.
    pub total_steps: usize,
}

impl TrainingHistory {
    /// Result of the last epoch.
    pub fn last(&self) -> Option<&EpochResult> {
        self.epochs.last()
    }

    /// Most recent evaluation metrics.
    pub fn last_eval(&self) -> Option<&EvalMetrics> {
        self.epochs.iter().rev().find_map(|e| e.eval.as_ref())
    }
}

/// Batch size for a 1-based `epoch`, interpolated from `range.start` at
/// epoch 1 to `range.end` at the final epoch.
pub fn linearly_increasing_batch_size(range: BatchSizeRange, epoch: usize, epochs: usize) -> usize {
    if epochs <= 1 {
        return range.start.max(1);
    }
    let step = epoch.clamp(1, epochs) as i64 - 1;
    let span = range.end as i64 - range.start as i64;
    let size = range.start as i64 + step * span / (epochs as i64 - 1);
    size.max(1) as usize
}

/// Drives one training run of a [`DualEncoderNetwork`].
pub struct Trainer {
    config: TrainingConfig,
    network: DualEncoderNetwork,
    loss: SimilarityLoss,
    optimizer: Adam,
    representation: LabelRepresentation,
    representation_tensor: Tensor,
    rng: StdRng,
    eval_seed: u64,
    state: TrainerState,
}

impl Trainer {
    /// Create a trainer; every tower parameter is registered with the optimizer.
    ///
    /// An `evaluate_every` of 0 evaluates only after the final epoch.
    pub fn new(
        mut config: TrainingConfig,
        network: DualEncoderNetwork,
        loss: SimilarityLoss,
        representation: LabelRepresentation,
        mut rng: StdRng,
    ) -> ClassifierResult<Self> {
        if config.evaluate_every == 0 {
            config.evaluate_every = config.epochs.max(1);
        }
        let mut optimizer = Adam::new(config.optimizer.clone());
        optimizer.add_params(network.trainable_vars())?;
        let representation_tensor = representation.to_tensor(network.device())?;
        let eval_seed = rng.gen();

        Ok(Self {
            config,
            network,
            loss,
            optimizer,
            representation,
            representation_tensor,
            rng,
            eval_seed,
            state: TrainerState::Init,
        })
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    /// Run every epoch over `dataset`.
    ///
    /// # Errors
    /// - `ClassifierError::InvalidInput` if the trainer already ran or the
    ///   dataset has no training examples
    pub fn train(&mut self, dataset: &BatchDataset) -> ClassifierResult<TrainingHistory> {
        if self.state != TrainerState::Init {
            return Err(ClassifierError::InvalidInput {
                message: "Trainer has already run".to_string(),
            });
        }
        if dataset.train().is_empty() {
            return Err(ClassifierError::InvalidInput {
                message: "No training examples".to_string(),
            });
        }

        tracing::info!(
            "Training dual encoder: {} examples, {} labels, {} epochs, {} params{}",
            dataset.train().len(),
            self.representation.num_labels(),
            self.config.epochs,
            self.network.num_params(),
            match dataset.eval() {
                Some(eval) => format!(", {} held out", eval.len()),
                None => String::new(),
            }
        );

        let mut history = TrainingHistory::default();
        for epoch in 1..=self.config.epochs {
            self.state = TrainerState::Running { epoch };
            let batch_size =
                linearly_increasing_batch_size(self.config.batch_size, epoch, self.config.epochs);
            let (components, num_batches) = self.train_epoch(dataset, batch_size)?;
            history.total_steps += num_batches;

            let is_last = epoch == self.config.epochs;
            let eval = if dataset.has_eval() && (epoch % self.config.evaluate_every == 0 || is_last) {
                self.state = TrainerState::Evaluating { epoch };
                let metrics = self.evaluate(dataset, batch_size)?;
                if let Some(m) = &metrics {
                    tracing::info!(
                        "Epoch {}/{}: loss={:.4} acc={:.3} | eval loss={:.4} acc={:.3} ({} examples)",
                        epoch,
                        self.config.epochs,
                        components.total,
                        components.accuracy,
                        m.loss,
                        m.accuracy,
                        m.num_examples
                    );
                }
                metrics
            } else {
                tracing::debug!(
                    "Epoch {}/{}: loss={:.4} acc={:.3} batch_size={} batches={}",
                    epoch,
                    self.config.epochs,
                    components.total,
                    components.accuracy,
                    batch_size,
                    num_batches
                );
                None
            };

            history.epochs.push(EpochResult {
                epoch,
                batch_size,
                num_batches,
                loss: components.total,
                accuracy: components.accuracy,
                eval,
            });
        }

        self.state = TrainerState::Done;
        if let Some(last) = history.last() {
            tracing::info!(
                "Finished training: final loss={:.4} acc={:.3} after {} steps",
                last.loss,
                last.accuracy,
                history.total_steps
            );
        }
        Ok(history)
    }

    /// One pass over the training subset. Returns mean components and batch count.
    fn train_epoch(
        &mut self,
        dataset: &BatchDataset,
        batch_size: usize,
    ) -> ClassifierResult<(LossComponents, usize)> {
        let data = dataset.train();
        let batches = dataset.epoch_batches(batch_size, &mut self.rng);

        let mut mean = LossComponents::default();
        let mut num_batches = 0usize;
        for indices in batches {
            if indices.is_empty() {
                continue;
            }
            let batch = data.batch(&indices, self.network.device())?;

            let message_emb = self.network.embed_inputs(&batch.features, Some(&mut self.rng))?;
            let label_emb = self
                .network
                .embed_labels(&batch.label_features, Some(&mut self.rng))?;
            let all_label_emb = self
                .network
                .embed_labels(&self.representation_tensor, Some(&mut self.rng))?;
            let negatives = NegativeSamples::sample(
                &batch.label_ids,
                self.loss.config().num_neg,
                &self.representation,
                &mut self.rng,
            );

            let (loss, components) =
                self.loss
                    .compute(&message_emb, &label_emb, &all_label_emb, &negatives)?;
            let total = self.loss.regularized(&loss, &self.network.l2_penalty()?)?;
            let total_value = total
                .to_scalar::<f32>()
                .map_err(|e| ClassifierError::TensorError {
                    message: format!("Training step error: {}", e),
                })?;
            if !total_value.is_finite() {
                return Err(ClassifierError::TensorError {
                    message: format!("Training step error: loss became {}", total_value),
                });
            }

            self.optimizer.step(&total)?;

            mean.similarity += components.similarity;
            mean.separation += components.separation;
            mean.accuracy += components.accuracy;
            mean.total += total_value;
            num_batches += 1;
        }

        if num_batches > 0 {
            let n = num_batches as f32;
            mean.similarity /= n;
            mean.separation /= n;
            mean.accuracy /= n;
            mean.total /= n;
        }
        Ok((mean, num_batches))
    }

    /// Held-out loss and accuracy without dropout or parameter updates.
    ///
    /// Batching and negatives use a fixed seed so repeated evaluations are
    /// comparable. Returns `None` when there is no evaluation subset.
    pub fn evaluate(
        &self,
        dataset: &BatchDataset,
        batch_size: usize,
    ) -> ClassifierResult<Option<EvalMetrics>> {
        let eval = match dataset.eval() {
            Some(eval) => eval,
            None => return Ok(None),
        };
        let mut rng = StdRng::seed_from_u64(self.eval_seed);
        let batches = match dataset.eval_batches(batch_size, &mut rng) {
            Some(batches) => batches,
            None => return Ok(None),
        };

        let all_label_emb = self
            .network
            .embed_labels(&self.representation_tensor, None)?
            .detach();

        let mut loss_sum = 0.0f32;
        let mut correct = 0.0f32;
        for indices in batches {
            if indices.is_empty() {
                continue;
            }
            let (loss, accuracy) = self.score_batch(eval, &indices, &all_label_emb, &mut rng)?;
            loss_sum += loss * indices.len() as f32;
            correct += accuracy * indices.len() as f32;
        }

        let n = eval.len() as f32;
        Ok(Some(EvalMetrics {
            loss: loss_sum / n,
            accuracy: correct / n,
            num_examples: eval.len(),
        }))
    }

    fn score_batch(
        &self,
        data: &SessionData,
        indices: &[usize],
        all_label_emb: &Tensor,
        rng: &mut StdRng,
    ) -> ClassifierResult<(f32, f32)> {
        let batch = data.batch(indices, self.network.device())?;
        let message_emb = self.network.embed_inputs(&batch.features, None)?.detach();
        let label_emb = self
            .network
            .embed_labels(&batch.label_features, None)?
            .detach();
        let negatives = NegativeSamples::sample(
            &batch.label_ids,
            self.loss.config().num_neg,
            &self.representation,
            rng,
        );
        let (_, components) =
            self.loss
                .compute(&message_emb, &label_emb, all_label_emb, &negatives)?;
        Ok((components.total, components.accuracy))
    }

    /// Label-tower embeddings of every label, detached, `[L, embed_dim]`.
    pub fn all_label_embeddings(&self) -> ClassifierResult<Tensor> {
        Ok(self
            .network
            .embed_labels(&self.representation_tensor, None)?
            .detach())
    }

    /// Consume the trainer, returning the trained network and label representation.
    pub fn into_parts(self) -> (DualEncoderNetwork, LabelRepresentation) {
        (self.network, self.representation)
    }
}
