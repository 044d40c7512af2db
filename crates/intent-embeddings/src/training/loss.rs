//! Negative-sampling similarity loss for the dual encoder.
//!
//! Per example, the message embedding is scored against its correct label
//! embedding and `k` sampled incorrect label embeddings:
//!
//! - **softmax**: cross-entropy of the correct label over the `k + 1` scores
//! - **margin**: `relu(mu_pos - sim_pos) + relu(mu_neg + sim_neg)`, using only
//!   the hardest negative when `use_max_sim_neg` is set
//!
//! Added on top:
//! - separation: `C_emb * mean_l relu(max_{m != l} sim(E_l, E_m))` over the
//!   all-label embedding table
//! - L2: `C2 * ½ Σ‖W‖²` over the dense kernels (see [`SimilarityLoss::regularized`])
//!
//! With `scale_loss`, each example is weighted by `((1 - c) / 0.5)^4` where
//! `c` is its confidence in the correct label; the weight carries no gradient.

use candle_core::{DType, Device, Tensor, D};
use rand::rngs::StdRng;

use super::labels::LabelRepresentation;
use crate::config::{ClassifierConfig, LossType, Similarity};
use crate::error::{ClassifierError, ClassifierResult, ConfigWarning};

/// Additive mask for negatives that must not contribute.
const MASKED: f32 = -1e9;

/// Loss hyperparameters, with `num_neg` already clamped to the label count.
#[derive(Debug, Clone)]
pub struct LossConfig {
    pub loss_type: LossType,
    pub similarity: Similarity,
    /// Negatives per example, at most `num_labels - 1`.
    pub num_neg: usize,
    pub mu_pos: f32,
    pub mu_neg: f32,
    pub use_max_sim_neg: bool,
    pub scale_loss: bool,
    pub c_emb: f32,
    pub c2: f32,
}

impl LossConfig {
    /// Loss settings for `num_labels` labels.
    ///
    /// Returns a warning when `num_neg` had to be clamped.
    pub fn from_config(
        config: &ClassifierConfig,
        num_labels: usize,
    ) -> (Self, Option<ConfigWarning>) {
        let available = num_labels.saturating_sub(1).max(1);
        let num_neg = config.num_neg.min(available);
        let warning = (num_neg < config.num_neg).then_some(ConfigWarning::NegativesClamped {
            requested: config.num_neg,
            clamped: num_neg,
        });

        let loss_config = Self {
            loss_type: config.loss_type,
            similarity: config.similarity(),
            num_neg,
            mu_pos: config.mu_pos,
            mu_neg: config.mu_neg,
            use_max_sim_neg: config.use_max_sim_neg,
            scale_loss: config.scale_loss,
            c_emb: config.c_emb,
            c2: config.c2,
        };
        (loss_config, warning)
    }
}

/// Sampled incorrect labels for each example of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct NegativeSamples {
    /// `[batch * k]` label ids, row-major.
    ids: Vec<usize>,
    /// `[batch * k]` additive mask: 0 or [`MASKED`].
    mask: Vec<f32>,
    k: usize,
}

impl NegativeSamples {
    /// Draw `k` distinct incorrect labels per example.
    ///
    /// Negatives whose representation equals the positive's (possible with
    /// tokenized labels) are kept for shape but masked out.
    pub fn sample(
        label_ids: &[usize],
        k: usize,
        representation: &LabelRepresentation,
        rng: &mut StdRng,
    ) -> Self {
        let num_labels = representation.num_labels();
        let k = k.min(num_labels.saturating_sub(1));
        let mut ids = Vec::with_capacity(label_ids.len() * k);
        let mut mask = Vec::with_capacity(label_ids.len() * k);

        for &pos in label_ids {
            for j in rand::seq::index::sample(rng, num_labels - 1, k) {
                // Skip over the positive id.
                let neg = if j >= pos { j + 1 } else { j };
                ids.push(neg);
                mask.push(if representation.same_representation(pos, neg) {
                    MASKED
                } else {
                    0.0
                });
            }
        }

        Self { ids, mask, k }
    }

    /// Negatives per example.
    pub fn k(&self) -> usize {
        self.k
    }

    /// Negative ids of example `i`.
    pub fn ids_for(&self, i: usize) -> &[usize] {
        &self.ids[i * self.k..(i + 1) * self.k]
    }

    /// Whether negative `j` of example `i` is masked out.
    pub fn is_masked(&self, i: usize, j: usize) -> bool {
        self.mask[i * self.k + j] != 0.0
    }

    fn id_tensor(&self, device: &Device) -> ClassifierResult<Tensor> {
        let ids: Vec<u32> = self.ids.iter().map(|&i| i as u32).collect();
        Tensor::from_vec(ids, self.ids.len(), device).map_err(map_candle)
    }

    fn mask_tensor(&self, batch: usize, device: &Device) -> ClassifierResult<Tensor> {
        Tensor::from_slice(&self.mask, (batch, self.k), device).map_err(map_candle)
    }
}

/// Per-component values for logging.
#[derive(Debug, Clone, Default)]
pub struct LossComponents {
    /// Mean softmax or margin loss.
    pub similarity: f32,
    /// Label separation term, already scaled by `C_emb`.
    pub separation: f32,
    /// Fraction of examples whose correct label outscores every negative.
    pub accuracy: f32,
    /// Total batch loss before L2.
    pub total: f32,
}

/// Similarity loss over positive and sampled negative labels.
pub struct SimilarityLoss {
    config: LossConfig,
}

impl SimilarityLoss {
    pub fn new(config: LossConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LossConfig {
        &self.config
    }

    /// Compute the batch loss.
    ///
    /// # Arguments
    /// * `message_emb` - Input-tower embeddings `[B, D]`
    /// * `label_emb` - Label-tower embeddings of each example's label `[B, D]`
    /// * `all_label_emb` - Label-tower embeddings of every label `[L, D]`
    /// * `negatives` - Sampled negatives for the `B` examples
    pub fn compute(
        &self,
        message_emb: &Tensor,
        label_emb: &Tensor,
        all_label_emb: &Tensor,
        negatives: &NegativeSamples,
    ) -> ClassifierResult<(Tensor, LossComponents)> {
        let batch = message_emb.dim(0).map_err(map_candle)?;
        let device = message_emb.device();

        let sim_pos = pair_similarity(message_emb, label_emb)?; // [B, 1]
        let sim_neg = self.negative_similarity(message_emb, all_label_emb, negatives, batch)?; // [B, k]

        let per_example = match self.config.loss_type {
            LossType::Softmax => self.softmax_loss(&sim_pos, &sim_neg)?,
            LossType::Margin => self.margin_loss(&sim_pos, &sim_neg)?,
        };
        let similarity_loss = per_example.mean_all().map_err(map_candle)?;

        let separation = self.separation_loss(all_label_emb, device)?;
        let total = similarity_loss.add(&separation).map_err(map_candle)?;

        let components = LossComponents {
            similarity: to_f32(&similarity_loss)?,
            separation: to_f32(&separation)?,
            accuracy: accuracy(&sim_pos, &sim_neg)?,
            total: to_f32(&total)?,
        };

        Ok((total, components))
    }

    /// Add `C2 * l2_penalty` to `loss`.
    pub fn regularized(&self, loss: &Tensor, l2_penalty: &Tensor) -> ClassifierResult<Tensor> {
        if self.config.c2 == 0.0 {
            return Ok(loss.clone());
        }
        loss.add(
            &l2_penalty
                .affine(self.config.c2 as f64, 0.0)
                .map_err(map_candle)?,
        )
        .map_err(map_candle)
    }

    /// Masked similarities to the sampled negatives, `[B, k]`.
    fn negative_similarity(
        &self,
        message_emb: &Tensor,
        all_label_emb: &Tensor,
        negatives: &NegativeSamples,
        batch: usize,
    ) -> ClassifierResult<Tensor> {
        let device = message_emb.device();
        let k = negatives.k();
        let dim = message_emb.dim(1).map_err(map_candle)?;

        let neg_emb = all_label_emb
            .index_select(&negatives.id_tensor(device)?, 0)
            .map_err(map_candle)?
            .reshape((batch, k, dim))
            .map_err(map_candle)?;

        message_emb
            .unsqueeze(1)
            .map_err(map_candle)?
            .broadcast_mul(&neg_emb)
            .map_err(map_candle)?
            .sum(2)
            .map_err(map_candle)?
            .add(&negatives.mask_tensor(batch, device)?)
            .map_err(map_candle)
    }

    /// Per-example cross-entropy `-log softmax([pos | negs])[0]`, `[B, 1]`.
    fn softmax_loss(&self, sim_pos: &Tensor, sim_neg: &Tensor) -> ClassifierResult<Tensor> {
        let logits = Tensor::cat(&[sim_pos, sim_neg], 1).map_err(map_candle)?;
        let loss = candle_nn::ops::log_softmax(&logits, D::Minus1)
            .map_err(map_candle)?
            .narrow(1, 0, 1)
            .map_err(map_candle)?
            .neg()
            .map_err(map_candle)?;

        if !self.config.scale_loss {
            return Ok(loss);
        }
        let confidence = candle_nn::ops::softmax(&logits, D::Minus1)
            .map_err(map_candle)?
            .narrow(1, 0, 1)
            .map_err(map_candle)?;
        loss.mul(&confidence_weight(&confidence)?).map_err(map_candle)
    }

    /// Per-example hinge loss, `[B, 1]`.
    fn margin_loss(&self, sim_pos: &Tensor, sim_neg: &Tensor) -> ClassifierResult<Tensor> {
        let pos_term = sim_pos
            .affine(-1.0, self.config.mu_pos as f64)
            .map_err(map_candle)?
            .relu()
            .map_err(map_candle)?;

        let neg_term = if self.config.use_max_sim_neg {
            sim_neg
                .max_keepdim(1)
                .map_err(map_candle)?
                .affine(1.0, self.config.mu_neg as f64)
                .map_err(map_candle)?
                .relu()
                .map_err(map_candle)?
        } else {
            sim_neg
                .affine(1.0, self.config.mu_neg as f64)
                .map_err(map_candle)?
                .relu()
                .map_err(map_candle)?
                .sum_keepdim(1)
                .map_err(map_candle)?
        };

        let loss = pos_term.add(&neg_term).map_err(map_candle)?;
        if !self.config.scale_loss {
            return Ok(loss);
        }
        let confidence = sim_pos.clamp(0f32, 1f32).map_err(map_candle)?;
        loss.mul(&confidence_weight(&confidence)?).map_err(map_candle)
    }

    /// `C_emb * mean_l relu(max_{m != l} sim(E_l, E_m))`.
    fn separation_loss(&self, all_label_emb: &Tensor, device: &Device) -> ClassifierResult<Tensor> {
        if self.config.c_emb == 0.0 {
            return Tensor::zeros((), DType::F32, device).map_err(map_candle);
        }
        let num_labels = all_label_emb.dim(0).map_err(map_candle)?;

        let mut diag = vec![0.0f32; num_labels * num_labels];
        for i in 0..num_labels {
            diag[i * num_labels + i] = MASKED;
        }
        let diag = Tensor::from_vec(diag, (num_labels, num_labels), device).map_err(map_candle)?;

        all_label_emb
            .matmul(&all_label_emb.t().map_err(map_candle)?)
            .map_err(map_candle)?
            .add(&diag)
            .map_err(map_candle)?
            .max(1)
            .map_err(map_candle)?
            .relu()
            .map_err(map_candle)?
            .mean_all()
            .map_err(map_candle)?
            .affine(self.config.c_emb as f64, 0.0)
            .map_err(map_candle)
    }
}

/// Row-wise dot product of paired embeddings, `[B, 1]`.
pub fn pair_similarity(a: &Tensor, b: &Tensor) -> ClassifierResult<Tensor> {
    a.mul(b).map_err(map_candle)?.sum_keepdim(1).map_err(map_candle)
}

/// Similarity of every row of `a` to every row of `b`, `[A, B]`.
///
/// Embeddings from a cosine-configured network are unit length, so the dot
/// product is the cosine similarity.
pub fn similarity_matrix(a: &Tensor, b: &Tensor) -> ClassifierResult<Tensor> {
    a.matmul(&b.t().map_err(map_candle)?).map_err(map_candle)
}

/// Turn raw similarities over all labels into confidences.
///
/// Inner product: softmax over the last dimension. Cosine: the similarity
/// itself.
pub fn similarity_to_confidence(sims: &Tensor, similarity: Similarity) -> ClassifierResult<Tensor> {
    match similarity {
        Similarity::Inner => candle_nn::ops::softmax(sims, D::Minus1).map_err(map_candle),
        Similarity::Cosine => Ok(sims.clone()),
    }
}

/// `((1 - c) / 0.5)^4`, detached from the graph.
fn confidence_weight(confidence: &Tensor) -> ClassifierResult<Tensor> {
    Ok(confidence
        .affine(-2.0, 2.0)
        .map_err(map_candle)?
        .sqr()
        .map_err(map_candle)?
        .sqr()
        .map_err(map_candle)?
        .detach())
}

/// Fraction of rows where the positive score is at least every negative score.
fn accuracy(sim_pos: &Tensor, sim_neg: &Tensor) -> ClassifierResult<f32> {
    let pos: Vec<f32> = sim_pos.flatten_all().map_err(map_candle)?.to_vec1().map_err(map_candle)?;
    let max_neg: Vec<f32> = sim_neg.max(1).map_err(map_candle)?.to_vec1().map_err(map_candle)?;
    if pos.is_empty() {
        return Ok(0.0);
    }
    let correct = pos.iter().zip(max_neg.iter()).filter(|(p, n)| p >= n).count();
    Ok(correct as f32 / pos.len() as f32)
}

fn to_f32(t: &Tensor) -> ClassifierResult<f32> {
    t.flatten_all()
        .map_err(map_candle)?
        .to_vec1::<f32>()
        .map_err(map_candle)?
        .first()
        .copied()
        .ok_or_else(|| ClassifierError::TensorError {
            message: "Loss computation error: empty tensor".to_string(),
        })
}

fn map_candle(e: candle_core::Error) -> ClassifierError {
    ClassifierError::TensorError {
        message: format!("Loss computation error: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::labels::LabelIndex;
    use rand::SeedableRng;

    fn loss_config(loss_type: LossType, similarity: Similarity) -> LossConfig {
        LossConfig {
            loss_type,
            similarity,
            num_neg: 2,
            mu_pos: 0.8,
            mu_neg: -0.4,
            use_max_sim_neg: true,
            scale_loss: false,
            c_emb: 0.0,
            c2: 0.0,
        }
    }

    fn t2(rows: &[&[f32]]) -> Tensor {
        let cols = rows[0].len();
        let data: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Tensor::from_vec(data, (rows.len(), cols), &Device::Cpu).unwrap()
    }

    /// Three orthonormal labels; example i is labelled i.
    fn orthonormal_setup() -> (Tensor, LabelRepresentation) {
        let labels = t2(&[&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0], &[0.0, 0.0, 1.0]]);
        (labels, LabelRepresentation::identity(3))
    }

    #[test]
    fn test_num_neg_clamped_to_labels() {
        let config = ClassifierConfig {
            num_neg: 20,
            ..Default::default()
        };
        let (loss_config, warning) = LossConfig::from_config(&config, 4);
        assert_eq!(loss_config.num_neg, 3);
        assert_eq!(
            warning,
            Some(ConfigWarning::NegativesClamped {
                requested: 20,
                clamped: 3
            })
        );

        let (loss_config, warning) = LossConfig::from_config(&config, 50);
        assert_eq!(loss_config.num_neg, 20);
        assert!(warning.is_none());
    }

    #[test]
    fn test_negatives_exclude_positive_and_are_distinct() {
        let repr = LabelRepresentation::identity(6);
        let mut rng = StdRng::seed_from_u64(9);
        let labels = vec![0, 3, 5, 3];
        let negs = NegativeSamples::sample(&labels, 4, &repr, &mut rng);

        assert_eq!(negs.k(), 4);
        for (i, &pos) in labels.iter().enumerate() {
            let ids = negs.ids_for(i);
            assert!(!ids.contains(&pos));
            let mut sorted = ids.to_vec();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted.len(), 4);
            assert!(ids.iter().all(|&id| id < 6));
        }
    }

    #[test]
    fn test_negatives_never_exceed_available_labels() {
        let repr = LabelRepresentation::identity(2);
        let mut rng = StdRng::seed_from_u64(1);
        let negs = NegativeSamples::sample(&[0, 1], 10, &repr, &mut rng);
        assert_eq!(negs.k(), 1);
        assert_eq!(negs.ids_for(0), &[1]);
        assert_eq!(negs.ids_for(1), &[0]);
    }

    #[test]
    fn test_same_representation_negatives_masked() {
        let index = LabelIndex::build(&["a_b", "b_a", "c"]).unwrap();
        let (repr, _) = LabelRepresentation::build(&index, true, "_");
        let mut rng = StdRng::seed_from_u64(0);
        let negs = NegativeSamples::sample(&[0], 2, &repr, &mut rng);

        for (j, &neg) in negs.ids_for(0).iter().enumerate() {
            assert_eq!(negs.is_masked(0, j), neg == 1);
        }
    }

    #[test]
    fn test_softmax_loss_prefers_correct_embeddings() {
        let (all_labels, repr) = orthonormal_setup();
        let loss = SimilarityLoss::new(loss_config(LossType::Softmax, Similarity::Inner));
        let mut rng = StdRng::seed_from_u64(0);
        let negs = NegativeSamples::sample(&[0, 1, 2], 2, &repr, &mut rng);

        let aligned = all_labels.affine(5.0, 0.0).unwrap();
        let (good, good_parts) = loss.compute(&aligned, &all_labels, &all_labels, &negs).unwrap();

        let swapped = t2(&[&[0.0, 5.0, 0.0], &[0.0, 0.0, 5.0], &[5.0, 0.0, 0.0]]);
        let (bad, bad_parts) = loss.compute(&swapped, &all_labels, &all_labels, &negs).unwrap();

        let good: f32 = good.to_scalar().unwrap();
        let bad: f32 = bad.to_scalar().unwrap();
        assert!(good < bad, "good {} should be below bad {}", good, bad);
        assert!((good_parts.accuracy - 1.0).abs() < 1e-6);
        assert!(bad_parts.accuracy < 1.0);
    }

    #[test]
    fn test_softmax_loss_value() {
        // One example, sim_pos = 1, one negative with sim 0: loss = ln(1 + e^-1)
        let labels = t2(&[&[1.0, 0.0], &[0.0, 1.0]]);
        let repr = LabelRepresentation::identity(2);
        let mut rng = StdRng::seed_from_u64(0);
        let negs = NegativeSamples::sample(&[0], 1, &repr, &mut rng);

        let loss = SimilarityLoss::new(loss_config(LossType::Softmax, Similarity::Inner));
        let msg = t2(&[&[1.0, 0.0]]);
        let pos = t2(&[&[1.0, 0.0]]);
        let (_, parts) = loss.compute(&msg, &pos, &labels, &negs).unwrap();

        let expected = (1.0f32 + (-1.0f32).exp()).ln();
        assert!((parts.similarity - expected).abs() < 1e-5);
    }

    #[test]
    fn test_margin_loss_zero_when_margins_met() {
        let (all_labels, repr) = orthonormal_setup();
        let loss = SimilarityLoss::new(loss_config(LossType::Margin, Similarity::Cosine));
        let mut rng = StdRng::seed_from_u64(0);
        let negs = NegativeSamples::sample(&[0, 1, 2], 2, &repr, &mut rng);

        // sim_pos = 1 > mu_pos, sim_neg = 0 < -mu_neg
        let (_, parts) = loss.compute(&all_labels, &all_labels, &all_labels, &negs).unwrap();
        assert!(parts.similarity.abs() < 1e-6);
        assert!((parts.accuracy - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_margin_loss_penalizes_close_negative() {
        let labels = t2(&[&[1.0, 0.0], &[0.0, 1.0]]);
        let repr = LabelRepresentation::identity(2);
        let mut rng = StdRng::seed_from_u64(0);
        let negs = NegativeSamples::sample(&[0], 1, &repr, &mut rng);

        let mut config = loss_config(LossType::Margin, Similarity::Cosine);
        config.num_neg = 1;
        let loss = SimilarityLoss::new(config);

        // sim_pos = sim_neg = 0.6: relu(0.8 - 0.6) + relu(-0.4 + 0.6) = 0.4
        let msg = t2(&[&[0.6, 0.6]]);
        let pos = t2(&[&[1.0, 0.0]]);
        let (_, parts) = loss.compute(&msg, &pos, &labels, &negs).unwrap();
        assert!((parts.similarity - 0.4).abs() < 1e-5, "got {}", parts.similarity);
    }

    #[test]
    fn test_margin_loss_sums_negatives_when_not_max() {
        let (labels, repr) = orthonormal_setup();
        let mut rng = StdRng::seed_from_u64(0);
        let negs = NegativeSamples::sample(&[0], 2, &repr, &mut rng);

        // sim_pos = 0.6, both negatives at 0.6
        let msg = t2(&[&[0.6, 0.6, 0.6]]);
        let pos = t2(&[&[1.0, 0.0, 0.0]]);

        let mut summed = loss_config(LossType::Margin, Similarity::Cosine);
        summed.use_max_sim_neg = false;
        let (_, parts) = SimilarityLoss::new(summed)
            .compute(&msg, &pos, &labels, &negs)
            .unwrap();
        // relu(0.8 - 0.6) + 2 * relu(-0.4 + 0.6) = 0.6
        assert!((parts.similarity - 0.6).abs() < 1e-5, "got {}", parts.similarity);

        let (_, parts) = SimilarityLoss::new(loss_config(LossType::Margin, Similarity::Cosine))
            .compute(&msg, &pos, &labels, &negs)
            .unwrap();
        // relu(0.8 - 0.6) + relu(-0.4 + 0.6) = 0.4
        assert!((parts.similarity - 0.4).abs() < 1e-5, "got {}", parts.similarity);
    }

    #[test]
    fn test_margin_scale_loss_weights_by_positive_similarity() {
        let labels = t2(&[&[1.0, 0.0], &[0.0, 1.0]]);
        let repr = LabelRepresentation::identity(2);
        let mut rng = StdRng::seed_from_u64(0);
        let negs = NegativeSamples::sample(&[0], 1, &repr, &mut rng);

        let mut config = loss_config(LossType::Margin, Similarity::Cosine);
        config.num_neg = 1;
        config.scale_loss = true;
        let loss = SimilarityLoss::new(config);

        // unscaled 0.4, weight ((1 - 0.6) / 0.5)^4 = 0.4096
        let msg = t2(&[&[0.6, 0.6]]);
        let pos = t2(&[&[1.0, 0.0]]);
        let (_, parts) = loss.compute(&msg, &pos, &labels, &negs).unwrap();
        assert!((parts.similarity - 0.4 * 0.4096).abs() < 1e-5, "got {}", parts.similarity);

        // negative positive similarity clamps to 0: weight 16
        let msg = t2(&[&[-0.2, 0.0]]);
        let (_, parts) = loss.compute(&msg, &pos, &labels, &negs).unwrap();
        // relu(0.8 + 0.2) + relu(-0.4 + 0) = 1.0
        assert!((parts.similarity - 16.0).abs() < 1e-4, "got {}", parts.similarity);
    }

    #[test]
    fn test_scale_loss_downweights_confident_examples() {
        let labels = t2(&[&[1.0, 0.0], &[0.0, 1.0]]);
        let repr = LabelRepresentation::identity(2);
        let mut rng = StdRng::seed_from_u64(0);
        let negs = NegativeSamples::sample(&[0], 1, &repr, &mut rng);

        let msg = t2(&[&[4.0, 0.0]]);
        let pos = t2(&[&[1.0, 0.0]]);

        let plain = SimilarityLoss::new(loss_config(LossType::Softmax, Similarity::Inner));
        let mut scaled_config = loss_config(LossType::Softmax, Similarity::Inner);
        scaled_config.scale_loss = true;
        let scaled = SimilarityLoss::new(scaled_config);

        let (_, plain_parts) = plain.compute(&msg, &pos, &labels, &negs).unwrap();
        let (_, scaled_parts) = scaled.compute(&msg, &pos, &labels, &negs).unwrap();
        assert!(scaled_parts.similarity < plain_parts.similarity);
    }

    #[test]
    fn test_separation_penalizes_collapsed_labels() {
        let mut config = loss_config(LossType::Softmax, Similarity::Inner);
        config.c_emb = 0.8;
        let loss = SimilarityLoss::new(config);
        let repr = LabelRepresentation::identity(2);
        let mut rng = StdRng::seed_from_u64(0);
        let negs = NegativeSamples::sample(&[0], 1, &repr, &mut rng);

        let msg = t2(&[&[1.0, 0.0]]);
        let orthogonal = t2(&[&[1.0, 0.0], &[0.0, 1.0]]);
        let collapsed = t2(&[&[1.0, 0.0], &[1.0, 0.0]]);

        let (_, apart) = loss.compute(&msg, &msg, &orthogonal, &negs).unwrap();
        let (_, together) = loss.compute(&msg, &msg, &collapsed, &negs).unwrap();
        assert!(apart.separation.abs() < 1e-6);
        assert!((together.separation - 0.8).abs() < 1e-5);
    }

    #[test]
    fn test_regularized_adds_scaled_penalty() {
        let mut config = loss_config(LossType::Softmax, Similarity::Inner);
        config.c2 = 0.5;
        let loss = SimilarityLoss::new(config);
        let base = Tensor::new(1.0f32, &Device::Cpu).unwrap();
        let penalty = Tensor::new(4.0f32, &Device::Cpu).unwrap();
        let total: f32 = loss.regularized(&base, &penalty).unwrap().to_scalar().unwrap();
        assert!((total - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_to_confidence() {
        let sims = t2(&[&[2.0, 0.0, -1.0]]);
        let inner = similarity_to_confidence(&sims, Similarity::Inner)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        let total: f32 = inner[0].iter().sum();
        assert!((total - 1.0).abs() < 1e-5);
        assert!(inner[0][0] > inner[0][1] && inner[0][1] > inner[0][2]);

        let cosine = similarity_to_confidence(&sims, Similarity::Cosine)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(cosine[0], vec![2.0, 0.0, -1.0]);
    }

    #[test]
    fn test_similarity_matrix_shape() {
        let a = t2(&[&[1.0, 0.0], &[0.0, 1.0], &[1.0, 1.0]]);
        let b = t2(&[&[1.0, 0.0], &[0.0, 2.0]]);
        let m = similarity_matrix(&a, &b).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(m, vec![vec![1.0, 0.0], vec![0.0, 2.0], vec![1.0, 2.0]]);
    }
}
