//! Dual-encoder network: independent input and label towers.
//!
//! # Architecture
//!
//! ```text
//! features  [B, input_dim] → (dense → relu → dropout)* → embed → [B, embed_dim]
//! label rep [L, label_dim] → (dense → relu → dropout)* → embed → [L, embed_dim]
//! ```
//!
//! With cosine similarity both tower outputs are L2-normalized. The towers
//! share no parameters. Dropout is applied only when a random source is
//! passed to the forward pass.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor, Var, D};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::{ClassifierConfig, Similarity};
use crate::error::{ClassifierError, ClassifierResult};

/// Shape of both towers, persisted next to the parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkTopology {
    /// Feature dimensionality expected by the input tower.
    pub input_dim: usize,
    /// Label-representation dimensionality expected by the label tower.
    pub label_dim: usize,
    /// Hidden layer sizes of the input tower.
    pub hidden_layers_a: Vec<usize>,
    /// Hidden layer sizes of the label tower.
    pub hidden_layers_b: Vec<usize>,
    /// Shared embedding dimensionality.
    pub embed_dim: usize,
    /// Dropout rate after each hidden layer.
    pub droprate: f32,
    /// Similarity measure; cosine normalizes tower outputs.
    pub similarity: Similarity,
}

impl NetworkTopology {
    /// Topology for the given data dimensions under `config`.
    pub fn from_config(config: &ClassifierConfig, input_dim: usize, label_dim: usize) -> Self {
        Self {
            input_dim,
            label_dim,
            hidden_layers_a: config.hidden_layers_sizes_a.clone(),
            hidden_layers_b: config.hidden_layers_sizes_b.clone(),
            embed_dim: config.embed_dim,
            droprate: config.droprate,
            similarity: config.similarity(),
        }
    }
}

/// Fully-connected layer `y = x W + b` with `W: [in, out]`.
pub struct DenseLayer {
    pub weight: Var,
    pub bias: Var,
}

impl DenseLayer {
    /// Glorot-uniform weights, zero bias.
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        rng: &mut StdRng,
        device: &Device,
    ) -> ClassifierResult<Self> {
        let limit = (6.0 / (in_dim + out_dim) as f64).sqrt() as f32;
        let data: Vec<f32> = (0..in_dim * out_dim)
            .map(|_| rng.gen_range(-limit..=limit))
            .collect();

        let weight = Tensor::from_vec(data, (in_dim, out_dim), device).map_err(map_candle)?;
        let bias = Tensor::zeros(out_dim, DType::F32, device).map_err(map_candle)?;

        Ok(Self {
            weight: Var::from_tensor(&weight).map_err(map_candle)?,
            bias: Var::from_tensor(&bias).map_err(map_candle)?,
        })
    }

    /// Wrap loaded tensors, checking their shapes.
    pub fn from_tensors(
        weight: Tensor,
        bias: Tensor,
        in_dim: usize,
        out_dim: usize,
    ) -> ClassifierResult<Self> {
        if weight.dims() != [in_dim, out_dim] || bias.dims() != [out_dim] {
            return Err(ClassifierError::SerializationError {
                message: format!(
                    "Dense layer shape mismatch: weight {:?}, bias {:?}, expected [{}, {}]",
                    weight.dims(),
                    bias.dims(),
                    in_dim,
                    out_dim
                ),
            });
        }
        Ok(Self {
            weight: Var::from_tensor(&weight).map_err(map_candle)?,
            bias: Var::from_tensor(&bias).map_err(map_candle)?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> ClassifierResult<Tensor> {
        x.matmul(self.weight.as_tensor())
            .map_err(map_candle)?
            .broadcast_add(self.bias.as_tensor())
            .map_err(map_candle)
    }

    pub fn num_params(&self) -> usize {
        self.weight.as_tensor().elem_count() + self.bias.as_tensor().elem_count()
    }
}

/// One feed-forward tower.
pub struct Tower {
    hidden: Vec<DenseLayer>,
    embed: DenseLayer,
    droprate: f32,
    normalize: bool,
}

impl Tower {
    fn new(
        in_dim: usize,
        hidden_sizes: &[usize],
        embed_dim: usize,
        droprate: f32,
        normalize: bool,
        rng: &mut StdRng,
        device: &Device,
    ) -> ClassifierResult<Self> {
        let mut hidden = Vec::with_capacity(hidden_sizes.len());
        let mut dim = in_dim;
        for &size in hidden_sizes {
            hidden.push(DenseLayer::new(dim, size, rng, device)?);
            dim = size;
        }
        let embed = DenseLayer::new(dim, embed_dim, rng, device)?;
        Ok(Self {
            hidden,
            embed,
            droprate,
            normalize,
        })
    }

    /// Embed a batch. Dropout is active only when `rng` is given.
    pub fn forward(&self, x: &Tensor, mut rng: Option<&mut StdRng>) -> ClassifierResult<Tensor> {
        let mut h = x.clone();
        for layer in &self.hidden {
            h = layer.forward(&h)?.relu().map_err(map_candle)?;
            if let Some(rng) = rng.as_deref_mut() {
                h = dropout(&h, self.droprate, rng)?;
            }
        }
        let out = self.embed.forward(&h)?;
        if self.normalize {
            l2_normalize(&out)
        } else {
            Ok(out)
        }
    }

    fn layers(&self) -> impl Iterator<Item = &DenseLayer> {
        self.hidden.iter().chain(std::iter::once(&self.embed))
    }

    /// Named parameter tensors, e.g. `hidden.0.weight`, `embed.bias`.
    fn named_tensors(&self, prefix: &str) -> Vec<(String, Tensor)> {
        let mut out = Vec::with_capacity(2 * (self.hidden.len() + 1));
        for (i, layer) in self.hidden.iter().enumerate() {
            out.push((format!("{}.hidden.{}.weight", prefix, i), layer.weight.as_tensor().clone()));
            out.push((format!("{}.hidden.{}.bias", prefix, i), layer.bias.as_tensor().clone()));
        }
        out.push((format!("{}.embed.weight", prefix), self.embed.weight.as_tensor().clone()));
        out.push((format!("{}.embed.bias", prefix), self.embed.bias.as_tensor().clone()));
        out
    }

    fn from_named(
        prefix: &str,
        in_dim: usize,
        hidden_sizes: &[usize],
        embed_dim: usize,
        droprate: f32,
        normalize: bool,
        tensors: &mut HashMap<String, Tensor>,
    ) -> ClassifierResult<Self> {
        let mut take = |name: String| -> ClassifierResult<Tensor> {
            tensors
                .remove(&name)
                .ok_or_else(|| ClassifierError::SerializationError {
                    message: format!("Missing tensor '{}'", name),
                })
        };

        let mut hidden = Vec::with_capacity(hidden_sizes.len());
        let mut dim = in_dim;
        for (i, &size) in hidden_sizes.iter().enumerate() {
            let weight = take(format!("{}.hidden.{}.weight", prefix, i))?;
            let bias = take(format!("{}.hidden.{}.bias", prefix, i))?;
            hidden.push(DenseLayer::from_tensors(weight, bias, dim, size)?);
            dim = size;
        }
        let weight = take(format!("{}.embed.weight", prefix))?;
        let bias = take(format!("{}.embed.bias", prefix))?;
        let embed = DenseLayer::from_tensors(weight, bias, dim, embed_dim)?;

        Ok(Self {
            hidden,
            embed,
            droprate,
            normalize,
        })
    }
}

/// Input tower plus label tower.
pub struct DualEncoderNetwork {
    topology: NetworkTopology,
    input_tower: Tower,
    label_tower: Tower,
    device: Device,
}

impl DualEncoderNetwork {
    /// Freshly initialized towers.
    pub fn new(topology: NetworkTopology, rng: &mut StdRng, device: &Device) -> ClassifierResult<Self> {
        let normalize = topology.similarity.normalizes_embeddings();
        let input_tower = Tower::new(
            topology.input_dim,
            &topology.hidden_layers_a,
            topology.embed_dim,
            topology.droprate,
            normalize,
            rng,
            device,
        )?;
        let label_tower = Tower::new(
            topology.label_dim,
            &topology.hidden_layers_b,
            topology.embed_dim,
            topology.droprate,
            normalize,
            rng,
            device,
        )?;

        tracing::debug!(
            "Initialized dual encoder: input {} -> {:?} -> {}, label {} -> {:?} -> {}",
            topology.input_dim,
            topology.hidden_layers_a,
            topology.embed_dim,
            topology.label_dim,
            topology.hidden_layers_b,
            topology.embed_dim
        );

        Ok(Self {
            topology,
            input_tower,
            label_tower,
            device: device.clone(),
        })
    }

    /// Rebuild towers from named tensors produced by [`Self::named_tensors`].
    pub fn from_tensors(
        topology: NetworkTopology,
        mut tensors: HashMap<String, Tensor>,
        device: &Device,
    ) -> ClassifierResult<Self> {
        let normalize = topology.similarity.normalizes_embeddings();
        let input_tower = Tower::from_named(
            INPUT_TOWER,
            topology.input_dim,
            &topology.hidden_layers_a,
            topology.embed_dim,
            topology.droprate,
            normalize,
            &mut tensors,
        )?;
        let label_tower = Tower::from_named(
            LABEL_TOWER,
            topology.label_dim,
            &topology.hidden_layers_b,
            topology.embed_dim,
            topology.droprate,
            normalize,
            &mut tensors,
        )?;

        Ok(Self {
            topology,
            input_tower,
            label_tower,
            device: device.clone(),
        })
    }

    pub fn topology(&self) -> &NetworkTopology {
        &self.topology
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Embed feature rows `[B, input_dim]`.
    pub fn embed_inputs(&self, x: &Tensor, rng: Option<&mut StdRng>) -> ClassifierResult<Tensor> {
        let dim = x.dim(D::Minus1).map_err(map_candle)?;
        if dim != self.topology.input_dim {
            return Err(ClassifierError::DimensionMismatch {
                expected: self.topology.input_dim,
                actual: dim,
            });
        }
        self.input_tower.forward(x, rng)
    }

    /// Embed label-representation rows `[L, label_dim]`.
    pub fn embed_labels(&self, y: &Tensor, rng: Option<&mut StdRng>) -> ClassifierResult<Tensor> {
        let dim = y.dim(D::Minus1).map_err(map_candle)?;
        if dim != self.topology.label_dim {
            return Err(ClassifierError::DimensionMismatch {
                expected: self.topology.label_dim,
                actual: dim,
            });
        }
        self.label_tower.forward(y, rng)
    }

    /// Every trainable variable of both towers.
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.input_tower
            .layers()
            .chain(self.label_tower.layers())
            .flat_map(|l| [l.weight.clone(), l.bias.clone()])
            .collect()
    }

    /// `½ Σ‖W‖²` over every dense kernel of both towers (biases excluded).
    pub fn l2_penalty(&self) -> ClassifierResult<Tensor> {
        let mut total = Tensor::zeros((), DType::F32, &self.device).map_err(map_candle)?;
        for layer in self.input_tower.layers().chain(self.label_tower.layers()) {
            let sq = layer
                .weight
                .as_tensor()
                .sqr()
                .map_err(map_candle)?
                .sum_all()
                .map_err(map_candle)?;
            total = total.add(&sq).map_err(map_candle)?;
        }
        total.affine(0.5, 0.0).map_err(map_candle)
    }

    /// Named parameter tensors of both towers.
    pub fn named_tensors(&self) -> Vec<(String, Tensor)> {
        let mut out = self.input_tower.named_tensors(INPUT_TOWER);
        out.extend(self.label_tower.named_tensors(LABEL_TOWER));
        out
    }

    /// Total number of parameters.
    pub fn num_params(&self) -> usize {
        self.input_tower
            .layers()
            .chain(self.label_tower.layers())
            .map(DenseLayer::num_params)
            .sum()
    }
}

const INPUT_TOWER: &str = "input_tower";
const LABEL_TOWER: &str = "label_tower";

/// Inverted dropout: zero each unit with probability `rate`, scale survivors.
fn dropout(x: &Tensor, rate: f32, rng: &mut StdRng) -> ClassifierResult<Tensor> {
    if rate <= 0.0 {
        return Ok(x.clone());
    }
    let keep_scale = 1.0 / (1.0 - rate);
    let mask: Vec<f32> = (0..x.elem_count())
        .map(|_| if rng.gen::<f32>() < rate { 0.0 } else { keep_scale })
        .collect();
    let mask = Tensor::from_vec(mask, x.dims(), x.device()).map_err(map_candle)?;
    x.mul(&mask).map_err(map_candle)
}

/// Row-wise L2 normalization.
pub(crate) fn l2_normalize(x: &Tensor) -> ClassifierResult<Tensor> {
    let norm = x
        .sqr()
        .map_err(map_candle)?
        .sum_keepdim(D::Minus1)
        .map_err(map_candle)?
        .affine(1.0, 1e-12)
        .map_err(map_candle)?
        .sqrt()
        .map_err(map_candle)?;
    x.broadcast_div(&norm).map_err(map_candle)
}

fn map_candle(e: candle_core::Error) -> ClassifierError {
    ClassifierError::TensorError {
        message: format!("Network error: {}", e),
    }
}
