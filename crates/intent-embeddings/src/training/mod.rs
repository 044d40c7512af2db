//! Supervised embedding training.
//!
//! # Components
//!
//! - [`labels`]: Label index and label representation matrix
//! - [`data`]: Examples, session data, split, and epoch batching
//! - [`network`]: Dual-encoder towers
//! - [`loss`]: Negative-sampling softmax and margin losses
//! - [`optimizer`]: Adam over tower variables
//! - [`trainer`]: Epoch loop with batch-size growth and evaluation

pub mod data;
pub mod labels;
pub mod loss;
pub mod network;
pub mod optimizer;
pub mod trainer;

pub use data::{
    load_examples_jsonl, save_examples_jsonl, split_session_data, Batch, BatchDataset,
    EpochBatches, Example, SessionData,
};
pub use labels::{LabelIndex, LabelRepresentation};
pub use loss::{LossComponents, LossConfig, NegativeSamples, SimilarityLoss};
pub use network::{DualEncoderNetwork, NetworkTopology};
pub use optimizer::{Adam, AdamConfig};
pub use trainer::{
    linearly_increasing_batch_size, EpochResult, EvalMetrics, Trainer, TrainerState,
    TrainingConfig, TrainingHistory,
};
