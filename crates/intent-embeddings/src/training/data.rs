//! Training examples, prepared session data, and epoch batching.
//!
//! `SessionData` keeps the feature matrix `X`, the label-representation
//! matrix `Y` and the raw label ids index-aligned. Every subset or batch is
//! taken by index, so the alignment is preserved throughout.

use std::collections::{BTreeMap, HashMap};
use std::io::{BufRead, Write};
use std::path::Path;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use super::labels::{LabelIndex, LabelRepresentation};
use crate::config::BatchStrategy;
use crate::error::{ClassifierError, ClassifierResult};

/// A pre-extracted feature vector and its label name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    /// Fixed-length numeric features from the upstream featurizer.
    pub features: Vec<f32>,
    /// Label (intent) name.
    pub label: String,
}

impl Example {
    pub fn new(features: Vec<f32>, label: impl Into<String>) -> Self {
        Self {
            features,
            label: label.into(),
        }
    }
}

/// Index-aligned `X`, `Y` and label ids for a training run.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionData {
    input_dim: usize,
    label_dim: usize,
    /// Row-major `[len, input_dim]`.
    x: Vec<f32>,
    /// Row-major `[len, label_dim]`.
    y: Vec<f32>,
    labels: Vec<usize>,
}

impl SessionData {
    /// Prepare session data from examples.
    ///
    /// # Errors
    /// - `ClassifierError::InvalidInput` if there are no examples, feature
    ///   vectors differ in length, contain non-finite values, or a label is
    ///   missing from `index`
    pub fn from_examples(
        examples: &[Example],
        index: &LabelIndex,
        representation: &LabelRepresentation,
    ) -> ClassifierResult<Self> {
        let labels: Vec<&str> = examples.iter().map(|e| e.label.as_str()).collect();
        let label_ids = index.encode(&labels)?;
        let features: Vec<&[f32]> = examples.iter().map(|e| e.features.as_slice()).collect();
        Self::new(&features, label_ids, representation)
    }

    /// Prepare session data from feature rows and label ids.
    pub fn new(
        features: &[&[f32]],
        label_ids: Vec<usize>,
        representation: &LabelRepresentation,
    ) -> ClassifierResult<Self> {
        let first = features.first().ok_or_else(|| ClassifierError::InvalidInput {
            message: "No training examples".to_string(),
        })?;
        let input_dim = first.len();
        if input_dim == 0 {
            return Err(ClassifierError::InvalidInput {
                message: "Feature vectors must not be empty".to_string(),
            });
        }
        if features.len() != label_ids.len() {
            return Err(ClassifierError::InvalidInput {
                message: format!(
                    "{} feature rows but {} labels",
                    features.len(),
                    label_ids.len()
                ),
            });
        }

        let label_dim = representation.dim();
        let mut x = Vec::with_capacity(features.len() * input_dim);
        let mut y = Vec::with_capacity(features.len() * label_dim);

        for (i, (row, &label)) in features.iter().zip(label_ids.iter()).enumerate() {
            if row.len() != input_dim {
                return Err(ClassifierError::InvalidInput {
                    message: format!(
                        "Example {} has {} features, expected {}",
                        i,
                        row.len(),
                        input_dim
                    ),
                });
            }
            if row.iter().any(|v| !v.is_finite()) {
                return Err(ClassifierError::InvalidInput {
                    message: format!("Example {} contains non-finite features", i),
                });
            }
            if label >= representation.num_labels() {
                return Err(ClassifierError::InvalidInput {
                    message: format!("Example {} has unknown label id {}", i, label),
                });
            }
            x.extend_from_slice(row);
            y.extend_from_slice(representation.row(label));
        }

        Ok(Self {
            input_dim,
            label_dim,
            x,
            y,
            labels: label_ids,
        })
    }

    /// Number of examples.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Feature dimensionality.
    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// Label-representation dimensionality.
    pub fn label_dim(&self) -> usize {
        self.label_dim
    }

    /// Label id of every example.
    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Feature row of example `i`.
    pub fn features(&self, i: usize) -> &[f32] {
        &self.x[i * self.input_dim..(i + 1) * self.input_dim]
    }

    /// Label-representation row of example `i`.
    pub fn label_features(&self, i: usize) -> &[f32] {
        &self.y[i * self.label_dim..(i + 1) * self.label_dim]
    }

    /// Examples at `indices`, in that order.
    pub fn subset(&self, indices: &[usize]) -> Self {
        let mut x = Vec::with_capacity(indices.len() * self.input_dim);
        let mut y = Vec::with_capacity(indices.len() * self.label_dim);
        let mut labels = Vec::with_capacity(indices.len());
        for &i in indices {
            x.extend_from_slice(self.features(i));
            y.extend_from_slice(self.label_features(i));
            labels.push(self.labels[i]);
        }
        Self {
            input_dim: self.input_dim,
            label_dim: self.label_dim,
            x,
            y,
            labels,
        }
    }

    /// Tensors for the examples at `indices`.
    pub fn batch(&self, indices: &[usize], device: &Device) -> ClassifierResult<Batch> {
        let mut x = Vec::with_capacity(indices.len() * self.input_dim);
        let mut y = Vec::with_capacity(indices.len() * self.label_dim);
        let mut label_ids = Vec::with_capacity(indices.len());
        for &i in indices {
            x.extend_from_slice(self.features(i));
            y.extend_from_slice(self.label_features(i));
            label_ids.push(self.labels[i]);
        }

        let features =
            Tensor::from_vec(x, (indices.len(), self.input_dim), device).map_err(map_candle)?;
        let label_features =
            Tensor::from_vec(y, (indices.len(), self.label_dim), device).map_err(map_candle)?;

        Ok(Batch {
            features,
            label_features,
            label_ids,
        })
    }

    /// Example indices grouped by label id, in ascending label order.
    fn indices_by_label(&self) -> BTreeMap<usize, Vec<usize>> {
        let mut by_label: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (i, &label) in self.labels.iter().enumerate() {
            by_label.entry(label).or_default().push(i);
        }
        by_label
    }
}

/// Split off a held-out evaluation subset of up to `eval_size` examples.
///
/// Each label keeps at least one example in the training subset, so labels
/// seen only once are never held out. Returns `None` for the evaluation
/// subset when `eval_size` is 0 or nothing can be held out.
pub fn split_session_data(
    data: SessionData,
    eval_size: usize,
    rng: &mut StdRng,
) -> (SessionData, Option<SessionData>) {
    if eval_size == 0 {
        return (data, None);
    }

    let mut remaining: HashMap<usize, usize> = HashMap::new();
    for &label in data.labels() {
        *remaining.entry(label).or_default() += 1;
    }

    let mut order: Vec<usize> = (0..data.len()).collect();
    order.shuffle(rng);

    let mut train = Vec::with_capacity(data.len());
    let mut eval = Vec::with_capacity(eval_size.min(data.len()));
    for i in order {
        let label = data.labels()[i];
        let left = remaining.get_mut(&label);
        match left {
            Some(count) if eval.len() < eval_size && *count > 1 => {
                *count -= 1;
                eval.push(i);
            }
            _ => train.push(i),
        }
    }

    if eval.len() < eval_size {
        tracing::warn!(
            "Requested {} evaluation examples, holding out {} so every label stays in training",
            eval_size,
            eval.len()
        );
    }

    if eval.is_empty() {
        return (data, None);
    }

    train.sort_unstable();
    eval.sort_unstable();
    (data.subset(&train), Some(data.subset(&eval)))
}

/// Tensors for one batch.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[batch, input_dim]`
    pub features: Tensor,
    /// `[batch, label_dim]`, the representation of each example's label.
    pub label_features: Tensor,
    /// Label id of each example.
    pub label_ids: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.label_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.label_ids.is_empty()
    }
}

/// Ordered example indices for one epoch, emitted in chunks of `batch_size`.
#[derive(Debug, Clone)]
pub struct EpochBatches {
    order: Vec<usize>,
    batch_size: usize,
    position: usize,
}

impl Iterator for EpochBatches {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.order.len() {
            return None;
        }
        let end = (self.position + self.batch_size).min(self.order.len());
        let chunk = self.order[self.position..end].to_vec();
        self.position = end;
        Some(chunk)
    }
}

/// Training data plus an optional held-out subset, batched per epoch.
#[derive(Debug, Clone)]
pub struct BatchDataset {
    train: SessionData,
    eval: Option<SessionData>,
    strategy: BatchStrategy,
}

impl BatchDataset {
    pub fn new(train: SessionData, eval: Option<SessionData>, strategy: BatchStrategy) -> Self {
        let eval = eval.filter(|e| !e.is_empty());
        Self {
            train,
            eval,
            strategy,
        }
    }

    pub fn train(&self) -> &SessionData {
        &self.train
    }

    pub fn eval(&self) -> Option<&SessionData> {
        self.eval.as_ref()
    }

    pub fn has_eval(&self) -> bool {
        self.eval.is_some()
    }

    pub fn strategy(&self) -> BatchStrategy {
        self.strategy
    }

    /// Batches over the training subset for one epoch.
    pub fn epoch_batches(&self, batch_size: usize, rng: &mut StdRng) -> EpochBatches {
        plan_epoch(&self.train, self.strategy, batch_size, rng)
    }

    /// Batches over the evaluation subset, or `None` when evaluation is disabled.
    pub fn eval_batches(&self, batch_size: usize, rng: &mut StdRng) -> Option<EpochBatches> {
        self.eval
            .as_ref()
            .map(|eval| plan_epoch(eval, self.strategy, batch_size, rng))
    }
}

fn plan_epoch(
    data: &SessionData,
    strategy: BatchStrategy,
    batch_size: usize,
    rng: &mut StdRng,
) -> EpochBatches {
    let order = match strategy {
        BatchStrategy::Sequence => {
            let mut order: Vec<usize> = (0..data.len()).collect();
            order.shuffle(rng);
            order
        }
        BatchStrategy::Balanced => balanced_order(data, rng),
    };
    EpochBatches {
        order,
        batch_size: batch_size.max(1),
        position: 0,
    }
}

/// Round-robin over label classes in a per-epoch random class order.
///
/// Each class's examples are shuffled; a class drops out of the rotation
/// once its examples are used up, and no example is repeated.
fn balanced_order(data: &SessionData, rng: &mut StdRng) -> Vec<usize> {
    let mut queues: Vec<Vec<usize>> = data.indices_by_label().into_values().collect();
    for queue in &mut queues {
        queue.shuffle(rng);
    }
    queues.shuffle(rng);

    let mut cursors = vec![0usize; queues.len()];
    let mut order = Vec::with_capacity(data.len());
    while order.len() < data.len() {
        for (queue, cursor) in queues.iter().zip(cursors.iter_mut()) {
            if let Some(&i) = queue.get(*cursor) {
                order.push(i);
                *cursor += 1;
            }
        }
    }
    order
}

/// Save examples to a JSONL file.
pub fn save_examples_jsonl(examples: &[Example], path: &Path) -> std::io::Result<()> {
    let file = std::fs::File::create(path)?;
    let mut writer = std::io::BufWriter::new(file);
    for example in examples {
        let json = serde_json::to_string(example)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        writeln!(writer, "{}", json)?;
    }
    writer.flush()
}

/// Load examples from a JSONL file. Blank lines are skipped.
pub fn load_examples_jsonl(path: &Path) -> std::io::Result<Vec<Example>> {
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    let mut examples = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let example: Example = serde_json::from_str(&line)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        examples.push(example);
    }
    Ok(examples)
}

fn map_candle(e: candle_core::Error) -> ClassifierError {
    ClassifierError::TensorError {
        message: format!("Batch preparation error: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;

    fn session(counts: &[usize]) -> SessionData {
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for (label, &count) in counts.iter().enumerate() {
            for j in 0..count {
                rows.push(vec![label as f32, j as f32]);
                labels.push(label);
            }
        }
        let refs: Vec<&[f32]> = rows.iter().map(Vec::as_slice).collect();
        SessionData::new(&refs, labels, &LabelRepresentation::identity(counts.len())).unwrap()
    }

    fn count_by_label(data: &SessionData, batch: &[usize]) -> BTreeMap<usize, usize> {
        let mut counts = BTreeMap::new();
        for &i in batch {
            *counts.entry(data.labels()[i]).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn test_from_examples_aligns_rows() {
        let examples = vec![
            Example::new(vec![1.0, 0.0], "greet"),
            Example::new(vec![0.0, 1.0], "bye"),
        ];
        let index = LabelIndex::build(&["greet", "bye"]).unwrap();
        let repr = LabelRepresentation::identity(index.len());
        let data = SessionData::from_examples(&examples, &index, &repr).unwrap();

        assert_eq!(data.len(), 2);
        assert_eq!(data.input_dim(), 2);
        assert_eq!(data.labels(), &[1, 0]);
        assert_eq!(data.features(0), &[1.0, 0.0]);
        assert_eq!(data.label_features(0), &[0.0, 1.0]);
        assert_eq!(data.label_features(1), &[1.0, 0.0]);
    }

    #[test]
    fn test_ragged_features_rejected() {
        let rows: Vec<&[f32]> = vec![&[1.0, 2.0][..], &[1.0][..]];
        let err = SessionData::new(&rows, vec![0, 1], &LabelRepresentation::identity(2));
        assert!(matches!(err, Err(ClassifierError::InvalidInput { .. })));
    }

    #[test]
    fn test_non_finite_features_rejected() {
        let rows: Vec<&[f32]> = vec![&[1.0, f32::NAN][..], &[1.0, 0.0][..]];
        let err = SessionData::new(&rows, vec![0, 1], &LabelRepresentation::identity(2));
        assert!(matches!(err, Err(ClassifierError::InvalidInput { .. })));
    }

    #[test]
    fn test_batch_tensors_match_rows() {
        let data = session(&[2, 3]);
        let batch = data.batch(&[4, 0], &Device::Cpu).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.features.dims(), &[2, 2]);
        assert_eq!(batch.label_ids, vec![1, 0]);
        let y = batch.label_features.to_vec2::<f32>().unwrap();
        assert_eq!(y[0], vec![0.0, 1.0]);
        assert_eq!(y[1], vec![1.0, 0.0]);
    }

    #[test]
    fn test_sequence_batches_cover_all_examples_once() {
        let data = session(&[3, 4]);
        let dataset = BatchDataset::new(data, None, BatchStrategy::Sequence);
        let mut rng = StdRng::seed_from_u64(42);

        let batches: Vec<Vec<usize>> = dataset.epoch_batches(3, &mut rng).collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].len(), 1);
        let mut seen: Vec<usize> = batches.into_iter().flatten().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn test_same_seed_same_batches() {
        let dataset = BatchDataset::new(session(&[5, 2, 3]), None, BatchStrategy::Balanced);
        let a: Vec<_> = dataset
            .epoch_batches(4, &mut StdRng::seed_from_u64(1))
            .collect();
        let b: Vec<_> = dataset
            .epoch_batches(4, &mut StdRng::seed_from_u64(1))
            .collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_balanced_batches_interleave_classes() {
        let data = session(&[4, 4]);
        let dataset = BatchDataset::new(data.clone(), None, BatchStrategy::Balanced);
        let mut rng = StdRng::seed_from_u64(3);

        for batch in dataset.epoch_batches(2, &mut rng) {
            let counts = count_by_label(&data, &batch);
            assert_eq!(counts.len(), 2, "each batch should hold both classes");
        }
    }

    #[test]
    fn test_eval_batches_none_without_eval_set() {
        let dataset = BatchDataset::new(session(&[2, 2]), None, BatchStrategy::Sequence);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(!dataset.has_eval());
        assert!(dataset.eval_batches(2, &mut rng).is_none());
    }

    #[test]
    fn test_split_is_disjoint_and_keeps_every_label() {
        let data = session(&[1, 5, 6]);
        let mut rng = StdRng::seed_from_u64(42);
        let (train, eval) = split_session_data(data, 4, &mut rng);
        let eval = eval.unwrap();

        assert_eq!(eval.len(), 4);
        assert_eq!(train.len(), 8);
        for label in 0..3 {
            assert!(train.labels().contains(&label));
        }

        let train_rows: Vec<&[f32]> = (0..train.len()).map(|i| train.features(i)).collect();
        for i in 0..eval.len() {
            assert!(!train_rows.contains(&eval.features(i)));
        }
    }

    #[test]
    fn test_split_holds_back_what_it_can() {
        let data = session(&[1, 2]);
        let mut rng = StdRng::seed_from_u64(42);
        let (train, eval) = split_session_data(data, 10, &mut rng);
        assert_eq!(train.len(), 2);
        assert_eq!(eval.unwrap().len(), 1);
    }

    #[test]
    fn test_split_zero_disables_eval() {
        let data = session(&[3, 3]);
        let mut rng = StdRng::seed_from_u64(42);
        let (train, eval) = split_session_data(data, 0, &mut rng);
        assert_eq!(train.len(), 6);
        assert!(eval.is_none());
    }

    #[test]
    fn test_jsonl_round_trip() {
        let examples = vec![
            Example::new(vec![0.5, -1.0, 2.0], "greet"),
            Example::new(vec![0.0, 0.0, 1.0], "bye"),
        ];

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("examples.jsonl");

        save_examples_jsonl(&examples, &path).unwrap();
        let loaded = load_examples_jsonl(&path).unwrap();

        assert_eq!(loaded, examples);
    }

    #[test]
    fn test_jsonl_malformed_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "{\"features\": [1.0], \"label\": \"greet\"}\nnot json\n").unwrap();

        let err = load_examples_jsonl(&path).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    proptest! {
        #[test]
        fn prop_balanced_batches_are_near_equal(
            counts in prop::collection::vec(1usize..12, 2..6),
            batch_size in 1usize..16,
            seed in any::<u64>(),
        ) {
            let data = session(&counts);
            let dataset = BatchDataset::new(data.clone(), None, BatchStrategy::Balanced);
            let mut rng = StdRng::seed_from_u64(seed);

            let mut used = vec![0usize; counts.len()];
            let mut total = 0;
            for batch in dataset.epoch_batches(batch_size, &mut rng) {
                let in_batch = count_by_label(&data, &batch);
                for (&label, &n) in &in_batch {
                    used[label] += n;
                }
                total += batch.len();

                // Classes with examples left after this batch were active
                // throughout it and must be represented evenly.
                let active: Vec<usize> = (0..counts.len())
                    .filter(|&l| used[l] < counts[l])
                    .map(|l| in_batch.get(&l).copied().unwrap_or(0))
                    .collect();
                if let (Some(max), Some(min)) = (active.iter().max(), active.iter().min()) {
                    prop_assert!(max - min <= 1, "counts {:?} in batch {:?}", active, batch);
                }
            }
            prop_assert_eq!(total, data.len());
            prop_assert_eq!(used, counts);
        }
    }
}
