//! Label dictionary and label representation matrix.
//!
//! Ids are assigned by sorting distinct label names, so two runs over the
//! same labels always produce the same index. The representation matrix is
//! either the identity (one unit per label) or a multi-hot bag of tokens
//! obtained by splitting each label name on a delimiter.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{ClassifierError, ClassifierResult, ConfigWarning};

/// Bidirectional mapping between label names and dense ids `[0, len)`.
///
/// Serialized as an id -> name map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<usize, String>", into = "BTreeMap<usize, String>")]
pub struct LabelIndex {
    names: Vec<String>,
    ids: HashMap<String, usize>,
}

impl LabelIndex {
    /// Build the index from observed labels (duplicates allowed).
    ///
    /// # Errors
    /// - `ClassifierError::InsufficientLabels` if fewer than 2 distinct labels
    pub fn build<S: AsRef<str>>(labels: &[S]) -> ClassifierResult<Self> {
        let distinct: BTreeSet<&str> = labels.iter().map(AsRef::as_ref).collect();
        if distinct.len() < 2 {
            return Err(ClassifierError::InsufficientLabels {
                found: distinct.len(),
            });
        }
        Ok(Self::from_sorted(
            distinct.into_iter().map(str::to_string).collect(),
        ))
    }

    fn from_sorted(names: Vec<String>) -> Self {
        let ids = names
            .iter()
            .enumerate()
            .map(|(id, name)| (name.clone(), id))
            .collect();
        Self { names, ids }
    }

    /// Number of labels.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Id of a label name.
    pub fn id(&self, name: &str) -> Option<usize> {
        self.ids.get(name).copied()
    }

    /// Name of a label id.
    pub fn name(&self, id: usize) -> Option<&str> {
        self.names.get(id).map(String::as_str)
    }

    /// Label names in id order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Map every label to its id.
    ///
    /// # Errors
    /// - `ClassifierError::InvalidInput` naming the first label not in the index
    pub fn encode<S: AsRef<str>>(&self, labels: &[S]) -> ClassifierResult<Vec<usize>> {
        labels
            .iter()
            .map(|label| {
                let label = label.as_ref();
                self.id(label).ok_or_else(|| ClassifierError::InvalidInput {
                    message: format!("Unknown label '{}'", label),
                })
            })
            .collect()
    }
}

impl From<LabelIndex> for BTreeMap<usize, String> {
    fn from(index: LabelIndex) -> Self {
        index.names.into_iter().enumerate().collect()
    }
}

impl TryFrom<BTreeMap<usize, String>> for LabelIndex {
    type Error = ClassifierError;

    fn try_from(map: BTreeMap<usize, String>) -> Result<Self, Self::Error> {
        let mut names = Vec::with_capacity(map.len());
        for (expected, (id, name)) in map.into_iter().enumerate() {
            if id != expected {
                return Err(ClassifierError::SerializationError {
                    message: format!("Label ids must be contiguous from 0, missing id {}", expected),
                });
            }
            names.push(name);
        }

        let index = Self::from_sorted(names);
        if index.ids.len() != index.names.len() {
            return Err(ClassifierError::SerializationError {
                message: "Label index contains duplicate names".to_string(),
            });
        }
        Ok(index)
    }
}

/// One row per label id describing the label to the label tower.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelRepresentation {
    rows: usize,
    cols: usize,
    /// Row-major values.
    data: Vec<f32>,
}

impl LabelRepresentation {
    /// Build the representation for `index`.
    ///
    /// Tokenization without a delimiter is downgraded to the identity matrix;
    /// the returned warning records the downgrade.
    pub fn build(
        index: &LabelIndex,
        tokenize: bool,
        delimiter: &str,
    ) -> (Self, Option<ConfigWarning>) {
        if tokenize && delimiter.is_empty() {
            let warning = ConfigWarning::TokenizationWithoutDelimiter;
            tracing::warn!("{}", warning);
            return (Self::identity(index.len()), Some(warning));
        }

        if tokenize {
            (Self::bag_of_tokens(index, delimiter), None)
        } else {
            (Self::identity(index.len()), None)
        }
    }

    /// One-hot rows.
    pub fn identity(num_labels: usize) -> Self {
        let mut data = vec![0.0f32; num_labels * num_labels];
        for i in 0..num_labels {
            data[i * num_labels + i] = 1.0;
        }
        Self {
            rows: num_labels,
            cols: num_labels,
            data,
        }
    }

    /// Multi-hot rows over the sorted vocabulary of label tokens.
    ///
    /// Empty tokens count as tokens, so `greet` and `greet_` stay distinct.
    pub fn bag_of_tokens(index: &LabelIndex, delimiter: &str) -> Self {
        let vocabulary: Vec<&str> = index
            .names()
            .iter()
            .flat_map(|name| name.split(delimiter))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let token_ids: HashMap<&str, usize> = vocabulary
            .iter()
            .enumerate()
            .map(|(i, &t)| (t, i))
            .collect();

        let rows = index.len();
        let cols = vocabulary.len();
        let mut data = vec![0.0f32; rows * cols];
        for (row, name) in index.names().iter().enumerate() {
            for token in name.split(delimiter) {
                if let Some(&col) = token_ids.get(token) {
                    data[row * cols + col] = 1.0;
                }
            }
        }

        Self { rows, cols, data }
    }

    /// Rebuild from raw row-major values, e.g. after loading an artifact.
    pub fn from_raw(rows: usize, cols: usize, data: Vec<f32>) -> ClassifierResult<Self> {
        if data.len() != rows * cols {
            return Err(ClassifierError::SerializationError {
                message: format!(
                    "Label representation has {} values, expected {}x{}",
                    data.len(),
                    rows,
                    cols
                ),
            });
        }
        Ok(Self { rows, cols, data })
    }

    /// Number of labels.
    pub fn num_labels(&self) -> usize {
        self.rows
    }

    /// Width of each row (label-tower input dimension).
    pub fn dim(&self) -> usize {
        self.cols
    }

    /// Row for a label id.
    pub fn row(&self, id: usize) -> &[f32] {
        &self.data[id * self.cols..(id + 1) * self.cols]
    }

    /// Whether two labels have identical representations.
    pub fn same_representation(&self, a: usize, b: usize) -> bool {
        self.row(a) == self.row(b)
    }

    /// The whole matrix as a `[num_labels, dim]` tensor.
    pub fn to_tensor(&self, device: &Device) -> ClassifierResult<Tensor> {
        Tensor::from_slice(&self.data, (self.rows, self.cols), device).map_err(map_candle)
    }
}

fn map_candle(e: candle_core::Error) -> ClassifierError {
    ClassifierError::TensorError {
        message: format!("Label encoding error: {}", e),
    }
}
