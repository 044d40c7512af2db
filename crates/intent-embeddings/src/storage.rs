//! Persistence of trained models.
//!
//! A model saved under base name `intent` in directory `dir` produces:
//!
//! | File | Contents |
//! |------|----------|
//! | `dir/intent.safetensors` | tower parameters, `all_label_embeddings`, `label_representation` |
//! | `dir/intent_label_index.json` | label id -> name map |
//! | `dir/intent_meta.json` | topology, similarity, loss type, dimensions, checksums |
//!
//! Each file is written to a temporary sibling and renamed into place, so a
//! concurrent save to the same destination never leaves a torn file. The
//! renames are independent, so two concurrent saves of different models may
//! interleave per file. The metadata is written last and records an xxh64
//! checksum of the other two files; a load that finds files from different
//! saves fails with `SerializationError` instead of mixing them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use candle_core::{Device, Tensor};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

use crate::config::{LossType, Similarity};
use crate::error::{ClassifierError, ClassifierResult};
use crate::training::{DualEncoderNetwork, LabelIndex, LabelRepresentation, NetworkTopology};

/// Metadata format version written by this crate.
pub const FORMAT_VERSION: u32 = 1;

const ALL_LABEL_EMBEDDINGS: &str = "all_label_embeddings";
const LABEL_REPRESENTATION: &str = "label_representation";

/// Where a model lives. Missing either field means there is no model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    /// Base file name shared by every artifact file.
    pub base_file_name: Option<String>,
    /// Directory holding the artifact files.
    pub directory: Option<PathBuf>,
}

impl ArtifactDescriptor {
    pub fn new(directory: impl Into<PathBuf>, base_file_name: impl Into<String>) -> Self {
        Self {
            base_file_name: Some(base_file_name.into()),
            directory: Some(directory.into()),
        }
    }

    /// File paths, if both fields are present.
    pub fn paths(&self) -> Option<ArtifactPaths> {
        let base = self.base_file_name.as_deref().filter(|b| !b.is_empty())?;
        let dir = self.directory.as_deref()?;
        Some(ArtifactPaths {
            weights: dir.join(format!("{}.safetensors", base)),
            label_index: dir.join(format!("{}_label_index.json", base)),
            metadata: dir.join(format!("{}_meta.json", base)),
        })
    }
}

/// Concrete file paths of an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub weights: PathBuf,
    pub label_index: PathBuf,
    pub metadata: PathBuf,
}

/// Everything needed to rebuild the towers and interpret their output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub format_version: u32,
    pub topology: NetworkTopology,
    pub loss_type: LossType,
    pub num_labels: usize,
}

impl ModelMetadata {
    pub fn similarity(&self) -> Similarity {
        self.topology.similarity
    }
}

/// On-disk form of [`ModelMetadata`], tying it to the exact bytes of the
/// sibling files it was written with.
#[derive(Debug, Serialize, Deserialize)]
struct SavedMetadata {
    #[serde(flatten)]
    model: ModelMetadata,
    weights_xxh64: u64,
    label_index_xxh64: u64,
}

/// A trained network with its label index and frozen label embeddings.
pub struct TrainedModel {
    pub network: DualEncoderNetwork,
    pub label_index: LabelIndex,
    pub label_representation: LabelRepresentation,
    /// Label-tower output for every label, `[num_labels, embed_dim]`.
    pub all_label_embeddings: Tensor,
    pub metadata: ModelMetadata,
}

impl std::fmt::Debug for TrainedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainedModel")
            .field("labels", &self.label_index.names())
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

impl TrainedModel {
    pub fn new(
        network: DualEncoderNetwork,
        label_index: LabelIndex,
        label_representation: LabelRepresentation,
        all_label_embeddings: Tensor,
        loss_type: LossType,
    ) -> ClassifierResult<Self> {
        let metadata = ModelMetadata {
            format_version: FORMAT_VERSION,
            topology: network.topology().clone(),
            loss_type,
            num_labels: label_index.len(),
        };
        let model = Self {
            network,
            label_index,
            label_representation,
            all_label_embeddings,
            metadata,
        };
        model.check_consistency()?;
        Ok(model)
    }

    /// Feature dimensionality the input tower expects.
    pub fn input_dim(&self) -> usize {
        self.metadata.topology.input_dim
    }

    pub fn similarity(&self) -> Similarity {
        self.metadata.similarity()
    }

    pub fn num_labels(&self) -> usize {
        self.label_index.len()
    }

    fn check_consistency(&self) -> ClassifierResult<()> {
        let topology = &self.metadata.topology;
        let expected_table = [self.label_index.len(), topology.embed_dim];
        if self.all_label_embeddings.dims() != expected_table {
            return Err(ClassifierError::SerializationError {
                message: format!(
                    "Label embedding table has shape {:?}, expected {:?}",
                    self.all_label_embeddings.dims(),
                    expected_table
                ),
            });
        }
        if self.label_representation.num_labels() != self.label_index.len()
            || self.label_representation.dim() != topology.label_dim
        {
            return Err(ClassifierError::SerializationError {
                message: format!(
                    "Label representation is {}x{}, expected {}x{}",
                    self.label_representation.num_labels(),
                    self.label_representation.dim(),
                    self.label_index.len(),
                    topology.label_dim
                ),
            });
        }
        if self.metadata.num_labels != self.label_index.len() {
            return Err(ClassifierError::SerializationError {
                message: format!(
                    "Metadata lists {} labels, index has {}",
                    self.metadata.num_labels,
                    self.label_index.len()
                ),
            });
        }
        Ok(())
    }
}

/// Saves and loads [`TrainedModel`] artifacts.
#[derive(Debug, Clone)]
pub struct ModelStore {
    device: Device,
}

impl Default for ModelStore {
    fn default() -> Self {
        Self::new(Device::Cpu)
    }
}

impl ModelStore {
    /// Store that loads tensors onto `device`.
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Persist `model` under `directory/base_file_name*`.
    ///
    /// Missing directories are created; an existing directory is not an error.
    pub fn save(
        &self,
        model: &TrainedModel,
        directory: &Path,
        base_file_name: &str,
    ) -> ClassifierResult<ArtifactDescriptor> {
        let descriptor = ArtifactDescriptor::new(directory, base_file_name);
        let paths = descriptor
            .paths()
            .ok_or_else(|| ClassifierError::InvalidInput {
                message: "Artifact base file name must not be empty".to_string(),
            })?;

        std::fs::create_dir_all(directory)?;

        let mut tensors = model.network.named_tensors();
        tensors.push((
            ALL_LABEL_EMBEDDINGS.to_string(),
            model.all_label_embeddings.clone(),
        ));
        tensors.push((
            LABEL_REPRESENTATION.to_string(),
            model.label_representation.to_tensor(&Device::Cpu)?,
        ));
        let weights = serialize_safetensors(&tensors)?;
        write_atomically(&paths.weights, |tmp| Ok(std::fs::write(tmp, &weights)?))?;

        let index_json = serde_json::to_vec_pretty(&model.label_index).map_err(map_json)?;
        write_atomically(&paths.label_index, |tmp| Ok(std::fs::write(tmp, &index_json)?))?;

        let saved = SavedMetadata {
            model: model.metadata.clone(),
            weights_xxh64: xxh64(&weights, 0),
            label_index_xxh64: xxh64(&index_json, 0),
        };
        let meta_json = serde_json::to_vec_pretty(&saved).map_err(map_json)?;
        write_atomically(&paths.metadata, |tmp| Ok(std::fs::write(tmp, &meta_json)?))?;

        tracing::info!(
            "Saved intent model '{}' ({} labels) to {}",
            base_file_name,
            model.num_labels(),
            directory.display()
        );
        Ok(descriptor)
    }

    /// Whether every artifact file of `descriptor` exists.
    pub fn exists(&self, descriptor: &ArtifactDescriptor) -> bool {
        descriptor.paths().is_some_and(|p| {
            p.weights.is_file() && p.label_index.is_file() && p.metadata.is_file()
        })
    }

    /// Load a model saved by [`Self::save`].
    ///
    /// # Errors
    /// - `ClassifierError::ModelNotFound` if the descriptor is incomplete or a file is missing
    /// - `ClassifierError::SerializationError` if an artifact is malformed or inconsistent,
    ///   including files left behind by different saves
    pub fn load(&self, descriptor: &ArtifactDescriptor) -> ClassifierResult<TrainedModel> {
        let paths = match descriptor.paths() {
            Some(paths) => paths,
            None => {
                let path = descriptor.directory.clone().unwrap_or_default();
                tracing::warn!(
                    "No intent model: artifact descriptor is incomplete ({:?})",
                    descriptor
                );
                return Err(ClassifierError::ModelNotFound { path });
            }
        };

        for path in [&paths.weights, &paths.label_index, &paths.metadata] {
            if !path.is_file() {
                tracing::warn!("No intent model: {} does not exist", path.display());
                return Err(ClassifierError::ModelNotFound { path: path.clone() });
            }
        }

        let saved: SavedMetadata =
            serde_json::from_slice(&std::fs::read(&paths.metadata)?).map_err(map_json)?;
        let metadata = saved.model;
        if metadata.format_version != FORMAT_VERSION {
            return Err(ClassifierError::SerializationError {
                message: format!(
                    "Unsupported model format version {} (expected {})",
                    metadata.format_version, FORMAT_VERSION
                ),
            });
        }
        let index_json = std::fs::read(&paths.label_index)?;
        let weights = std::fs::read(&paths.weights)?;
        verify_checksum(&paths.label_index, &index_json, saved.label_index_xxh64)?;
        verify_checksum(&paths.weights, &weights, saved.weights_xxh64)?;

        let label_index: LabelIndex = serde_json::from_slice(&index_json).map_err(map_json)?;
        let mut tensors = read_safetensors(&weights, &paths.weights, &self.device)?;
        let mut take = |name: &str| -> ClassifierResult<Tensor> {
            tensors
                .remove(name)
                .ok_or_else(|| ClassifierError::SerializationError {
                    message: format!("Missing tensor '{}' in {}", name, paths.weights.display()),
                })
        };
        let all_label_embeddings = take(ALL_LABEL_EMBEDDINGS)?;
        let representation = take(LABEL_REPRESENTATION)?;

        let (rows, cols) = representation.dims2().map_err(map_candle)?;
        let values = representation
            .flatten_all()
            .map_err(map_candle)?
            .to_vec1::<f32>()
            .map_err(map_candle)?;
        let label_representation = LabelRepresentation::from_raw(rows, cols, values)?;

        let network = DualEncoderNetwork::from_tensors(metadata.topology.clone(), tensors, &self.device)?;

        let model = TrainedModel {
            network,
            label_index,
            label_representation,
            all_label_embeddings,
            metadata,
        };
        model.check_consistency()?;

        tracing::info!(
            "Loaded intent model from {} ({} labels, {:?} similarity)",
            paths.weights.display(),
            model.num_labels(),
            model.similarity()
        );
        Ok(model)
    }
}

fn verify_checksum(path: &Path, bytes: &[u8], expected: u64) -> ClassifierResult<()> {
    let actual = xxh64(bytes, 0);
    if actual != expected {
        return Err(ClassifierError::SerializationError {
            message: format!(
                "Checksum mismatch for {} (found {:016x}, metadata expects {:016x}): \
                 artifact files come from different saves",
                path.display(),
                actual,
                expected
            ),
        });
    }
    Ok(())
}

fn serialize_safetensors(tensors: &[(String, Tensor)]) -> ClassifierResult<Vec<u8>> {
    let tensor_data: Vec<(String, Vec<f32>, Vec<usize>)> = tensors
        .iter()
        .map(|(name, t)| {
            let data: Vec<f32> = t
                .flatten_all()
                .map_err(map_candle)?
                .to_vec1()
                .map_err(map_candle)?;
            Ok((name.clone(), data, t.dims().to_vec()))
        })
        .collect::<ClassifierResult<Vec<_>>>()?;

    let views: Vec<(String, TensorView<'_>)> = tensor_data
        .iter()
        .map(|(name, data, shape)| {
            let view = TensorView::new(Dtype::F32, shape.clone(), bytemuck::cast_slice(data))
                .map_err(|e| ClassifierError::SerializationError {
                    message: format!("TensorView for '{}' failed: {}", name, e),
                })?;
            Ok((name.clone(), view))
        })
        .collect::<ClassifierResult<Vec<_>>>()?;

    safetensors::tensor::serialize(views, &None::<HashMap<String, String>>).map_err(|e| {
        ClassifierError::SerializationError {
            message: format!("Failed to serialize model weights: {}", e),
        }
    })
}

fn read_safetensors(
    bytes: &[u8],
    path: &Path,
    device: &Device,
) -> ClassifierResult<HashMap<String, Tensor>> {
    let st = SafeTensors::deserialize(bytes).map_err(|e| ClassifierError::SerializationError {
        message: format!("Failed to parse {}: {}", path.display(), e),
    })?;

    let mut tensors = HashMap::new();
    for (name, view) in st.tensors() {
        if view.dtype() != Dtype::F32 {
            return Err(ClassifierError::SerializationError {
                message: format!("Tensor '{}' has dtype {:?}, expected F32", name, view.dtype()),
            });
        }
        // Copy out: the byte buffer carries no f32 alignment guarantee.
        let data: Vec<f32> = bytemuck::allocation::pod_collect_to_vec(view.data());
        let tensor = Tensor::from_vec(data, view.shape().to_vec(), device).map_err(map_candle)?;
        tensors.insert(name, tensor);
    }
    Ok(tensors)
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write via a uniquely named sibling file, then rename over `path`.
fn write_atomically(
    path: &Path,
    write: impl FnOnce(&Path) -> ClassifierResult<()>,
) -> ClassifierResult<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(
        ".{}.{}.{}.tmp",
        file_name,
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    if let Err(e) = write(&tmp) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        ClassifierError::IoError(e)
    })
}

fn map_json(e: serde_json::Error) -> ClassifierError {
    ClassifierError::SerializationError {
        message: e.to_string(),
    }
}

fn map_candle(e: candle_core::Error) -> ClassifierError {
    ClassifierError::TensorError {
        message: format!("Model storage error: {}", e),
    }
}
