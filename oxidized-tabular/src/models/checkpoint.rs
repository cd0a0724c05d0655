//! Loading of trained tabular models.
//!
//! A model directory contains `config.json` with the model configuration
//! and the parameters in one of the following forms:
//!
//! * `model.safetensors.index.json` with shards listed in its `weight_map`;
//! * `model.safetensors`;
//! * `model.pt`, a PyTorch state dict.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::File;
use std::io;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use candle_core::pickle::{read_pth_tensor_info, PthTensors};
use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device, Shape, Tensor};
use candle_nn::var_builder::SimpleBackend;
use candle_nn::{Init, VarBuilder};
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};

use crate::error::BoxedError;
use crate::models::{BuildTabularModel, TabularModel, TabularModelConfig};

static CONFIG: &str = "config.json";
static PYTORCH_SINGLE: &str = "model.pt";
static SAFETENSORS_INDEX: &str = "model.safetensors.index.json";
static SAFETENSORS_SINGLE: &str = "model.safetensors";

/// Checkpoint loading errors.
#[derive(Debug, Snafu)]
pub enum CheckpointError {
    #[snafu(display("Cannot build model"))]
    BuildModel { source: BoxedError },

    #[snafu(display("Cannot open or load checkpoint"))]
    LoadCheckpoint { source: candle_core::Error },

    #[snafu(display("Checkpoint does not exist in: {}", path.to_string_lossy()))]
    NonExistentCheckpoint { path: PathBuf },

    #[snafu(display("Model configuration does not exist: {}", path.to_string_lossy()))]
    NonExistentConfig { path: PathBuf },

    #[snafu(display("Shard does not exist: {}", path.to_string_lossy()))]
    NonExistentShard { path: PathBuf },

    #[snafu(display("Cannot open file: {}", path.to_string_lossy()))]
    Open { source: io::Error, path: PathBuf },

    #[snafu(display("Cannot parse index file: {}", path.to_string_lossy()))]
    ParseCheckpointIndex {
        source: serde_json::Error,
        path: PathBuf,
    },

    #[snafu(display("Cannot parse model configuration: {}", path.to_string_lossy()))]
    ParseConfig {
        source: serde_json::Error,
        path: PathBuf,
    },
}

/// Parameter data type.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "lowercase")]
pub enum ParameterDType {
    BFloat16,
    Float16,
    #[default]
    Float32,
}

impl From<ParameterDType> for DType {
    fn from(dtype: ParameterDType) -> Self {
        match dtype {
            ParameterDType::BFloat16 => DType::BF16,
            ParameterDType::Float16 => DType::F16,
            ParameterDType::Float32 => DType::F32,
        }
    }
}

/// Model configuration with the data type of the parameters.
///
/// This is the format of `config.json`, e.g.:
///
/// ```json
/// {"model_type": "tab_resnet", "dtype": "float32", "blocks_dims": [16, 8], ...}
/// ```
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CheckpointConfig {
    #[serde(flatten)]
    config: TabularModelConfig,

    #[serde(default)]
    dtype: ParameterDType,
}

impl CheckpointConfig {
    /// Create a checkpoint configuration.
    pub fn new(config: impl Into<TabularModelConfig>, dtype: ParameterDType) -> Self {
        CheckpointConfig {
            config: config.into(),
            dtype,
        }
    }

    /// Read the configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let path = path.as_ref();
        ensure!(
            path.exists(),
            NonExistentConfigSnafu {
                path: path.to_path_buf()
            }
        );
        let reader =
            BufReader::new(File::open(path).context(OpenSnafu { path: path.to_path_buf() })?);
        serde_json::from_reader(reader).context(ParseConfigSnafu {
            path: path.to_path_buf(),
        })
    }

    /// Get the model configuration.
    pub fn config(&self) -> &TabularModelConfig {
        &self.config
    }

    /// Get the parameter data type.
    pub fn dtype(&self) -> DType {
        self.dtype.into()
    }
}

/// Load a tabular model from a directory.
///
/// * `path` - Directory with the model configuration and parameters.
/// * `device` - Device to place the model on.
pub fn load_tabular_model(
    path: impl AsRef<Path>,
    device: &Device,
) -> Result<Box<dyn TabularModel>, CheckpointError> {
    let path = path.as_ref();
    let config = CheckpointConfig::from_file(path.join(CONFIG))?;
    let backend = load_checkpoint(path)?;

    tracing::debug!(
        path = %path.to_string_lossy(),
        dtype = ?config.dtype(),
        "Loading tabular model"
    );

    let vb = VarBuilder::from_backend(backend, config.dtype(), device.clone());
    config.config().build_model(vb).context(BuildModelSnafu)
}

/// Load the parameters of a model directory.
///
/// Safetensors checkpoints take precedence over PyTorch checkpoints. A
/// shard index takes precedence over a single-file safetensors checkpoint.
pub fn load_checkpoint(path: impl AsRef<Path>) -> Result<Box<dyn SimpleBackend>, CheckpointError> {
    let path = path.as_ref();

    if path.join(SAFETENSORS_INDEX).exists() {
        let shards = Checkpoint::Multiple(path.join(SAFETENSORS_INDEX)).paths()?;
        tracing::trace!(n_shards = shards.len(), "Loading sharded safetensors checkpoint");
        Ok(Box::new(unsafe {
            MmapedSafetensors::multi(&shards).context(LoadCheckpointSnafu)?
        }))
    } else if path.join(SAFETENSORS_SINGLE).exists() {
        let paths = Checkpoint::Single(path.join(SAFETENSORS_SINGLE)).paths()?;
        Ok(Box::new(unsafe {
            MmapedSafetensors::multi(&paths).context(LoadCheckpointSnafu)?
        }))
    } else if path.join(PYTORCH_SINGLE).exists() {
        Ok(Box::new(
            PyTorchTensors::new(path.join(PYTORCH_SINGLE)).context(LoadCheckpointSnafu)?,
        ))
    } else {
        NonExistentCheckpointSnafu {
            path: path.to_path_buf(),
        }
        .fail()
    }
}

/// Parameters of a PyTorch state dict.
struct PyTorchTensors {
    names: HashSet<String>,
    tensors: PthTensors,
}

impl PyTorchTensors {
    fn new(path: impl AsRef<Path>) -> Result<Self, candle_core::Error> {
        let path = path.as_ref();

        // PthTensors does not expose the tensor names.
        let names = read_pth_tensor_info(path, false, None)?
            .into_iter()
            .map(|info| info.name)
            .collect();
        let tensors = PthTensors::new(path, None)?;

        Ok(Self { names, tensors })
    }

    fn get(&self, name: &str) -> Result<Tensor, candle_core::Error> {
        self.tensors
            .get(name)?
            .ok_or_else(|| candle_core::Error::CannotFindTensor {
                path: name.to_string(),
            })
    }
}

impl SimpleBackend for PyTorchTensors {
    fn get(
        &self,
        s: Shape,
        name: &str,
        _: Init,
        dtype: DType,
        dev: &Device,
    ) -> Result<Tensor, candle_core::Error> {
        let tensor = PyTorchTensors::get(self, name)?
            .to_device(dev)?
            .to_dtype(dtype)?;
        if tensor.shape() != &s {
            Err(candle_core::Error::UnexpectedShape {
                msg: format!("shape mismatch for {name}"),
                expected: s,
                got: tensor.shape().clone(),
            })?
        }
        Ok(tensor)
    }

    fn get_unchecked(
        &self,
        name: &str,
        dtype: DType,
        dev: &Device,
    ) -> Result<Tensor, candle_core::Error> {
        PyTorchTensors::get(self, name)?
            .to_device(dev)?
            .to_dtype(dtype)
    }

    fn contains_tensor(&self, name: &str) -> bool {
        self.names.contains(name)
    }
}

enum Checkpoint {
    Single(PathBuf),
    Multiple(PathBuf),
}

impl Checkpoint {
    fn paths(&self) -> Result<Vec<PathBuf>, CheckpointError> {
        match self {
            Checkpoint::Single(path) => Ok(vec![path.clone()]),
            Checkpoint::Multiple(index_path) => {
                let index_file = BufReader::new(File::open(index_path).context(OpenSnafu {
                    path: index_path.clone(),
                })?);
                let index: CheckpointIndex = serde_json::from_reader(index_file)
                    .context(ParseCheckpointIndexSnafu {
                        path: index_path.clone(),
                    })?;

                let dir = index_path.parent().unwrap_or_else(|| Path::new(""));
                index
                    .shards()
                    .into_iter()
                    .map(|shard_name| {
                        let path = dir.join(shard_name);
                        ensure!(path.exists(), NonExistentShardSnafu { path });
                        Ok(path)
                    })
                    .collect()
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct CheckpointIndex {
    weight_map: HashMap<String, String>,
}

impl CheckpointIndex {
    /// Get the names of the shards.
    fn shards(&self) -> BTreeSet<&str> {
        self.weight_map.values().map(String::as_str).collect()
    }
}
