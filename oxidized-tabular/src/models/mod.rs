//! Tabular models.
//!
//! A tabular model maps a `(batch_size, n_columns)` input to a
//! `(batch_size, output_dim)` representation.
use candle_core::Tensor;
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};

use crate::error::BoxedError;

pub mod checkpoint;

mod tab_resnet;
pub use tab_resnet::{TabResnet, TabResnetConfig, TabResnetError};

mod tab_transformer;
pub use tab_transformer::{
    TabTransformer, TabTransformerConfig, TabTransformerError, TabTransformerOutput,
};

/// Trait for tabular models.
pub trait TabularModel {
    /// Apply the model to the input.
    ///
    /// * `input` - Model input, categorical columns hold category indices.
    ///   *Shape:* `(batch_size, n_columns)`
    /// * `train` - Whether to train the model.
    ///
    /// Returns the model output.
    /// *Shape:* `(batch_size, output_dim)`
    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor, BoxedError>;

    /// Width of the model output.
    fn output_dim(&self) -> usize;
}

/// Build a tabular model.
pub trait BuildTabularModel {
    /// Build a model.
    fn build_model(&self, vb: VarBuilder) -> Result<Box<dyn TabularModel>, BoxedError>;
}

/// Configuration of any of the tabular models.
///
/// The model is selected using the `model_type` field, e.g.:
///
/// ```json
/// {"model_type": "tab_resnet", "blocks_dims": [16, 8], ...}
/// ```
#[derive(Clone, Debug, Deserialize, Serialize)]
#[non_exhaustive]
#[serde(tag = "model_type", rename_all = "snake_case")]
pub enum TabularModelConfig {
    TabResnet(TabResnetConfig),
    TabTransformer(TabTransformerConfig),
}

impl BuildTabularModel for TabularModelConfig {
    fn build_model(&self, vb: VarBuilder) -> Result<Box<dyn TabularModel>, BoxedError> {
        match self {
            TabularModelConfig::TabResnet(config) => config.build_model(vb),
            TabularModelConfig::TabTransformer(config) => config.build_model(vb),
        }
    }
}

impl From<TabResnetConfig> for TabularModelConfig {
    fn from(config: TabResnetConfig) -> Self {
        TabularModelConfig::TabResnet(config)
    }
}

impl From<TabTransformerConfig> for TabularModelConfig {
    fn from(config: TabTransformerConfig) -> Self {
        TabularModelConfig::TabTransformer(config)
    }
}
