use candle_core::ModuleT;
use candle_nn::{
    batch_norm, layer_norm, BatchNormConfig as CandleBatchNormConfig,
    LayerNormConfig as CandleLayerNormConfig, VarBuilder,
};
use serde::{Deserialize, Serialize};

use crate::error::BoxedError;
use crate::layers::build_module::BuildModule;

/// Batch norm configuration.
///
/// Batch normalization keeps running statistics of the mean and variance.
/// Batch statistics are used (and the running statistics updated) when
/// the module is applied with `train` set. Otherwise, the running
/// statistics are used.
#[derive(Clone, Debug)]
pub struct BatchNormConfig {
    pub eps: f64,
    pub size: usize,
}

impl BatchNormConfig {
    /// Epsilon value.
    ///
    /// Default: `1e-5`
    pub fn eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    /// Number of features.
    ///
    /// Default: `1`
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }
}

impl Default for BatchNormConfig {
    fn default() -> Self {
        Self { eps: 1e-5, size: 1 }
    }
}

impl BuildModule for BatchNormConfig {
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError> {
        Ok(Box::new(batch_norm(
            self.size,
            CandleBatchNormConfig {
                eps: self.eps,
                ..Default::default()
            },
            vb,
        )?))
    }
}

/// Layer norm configuration.
#[derive(Clone, Debug)]
pub struct LayerNormConfig {
    pub affine: bool,
    pub eps: f64,
    pub size: usize,
}

impl LayerNormConfig {
    /// Whether to use an affine transformation.
    ///
    /// Default: `true`
    pub fn affine(mut self, affine: bool) -> Self {
        self.affine = affine;
        self
    }

    /// Epsilon value.
    ///
    /// Default: `1e-5`
    pub fn eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    /// Dimensionality of the layer.
    ///
    /// Default: `32`
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }
}

impl Default for LayerNormConfig {
    fn default() -> Self {
        Self {
            affine: true,
            eps: 1e-5,
            size: 32,
        }
    }
}

impl BuildModule for LayerNormConfig {
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError> {
        Ok(Box::new(layer_norm(
            self.size,
            CandleLayerNormConfig {
                affine: self.affine,
                eps: self.eps,
                remove_mean: true,
            },
            vb,
        )?))
    }
}

/// Normalization of the continuous columns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContNormLayer {
    /// Batch normalization over the continuous columns.
    #[serde(alias = "batch_norm")]
    Batchnorm,

    /// Layer normalization over the continuous columns of each sample.
    #[serde(alias = "layer_norm")]
    Layernorm,
}

impl ContNormLayer {
    /// Get the configuration of the normalization for `n_cont` columns.
    pub fn config(&self, n_cont: usize) -> Box<dyn BuildModule> {
        match self {
            ContNormLayer::Batchnorm => Box::new(BatchNormConfig::default().size(n_cont)),
            ContNormLayer::Layernorm => Box::new(LayerNormConfig::default().size(n_cont)),
        }
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, ModuleT, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use snafu::{report, FromString, ResultExt, Whatever};

    use crate::layers::build_module::BuildModule;
    use crate::layers::normalization::{BatchNormConfig, ContNormLayer};

    #[test]
    #[report]
    fn batch_norm_normalizes_batch_in_training() -> Result<(), Whatever> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let norm = BatchNormConfig::default()
            .size(2)
            .build(vb)
            .map_err(|e| Whatever::with_source(e, "Cannot build batch norm".to_string()))?;
        let input = Tensor::new(&[[1f32, 10.], [3., 30.]], &Device::Cpu)
            .whatever_context("Cannot create input")?;
        let output: Vec<Vec<f32>> = norm
            .forward_t(&input, true)
            .and_then(|output| output.to_vec2())
            .whatever_context("Cannot apply batch norm")?;

        for feature in 0..2 {
            assert!((output[0][feature] + 1.).abs() < 1e-3);
            assert!((output[1][feature] - 1.).abs() < 1e-3);
        }

        Ok(())
    }

    #[test]
    fn cont_norm_layer_deserializes() {
        let norm: ContNormLayer = serde_json::from_str("\"layernorm\"").unwrap();
        assert_eq!(norm, ContNormLayer::Layernorm);
        let norm: ContNormLayer = serde_json::from_str("\"batch_norm\"").unwrap();
        assert_eq!(norm, ContNormLayer::Batchnorm);
    }
}
