//! Multi-layer perceptrons.
use candle_core::{ModuleT, Tensor};
use candle_nn::{linear, linear_no_bias, Dropout, VarBuilder};
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::activation::Activation;
use crate::layers::build_module::BuildModule;
use crate::layers::normalization::BatchNormConfig;

/// Multi-layer perceptron configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct MlpConfig {
    activation: Activation,
    batchnorm: bool,
    batchnorm_last: bool,
    dims: Vec<usize>,
    dropout: f32,
    linear_first: bool,
}

impl MlpConfig {
    /// Activation applied after each linear layer.
    ///
    /// Default: `Activation::Relu`
    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Apply batch normalization in the dense layers.
    ///
    /// Default: `false`
    pub fn batchnorm(mut self, batchnorm: bool) -> Self {
        self.batchnorm = batchnorm;
        self
    }

    /// Also apply batch normalization in the last dense layer.
    ///
    /// Only has an effect when `batchnorm` is enabled.
    ///
    /// Default: `false`
    pub fn batchnorm_last(mut self, batchnorm_last: bool) -> Self {
        self.batchnorm_last = batchnorm_last;
        self
    }

    /// Layer widths.
    ///
    /// The first element is the input width, every following element
    /// adds a dense layer with that output width.
    ///
    /// Default: `[]`
    pub fn dims(mut self, dims: Vec<usize>) -> Self {
        self.dims = dims;
        self
    }

    /// Dropout probability in the dense layers.
    ///
    /// Default: `0.1`
    pub fn dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    /// Order of the operations in a dense layer.
    ///
    /// If `true`: `linear -> activation -> batch norm -> dropout`.
    /// If `false`: `batch norm -> dropout -> linear -> activation`.
    ///
    /// Default: `false`
    pub fn linear_first(mut self, linear_first: bool) -> Self {
        self.linear_first = linear_first;
        self
    }

    /// Width of the perceptron output.
    pub fn output_dim(&self) -> Option<usize> {
        self.dims.last().copied()
    }

    /// Build a multi-layer perceptron.
    pub fn build(&self, vb: VarBuilder) -> Result<Mlp, MlpError> {
        ensure!(
            self.dims.len() >= 2,
            TooFewDimsSnafu {
                n_dims: self.dims.len()
            }
        );
        ensure!(
            !self.activation.is_glu(),
            GatedActivationSnafu {
                activation: self.activation
            }
        );
        ensure!(
            (0f32..1f32).contains(&self.dropout),
            InvalidDropoutSnafu { p: self.dropout }
        );

        let n_layers = self.dims.len() - 1;
        let layers = self
            .dims
            .windows(2)
            .enumerate()
            .map(|(idx, dims)| {
                let is_last = idx + 1 == n_layers;
                self.dense_layer(
                    vb.push_prefix(format!("dense_layer_{idx}")),
                    dims[0],
                    dims[1],
                    self.batchnorm && (!is_last || self.batchnorm_last),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Mlp { layers })
    }

    /// Build a dense layer.
    ///
    /// Parameters are named after the position of the operation in the
    /// layer, e.g. `dense_layer_0.0.weight` for a leading linear layer.
    fn dense_layer(
        &self,
        vb: VarBuilder,
        input_width: usize,
        output_width: usize,
        use_batchnorm: bool,
    ) -> Result<DenseLayer, MlpError> {
        let mut ops: Vec<Box<dyn ModuleT>> = Vec::with_capacity(4);

        if !self.linear_first {
            self.push_norm_dropout(&vb, &mut ops, input_width, use_batchnorm)?;
        }

        // The batch norm bias makes the linear bias redundant.
        let linear_ctor = if use_batchnorm { linear_no_bias } else { linear };
        let linear = linear_ctor(
            input_width,
            output_width,
            vb.push_prefix(ops.len().to_string()),
        )
        .context(ConstructionSnafu)?;
        ops.push(Box::new(linear));
        ops.push(Box::new(self.activation));

        if self.linear_first {
            self.push_norm_dropout(&vb, &mut ops, output_width, use_batchnorm)?;
        }

        Ok(DenseLayer { ops })
    }

    fn push_norm_dropout(
        &self,
        vb: &VarBuilder,
        ops: &mut Vec<Box<dyn ModuleT>>,
        width: usize,
        use_batchnorm: bool,
    ) -> Result<(), MlpError> {
        if use_batchnorm {
            ops.push(
                BatchNormConfig::default()
                    .size(width)
                    .build(vb.push_prefix(ops.len().to_string()))
                    .context(BuildBatchNormSnafu)?,
            );
        }
        if self.dropout > 0. {
            ops.push(Box::new(Dropout::new(self.dropout)));
        }
        Ok(())
    }
}

impl Default for MlpConfig {
    fn default() -> Self {
        Self {
            activation: Activation::Relu,
            batchnorm: false,
            batchnorm_last: false,
            dims: vec![],
            dropout: 0.1,
            linear_first: false,
        }
    }
}

/// Multi-layer perceptron errors.
#[derive(Debug, Snafu)]
pub enum MlpError {
    #[snafu(display("Cannot build batch normalization"))]
    BuildBatchNorm { source: BoxedError },

    #[snafu(display("Cannot construct dense layer"))]
    Construction { source: candle_core::Error },

    #[snafu(display(
        "Gated activation {activation:?} cannot be used in a multi-layer perceptron"
    ))]
    GatedActivation { activation: Activation },

    #[snafu(display("Dropout probability must be in [0, 1), was {p}"))]
    InvalidDropout { p: f32 },

    #[snafu(display(
        "Multi-layer perceptron needs at least an input and output width, got {n_dims} dims"
    ))]
    TooFewDims { n_dims: usize },
}

/// Dense layer: a sequence of linear transformation, activation, and
/// optionally batch normalization and dropout.
struct DenseLayer {
    ops: Vec<Box<dyn ModuleT>>,
}

impl ModuleT for DenseLayer {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor, candle_core::Error> {
        self.ops
            .iter()
            .try_fold(xs.clone(), |xs, op| op.forward_t(&xs, train))
    }
}

/// Multi-layer perceptron.
///
/// Stack of dense layers that is used as the head of the tabular models.
pub struct Mlp {
    layers: Vec<DenseLayer>,
}

impl ModuleT for Mlp {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor, candle_core::Error> {
        self.layers
            .iter()
            .try_fold(xs.clone(), |xs, layer| layer.forward_t(&xs, train))
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, ModuleT, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use rstest::rstest;
    use snafu::{ResultExt, Whatever};

    use crate::layers::activation::Activation;
    use crate::layers::mlp::{MlpConfig, MlpError};
    use crate::util::device::tests::test_devices;

    #[rstest]
    #[case(false, false, false)]
    #[case(true, false, false)]
    #[case(true, true, false)]
    #[case(true, true, true)]
    #[case(false, false, true)]
    fn mlp_has_declared_output_width(
        #[case] batchnorm: bool,
        #[case] batchnorm_last: bool,
        #[case] linear_first: bool,
    ) -> Result<(), Whatever> {
        for device in test_devices() {
            let vb = VarBuilder::zeros(DType::F32, &device);
            let config = MlpConfig::default()
                .dims(vec![6, 16, 8, 3])
                .batchnorm(batchnorm)
                .batchnorm_last(batchnorm_last)
                .linear_first(linear_first);
            let mlp = config.build(vb).whatever_context("Cannot build MLP")?;
            let input = Tensor::ones((4, 6), DType::F32, &device)
                .whatever_context("Cannot create input")?;
            for train in [false, true] {
                let output = mlp
                    .forward_t(&input, train)
                    .whatever_context("Cannot apply MLP")?;
                assert_eq!(output.dims(), &[4, config.output_dim().unwrap()]);
            }
        }
        Ok(())
    }

    #[test]
    fn mlp_names_parameters_by_position() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        MlpConfig::default()
            .dims(vec![4, 8, 2])
            .batchnorm(true)
            .build(vb)
            .unwrap();

        let data = varmap.data().lock().unwrap();
        // Batch norm precedes dropout and the linear layer.
        assert!(data.contains_key("dense_layer_0.0.weight"));
        assert!(data.contains_key("dense_layer_0.0.running_mean"));
        assert!(data.contains_key("dense_layer_0.2.weight"));
        assert!(!data.contains_key("dense_layer_0.2.bias"));
        // No batch norm in the last layer.
        assert!(data.contains_key("dense_layer_1.1.weight"));
        assert!(data.contains_key("dense_layer_1.1.bias"));
    }

    #[test]
    fn mlp_rejects_invalid_configurations() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        assert!(matches!(
            MlpConfig::default().dims(vec![4]).build(vb.clone()),
            Err(MlpError::TooFewDims { n_dims: 1 })
        ));
        assert!(matches!(
            MlpConfig::default()
                .dims(vec![4, 2])
                .activation(Activation::Geglu)
                .build(vb),
            Err(MlpError::GatedActivation { .. })
        ));
    }
}
