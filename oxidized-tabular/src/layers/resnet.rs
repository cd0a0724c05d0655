//! Residual blocks for dense (tabular) inputs.
use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{linear, Dropout, Linear, VarBuilder};
use snafu::{ensure, ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::activation::Activation;
use crate::layers::build_module::BuildModule;
use crate::layers::normalization::BatchNormConfig;

/// Errors for residual blocks.
#[derive(Debug, Snafu)]
pub enum DenseResnetError {
    #[snafu(display("Cannot build batch normalization"))]
    BuildBatchNorm { source: BoxedError },

    #[snafu(display("Cannot construct residual block"))]
    Construction { source: candle_core::Error },

    #[snafu(display("Dropout probability must be in [0, 1), was {p}"))]
    InvalidDropout { p: f32 },

    #[snafu(display(
        "Block dimensions must contain at least two elements, e.g. [256, 128], got {n_dims}"
    ))]
    TooFewBlockDims { n_dims: usize },
}

/// Linear transformation followed by batch normalization.
struct LinearBatchNorm {
    linear: Linear,
    batch_norm: Box<dyn ModuleT>,
}

impl LinearBatchNorm {
    fn new(
        vb: VarBuilder,
        linear_name: &str,
        batch_norm_name: &str,
        input_width: usize,
        output_width: usize,
    ) -> Result<Self, DenseResnetError> {
        Ok(Self {
            linear: linear(input_width, output_width, vb.push_prefix(linear_name))
                .context(ConstructionSnafu)?,
            batch_norm: BatchNormConfig::default()
                .size(output_width)
                .build(vb.push_prefix(batch_norm_name))
                .context(BuildBatchNormSnafu)?,
        })
    }
}

impl ModuleT for LinearBatchNorm {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor, candle_core::Error> {
        self.batch_norm
            .forward_t(&self.linear.forward(xs)?, train)
    }
}

/// Residual block for dense inputs.
///
/// The block computes:
///
/// `leaky_relu(bn2(lin2(dropout(leaky_relu(bn1(lin1(x)))))) + shortcut(x))`
///
/// The shortcut is the identity when the input and output widths are the
/// same. Otherwise, the input is resized with a linear transformation
/// followed by batch normalization.
pub struct BasicBlock {
    first: LinearBatchNorm,
    second: LinearBatchNorm,
    dropout: Option<Dropout>,
    resize: Option<LinearBatchNorm>,
}

impl BasicBlock {
    /// Construct a residual block.
    ///
    /// * `vb` - Variable store.
    /// * `input_width` - Width of the block input.
    /// * `output_width` - Width of the block output.
    /// * `dropout` - Dropout probability after the first transformation.
    pub fn new(
        vb: VarBuilder,
        input_width: usize,
        output_width: usize,
        dropout: f32,
    ) -> Result<Self, DenseResnetError> {
        let resize = if input_width != output_width {
            Some(LinearBatchNorm::new(
                vb.push_prefix("resize"),
                "0",
                "1",
                input_width,
                output_width,
            )?)
        } else {
            None
        };

        Ok(Self {
            first: LinearBatchNorm::new(vb.clone(), "lin1", "bn1", input_width, output_width)?,
            second: LinearBatchNorm::new(vb, "lin2", "bn2", output_width, output_width)?,
            dropout: (dropout > 0.).then(|| Dropout::new(dropout)),
            resize,
        })
    }
}

impl ModuleT for BasicBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor, candle_core::Error> {
        let mut out = Activation::LeakyRelu.forward(&self.first.forward_t(xs, train)?)?;
        if let Some(dropout) = &self.dropout {
            out = dropout.forward_t(&out, train)?;
        }
        out = self.second.forward_t(&out, train)?;

        let identity = match &self.resize {
            Some(resize) => resize.forward_t(xs, train)?,
            None => xs.clone(),
        };

        Activation::LeakyRelu.forward(&(out + identity)?)
    }
}

/// Configuration of a stack of residual blocks.
#[derive(Clone, Debug)]
pub struct DenseResnetConfig {
    blocks_dims: Vec<usize>,
    dropout: f32,
    input_dim: usize,
}

impl DenseResnetConfig {
    /// Input and output widths of the blocks.
    ///
    /// For example, `[128, 64, 32]` results in two blocks. The first maps
    /// 128 inputs to 64 outputs, the second 64 inputs to 32 outputs.
    ///
    /// Default: `[]`
    pub fn blocks_dims(mut self, blocks_dims: Vec<usize>) -> Self {
        self.blocks_dims = blocks_dims;
        self
    }

    /// Dropout probability inside the blocks.
    ///
    /// Default: `0.0`
    pub fn dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    /// Width of the input.
    ///
    /// When the width differs from the first block dimension, the input
    /// is first mapped to that width.
    ///
    /// Default: `0`
    pub fn input_dim(mut self, input_dim: usize) -> Self {
        self.input_dim = input_dim;
        self
    }

    /// Build the residual blocks.
    pub fn build(&self, vb: VarBuilder) -> Result<DenseResnet, DenseResnetError> {
        ensure!(
            self.blocks_dims.len() >= 2,
            TooFewBlockDimsSnafu {
                n_dims: self.blocks_dims.len()
            }
        );
        ensure!(
            (0f32..1f32).contains(&self.dropout),
            InvalidDropoutSnafu { p: self.dropout }
        );

        let stem = if self.input_dim != self.blocks_dims[0] {
            Some(LinearBatchNorm::new(
                vb.clone(),
                "lin1",
                "bn1",
                self.input_dim,
                self.blocks_dims[0],
            )?)
        } else {
            None
        };

        let blocks = self
            .blocks_dims
            .windows(2)
            .enumerate()
            .map(|(idx, dims)| {
                BasicBlock::new(
                    vb.push_prefix(format!("block_{idx}")),
                    dims[0],
                    dims[1],
                    self.dropout,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(
            input_dim = self.input_dim,
            n_blocks = blocks.len(),
            with_stem = stem.is_some(),
            "Built dense residual blocks"
        );

        Ok(DenseResnet { blocks, stem })
    }
}

impl Default for DenseResnetConfig {
    fn default() -> Self {
        Self {
            blocks_dims: vec![],
            dropout: 0.0,
            input_dim: 0,
        }
    }
}

/// Stack of residual blocks for dense inputs.
pub struct DenseResnet {
    blocks: Vec<BasicBlock>,
    stem: Option<LinearBatchNorm>,
}

impl ModuleT for DenseResnet {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor, candle_core::Error> {
        let xs = match &self.stem {
            Some(stem) => stem.forward_t(xs, train)?,
            None => xs.clone(),
        };
        self.blocks
            .iter()
            .try_fold(xs, |xs, block| block.forward_t(&xs, train))
    }
}
