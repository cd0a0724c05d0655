use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{linear, Dropout, Linear, VarBuilder};
use snafu::{ensure, ResultExt, Snafu};

use crate::layers::activation::Activation;

/// Configuration for the point-wise feed-forward layer.
#[derive(Clone, Debug)]
pub struct FeedForwardConfig {
    activation: Activation,
    dropout: f32,
    input_dim: usize,
    mult: usize,
}

impl FeedForwardConfig {
    /// Activation applied to the intermediate representation.
    ///
    /// Gated activations are supported, in that case the intermediate
    /// projection is twice as wide.
    ///
    /// Default: `Activation::Gelu`
    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Dropout applied to the activations.
    ///
    /// Default: `0.0`
    pub fn dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    /// Input and output width.
    ///
    /// Default: `32`
    pub fn input_dim(mut self, input_dim: usize) -> Self {
        self.input_dim = input_dim;
        self
    }

    /// Ratio of the intermediate width to the input width.
    ///
    /// Default: `4`
    pub fn mult(mut self, mult: usize) -> Self {
        self.mult = mult;
        self
    }

    /// Build a point-wise feed-forward layer.
    pub fn build(&self, vb: VarBuilder) -> Result<FeedForward, FeedForwardError> {
        ensure!(
            (0f32..1f32).contains(&self.dropout),
            InvalidDropoutSnafu { p: self.dropout }
        );

        let intermediate_width = self.input_dim * self.mult;
        let w_1_width = if self.activation.is_glu() {
            2 * intermediate_width
        } else {
            intermediate_width
        };

        Ok(FeedForward {
            activation: self.activation,
            dropout: Dropout::new(self.dropout),
            w_1: linear(self.input_dim, w_1_width, vb.push_prefix("w_1"))
                .context(ConstructionSnafu)?,
            w_2: linear(intermediate_width, self.input_dim, vb.push_prefix("w_2"))
                .context(ConstructionSnafu)?,
        })
    }
}

impl Default for FeedForwardConfig {
    fn default() -> Self {
        Self {
            activation: Activation::Gelu,
            dropout: 0.0,
            input_dim: 32,
            mult: 4,
        }
    }
}

/// Feed-forward layer errors.
#[derive(Debug, Snafu)]
pub enum FeedForwardError {
    #[snafu(display("Cannot construct feed-forward layer"))]
    Construction { source: candle_core::Error },

    #[snafu(display("Dropout probability must be in [0, 1), was {p}"))]
    InvalidDropout { p: f32 },
}

/// Point-wise feed-forward layer (_Vaswani et al., 2017_).
///
/// The same transformation is applied to each column representation:
///
/// `w_2(dropout(g(w_1(x))))`
///
/// When `g` is a gated linear unit (_Shazeer, 2020_), `w_1` produces both
/// the values and the gates, so it is twice as wide as `w_2`'s input.
///
/// * _Vaswani et al., 2017_: https://arxiv.org/abs/1706.03762
/// * _Shazeer, 2020_: https://arxiv.org/abs/2002.05202
pub struct FeedForward {
    activation: Activation,
    dropout: Dropout,
    w_1: Linear,
    w_2: Linear,
}

impl ModuleT for FeedForward {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor, candle_core::Error> {
        let hidden = self.activation.forward(&self.w_1.forward(xs)?)?;
        let hidden = self.dropout.forward_t(&hidden, train)?;
        self.w_2.forward(&hidden)
    }
}
