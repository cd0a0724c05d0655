use candle_core::{Module, ModuleT, Tensor, D};
use candle_nn::ops::softmax;
use candle_nn::{linear, linear_no_bias, Dropout, Linear, VarBuilder};
use snafu::{ensure, ResultExt, Snafu};

use crate::layers::attention::AttentionOutput;

/// Configuration for context attention.
#[derive(Clone, Debug)]
pub struct ContextAttentionConfig {
    dropout: f32,
    input_dim: usize,
    sum_along_seq: bool,
}

impl ContextAttentionConfig {
    /// Dropout applied to the attention weights.
    ///
    /// Default: `0.0`
    pub fn dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    /// Width of the column representations.
    ///
    /// Default: `32`
    pub fn input_dim(mut self, input_dim: usize) -> Self {
        self.input_dim = input_dim;
        self
    }

    /// Sum the weighted representations over the columns.
    ///
    /// Default: `false`
    pub fn sum_along_seq(mut self, sum_along_seq: bool) -> Self {
        self.sum_along_seq = sum_along_seq;
        self
    }

    /// Build a context attention layer.
    pub fn build(&self, vb: VarBuilder) -> Result<ContextAttention, ContextAttentionError> {
        ensure!(
            (0f32..1f32).contains(&self.dropout),
            InvalidDropoutSnafu { p: self.dropout }
        );

        Ok(ContextAttention {
            context: linear_no_bias(self.input_dim, 1, vb.push_prefix("context"))
                .context(ConstructionSnafu)?,
            dropout: Dropout::new(self.dropout),
            inp_proj: linear(self.input_dim, self.input_dim, vb.push_prefix("inp_proj"))
                .context(ConstructionSnafu)?,
            sum_along_seq: self.sum_along_seq,
        })
    }
}

impl Default for ContextAttentionConfig {
    fn default() -> Self {
        Self {
            dropout: 0.0,
            input_dim: 32,
            sum_along_seq: false,
        }
    }
}

/// Errors for context attention.
#[derive(Debug, Snafu)]
pub enum ContextAttentionError {
    #[snafu(display("Cannot calculate attention weights"))]
    AttentionWeights { source: candle_core::Error },

    #[snafu(display("Cannot construct context attention layer"))]
    Construction { source: candle_core::Error },

    #[snafu(display("Dropout probability must be in [0, 1), was {p}"))]
    InvalidDropout { p: f32 },

    #[snafu(display("Cannot weigh representations"))]
    Weigh { source: candle_core::Error },
}

/// Context attention.
///
/// Scores every column against a single learned context vector and
/// weighs the column representations by the softmax of the scores.
///
/// See [Yang et al., 2016](https://www.cs.cmu.edu/~./hovy/papers/16HLT-hierarchical-attention-networks.pdf).
pub struct ContextAttention {
    context: Linear,
    dropout: Dropout,
    inp_proj: Linear,
    sum_along_seq: bool,
}

impl ContextAttention {
    /// Apply context attention.
    ///
    /// * `input` - Column representations.
    ///   *Shape:* `(batch_size, n_columns, width)`
    /// * `train` - Whether to train the layer.
    ///
    /// Returns the weighted representations with shape
    /// `(batch_size, n_columns, width)`, or `(batch_size, width)` when
    /// summing along the columns. The attention weights have shape
    /// `(batch_size, n_columns)`.
    pub fn forward_t(
        &self,
        input: &Tensor,
        train: bool,
    ) -> Result<AttentionOutput, ContextAttentionError> {
        let attn_weights = self
            .inp_proj
            .forward(input)
            .and_then(|scores| scores.tanh())
            .and_then(|scores| self.context.forward(&scores))
            .and_then(|scores| softmax(&scores, 1))
            .context(AttentionWeightsSnafu)?;

        let output = self
            .dropout
            .forward_t(&attn_weights, train)
            .and_then(|weights| weights.broadcast_mul(input))
            .and_then(|weighted| {
                if self.sum_along_seq {
                    weighted.sum(1)
                } else {
                    Ok(weighted)
                }
            })
            .context(WeighSnafu)?;

        let attn_weights = attn_weights
            .squeeze(D::Minus1)
            .context(AttentionWeightsSnafu)?;

        Ok(AttentionOutput::new(output, attn_weights))
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use ndarray::array;
    use rstest::rstest;
    use snafu::{ResultExt, Whatever};

    use crate::layers::attention::ContextAttentionConfig;
    use crate::util::tests::{assert_tensor_eq, PseudoRandom};

    #[rstest]
    #[case(false, &[2, 3, 4])]
    #[case(true, &[2, 4])]
    fn context_attention_has_correct_shapes(
        #[case] sum_along_seq: bool,
        #[case] output_shape: &[usize],
    ) -> Result<(), Whatever> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let attention = ContextAttentionConfig::default()
            .input_dim(4)
            .sum_along_seq(sum_along_seq)
            .build(vb)
            .whatever_context("Cannot build attention")?;
        let input = Tensor::pseudo_random(24, &Device::Cpu)
            .reshape((2, 3, 4))
            .whatever_context("Cannot create input")?;
        let output = attention
            .forward_t(&input, false)
            .whatever_context("Cannot apply attention")?;

        assert_eq!(output.output().dims(), output_shape);
        assert_eq!(output.attention_weights().dims(), &[2, 3]);

        // Weights are a distribution over the columns.
        let weight_sums = output
            .attention_weights()
            .sum(1)
            .whatever_context("Cannot sum weights")?;
        assert_tensor_eq!(weight_sums, array![1f32, 1f32], epsilon = 1e-5);

        Ok(())
    }

    #[test]
    fn context_attention_with_zero_weights_is_uniform() -> Result<(), Whatever> {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let attention = ContextAttentionConfig::default()
            .input_dim(2)
            .sum_along_seq(true)
            .build(vb)
            .whatever_context("Cannot build attention")?;
        let input = Tensor::new(&[[[1f32, 2.], [3., 4.]]], &Device::Cpu)
            .whatever_context("Cannot create input")?;
        let output = attention
            .forward_t(&input, false)
            .whatever_context("Cannot apply attention")?;
        assert_tensor_eq!(
            output.attention_weights(),
            array![[0.5f32, 0.5]],
            epsilon = 1e-6
        );
        assert_tensor_eq!(output.output(), array![[2f32, 3.]], epsilon = 1e-6);
        Ok(())
    }
}
