use candle_core::{Module, ModuleT, Tensor, D};
use candle_nn::ops::softmax;
use candle_nn::{linear, linear_no_bias, Dropout, Linear, VarBuilder};
use snafu::{ensure, ResultExt, Snafu};

use crate::layers::attention::{
    head_width, AttentionHeadsError, AttentionOutput, CombineHeads, SplitHeads,
};

/// Configuration for query-key self-attention.
#[derive(Clone, Debug)]
pub struct QueryKeySelfAttentionConfig {
    dropout: f32,
    input_dim: usize,
    n_heads: usize,
    use_bias: bool,
}

impl QueryKeySelfAttentionConfig {
    /// Dropout applied to the attention weights.
    ///
    /// Default: `0.0`
    pub fn dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    /// Width of the column representations.
    ///
    /// Must be divisible by the number of heads.
    ///
    /// Default: `32`
    pub fn input_dim(mut self, input_dim: usize) -> Self {
        self.input_dim = input_dim;
        self
    }

    /// Number of attention heads.
    ///
    /// Default: `8`
    pub fn n_heads(mut self, n_heads: usize) -> Self {
        self.n_heads = n_heads;
        self
    }

    /// Use a bias in the query-key projection.
    ///
    /// Default: `false`
    pub fn use_bias(mut self, use_bias: bool) -> Self {
        self.use_bias = use_bias;
        self
    }

    /// Build a query-key self-attention layer.
    pub fn build(
        &self,
        vb: VarBuilder,
    ) -> Result<QueryKeySelfAttention, QueryKeySelfAttentionError> {
        let head_width = head_width(self.input_dim, self.n_heads).context(AttentionHeadsSnafu)?;
        ensure!(
            (0f32..1f32).contains(&self.dropout),
            InvalidDropoutSnafu { p: self.dropout }
        );

        let linear_ctor = if self.use_bias { linear } else { linear_no_bias };
        Ok(QueryKeySelfAttention {
            dropout: Dropout::new(self.dropout),
            head_width,
            n_heads: self.n_heads,
            qk_proj: linear_ctor(self.input_dim, 2 * self.input_dim, vb.push_prefix("qk_proj"))
                .context(ConstructionSnafu)?,
        })
    }
}

impl Default for QueryKeySelfAttentionConfig {
    fn default() -> Self {
        Self {
            dropout: 0.0,
            input_dim: 32,
            n_heads: 8,
            use_bias: false,
        }
    }
}

/// Errors for query-key self-attention.
#[derive(Debug, Snafu)]
pub enum QueryKeySelfAttentionError {
    #[snafu(display("Invalid attention heads"))]
    AttentionHeads { source: AttentionHeadsError },

    #[snafu(display("Cannot calculate attention scores"))]
    AttentionScores { source: candle_core::Error },

    #[snafu(display("Cannot weigh representations using attention weights"))]
    AttentionWeight { source: candle_core::Error },

    #[snafu(display("Cannot construct query-key self-attention layer"))]
    Construction { source: candle_core::Error },

    #[snafu(display("Dropout probability must be in [0, 1), was {p}"))]
    InvalidDropout { p: f32 },
}

/// Query-key self-attention.
///
/// Self-attention where the input itself is used as the values, so that
/// the output is a mixture of the input column representations. Only the
/// queries and keys are projected.
pub struct QueryKeySelfAttention {
    dropout: Dropout,
    head_width: usize,
    n_heads: usize,
    qk_proj: Linear,
}

impl QueryKeySelfAttention {
    /// Apply query-key self-attention.
    ///
    /// * `input` - Column representations.
    ///   *Shape:* `(batch_size, n_columns, width)`
    /// * `train` - Whether to train the layer.
    ///
    /// Returns the attention output with shape `(batch_size, n_columns,
    /// width)` and attention weights with shape `(batch_size, n_heads,
    /// n_columns, n_columns)`.
    pub fn forward_t(
        &self,
        input: &Tensor,
        train: bool,
    ) -> Result<AttentionOutput, QueryKeySelfAttentionError> {
        let qk = self.qk_proj.forward(input).context(AttentionScoresSnafu)?;
        let qk = qk.chunk(2, D::Minus1).context(AttentionScoresSnafu)?;

        let query = qk[0]
            .split_heads(self.n_heads)
            .context(AttentionHeadsSnafu)?;
        let key = qk[1]
            .split_heads(self.n_heads)
            .context(AttentionHeadsSnafu)?;
        let value = input
            .split_heads(self.n_heads)
            .context(AttentionHeadsSnafu)?;

        let attn_weights = key
            .transpose(3, 2)
            .and_then(|key| query.matmul(&key))
            .and_then(|scores| scores / (self.head_width as f64).sqrt())
            .and_then(|scores| softmax(&scores, D::Minus1))
            .context(AttentionScoresSnafu)?;

        let output = self
            .dropout
            .forward_t(&attn_weights, train)
            .and_then(|weights| weights.matmul(&value))
            .context(AttentionWeightSnafu)?
            .combine_heads()
            .context(AttentionHeadsSnafu)?;

        Ok(AttentionOutput::new(output, attn_weights))
    }
}
