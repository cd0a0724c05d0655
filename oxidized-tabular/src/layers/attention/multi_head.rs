use candle_core::{Module, ModuleT, Tensor, D};
use candle_nn::ops::softmax;
use candle_nn::{linear, linear_no_bias, Dropout, Linear, VarBuilder};
use snafu::{ensure, ResultExt, Snafu};

use crate::layers::attention::{
    head_width, AttentionHeadsError, AttentionOutput, CombineHeads, SplitHeads,
};

/// Configuration for multi-headed self-attention.
#[derive(Clone, Debug)]
pub struct MultiHeadedAttentionConfig {
    dropout: f32,
    input_dim: usize,
    n_heads: usize,
    use_bias: bool,
}

impl MultiHeadedAttentionConfig {
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

    /// Use biases in the query, key, value, and output projections.
    ///
    /// Default: `false`
    pub fn use_bias(mut self, use_bias: bool) -> Self {
        self.use_bias = use_bias;
        self
    }

    /// Build a multi-headed self-attention layer.
    pub fn build(&self, vb: VarBuilder) -> Result<MultiHeadedAttention, MultiHeadedAttentionError> {
        let head_width = head_width(self.input_dim, self.n_heads).context(AttentionHeadsSnafu)?;
        ensure!(
            (0f32..1f32).contains(&self.dropout),
            InvalidDropoutSnafu { p: self.dropout }
        );

        let linear_ctor = if self.use_bias { linear } else { linear_no_bias };
        let width = self.input_dim;

        // With a single head, the attention output is already a mixture
        // of the values and no output projection is needed.
        let out_proj = if self.n_heads > 1 {
            Some(linear_ctor(width, width, vb.push_prefix("out_proj")).context(ConstructionSnafu)?)
        } else {
            None
        };

        Ok(MultiHeadedAttention {
            dropout: Dropout::new(self.dropout),
            head_width,
            kv_proj: linear_ctor(width, 2 * width, vb.push_prefix("kv_proj"))
                .context(ConstructionSnafu)?,
            n_heads: self.n_heads,
            out_proj,
            q_proj: linear_ctor(width, width, vb.push_prefix("q_proj")).context(ConstructionSnafu)?,
        })
    }
}

impl Default for MultiHeadedAttentionConfig {
    fn default() -> Self {
        Self {
            dropout: 0.0,
            input_dim: 32,
            n_heads: 8,
            use_bias: false,
        }
    }
}

/// Errors for multi-headed self-attention.
#[derive(Debug, Snafu)]
pub enum MultiHeadedAttentionError {
    #[snafu(display("Invalid attention heads"))]
    AttentionHeads { source: AttentionHeadsError },

    #[snafu(display("Cannot calculate attention scores"))]
    AttentionScores { source: candle_core::Error },

    #[snafu(display("Cannot weigh representations using attention weights"))]
    AttentionWeight { source: candle_core::Error },

    #[snafu(display("Cannot construct multi-headed attention layer"))]
    Construction { source: candle_core::Error },

    #[snafu(display("Dropout probability must be in [0, 1), was {p}"))]
    InvalidDropout { p: f32 },

    #[snafu(display("Cannot apply output projection"))]
    Output { source: candle_core::Error },

    #[snafu(display("Cannot calculate query, key, or value"))]
    Qkv { source: candle_core::Error },
}

/// Multi-headed self-attention.
///
/// See [Vaswani et al., 2017](https://arxiv.org/abs/1706.03762).
pub struct MultiHeadedAttention {
    dropout: Dropout,
    head_width: usize,
    kv_proj: Linear,
    n_heads: usize,
    out_proj: Option<Linear>,
    q_proj: Linear,
}

impl MultiHeadedAttention {
    /// Apply multi-headed self-attention.
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
    ) -> Result<AttentionOutput, MultiHeadedAttentionError> {
        let query = self
            .q_proj
            .forward(input)
            .context(QkvSnafu)?
            .split_heads(self.n_heads)
            .context(AttentionHeadsSnafu)?;
        let kv = self
            .kv_proj
            .forward(input)
            .and_then(|kv| kv.chunk(2, D::Minus1))
            .context(QkvSnafu)?;
        let key = kv[0]
            .split_heads(self.n_heads)
            .context(AttentionHeadsSnafu)?;
        let value = kv[1]
            .split_heads(self.n_heads)
            .context(AttentionHeadsSnafu)?;

        let attn_weights = key
            .transpose(3, 2)
            .and_then(|key| query.matmul(&key))
            .and_then(|scores| scores / (self.head_width as f64).sqrt())
            .and_then(|scores| softmax(&scores, D::Minus1))
            .context(AttentionScoresSnafu)?;

        let attn = self
            .dropout
            .forward_t(&attn_weights, train)
            .and_then(|weights| weights.matmul(&value))
            .context(AttentionWeightSnafu)?
            .combine_heads()
            .context(AttentionHeadsSnafu)?;

        let output = match &self.out_proj {
            Some(out_proj) => out_proj.forward(&attn).context(OutputSnafu)?,
            None => attn,
        };

        Ok(AttentionOutput::new(output, attn_weights))
    }
}
