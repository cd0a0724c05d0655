//! Attention layers.
//!
//! All attention layers in this module work on column representations
//! with shape `(batch_size, n_columns, width)`.
use candle_core::Tensor;
use snafu::{ensure, ResultExt, Snafu};

mod context;
pub use context::{ContextAttention, ContextAttentionConfig, ContextAttentionError};

mod multi_head;
pub use multi_head::{MultiHeadedAttention, MultiHeadedAttentionConfig, MultiHeadedAttentionError};

mod query_key;
pub use query_key::{QueryKeySelfAttention, QueryKeySelfAttentionConfig, QueryKeySelfAttentionError};

/// Output of an attention layer.
pub struct AttentionOutput {
    output: Tensor,
    attention_weights: Tensor,
}

impl AttentionOutput {
    /// Create an attention output.
    pub fn new(output: Tensor, attention_weights: Tensor) -> Self {
        Self {
            output,
            attention_weights,
        }
    }

    /// Attention weights.
    ///
    /// The shape depends on the attention layer, see the documentation of
    /// the layer's `forward_t` method.
    pub fn attention_weights(&self) -> &Tensor {
        &self.attention_weights
    }

    /// Layer output.
    pub fn output(&self) -> &Tensor {
        &self.output
    }

    /// Split into the layer output and the attention weights.
    pub fn into_parts(self) -> (Tensor, Tensor) {
        (self.output, self.attention_weights)
    }
}

/// Attention head errors.
#[derive(Debug, Snafu)]
pub enum AttentionHeadsError {
    #[snafu(display("Cannot combine heads"))]
    CombineHeads { source: candle_core::Error },

    #[snafu(display("Width {width} must be divisible by the number of heads ({n_heads})"))]
    IndivisibleWidth { width: usize, n_heads: usize },

    #[snafu(display("Cannot split heads"))]
    SplitHeads { source: candle_core::Error },

    #[snafu(display("The number of attention heads must be larger than zero"))]
    ZeroHeads,
}

/// Get the width of each attention head.
///
/// Fails if `width` cannot be evenly divided over `n_heads`.
pub(crate) fn head_width(width: usize, n_heads: usize) -> Result<usize, AttentionHeadsError> {
    ensure!(n_heads > 0, ZeroHeadsSnafu);
    ensure!(
        width % n_heads == 0,
        IndivisibleWidthSnafu { width, n_heads }
    );
    Ok(width / n_heads)
}

pub(crate) trait CombineHeads {
    /// Combine heads into a single representation.
    ///
    /// `(batch_size, n_heads, seq_len, head_width)` becomes
    /// `(batch_size, seq_len, n_heads * head_width)`.
    fn combine_heads(&self) -> Result<Tensor, AttentionHeadsError>;
}

impl CombineHeads for Tensor {
    fn combine_heads(&self) -> Result<Tensor, AttentionHeadsError> {
        let (batch_size, n_heads, seq_len, head_width) =
            self.dims4().context(CombineHeadsSnafu)?;
        self.transpose(1, 2)
            .and_then(|heads| heads.reshape((batch_size, seq_len, n_heads * head_width)))
            .context(CombineHeadsSnafu)
    }
}

pub(crate) trait SplitHeads {
    /// Split a representation into heads.
    ///
    /// `(batch_size, seq_len, n_heads * head_width)` becomes
    /// `(batch_size, n_heads, seq_len, head_width)`.
    fn split_heads(&self, n_heads: usize) -> Result<Tensor, AttentionHeadsError>;
}

impl SplitHeads for Tensor {
    fn split_heads(&self, n_heads: usize) -> Result<Tensor, AttentionHeadsError> {
        let (batch_size, seq_len, width) = self.dims3().context(SplitHeadsSnafu)?;
        let head_width = head_width(width, n_heads)?;
        self.reshape((batch_size, seq_len, n_heads, head_width))
            .and_then(|heads| heads.transpose(1, 2))
            .and_then(|heads| heads.contiguous())
            .context(SplitHeadsSnafu)
    }
}
