//! Transformer building blocks.
use candle_core::{ModuleT, Tensor};
use candle_nn::{Dropout, VarBuilder};
use snafu::{ensure, ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::activation::Activation;
use crate::layers::attention::{
    AttentionOutput, MultiHeadedAttention, MultiHeadedAttentionConfig, MultiHeadedAttentionError,
};
use crate::layers::build_module::BuildModule;
use crate::layers::feedforward::{FeedForward, FeedForwardConfig, FeedForwardError};
use crate::layers::normalization::LayerNormConfig;

/// Configuration of a transformer encoder layer.
#[derive(Clone, Debug)]
pub struct TransformerEncoderLayerConfig {
    activation: Activation,
    attn_dropout: f32,
    ff_dropout: f32,
    input_dim: usize,
    n_heads: usize,
    use_qkv_bias: bool,
}

impl TransformerEncoderLayerConfig {
    /// Activation of the feed-forward layer.
    ///
    /// Default: `Activation::Gelu`
    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Dropout of the attention weights and the attention residual.
    ///
    /// Default: `0.2`
    pub fn attn_dropout(mut self, attn_dropout: f32) -> Self {
        self.attn_dropout = attn_dropout;
        self
    }

    /// Dropout in the feed-forward layer and of its residual.
    ///
    /// Default: `0.1`
    pub fn ff_dropout(mut self, ff_dropout: f32) -> Self {
        self.ff_dropout = ff_dropout;
        self
    }

    /// Width of the column representations.
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

    /// Use biases in the attention projections.
    ///
    /// Default: `false`
    pub fn use_qkv_bias(mut self, use_qkv_bias: bool) -> Self {
        self.use_qkv_bias = use_qkv_bias;
        self
    }

    /// Build a transformer encoder layer.
    pub fn build(
        &self,
        vb: VarBuilder,
    ) -> Result<TransformerEncoderLayer, TransformerEncoderLayerError> {
        for p in [self.attn_dropout, self.ff_dropout] {
            ensure!((0f32..1f32).contains(&p), InvalidDropoutSnafu { p });
        }

        let attn = MultiHeadedAttentionConfig::default()
            .dropout(self.attn_dropout)
            .input_dim(self.input_dim)
            .n_heads(self.n_heads)
            .use_bias(self.use_qkv_bias)
            .build(vb.push_prefix("attn"))
            .context(BuildAttentionSnafu)?;

        let ff = FeedForwardConfig::default()
            .activation(self.activation)
            .dropout(self.ff_dropout)
            .input_dim(self.input_dim)
            .build(vb.push_prefix("ff"))
            .context(BuildFeedForwardSnafu)?;

        Ok(TransformerEncoderLayer {
            attn,
            attn_addnorm: AddNorm::new(
                vb.push_prefix("attn_addnorm"),
                self.input_dim,
                self.attn_dropout,
            )?,
            ff,
            ff_addnorm: AddNorm::new(vb.push_prefix("ff_addnorm"), self.input_dim, self.ff_dropout)?,
        })
    }
}

impl Default for TransformerEncoderLayerConfig {
    fn default() -> Self {
        Self {
            activation: Activation::Gelu,
            attn_dropout: 0.2,
            ff_dropout: 0.1,
            input_dim: 32,
            n_heads: 8,
            use_qkv_bias: false,
        }
    }
}

/// Errors for transformer encoder layers.
#[derive(Debug, Snafu)]
pub enum TransformerEncoderLayerError {
    #[snafu(display("Cannot build self-attention"))]
    BuildAttention { source: MultiHeadedAttentionError },

    #[snafu(display("Cannot build feed-forward layer"))]
    BuildFeedForward { source: FeedForwardError },

    #[snafu(display("Cannot build layer normalization"))]
    BuildLayerNorm { source: BoxedError },

    #[snafu(display("Cannot apply point-wise feed-forward layer"))]
    FeedForward { source: candle_core::Error },

    #[snafu(display("Dropout probability must be in [0, 1), was {p}"))]
    InvalidDropout { p: f32 },

    #[snafu(display("Cannot apply residual connection"))]
    Residual { source: candle_core::Error },

    #[snafu(display("Cannot apply self-attention"))]
    SelfAttention { source: MultiHeadedAttentionError },
}

/// Residual connection followed by layer normalization.
///
/// `layer_norm(x + dropout(sublayer_output))`
struct AddNorm {
    dropout: Dropout,
    ln: Box<dyn ModuleT>,
}

impl AddNorm {
    fn new(vb: VarBuilder, width: usize, dropout: f32) -> Result<Self, TransformerEncoderLayerError> {
        Ok(Self {
            dropout: Dropout::new(dropout),
            ln: LayerNormConfig::default()
                .size(width)
                .build(vb.push_prefix("ln"))
                .context(BuildLayerNormSnafu)?,
        })
    }

    fn forward_t(
        &self,
        input: &Tensor,
        sublayer_output: &Tensor,
        train: bool,
    ) -> Result<Tensor, candle_core::Error> {
        let residual = self.dropout.forward_t(sublayer_output, train)?;
        self.ln.forward_t(&(input + residual)?, train)
    }
}

/// Transformer encoder layer.
///
/// Post-norm encoder layer: multi-headed self-attention and a point-wise
/// feed-forward layer, each followed by a residual connection and layer
/// normalization.
///
/// See [Vaswani et al. (2017)](https://arxiv.org/abs/1706.03762).
pub struct TransformerEncoderLayer {
    attn: MultiHeadedAttention,
    attn_addnorm: AddNorm,
    ff: FeedForward,
    ff_addnorm: AddNorm,
}

impl TransformerEncoderLayer {
    /// Apply the encoder layer to column representations.
    ///
    /// * `input` - Column representations.
    ///   *Shape:* `(batch_size, n_columns, width)`
    /// * `train` - Whether to train the layer.
    ///
    /// Returns the layer output with the same shape as the input and the
    /// attention weights of the layer.
    /// *Shape:* `(batch_size, n_heads, n_columns, n_columns)`
    pub fn forward_t(
        &self,
        input: &Tensor,
        train: bool,
    ) -> Result<AttentionOutput, TransformerEncoderLayerError> {
        let (attn_out, attn_weights) = self
            .attn
            .forward_t(input, train)
            .context(SelfAttentionSnafu)?
            .into_parts();

        let residual = self
            .attn_addnorm
            .forward_t(input, &attn_out, train)
            .context(ResidualSnafu)?;

        let ff_out = self
            .ff
            .forward_t(&residual, train)
            .context(FeedForwardSnafu)?;

        let output = self
            .ff_addnorm
            .forward_t(&residual, &ff_out, train)
            .context(ResidualSnafu)?;

        Ok(AttentionOutput::new(output, attn_weights))
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use snafu::{report, ResultExt, Whatever};

    use crate::layers::activation::Activation;
    use crate::layers::transformer::{TransformerEncoderLayerConfig, TransformerEncoderLayerError};
    use crate::util::device::tests::test_devices;
    use crate::util::tests::PseudoRandom;

    #[test]
    #[report]
    fn encoder_layer_preserves_shape() -> Result<(), Whatever> {
        for device in test_devices() {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
            let layer = TransformerEncoderLayerConfig::default()
                .input_dim(16)
                .n_heads(4)
                .activation(Activation::Geglu)
                .build(vb)
                .whatever_context("Cannot build encoder layer")?;
            let input = Tensor::pseudo_random(2 * 5 * 16, &device)
                .reshape((2, 5, 16))
                .whatever_context("Cannot create input")?;

            for train in [false, true] {
                let output = layer
                    .forward_t(&input, train)
                    .whatever_context("Cannot apply encoder layer")?;
                assert_eq!(output.output().dims(), &[2, 5, 16]);
                assert_eq!(output.attention_weights().dims(), &[2, 4, 5, 5]);
            }

            let data = varmap.data().lock().unwrap();
            for name in [
                "attn.q_proj.weight",
                "attn.kv_proj.weight",
                "attn.out_proj.weight",
                "attn_addnorm.ln.weight",
                "ff.w_1.weight",
                "ff.w_2.bias",
                "ff_addnorm.ln.bias",
            ] {
                assert!(data.contains_key(name), "Missing parameter: {name}");
            }
        }

        Ok(())
    }

    #[test]
    #[report]
    fn encoder_layer_is_deterministic_in_eval() -> Result<(), Whatever> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer = TransformerEncoderLayerConfig::default()
            .input_dim(8)
            .n_heads(2)
            .build(vb)
            .whatever_context("Cannot build encoder layer")?;
        let input = Tensor::pseudo_random(3 * 8, &Device::Cpu)
            .reshape((1, 3, 8))
            .whatever_context("Cannot create input")?;

        let mut outputs = Vec::new();
        for _ in 0..2 {
            let output: Vec<Vec<Vec<f32>>> = layer
                .forward_t(&input, false)
                .whatever_context("Cannot apply encoder layer")?
                .output()
                .to_vec3()
                .whatever_context("Cannot convert output")?;
            outputs.push(output);
        }
        assert_eq!(outputs[0], outputs[1]);

        Ok(())
    }

    #[test]
    fn encoder_layer_rejects_indivisible_heads() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        assert!(matches!(
            TransformerEncoderLayerConfig::default()
                .input_dim(10)
                .n_heads(3)
                .build(vb),
            Err(TransformerEncoderLayerError::BuildAttention { .. })
        ));
    }
}
