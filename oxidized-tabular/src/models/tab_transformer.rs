use candle_core::{IndexOp, ModuleT, Tensor};
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt, Snafu};

use crate::columns::ColumnIndex;
use crate::error::BoxedError;
use crate::layers::activation::Activation;
use crate::layers::embeddings::{
    CatAndContEmbeddings, CatAndContEmbeddingsConfig, CatAndContEmbeddingsError,
    ContEmbeddingsConfig, SameSizeCatEmbeddingsConfig,
};
use crate::layers::mlp::{Mlp, MlpConfig, MlpError};
use crate::layers::normalization::ContNormLayer;
use crate::layers::transformer::{
    TransformerEncoderLayer, TransformerEncoderLayerConfig, TransformerEncoderLayerError,
};
use crate::models::{BuildTabularModel, TabularModel};

/// Name of the column that holds the classification token.
pub const CLS_TOKEN: &str = "cls_token";

/// Tabular transformer configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct TabTransformerConfig {
    add_shared_embed: bool,
    attn_dropout: f32,
    cat_embed_activation: Option<Activation>,
    cat_embed_dropout: f32,
    cat_embed_input: Option<Vec<(String, usize)>>,
    column_idx: ColumnIndex,
    cont_embed_activation: Option<Activation>,
    cont_embed_dropout: f32,
    cont_norm_layer: Option<ContNormLayer>,
    continuous_cols: Option<Vec<String>>,
    embed_continuous: bool,
    ff_dropout: f32,
    frac_shared_embed: f32,
    full_embed_dropout: bool,
    input_dim: usize,
    mlp_activation: Activation,
    mlp_batchnorm: bool,
    mlp_batchnorm_last: bool,
    mlp_dropout: f32,
    mlp_hidden_dims: Option<Vec<usize>>,
    mlp_linear_first: bool,
    n_blocks: usize,
    n_heads: usize,
    shared_embed: bool,
    transformer_activation: Activation,
    use_cat_bias: bool,
    use_cont_bias: bool,
    use_qkv_bias: bool,
}

impl TabTransformerConfig {
    /// Add the shared embedding to the column embeddings instead of
    /// replacing their leading components.
    ///
    /// Default: `false`
    pub fn add_shared_embed(mut self, add_shared_embed: bool) -> Self {
        self.add_shared_embed = add_shared_embed;
        self
    }

    /// Dropout of the attention weights.
    ///
    /// Default: `0.2`
    pub fn attn_dropout(mut self, attn_dropout: f32) -> Self {
        self.attn_dropout = attn_dropout;
        self
    }

    /// Activation applied to the categorical embeddings.
    ///
    /// Default: `None`
    pub fn cat_embed_activation(mut self, cat_embed_activation: Option<Activation>) -> Self {
        self.cat_embed_activation = cat_embed_activation;
        self
    }

    /// Dropout of the categorical embeddings.
    ///
    /// Default: `0.1`
    pub fn cat_embed_dropout(mut self, cat_embed_dropout: f32) -> Self {
        self.cat_embed_dropout = cat_embed_dropout;
        self
    }

    /// Categorical columns as `(column, n_unique)`.
    ///
    /// Default: `None`
    pub fn cat_embed_input(mut self, cat_embed_input: Option<Vec<(String, usize)>>) -> Self {
        self.cat_embed_input = cat_embed_input;
        self
    }

    /// Positions of the columns in the model input.
    ///
    /// The model uses a classification token when the index contains a
    /// `cls_token` column.
    ///
    /// Default: empty
    pub fn column_idx(mut self, column_idx: ColumnIndex) -> Self {
        self.column_idx = column_idx;
        self
    }

    /// Activation applied to the continuous embeddings.
    ///
    /// Default: `None`
    pub fn cont_embed_activation(mut self, cont_embed_activation: Option<Activation>) -> Self {
        self.cont_embed_activation = cont_embed_activation;
        self
    }

    /// Dropout of the continuous embeddings.
    ///
    /// Default: `0.1`
    pub fn cont_embed_dropout(mut self, cont_embed_dropout: f32) -> Self {
        self.cont_embed_dropout = cont_embed_dropout;
        self
    }

    /// Normalization of the continuous columns.
    ///
    /// Default: `None`
    pub fn cont_norm_layer(mut self, cont_norm_layer: Option<ContNormLayer>) -> Self {
        self.cont_norm_layer = cont_norm_layer;
        self
    }

    /// Continuous columns.
    ///
    /// Default: `None`
    pub fn continuous_cols(mut self, continuous_cols: Option<Vec<String>>) -> Self {
        self.continuous_cols = continuous_cols;
        self
    }

    /// Embed the continuous columns and pass them through the attention
    /// blocks together with the categorical columns.
    ///
    /// Default: `false`
    pub fn embed_continuous(mut self, embed_continuous: bool) -> Self {
        self.embed_continuous = embed_continuous;
        self
    }

    /// Dropout of the feed-forward layers.
    ///
    /// Default: `0.1`
    pub fn ff_dropout(mut self, ff_dropout: f32) -> Self {
        self.ff_dropout = ff_dropout;
        self
    }

    /// Fraction of the embedding width used by the shared embedding.
    ///
    /// Default: `0.25`
    pub fn frac_shared_embed(mut self, frac_shared_embed: f32) -> Self {
        self.frac_shared_embed = frac_shared_embed;
        self
    }

    /// Drop out complete embeddings rather than single components.
    ///
    /// Default: `false`
    pub fn full_embed_dropout(mut self, full_embed_dropout: bool) -> Self {
        self.full_embed_dropout = full_embed_dropout;
        self
    }

    /// Width of the column embeddings.
    ///
    /// Default: `32`
    pub fn input_dim(mut self, input_dim: usize) -> Self {
        self.input_dim = input_dim;
        self
    }

    /// Activation of the MLP head.
    ///
    /// Default: `Activation::Relu`
    pub fn mlp_activation(mut self, mlp_activation: Activation) -> Self {
        self.mlp_activation = mlp_activation;
        self
    }

    /// Batch normalization in the MLP head.
    ///
    /// Default: `false`
    pub fn mlp_batchnorm(mut self, mlp_batchnorm: bool) -> Self {
        self.mlp_batchnorm = mlp_batchnorm;
        self
    }

    /// Batch normalization in the last layer of the MLP head.
    ///
    /// Default: `false`
    pub fn mlp_batchnorm_last(mut self, mlp_batchnorm_last: bool) -> Self {
        self.mlp_batchnorm_last = mlp_batchnorm_last;
        self
    }

    /// Dropout in the MLP head.
    ///
    /// Default: `0.1`
    pub fn mlp_dropout(mut self, mlp_dropout: f32) -> Self {
        self.mlp_dropout = mlp_dropout;
        self
    }

    /// Hidden widths of the MLP head.
    ///
    /// When `None` or empty, the hidden widths are four and two times the width
    /// of the attention output.
    ///
    /// Default: `None`
    pub fn mlp_hidden_dims(mut self, mlp_hidden_dims: Option<Vec<usize>>) -> Self {
        self.mlp_hidden_dims = mlp_hidden_dims;
        self
    }

    /// Apply the linear layer first in the dense layers of the MLP head.
    ///
    /// Default: `true`
    pub fn mlp_linear_first(mut self, mlp_linear_first: bool) -> Self {
        self.mlp_linear_first = mlp_linear_first;
        self
    }

    /// Number of transformer encoder layers.
    ///
    /// Default: `4`
    pub fn n_blocks(mut self, n_blocks: usize) -> Self {
        self.n_blocks = n_blocks;
        self
    }

    /// Number of attention heads.
    ///
    /// Default: `8`
    pub fn n_heads(mut self, n_heads: usize) -> Self {
        self.n_heads = n_heads;
        self
    }

    /// Share part of the embedding between the categories of a column.
    ///
    /// Default: `false`
    pub fn shared_embed(mut self, shared_embed: bool) -> Self {
        self.shared_embed = shared_embed;
        self
    }

    /// Activation of the feed-forward layers.
    ///
    /// Default: `Activation::Gelu`
    pub fn transformer_activation(mut self, transformer_activation: Activation) -> Self {
        self.transformer_activation = transformer_activation;
        self
    }

    /// Add a bias per categorical column.
    ///
    /// Default: `false`
    pub fn use_cat_bias(mut self, use_cat_bias: bool) -> Self {
        self.use_cat_bias = use_cat_bias;
        self
    }

    /// Add a bias per continuous column.
    ///
    /// Default: `true`
    pub fn use_cont_bias(mut self, use_cont_bias: bool) -> Self {
        self.use_cont_bias = use_cont_bias;
        self
    }

    /// Use biases in the query, key and value projections.
    ///
    /// Default: `false`
    pub fn use_qkv_bias(mut self, use_qkv_bias: bool) -> Self {
        self.use_qkv_bias = use_qkv_bias;
        self
    }

    /// Build the model.
    pub fn build(&self, vb: VarBuilder) -> Result<TabTransformer, TabTransformerError> {
        let cat_embed_input = self.cat_embed_input.clone().unwrap_or_default();
        let continuous_cols = self.continuous_cols.clone().unwrap_or_default();
        let n_cat = cat_embed_input.len();
        let n_cont = continuous_cols.len();

        ensure!(n_cat + n_cont > 0, NoColumnsSnafu);
        ensure!(
            n_cat > 0 || self.embed_continuous,
            ContinuousNotEmbeddedSnafu
        );

        let with_cls_token = self.column_idx.contains(CLS_TOKEN);

        let cat_and_cont_embed = CatAndContEmbeddingsConfig::default()
            .cat_embed(
                SameSizeCatEmbeddingsConfig::default()
                    .add_shared_embed(self.add_shared_embed)
                    .dropout(self.cat_embed_dropout)
                    .embed_input(cat_embed_input)
                    .embedding_width(self.input_dim)
                    .frac_shared_embed(self.frac_shared_embed)
                    .full_embed_dropout(self.full_embed_dropout)
                    .shared_embed(self.shared_embed)
                    .use_bias(self.use_cat_bias),
            )
            .cat_embed_activation(self.cat_embed_activation)
            .cont_embed(
                ContEmbeddingsConfig::default()
                    .dropout(self.cont_embed_dropout)
                    .embedding_width(self.input_dim)
                    .use_bias(self.use_cont_bias),
            )
            .cont_embed_activation(self.cont_embed_activation)
            .cont_norm_layer(self.cont_norm_layer)
            .continuous_cols(continuous_cols)
            .embed_continuous(self.embed_continuous)
            .build(vb.push_prefix("cat_and_cont_embed"), &self.column_idx)
            .context(BuildEmbeddingsSnafu)?;

        let layer_config = TransformerEncoderLayerConfig::default()
            .activation(self.transformer_activation)
            .attn_dropout(self.attn_dropout)
            .ff_dropout(self.ff_dropout)
            .input_dim(self.input_dim)
            .n_heads(self.n_heads)
            .use_qkv_bias(self.use_qkv_bias);
        let transformer_blks = (0..self.n_blocks)
            .map(|n| {
                layer_config
                    .build(vb.push_prefix(format!("transformer_blks.transformer_block{n}")))
                    .context(BuildBlockSnafu { n })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let attn_output_dim = self.attention_output_dim(n_cat, n_cont, with_cls_token);
        let mlp_dims = match &self.mlp_hidden_dims {
            Some(mlp_hidden_dims) if !mlp_hidden_dims.is_empty() => {
                std::iter::once(attn_output_dim)
                    .chain(mlp_hidden_dims.iter().copied())
                    .collect()
            }
            _ => vec![attn_output_dim, 4 * attn_output_dim, 2 * attn_output_dim],
        };
        let mlp_config = MlpConfig::default()
            .activation(self.mlp_activation)
            .batchnorm(self.mlp_batchnorm)
            .batchnorm_last(self.mlp_batchnorm_last)
            .dims(mlp_dims)
            .dropout(self.mlp_dropout)
            .linear_first(self.mlp_linear_first);
        let output_dim = mlp_config.output_dim().unwrap_or(attn_output_dim);
        let transformer_mlp = mlp_config
            .build(vb.push_prefix("transformer_mlp.mlp"))
            .context(BuildMlpSnafu)?;

        tracing::debug!(
            n_cat,
            n_cont,
            with_cls_token,
            embed_continuous = self.embed_continuous,
            attn_output_dim,
            output_dim,
            "Built tabular transformer"
        );

        Ok(TabTransformer {
            cat_and_cont_embed,
            embed_continuous: self.embed_continuous,
            output_dim,
            transformer_blks,
            transformer_mlp,
            with_cls_token,
        })
    }

    fn attention_output_dim(&self, n_cat: usize, n_cont: usize, with_cls_token: bool) -> usize {
        match (with_cls_token, self.embed_continuous) {
            (true, true) => self.input_dim,
            (true, false) => self.input_dim + n_cont,
            (false, true) => (n_cat + n_cont) * self.input_dim,
            (false, false) => n_cat * self.input_dim + n_cont,
        }
    }
}

impl Default for TabTransformerConfig {
    fn default() -> Self {
        Self {
            add_shared_embed: false,
            attn_dropout: 0.2,
            cat_embed_activation: None,
            cat_embed_dropout: 0.1,
            cat_embed_input: None,
            column_idx: ColumnIndex::default(),
            cont_embed_activation: None,
            cont_embed_dropout: 0.1,
            cont_norm_layer: None,
            continuous_cols: None,
            embed_continuous: false,
            ff_dropout: 0.1,
            frac_shared_embed: 0.25,
            full_embed_dropout: false,
            input_dim: 32,
            mlp_activation: Activation::Relu,
            mlp_batchnorm: false,
            mlp_batchnorm_last: false,
            mlp_dropout: 0.1,
            mlp_hidden_dims: None,
            mlp_linear_first: true,
            n_blocks: 4,
            n_heads: 8,
            shared_embed: false,
            transformer_activation: Activation::Gelu,
            use_cat_bias: false,
            use_cont_bias: true,
            use_qkv_bias: false,
        }
    }
}

impl BuildTabularModel for TabTransformerConfig {
    fn build_model(&self, vb: VarBuilder) -> Result<Box<dyn TabularModel>, BoxedError> {
        Ok(Box::new(self.build(vb)?))
    }
}

/// Tabular transformer errors.
#[derive(Debug, Snafu)]
pub enum TabTransformerError {
    #[snafu(display("Cannot apply transformer block {n}"))]
    Block {
        source: TransformerEncoderLayerError,
        n: usize,
    },

    #[snafu(display("Cannot build transformer block {n}"))]
    BuildBlock {
        source: TransformerEncoderLayerError,
        n: usize,
    },

    #[snafu(display("Cannot build column embeddings"))]
    BuildEmbeddings { source: CatAndContEmbeddingsError },

    #[snafu(display("Cannot build MLP head"))]
    BuildMlp { source: MlpError },

    #[snafu(display("Cannot concatenate column representations"))]
    Concat { source: candle_core::Error },

    #[snafu(display(
        "Continuous columns without categorical columns must be embedded, set embed_continuous"
    ))]
    ContinuousNotEmbedded,

    #[snafu(display("Cannot embed columns"))]
    Embed { source: CatAndContEmbeddingsError },

    #[snafu(display("Cannot apply MLP head"))]
    Mlp { source: candle_core::Error },

    #[snafu(display("The tabular transformer requires categorical or continuous columns"))]
    NoColumns,

    #[snafu(display("Cannot pool column representations"))]
    Pool { source: candle_core::Error },
}

/// Tabular transformer output.
pub struct TabTransformerOutput {
    attention_weights: Vec<Tensor>,
    output: Tensor,
}

impl TabTransformerOutput {
    /// Attention weights of each transformer block.
    ///
    /// *Shape:* `(batch_size, n_heads, n_columns, n_columns)`
    pub fn attention_weights(&self) -> &[Tensor] {
        &self.attention_weights
    }

    /// Model output.
    ///
    /// *Shape:* `(batch_size, output_dim)`
    pub fn output(&self) -> &Tensor {
        &self.output
    }

    /// Split into the model output and the attention weights.
    pub fn into_parts(self) -> (Tensor, Vec<Tensor>) {
        (self.output, self.attention_weights)
    }
}

/// Transformer for tabular data.
///
/// The categorical columns (and optionally the continuous columns) are
/// embedded as same-width column representations, which are contextualized
/// by a stack of transformer encoder layers. The representations are then
/// pooled, by taking the classification token or by flattening, and passed
/// to an MLP head.
///
/// See [Huang et al., 2020](https://arxiv.org/abs/2012.06678).
pub struct TabTransformer {
    cat_and_cont_embed: CatAndContEmbeddings,
    embed_continuous: bool,
    output_dim: usize,
    transformer_blks: Vec<TransformerEncoderLayer>,
    transformer_mlp: Mlp,
    with_cls_token: bool,
}

impl TabTransformer {
    /// Apply the model.
    ///
    /// * `input` - Model input.
    ///   *Shape:* `(batch_size, n_columns)`
    /// * `train` - Whether to train the model.
    ///
    /// Returns the model output.
    /// *Shape:* `(batch_size, output_dim)`
    pub fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor, TabTransformerError> {
        Ok(self.forward_with_attention_weights(input, train)?.output)
    }

    /// Apply the model and return the attention weights of every block.
    ///
    /// * `input` - Model input.
    ///   *Shape:* `(batch_size, n_columns)`
    /// * `train` - Whether to train the model.
    pub fn forward_with_attention_weights(
        &self,
        input: &Tensor,
        train: bool,
    ) -> Result<TabTransformerOutput, TabTransformerError> {
        let (x_cat, x_cont) = self
            .cat_and_cont_embed
            .forward_t(input, train)
            .context(EmbedSnafu)?;

        let (mut x, x_cont) = if self.embed_continuous {
            let x = match (x_cat, x_cont) {
                (Some(x_cat), Some(x_cont)) => {
                    Tensor::cat(&[x_cat, x_cont], 1).context(ConcatSnafu)?
                }
                (x_cat, x_cont) => x_cat.or(x_cont).context(NoColumnsSnafu)?,
            };
            (x, None)
        } else {
            (x_cat.context(ContinuousNotEmbeddedSnafu)?, x_cont)
        };

        let mut attention_weights = Vec::with_capacity(self.transformer_blks.len());
        for (n, block) in self.transformer_blks.iter().enumerate() {
            let (output, weights) = block
                .forward_t(&x, train)
                .context(BlockSnafu { n })?
                .into_parts();
            x = output;
            attention_weights.push(weights);
        }

        let mut x = if self.with_cls_token {
            x.i((.., 0)).context(PoolSnafu)?
        } else {
            x.flatten_from(1).context(PoolSnafu)?
        };

        if let Some(x_cont) = x_cont {
            x = Tensor::cat(&[x, x_cont], 1).context(ConcatSnafu)?;
        }

        let output = self
            .transformer_mlp
            .forward_t(&x, train)
            .context(MlpSnafu)?;

        Ok(TabTransformerOutput {
            attention_weights,
            output,
        })
    }

    /// Width of the model output.
    pub fn output_dim(&self) -> usize {
        self.output_dim
    }
}

impl TabularModel for TabTransformer {
    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor, BoxedError> {
        tracing::trace!(shape = ?input.shape(), train, "Applying tabular transformer");
        Ok(TabTransformer::forward_t(self, input, train)?)
    }

    fn output_dim(&self) -> usize {
        self.output_dim
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use rstest::rstest;
    use snafu::{report, FromString, ResultExt, Whatever};

    use crate::columns::ColumnIndex;
    use crate::layers::activation::Activation;
    use crate::layers::normalization::ContNormLayer;
    use crate::models::{
        BuildTabularModel, TabTransformerConfig, TabTransformerError, TabularModelConfig,
    };
    use crate::util::device::tests::test_devices;

    fn config(with_cls_token: bool) -> TabTransformerConfig {
        let mut cat_cols = vec!["a", "b", "c"];
        if with_cls_token {
            cat_cols.insert(0, "cls_token");
        }
        let mut columns = cat_cols.clone();
        columns.push("d");

        TabTransformerConfig::default()
            .column_idx(ColumnIndex::from_names(columns))
            .cat_embed_input(Some(
                cat_cols
                    .into_iter()
                    .map(|col| (col.to_string(), if col == "cls_token" { 1 } else { 4 }))
                    .collect(),
            ))
            .continuous_cols(Some(vec!["d".to_string()]))
            .input_dim(8)
            .n_heads(2)
            .n_blocks(2)
    }

    fn input(with_cls_token: bool, device: &Device) -> Tensor {
        let rows = [
            [1f32, 2., 3., 0.5],
            [4., 1., 2., -1.],
            [2., 3., 4., 1.5],
        ];
        let data = rows
            .iter()
            .flat_map(|row| with_cls_token.then_some(1.).into_iter().chain(row.iter().copied()))
            .collect::<Vec<f32>>();
        let n_columns = data.len() / rows.len();
        Tensor::from_vec(data, (rows.len(), n_columns), device).unwrap()
    }

    #[rstest]
    #[case(false, false, None, 50, 3)]
    #[case(false, true, None, 64, 4)]
    #[case(true, false, None, 18, 4)]
    #[case(true, true, None, 16, 5)]
    #[case(false, false, Some(vec![16, 4]), 4, 3)]
    #[case(true, false, Some(vec![]), 18, 4)]
    fn tab_transformer_output_has_output_dim(
        #[case] with_cls_token: bool,
        #[case] embed_continuous: bool,
        #[case] mlp_hidden_dims: Option<Vec<usize>>,
        #[case] output_dim: usize,
        #[case] n_attended: usize,
    ) -> Result<(), Whatever> {
        for device in test_devices() {
            let vb = VarBuilder::from_varmap(&VarMap::new(), DType::F32, &device);
            let model = config(with_cls_token)
                .embed_continuous(embed_continuous)
                .mlp_hidden_dims(mlp_hidden_dims.clone())
                .build(vb)
                .whatever_context("Cannot build model")?;
            assert_eq!(model.output_dim(), output_dim);

            for train in [false, true] {
                let output = model
                    .forward_with_attention_weights(&input(with_cls_token, &device), train)
                    .whatever_context("Cannot apply model")?;
                assert_eq!(output.output().dims(), &[3, output_dim]);
                assert_eq!(output.attention_weights().len(), 2);
                for weights in output.attention_weights() {
                    assert_eq!(weights.dims(), &[3, 2, n_attended, n_attended]);
                }
            }
        }

        Ok(())
    }

    #[test]
    #[report]
    fn tab_transformer_embeds_continuous_only() -> Result<(), Whatever> {
        let vb = VarBuilder::from_varmap(&VarMap::new(), DType::F32, &Device::Cpu);
        let model = TabTransformerConfig::default()
            .column_idx(ColumnIndex::from_names(["x", "y"]))
            .continuous_cols(Some(vec!["x".to_string(), "y".to_string()]))
            .cont_norm_layer(Some(ContNormLayer::Layernorm))
            .embed_continuous(true)
            .input_dim(4)
            .n_heads(1)
            .n_blocks(1)
            .mlp_hidden_dims(Some(vec![3]))
            .build(vb)
            .whatever_context("Cannot build model")?;
        assert_eq!(model.output_dim(), 3);

        let input = Tensor::new(&[[0.5f32, -1.], [2., 0.25]], &Device::Cpu)
            .whatever_context("Cannot create input")?;
        let output = model
            .forward_t(&input, false)
            .whatever_context("Cannot apply model")?;
        assert_eq!(output.dims(), &[2, 3]);

        Ok(())
    }

    #[test]
    #[report]
    fn tab_transformer_is_deterministic_in_eval() -> Result<(), Whatever> {
        let vb = VarBuilder::from_varmap(&VarMap::new(), DType::F32, &Device::Cpu);
        let model = config(false)
            .shared_embed(true)
            .use_cat_bias(true)
            .full_embed_dropout(true)
            .build(vb)
            .whatever_context("Cannot build model")?;
        let input = input(false, &Device::Cpu);
        let first: Vec<Vec<f32>> = model
            .forward_t(&input, false)
            .whatever_context("Cannot apply model")?
            .to_vec2()
            .whatever_context("Cannot convert output")?;
        let second: Vec<Vec<f32>> = model
            .forward_t(&input, false)
            .whatever_context("Cannot apply model")?
            .to_vec2()
            .whatever_context("Cannot convert output")?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn tab_transformer_parameters_follow_module_paths() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        config(false)
            .use_cat_bias(true)
            .use_qkv_bias(true)
            .cont_norm_layer(Some(ContNormLayer::Layernorm))
            .embed_continuous(true)
            .build(vb)
            .unwrap();

        let data = varmap.data().lock().unwrap();
        for name in [
            "cat_and_cont_embed.cat_embed.embed.weight",
            "cat_and_cont_embed.cat_embed.bias",
            "cat_and_cont_embed.cont_norm.weight",
            "cat_and_cont_embed.cont_embed.weight",
            "cat_and_cont_embed.cont_embed.bias",
            "transformer_blks.transformer_block0.attn.q_proj.weight",
            "transformer_blks.transformer_block0.attn.kv_proj.bias",
            "transformer_blks.transformer_block1.attn.out_proj.weight",
            "transformer_blks.transformer_block1.ff.w_1.weight",
            "transformer_blks.transformer_block1.ff.w_2.weight",
            "transformer_blks.transformer_block1.attn_addnorm.ln.weight",
            "transformer_blks.transformer_block1.ff_addnorm.ln.bias",
            "transformer_mlp.mlp.dense_layer_0.0.weight",
            "transformer_mlp.mlp.dense_layer_1.0.weight",
        ] {
            assert!(data.contains_key(name), "Missing parameter: {name}");
        }
        assert!(!data.contains_key("transformer_blks.transformer_block2.attn.q_proj.weight"));
    }

    #[test]
    fn tab_transformer_rejects_invalid_configs() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        assert!(matches!(
            TabTransformerConfig::default()
                .column_idx(ColumnIndex::from_names(["x"]))
                .continuous_cols(Some(vec!["x".to_string()]))
                .build(vb.clone()),
            Err(TabTransformerError::ContinuousNotEmbedded)
        ));
        assert!(matches!(
            TabTransformerConfig::default().build(vb.clone()),
            Err(TabTransformerError::NoColumns)
        ));
        assert!(matches!(
            config(false).n_heads(3).build(vb.clone()),
            Err(TabTransformerError::BuildBlock { n: 0, .. })
        ));
        assert!(matches!(
            config(false)
                .cat_embed_activation(Some(Activation::Geglu))
                .build(vb),
            Err(TabTransformerError::BuildEmbeddings { .. })
        ));
    }

    #[test]
    #[report]
    fn tab_transformer_builds_from_json() -> Result<(), Whatever> {
        let config: TabularModelConfig = serde_json::from_str(
            r#"{
                "model_type": "tab_transformer",
                "column_idx": {"a": 0, "b": 1, "x": 2},
                "cat_embed_input": [["a", 3], ["b", 2]],
                "continuous_cols": ["x"],
                "cont_norm_layer": "batchnorm",
                "input_dim": 4,
                "n_heads": 2,
                "n_blocks": 1,
                "mlp_hidden_dims": [5]
            }"#,
        )
        .whatever_context("Cannot parse config")?;
        let vb = VarBuilder::from_varmap(&VarMap::new(), DType::F32, &Device::Cpu);
        let model = config
            .build_model(vb)
            .map_err(|e| Whatever::with_source(e, "Cannot build model".to_string()))?;
        assert_eq!(model.output_dim(), 5);

        let input = Tensor::new(&[[1f32, 2., 0.5], [3., 1., -0.5]], &Device::Cpu)
            .whatever_context("Cannot create input")?;
        let output = model
            .forward_t(&input, false)
            .map_err(|e| Whatever::with_source(e, "Cannot apply model".to_string()))?;
        assert_eq!(output.dims(), &[2, 5]);

        Ok(())
    }
}
