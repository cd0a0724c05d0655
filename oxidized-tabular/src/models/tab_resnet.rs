use candle_core::{ModuleT, Tensor};
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};

use crate::columns::{select, ColumnError, ColumnIndex};
use crate::error::BoxedError;
use crate::layers::activation::Activation;
use crate::layers::build_module::BuildModule;
use crate::layers::embeddings::{
    CategoricalEmbeddings, CategoricalEmbeddingsConfig, CategoricalEmbeddingsError,
};
use crate::layers::mlp::{Mlp, MlpConfig, MlpError};
use crate::layers::normalization::BatchNormConfig;
use crate::layers::resnet::{DenseResnet, DenseResnetConfig, DenseResnetError};
use crate::models::{BuildTabularModel, TabularModel};

/// Residual network model configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct TabResnetConfig {
    batchnorm_cont: bool,
    blocks_dims: Vec<usize>,
    blocks_dropout: f32,
    column_idx: ColumnIndex,
    concat_cont_first: bool,
    continuous_cols: Option<Vec<String>>,
    embed_dropout: f32,
    embed_input: Vec<(String, usize, usize)>,
    mlp_activation: Activation,
    mlp_batchnorm: bool,
    mlp_batchnorm_last: bool,
    mlp_dropout: f32,
    mlp_hidden_dims: Option<Vec<usize>>,
    mlp_linear_first: bool,
}

impl TabResnetConfig {
    /// Apply batch normalization to the continuous columns.
    ///
    /// Default: `false`
    pub fn batchnorm_cont(mut self, batchnorm_cont: bool) -> Self {
        self.batchnorm_cont = batchnorm_cont;
        self
    }

    /// Input and output widths of the residual blocks.
    ///
    /// Default: `[200, 100, 100]`
    pub fn blocks_dims(mut self, blocks_dims: Vec<usize>) -> Self {
        self.blocks_dims = blocks_dims;
        self
    }

    /// Dropout inside the residual blocks.
    ///
    /// Default: `0.0`
    pub fn blocks_dropout(mut self, blocks_dropout: f32) -> Self {
        self.blocks_dropout = blocks_dropout;
        self
    }

    /// Positions of the columns in the model input.
    ///
    /// Default: empty
    pub fn column_idx(mut self, column_idx: ColumnIndex) -> Self {
        self.column_idx = column_idx;
        self
    }

    /// Concatenate the continuous columns before the residual blocks.
    ///
    /// If `false`, the continuous columns are concatenated to the output
    /// of the residual blocks.
    ///
    /// Default: `true`
    pub fn concat_cont_first(mut self, concat_cont_first: bool) -> Self {
        self.concat_cont_first = concat_cont_first;
        self
    }

    /// Continuous columns.
    ///
    /// Default: `None`
    pub fn continuous_cols(mut self, continuous_cols: Option<Vec<String>>) -> Self {
        self.continuous_cols = continuous_cols;
        self
    }

    /// Dropout of the categorical embeddings.
    ///
    /// Default: `0.0`
    pub fn embed_dropout(mut self, embed_dropout: f32) -> Self {
        self.embed_dropout = embed_dropout;
        self
    }

    /// Categorical columns as `(column, n_unique, embedding_width)`.
    ///
    /// Default: `[]`
    pub fn embed_input(mut self, embed_input: Vec<(String, usize, usize)>) -> Self {
        self.embed_input = embed_input;
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
    /// Default: `0.0`
    pub fn mlp_dropout(mut self, mlp_dropout: f32) -> Self {
        self.mlp_dropout = mlp_dropout;
        self
    }

    /// Hidden widths of the MLP head, no head is used when `None` or empty.
    ///
    /// Default: `None`
    pub fn mlp_hidden_dims(mut self, mlp_hidden_dims: Option<Vec<usize>>) -> Self {
        self.mlp_hidden_dims = mlp_hidden_dims;
        self
    }

    /// Apply the linear layer first in the dense layers of the MLP head.
    ///
    /// Default: `false`
    pub fn mlp_linear_first(mut self, mlp_linear_first: bool) -> Self {
        self.mlp_linear_first = mlp_linear_first;
        self
    }

    /// Build the model.
    pub fn build(&self, vb: VarBuilder) -> Result<TabResnet, TabResnetError> {
        ensure!(!self.embed_input.is_empty(), NoCategoricalColumnsSnafu);
        ensure!(
            self.blocks_dims.len() >= 2,
            TooFewBlockDimsSnafu {
                n_dims: self.blocks_dims.len()
            }
        );

        let embeddings_config = CategoricalEmbeddingsConfig::default()
            .dropout(self.embed_dropout)
            .embed_input(self.embed_input.clone());
        let emb_dim = embeddings_config.output_dim();
        let embed_layers = embeddings_config
            .build(vb.push_prefix("embed_layers"), &self.column_idx)
            .context(BuildEmbeddingsSnafu)?;

        let cont = match &self.continuous_cols {
            Some(continuous_cols) if !continuous_cols.is_empty() => {
                let cont_idx = self
                    .column_idx
                    .indices(continuous_cols)
                    .context(ColumnSnafu)?;
                let norm = if self.batchnorm_cont {
                    Some(
                        BatchNormConfig::default()
                            .size(cont_idx.len())
                            .build(vb.push_prefix("norm"))
                            .context(BuildNormSnafu)?,
                    )
                } else {
                    None
                };
                Some(Continuous { cont_idx, norm })
            }
            _ => None,
        };
        let cont_dim = cont.as_ref().map(|cont| cont.cont_idx.len()).unwrap_or(0);

        let (resnet_input_dim, resnet_output_dim) = if self.concat_cont_first {
            (emb_dim + cont_dim, self.blocks_dims[self.blocks_dims.len() - 1])
        } else {
            (emb_dim, cont_dim + self.blocks_dims[self.blocks_dims.len() - 1])
        };

        let tab_resnet = DenseResnetConfig::default()
            .blocks_dims(self.blocks_dims.clone())
            .dropout(self.blocks_dropout)
            .input_dim(resnet_input_dim)
            .build(vb.push_prefix("tab_resnet.dense_resnet"))
            .context(BuildResnetSnafu)?;

        let (tab_resnet_mlp, output_dim) = match &self.mlp_hidden_dims {
            Some(mlp_hidden_dims) if !mlp_hidden_dims.is_empty() => {
                let mlp_config = MlpConfig::default()
                    .activation(self.mlp_activation)
                    .batchnorm(self.mlp_batchnorm)
                    .batchnorm_last(self.mlp_batchnorm_last)
                    .dims(
                        std::iter::once(resnet_output_dim)
                            .chain(mlp_hidden_dims.iter().copied())
                            .collect(),
                    )
                    .dropout(self.mlp_dropout)
                    .linear_first(self.mlp_linear_first);
                let output_dim = mlp_config.output_dim().unwrap_or(resnet_output_dim);
                let mlp = mlp_config
                    .build(vb.push_prefix("tab_resnet_mlp.mlp"))
                    .context(BuildMlpSnafu)?;
                (Some(mlp), output_dim)
            }
            _ => (None, resnet_output_dim),
        };

        tracing::debug!(
            emb_dim,
            cont_dim,
            resnet_input_dim,
            output_dim,
            "Built residual network model"
        );

        Ok(TabResnet {
            concat_cont_first: self.concat_cont_first,
            cont,
            embed_layers,
            output_dim,
            tab_resnet,
            tab_resnet_mlp,
        })
    }
}

impl Default for TabResnetConfig {
    fn default() -> Self {
        Self {
            batchnorm_cont: false,
            blocks_dims: vec![200, 100, 100],
            blocks_dropout: 0.0,
            column_idx: ColumnIndex::default(),
            concat_cont_first: true,
            continuous_cols: None,
            embed_dropout: 0.0,
            embed_input: vec![],
            mlp_activation: Activation::Relu,
            mlp_batchnorm: false,
            mlp_batchnorm_last: false,
            mlp_dropout: 0.0,
            mlp_hidden_dims: None,
            mlp_linear_first: false,
        }
    }
}

impl BuildTabularModel for TabResnetConfig {
    fn build_model(&self, vb: VarBuilder) -> Result<Box<dyn TabularModel>, BoxedError> {
        Ok(Box::new(self.build(vb)?))
    }
}

/// Residual network model errors.
#[derive(Debug, Snafu)]
pub enum TabResnetError {
    #[snafu(display("Cannot build categorical embeddings"))]
    BuildEmbeddings { source: CategoricalEmbeddingsError },

    #[snafu(display("Cannot build MLP head"))]
    BuildMlp { source: MlpError },

    #[snafu(display("Cannot build batch normalization of continuous columns"))]
    BuildNorm { source: BoxedError },

    #[snafu(display("Cannot build residual blocks"))]
    BuildResnet { source: DenseResnetError },

    #[snafu(display("Cannot resolve continuous column"))]
    Column { source: ColumnError },

    #[snafu(display("Cannot concatenate continuous columns"))]
    Concat { source: candle_core::Error },

    #[snafu(display("Cannot select continuous columns"))]
    ContSelect { source: ColumnError },

    #[snafu(display("Cannot embed categorical columns"))]
    Embed { source: CategoricalEmbeddingsError },

    #[snafu(display("Cannot apply MLP head"))]
    Mlp { source: candle_core::Error },

    #[snafu(display("The residual network model requires categorical columns"))]
    NoCategoricalColumns,

    #[snafu(display("Cannot normalize continuous columns"))]
    Norm { source: candle_core::Error },

    #[snafu(display("Cannot apply residual blocks"))]
    Resnet { source: candle_core::Error },

    #[snafu(display(
        "Block dimensions must contain at least two elements, e.g. [256, 128], got {n_dims}"
    ))]
    TooFewBlockDims { n_dims: usize },
}

struct Continuous {
    cont_idx: Vec<usize>,
    norm: Option<Box<dyn ModuleT>>,
}

/// Residual network for tabular data.
///
/// Categorical columns are embedded and, together with the continuous
/// columns, passed through a stack of dense residual blocks. An optional
/// MLP head follows the blocks.
pub struct TabResnet {
    concat_cont_first: bool,
    cont: Option<Continuous>,
    embed_layers: CategoricalEmbeddings,
    output_dim: usize,
    tab_resnet: DenseResnet,
    tab_resnet_mlp: Option<Mlp>,
}

impl TabResnet {
    /// Apply the model.
    ///
    /// * `input` - Model input.
    ///   *Shape:* `(batch_size, n_columns)`
    /// * `train` - Whether to train the model.
    ///
    /// Returns the model output.
    /// *Shape:* `(batch_size, output_dim)`
    pub fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor, TabResnetError> {
        let x = self
            .embed_layers
            .forward_t(input, train)
            .context(EmbedSnafu)?;

        let out = match &self.cont {
            Some(cont) => {
                let mut x_cont = select(input, &cont.cont_idx).context(ContSelectSnafu)?;
                if let Some(norm) = &cont.norm {
                    x_cont = norm.forward_t(&x_cont, train).context(NormSnafu)?;
                }

                if self.concat_cont_first {
                    let x = Tensor::cat(&[x, x_cont], 1).context(ConcatSnafu)?;
                    self.tab_resnet.forward_t(&x, train).context(ResnetSnafu)?
                } else {
                    let x = self.tab_resnet.forward_t(&x, train).context(ResnetSnafu)?;
                    Tensor::cat(&[x, x_cont], 1).context(ConcatSnafu)?
                }
            }
            None => self.tab_resnet.forward_t(&x, train).context(ResnetSnafu)?,
        };

        match &self.tab_resnet_mlp {
            Some(mlp) => mlp.forward_t(&out, train).context(MlpSnafu),
            None => Ok(out),
        }
    }

    /// Width of the model output.
    pub fn output_dim(&self) -> usize {
        self.output_dim
    }
}

impl TabularModel for TabResnet {
    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor, BoxedError> {
        tracing::trace!(shape = ?input.shape(), train, "Applying residual network model");
        Ok(TabResnet::forward_t(self, input, train)?)
    }

    fn output_dim(&self) -> usize {
        self.output_dim
    }
}
