use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{Dropout, VarBuilder};
use snafu::{ensure, ResultExt, Snafu};

use crate::columns::{categorical, ColumnError, ColumnIndex};
use crate::layers::embeddings::PaddedEmbedding;

/// Configuration of per-column categorical embeddings.
#[derive(Clone, Debug, Default)]
pub struct CategoricalEmbeddingsConfig {
    dropout: f32,
    embed_input: Vec<(String, usize, usize)>,
}

impl CategoricalEmbeddingsConfig {
    /// Dropout applied to the concatenated embeddings.
    ///
    /// Default: `0.0`
    pub fn dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    /// Categorical columns as `(column, n_unique, embedding_width)`.
    ///
    /// Every column gets a table with `n_unique + 1` rows, since index `0`
    /// is reserved for padding.
    ///
    /// Default: `[]`
    pub fn embed_input(mut self, embed_input: Vec<(String, usize, usize)>) -> Self {
        self.embed_input = embed_input;
        self
    }

    /// Sum of the embedding widths.
    pub fn output_dim(&self) -> usize {
        self.embed_input.iter().map(|(_, _, width)| width).sum()
    }

    /// Build the embeddings.
    ///
    /// * `vb` - Variable store.
    /// * `column_idx` - Positions of the columns in the model input.
    pub fn build(
        &self,
        vb: VarBuilder,
        column_idx: &ColumnIndex,
    ) -> Result<CategoricalEmbeddings, CategoricalEmbeddingsError> {
        ensure!(
            (0f32..1f32).contains(&self.dropout),
            InvalidDropoutSnafu { p: self.dropout }
        );

        let embeddings = self
            .embed_input
            .iter()
            .map(|(column, n_unique, width)| {
                let index = column_idx.get(column).context(ColumnSnafu)?;
                let table = PaddedEmbedding::new(
                    n_unique + 1,
                    *width,
                    vb.push_prefix(format!("emb_layer_{column}")),
                )
                .context(ConstructionSnafu)?;
                Ok((index, table))
            })
            .collect::<Result<Vec<_>, CategoricalEmbeddingsError>>()?;

        Ok(CategoricalEmbeddings {
            dropout: Dropout::new(self.dropout),
            embeddings,
        })
    }
}

/// Errors for categorical embeddings.
#[derive(Debug, Snafu)]
pub enum CategoricalEmbeddingsError {
    #[snafu(display("Cannot resolve categorical column"))]
    Column { source: ColumnError },

    #[snafu(display("Cannot construct embedding table"))]
    Construction { source: candle_core::Error },

    #[snafu(display("Cannot embed categorical columns"))]
    Embed { source: candle_core::Error },

    #[snafu(display("Dropout probability must be in [0, 1), was {p}"))]
    InvalidDropout { p: f32 },

    #[snafu(display("Cannot get category indices"))]
    Indices { source: ColumnError },
}

/// Categorical embeddings with a width per column.
///
/// The embeddings of the columns are concatenated, giving an output with
/// shape `(batch_size, sum_of_widths)`.
pub struct CategoricalEmbeddings {
    dropout: Dropout,
    embeddings: Vec<(usize, PaddedEmbedding)>,
}

impl CategoricalEmbeddings {
    /// Embed the categorical columns of the input.
    ///
    /// * `input` - Model input.
    ///   *Shape:* `(batch_size, n_columns)`
    /// * `train` - Whether to train the layer.
    pub fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor, CategoricalEmbeddingsError> {
        let embeddings = self
            .embeddings
            .iter()
            .map(|(index, table)| {
                let ids = categorical(input, *index).context(IndicesSnafu)?;
                table.forward(&ids).context(EmbedSnafu)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Tensor::cat(&embeddings, 1)
            .and_then(|embeddings| self.dropout.forward_t(&embeddings, train))
            .context(EmbedSnafu)
    }
}
