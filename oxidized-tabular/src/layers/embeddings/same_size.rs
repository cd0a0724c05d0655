use candle_core::{Module, ModuleT, Tensor};
use candle_nn::init::{Init, DEFAULT_KAIMING_UNIFORM};
use candle_nn::VarBuilder;
use snafu::{ensure, ResultExt, Snafu};

use crate::columns::{categorical, select, ColumnError, ColumnIndex};
use crate::error::BoxedError;
use crate::layers::build_module::BuildModule;
use crate::layers::dropout::{DropoutConfig, FullEmbeddingDropoutConfig};
use crate::layers::embeddings::PaddedEmbedding;

/// Errors for same-size categorical embeddings.
#[derive(Debug, Snafu)]
pub enum SameSizeCatEmbeddingsError {
    #[snafu(display("Cannot build embedding dropout"))]
    BuildDropout { source: BoxedError },

    #[snafu(display("Cannot resolve categorical column"))]
    Column { source: ColumnError },

    #[snafu(display("Cannot construct embeddings"))]
    Construction { source: candle_core::Error },

    #[snafu(display("Cannot embed categorical columns"))]
    Embed { source: candle_core::Error },

    #[snafu(display("Cannot get category indices"))]
    Indices { source: ColumnError },

    #[snafu(display("Fraction of shared embeddings must be in [0, 1), was {frac}"))]
    InvalidFracSharedEmbed { frac: f32 },

    #[snafu(display("Cannot apply shared embedding"))]
    SharedEmbed { source: candle_core::Error },
}

/// Configuration of the embeddings of a single column with a shared
/// column embedding.
#[derive(Clone, Debug)]
pub struct SharedEmbeddingsConfig {
    add_shared_embed: bool,
    dropout: f32,
    embedding_width: usize,
    frac_shared_embed: f32,
    full_embed_dropout: bool,
    n_embeddings: usize,
}

impl SharedEmbeddingsConfig {
    /// Add the shared embedding to the category embeddings.
    ///
    /// If `false`, the shared embedding replaces the first
    /// `frac_shared_embed * embedding_width` components of the category
    /// embeddings.
    ///
    /// Default: `false`
    pub fn add_shared_embed(mut self, add_shared_embed: bool) -> Self {
        self.add_shared_embed = add_shared_embed;
        self
    }

    /// Embedding dropout.
    ///
    /// Default: `0.0`
    pub fn dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    /// Width of the embeddings.
    ///
    /// Default: `32`
    pub fn embedding_width(mut self, embedding_width: usize) -> Self {
        self.embedding_width = embedding_width;
        self
    }

    /// Fraction of the embedding that is shared by all categories.
    ///
    /// Default: `0.25`
    pub fn frac_shared_embed(mut self, frac_shared_embed: f32) -> Self {
        self.frac_shared_embed = frac_shared_embed;
        self
    }

    /// Drop complete embeddings rather than elements.
    ///
    /// Default: `false`
    pub fn full_embed_dropout(mut self, full_embed_dropout: bool) -> Self {
        self.full_embed_dropout = full_embed_dropout;
        self
    }

    /// Number of rows in the embedding table, including padding.
    ///
    /// Default: `1`
    pub fn n_embeddings(mut self, n_embeddings: usize) -> Self {
        self.n_embeddings = n_embeddings;
        self
    }

    /// Build shared embeddings.
    pub fn build(&self, vb: VarBuilder) -> Result<SharedEmbeddings, SameSizeCatEmbeddingsError> {
        ensure!(
            (0f32..1f32).contains(&self.frac_shared_embed),
            InvalidFracSharedEmbedSnafu {
                frac: self.frac_shared_embed
            }
        );

        let shared_width = if self.add_shared_embed {
            self.embedding_width
        } else {
            (self.embedding_width as f32 * self.frac_shared_embed) as usize
        };

        let shared_embed = if shared_width > 0 {
            Some(
                vb.get_with_hints(
                    (1, shared_width),
                    "shared_embed",
                    Init::Uniform { lo: -1., up: 1. },
                )
                .context(ConstructionSnafu)?,
            )
        } else {
            None
        };

        Ok(SharedEmbeddings {
            add_shared_embed: self.add_shared_embed,
            dropout: embedding_dropout(vb.clone(), self.dropout, self.full_embed_dropout)?,
            embed: PaddedEmbedding::new(
                self.n_embeddings,
                self.embedding_width,
                vb.push_prefix("embed"),
            )
            .context(ConstructionSnafu)?,
            shared_embed,
        })
    }
}

impl Default for SharedEmbeddingsConfig {
    fn default() -> Self {
        Self {
            add_shared_embed: false,
            dropout: 0.0,
            embedding_width: 32,
            frac_shared_embed: 0.25,
            full_embed_dropout: false,
            n_embeddings: 1,
        }
    }
}

fn embedding_dropout(
    vb: VarBuilder,
    p: f32,
    full_embed_dropout: bool,
) -> Result<Box<dyn ModuleT>, SameSizeCatEmbeddingsError> {
    let config: Box<dyn BuildModule> = if full_embed_dropout {
        Box::new(FullEmbeddingDropoutConfig::default().p(p))
    } else {
        Box::new(DropoutConfig::default().p(p))
    };
    config.build(vb).context(BuildDropoutSnafu)
}

/// Embeddings of a single categorical column with a shared embedding.
///
/// The shared embedding is learned for the column as a whole, so that
/// the model can identify the column that a category embedding belongs
/// to.
///
/// See Appendix A of [Huang et al., 2020](https://arxiv.org/abs/2012.06678).
pub struct SharedEmbeddings {
    add_shared_embed: bool,
    dropout: Box<dyn ModuleT>,
    embed: PaddedEmbedding,
    shared_embed: Option<Tensor>,
}

impl SharedEmbeddings {
    /// Embed category indices.
    ///
    /// * `ids` - Category indices.
    ///   *Shape:* `(batch_size,)`
    /// * `train` - Whether to train the layer.
    ///
    /// Returns embeddings with shape `(batch_size, 1, width)`.
    pub fn forward_t(&self, ids: &Tensor, train: bool) -> Result<Tensor, SameSizeCatEmbeddingsError> {
        let embeddings = self
            .embed
            .forward(ids)
            .and_then(|embeddings| embeddings.unsqueeze(1))
            .and_then(|embeddings| self.dropout.forward_t(&embeddings, train))
            .context(EmbedSnafu)?;

        let shared_embed = match &self.shared_embed {
            Some(shared_embed) => shared_embed,
            None => return Ok(embeddings),
        };

        let (batch_size, _, width) = embeddings.dims3().context(SharedEmbedSnafu)?;
        let shared_width = shared_embed.dim(1).context(SharedEmbedSnafu)?;
        let shared = shared_embed
            .unsqueeze(0)
            .and_then(|shared| shared.broadcast_as((batch_size, 1, shared_width)))
            .context(SharedEmbedSnafu)?;

        if self.add_shared_embed {
            (embeddings + shared).context(SharedEmbedSnafu)
        } else {
            embeddings
                .narrow(2, shared_width, width - shared_width)
                .and_then(|rest| Tensor::cat(&[&shared, &rest], 2))
                .context(SharedEmbedSnafu)
        }
    }
}

/// Configuration of categorical embeddings that share a width.
#[derive(Clone, Debug)]
pub struct SameSizeCatEmbeddingsConfig {
    add_shared_embed: bool,
    dropout: f32,
    embed_input: Vec<(String, usize)>,
    embedding_width: usize,
    frac_shared_embed: f32,
    full_embed_dropout: bool,
    shared_embed: bool,
    use_bias: bool,
}

impl SameSizeCatEmbeddingsConfig {
    /// Add the shared embedding rather than replacing part of the
    /// category embeddings.
    ///
    /// Only used when `shared_embed` is set.
    ///
    /// Default: `false`
    pub fn add_shared_embed(mut self, add_shared_embed: bool) -> Self {
        self.add_shared_embed = add_shared_embed;
        self
    }

    /// Embedding dropout.
    ///
    /// Default: `0.1`
    pub fn dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    /// Categorical columns as `(column, n_unique)`.
    ///
    /// Default: `[]`
    pub fn embed_input(mut self, embed_input: Vec<(String, usize)>) -> Self {
        self.embed_input = embed_input;
        self
    }

    /// Width of the embeddings.
    ///
    /// Default: `32`
    pub fn embedding_width(mut self, embedding_width: usize) -> Self {
        self.embedding_width = embedding_width;
        self
    }

    /// Fraction of the embedding that is shared in a column.
    ///
    /// Only used when `shared_embed` is set and `add_shared_embed` is not.
    ///
    /// Default: `0.25`
    pub fn frac_shared_embed(mut self, frac_shared_embed: f32) -> Self {
        self.frac_shared_embed = frac_shared_embed;
        self
    }

    /// Drop complete column embeddings rather than elements.
    ///
    /// Default: `false`
    pub fn full_embed_dropout(mut self, full_embed_dropout: bool) -> Self {
        self.full_embed_dropout = full_embed_dropout;
        self
    }

    /// Use a table per column with a shared column embedding.
    ///
    /// Default: `false`
    pub fn shared_embed(mut self, shared_embed: bool) -> Self {
        self.shared_embed = shared_embed;
        self
    }

    /// Add a learned bias to the embeddings of each column.
    ///
    /// Default: `false`
    pub fn use_bias(mut self, use_bias: bool) -> Self {
        self.use_bias = use_bias;
        self
    }

    /// Build the embeddings.
    ///
    /// * `vb` - Variable store.
    /// * `column_idx` - Positions of the columns in the model input.
    pub fn build(
        &self,
        vb: VarBuilder,
        column_idx: &ColumnIndex,
    ) -> Result<SameSizeCatEmbeddings, SameSizeCatEmbeddingsError> {
        let columns = self
            .embed_input
            .iter()
            .map(|(column, _)| column.as_str())
            .collect::<Vec<_>>();
        let cat_idx = column_idx.indices(&columns).context(ColumnSnafu)?;
        let n_cat = cat_idx.len();

        let embed = if self.shared_embed {
            let tables = self
                .embed_input
                .iter()
                .map(|(column, n_unique)| {
                    SharedEmbeddingsConfig::default()
                        .add_shared_embed(self.add_shared_embed)
                        .dropout(self.dropout)
                        .embedding_width(self.embedding_width)
                        .frac_shared_embed(self.frac_shared_embed)
                        .full_embed_dropout(self.full_embed_dropout)
                        .n_embeddings(n_unique + 1)
                        .build(vb.push_prefix(format!("embed.emb_layer_{column}")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            CatEmbed::Shared(tables)
        } else {
            // Category indices are encoded over all columns, so a single
            // table is indexed by every column.
            let n_tokens: usize = self.embed_input.iter().map(|(_, n_unique)| n_unique).sum();
            CatEmbed::Single {
                dropout: embedding_dropout(vb.clone(), self.dropout, self.full_embed_dropout)?,
                embed: PaddedEmbedding::new(
                    n_tokens + 1,
                    self.embedding_width,
                    vb.push_prefix("embed"),
                )
                .context(ConstructionSnafu)?,
            }
        };

        let bias = if self.use_bias {
            Some(
                vb.get_with_hints((n_cat, self.embedding_width), "bias", DEFAULT_KAIMING_UNIFORM)
                    .context(ConstructionSnafu)?,
            )
        } else {
            None
        };

        Ok(SameSizeCatEmbeddings {
            bias,
            cat_idx,
            embed,
        })
    }

    /// Number of categorical columns.
    pub fn n_cat(&self) -> usize {
        self.embed_input.len()
    }
}

impl Default for SameSizeCatEmbeddingsConfig {
    fn default() -> Self {
        Self {
            add_shared_embed: false,
            dropout: 0.1,
            embed_input: vec![],
            embedding_width: 32,
            frac_shared_embed: 0.25,
            full_embed_dropout: false,
            shared_embed: false,
            use_bias: false,
        }
    }
}

enum CatEmbed {
    Shared(Vec<SharedEmbeddings>),
    Single {
        dropout: Box<dyn ModuleT>,
        embed: PaddedEmbedding,
    },
}

/// Categorical embeddings where every column has the same width.
///
/// Used by attention-based models, which treat the columns as a sequence
/// of representations.
pub struct SameSizeCatEmbeddings {
    bias: Option<Tensor>,
    cat_idx: Vec<usize>,
    embed: CatEmbed,
}

impl SameSizeCatEmbeddings {
    /// Embed the categorical columns of the input.
    ///
    /// * `input` - Model input.
    ///   *Shape:* `(batch_size, n_columns)`
    /// * `train` - Whether to train the layer.
    ///
    /// Returns embeddings with shape `(batch_size, n_cat, width)`.
    pub fn forward_t(
        &self,
        input: &Tensor,
        train: bool,
    ) -> Result<Tensor, SameSizeCatEmbeddingsError> {
        let embeddings = match &self.embed {
            CatEmbed::Shared(tables) => {
                let embeddings = self
                    .cat_idx
                    .iter()
                    .zip(tables)
                    .map(|(&index, table)| {
                        let ids = categorical(input, index).context(IndicesSnafu)?;
                        table.forward_t(&ids, train)
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Tensor::cat(&embeddings, 1).context(EmbedSnafu)?
            }
            CatEmbed::Single { embed, .. } => {
                let ids = select(input, &self.cat_idx)
                    .context(IndicesSnafu)?
                    .to_dtype(candle_core::DType::U32)
                    .context(EmbedSnafu)?;
                embed.forward(&ids).context(EmbedSnafu)?
            }
        };

        let embeddings = match &self.bias {
            Some(bias) => bias
                .unsqueeze(0)
                .and_then(|bias| embeddings.broadcast_add(&bias))
                .context(EmbedSnafu)?,
            None => embeddings,
        };

        match &self.embed {
            CatEmbed::Single { dropout, .. } => {
                dropout.forward_t(&embeddings, train).context(EmbedSnafu)
            }
            CatEmbed::Shared(_) => Ok(embeddings),
        }
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use rstest::rstest;
    use snafu::{report, ResultExt, Whatever};

    use crate::columns::ColumnIndex;
    use crate::layers::embeddings::{
        SameSizeCatEmbeddingsConfig, SameSizeCatEmbeddingsError, SharedEmbeddingsConfig,
    };

    fn embed_input() -> Vec<(String, usize)> {
        vec![("a".to_string(), 2), ("b".to_string(), 3)]
    }

    #[rstest]
    #[case(false, false, false)]
    #[case(false, false, true)]
    #[case(true, false, false)]
    #[case(true, true, true)]
    fn same_size_embeddings_have_correct_shape(
        #[case] shared_embed: bool,
        #[case] add_shared_embed: bool,
        #[case] full_embed_dropout: bool,
    ) -> Result<(), Whatever> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let column_idx = ColumnIndex::from_names(["a", "x", "b"]);
        let embeddings = SameSizeCatEmbeddingsConfig::default()
            .embed_input(embed_input())
            .embedding_width(8)
            .shared_embed(shared_embed)
            .add_shared_embed(add_shared_embed)
            .full_embed_dropout(full_embed_dropout)
            .use_bias(true)
            .build(vb, &column_idx)
            .whatever_context("Cannot build embeddings")?;

        // Values are encoded over all columns when no table is shared.
        let input = Tensor::new(&[[1f32, 0.3, 3.], [2., 0.7, 5.]], &Device::Cpu)
            .whatever_context("Cannot create input")?;
        for train in [false, true] {
            let output = embeddings
                .forward_t(&input, train)
                .whatever_context("Cannot embed input")?;
            assert_eq!(output.dims(), &[2, 2, 8]);
        }

        let data = varmap.data().lock().unwrap();
        assert_eq!(data["bias"].dims(), &[2, 8]);
        if shared_embed {
            assert_eq!(data["embed.emb_layer_b.embed.weight"].dims(), &[4, 8]);
            let shared_width = if add_shared_embed { 8 } else { 2 };
            assert_eq!(
                data["embed.emb_layer_a.shared_embed"].dims(),
                &[1, shared_width]
            );
        } else {
            assert_eq!(data["embed.weight"].dims(), &[6, 8]);
        }

        Ok(())
    }

    #[test]
    #[report]
    fn shared_embedding_replaces_leading_components() -> Result<(), Whatever> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let embeddings = SharedEmbeddingsConfig::default()
            .n_embeddings(3)
            .embedding_width(4)
            .frac_shared_embed(0.5)
            .build(vb)
            .whatever_context("Cannot build embeddings")?;
        let ids = Tensor::new(&[0u32, 1, 2], &Device::Cpu).whatever_context("Cannot create ids")?;
        let output: Vec<Vec<Vec<f32>>> = embeddings
            .forward_t(&ids, false)
            .whatever_context("Cannot embed ids")?
            .to_vec3()
            .whatever_context("Cannot convert output")?;

        let shared: Vec<Vec<f32>> = varmap.data().lock().unwrap()["shared_embed"]
            .to_vec2()
            .whatever_context("Cannot convert shared embedding")?;

        for row in &output {
            assert_eq!(&row[0][..2], &shared[0][..]);
        }
        // Padding keeps the zero vector outside of the shared part.
        assert_eq!(&output[0][0][2..], &[0f32, 0.]);

        Ok(())
    }

    #[rstest]
    #[case(1.0)]
    #[case(-0.1)]
    fn shared_embeddings_reject_invalid_fraction(#[case] frac: f32) {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        assert!(matches!(
            SameSizeCatEmbeddingsConfig::default()
                .embed_input(embed_input())
                .shared_embed(true)
                .frac_shared_embed(frac)
                .build(vb, &ColumnIndex::from_names(["a", "b"])),
            Err(SameSizeCatEmbeddingsError::InvalidFracSharedEmbed { .. })
        ));
    }
}
