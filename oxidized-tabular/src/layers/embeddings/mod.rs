//! Embedding layers for categorical and continuous columns.
//!
//! Category index `0` is reserved for padding and unseen categories. It
//! is always embedded as the zero vector.
use candle_core::{Module, Tensor};
use candle_nn::{embedding, Embedding, VarBuilder};

mod cat_and_cont;
pub use cat_and_cont::{CatAndContEmbeddings, CatAndContEmbeddingsConfig, CatAndContEmbeddingsError};

mod categorical;
pub use categorical::{CategoricalEmbeddings, CategoricalEmbeddingsConfig, CategoricalEmbeddingsError};

mod continuous;
pub use continuous::{ContEmbeddings, ContEmbeddingsConfig, ContEmbeddingsError};

mod same_size;
pub use same_size::{
    SameSizeCatEmbeddings, SameSizeCatEmbeddingsConfig, SameSizeCatEmbeddingsError,
    SharedEmbeddings, SharedEmbeddingsConfig,
};

/// Embedding table that maps index `0` to the zero vector.
///
/// The table itself is a regular embedding table with parameter name
/// `weight`, so the stored row for index `0` is ignored.
pub(crate) struct PaddedEmbedding {
    embeddings: Embedding,
}

impl PaddedEmbedding {
    pub(crate) fn new(
        n_embeddings: usize,
        width: usize,
        vb: VarBuilder,
    ) -> Result<Self, candle_core::Error> {
        Ok(Self {
            embeddings: embedding(n_embeddings, width, vb)?,
        })
    }
}

impl Module for PaddedEmbedding {
    fn forward(&self, ids: &Tensor) -> Result<Tensor, candle_core::Error> {
        let embeddings = self.embeddings.forward(ids)?;
        let mask = ids
            .ne(0u32)?
            .to_dtype(embeddings.dtype())?
            .unsqueeze(ids.rank())?;
        embeddings.broadcast_mul(&mask)
    }
}
