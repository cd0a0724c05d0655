use candle_core::{ModuleT, Tensor};
use candle_nn::init::DEFAULT_KAIMING_UNIFORM;
use candle_nn::{Dropout, VarBuilder};
use snafu::{ensure, ResultExt, Snafu};

/// Configuration of continuous column embeddings.
#[derive(Clone, Debug)]
pub struct ContEmbeddingsConfig {
    dropout: f32,
    embedding_width: usize,
    n_cont: usize,
    use_bias: bool,
}

impl ContEmbeddingsConfig {
    /// Dropout applied to the embeddings.
    ///
    /// Default: `0.0`
    pub fn dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    /// Width of the embedding of each continuous column.
    ///
    /// Default: `32`
    pub fn embedding_width(mut self, embedding_width: usize) -> Self {
        self.embedding_width = embedding_width;
        self
    }

    /// Number of continuous columns.
    ///
    /// Default: `0`
    pub fn n_cont(mut self, n_cont: usize) -> Self {
        self.n_cont = n_cont;
        self
    }

    /// Add a learned bias per column.
    ///
    /// Default: `true`
    pub fn use_bias(mut self, use_bias: bool) -> Self {
        self.use_bias = use_bias;
        self
    }

    /// Build continuous embeddings.
    pub fn build(&self, vb: VarBuilder) -> Result<ContEmbeddings, ContEmbeddingsError> {
        ensure!(
            (0f32..1f32).contains(&self.dropout),
            InvalidDropoutSnafu { p: self.dropout }
        );

        let shape = (self.n_cont, self.embedding_width);
        let weight = vb
            .get_with_hints(shape, "weight", DEFAULT_KAIMING_UNIFORM)
            .context(ConstructionSnafu)?;
        let bias = if self.use_bias {
            Some(
                vb.get_with_hints(shape, "bias", DEFAULT_KAIMING_UNIFORM)
                    .context(ConstructionSnafu)?,
            )
        } else {
            None
        };

        Ok(ContEmbeddings {
            bias,
            dropout: Dropout::new(self.dropout),
            weight,
        })
    }
}

impl Default for ContEmbeddingsConfig {
    fn default() -> Self {
        Self {
            dropout: 0.0,
            embedding_width: 32,
            n_cont: 0,
            use_bias: true,
        }
    }
}

/// Errors for continuous embeddings.
#[derive(Debug, Snafu)]
pub enum ContEmbeddingsError {
    #[snafu(display("Cannot construct continuous embeddings"))]
    Construction { source: candle_core::Error },

    #[snafu(display("Cannot embed continuous columns"))]
    Embed { source: candle_core::Error },

    #[snafu(display("Dropout probability must be in [0, 1), was {p}"))]
    InvalidDropout { p: f32 },
}

/// Embeddings of continuous columns.
///
/// Every continuous column has a learned vector that is scaled by the
/// column value, optionally shifted by a learned per-column bias.
pub struct ContEmbeddings {
    bias: Option<Tensor>,
    dropout: Dropout,
    weight: Tensor,
}

impl ModuleT for ContEmbeddings {
    /// Embed continuous columns.
    ///
    /// Maps `(batch_size, n_cont)` to `(batch_size, n_cont, width)`.
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor, candle_core::Error> {
        let mut embeddings = xs
            .unsqueeze(2)?
            .broadcast_mul(&self.weight.unsqueeze(0)?)?;
        if let Some(bias) = &self.bias {
            embeddings = embeddings.broadcast_add(&bias.unsqueeze(0)?)?;
        }
        self.dropout.forward_t(&embeddings, train)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, ModuleT, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use ndarray::array;
    use snafu::{report, ResultExt, Whatever};

    use crate::layers::embeddings::ContEmbeddingsConfig;
    use crate::util::tests::assert_tensor_eq;

    #[test]
    #[report]
    fn cont_embeddings_scale_column_vectors() -> Result<(), Whatever> {
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let embeddings = ContEmbeddingsConfig::default()
            .n_cont(2)
            .embedding_width(3)
            .use_bias(false)
            .build(vb)
            .whatever_context("Cannot build embeddings")?;

        varmap
            .set_one(
                "weight",
                Tensor::new(&[[1f32, 2., 3.], [-1., 0., 1.]], &Device::Cpu)
                    .whatever_context("Cannot create weight")?,
            )
            .whatever_context("Cannot set weight")?;

        let input = Tensor::new(&[[2f32, 3.]], &Device::Cpu)
            .whatever_context("Cannot create input")?;
        let output = embeddings
            .forward_t(&input, false)
            .whatever_context("Cannot embed input")?;
        assert_tensor_eq!(
            output,
            array![[[2f32, 4., 6.], [-3., 0., 3.]]],
            epsilon = 1e-6
        );

        Ok(())
    }

    #[test]
    #[report]
    fn cont_embeddings_have_per_column_bias() -> Result<(), Whatever> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let embeddings = ContEmbeddingsConfig::default()
            .n_cont(4)
            .embedding_width(8)
            .build(vb)
            .whatever_context("Cannot build embeddings")?;
        let input = Tensor::zeros((5, 4), DType::F32, &Device::Cpu)
            .whatever_context("Cannot create input")?;
        let output = embeddings
            .forward_t(&input, true)
            .whatever_context("Cannot embed input")?;
        assert_eq!(output.dims(), &[5, 4, 8]);

        let data = varmap.data().lock().unwrap();
        assert_eq!(data["bias"].dims(), &[4, 8]);

        Ok(())
    }
}
