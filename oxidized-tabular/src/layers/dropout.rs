use candle_core::{ModuleT, Tensor};
use candle_nn::{Dropout, VarBuilder};
use snafu::{ensure, Snafu};

use crate::error::BoxedError;
use crate::layers::build_module::BuildModule;

/// Dropout errors.
#[derive(Debug, Snafu)]
pub enum DropoutError {
    #[snafu(display("Dropout probability must be in [0, 1), was {p}"))]
    InvalidProbability { p: f32 },
}

fn check_probability(p: f32) -> Result<(), DropoutError> {
    ensure!((0f32..1f32).contains(&p), InvalidProbabilitySnafu { p });
    Ok(())
}

/// Dropout configuration.
#[derive(Clone, Debug)]
pub struct DropoutConfig {
    p: f32,
}

impl DropoutConfig {
    /// Dropout probability, must be in `[0, 1)`.
    ///
    /// Unlike PyTorch, `1.0` is rejected since candle's dropout requires
    /// `p < 1`.
    ///
    /// Default: `0.0`
    pub fn p(mut self, p: f32) -> Self {
        self.p = p;
        self
    }
}

impl Default for DropoutConfig {
    fn default() -> Self {
        Self { p: 0.0 }
    }
}

impl BuildModule for DropoutConfig {
    fn build(&self, _vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError> {
        check_probability(self.p)?;
        Ok(Box::new(Dropout::new(self.p)))
    }
}

/// Full embedding dropout configuration.
#[derive(Clone, Debug)]
pub struct FullEmbeddingDropoutConfig {
    p: f32,
}

impl FullEmbeddingDropoutConfig {
    /// Probability of dropping the embedding of a column, must be in
    /// `[0, 1)`.
    ///
    /// Default: `0.0`
    pub fn p(mut self, p: f32) -> Self {
        self.p = p;
        self
    }
}

impl Default for FullEmbeddingDropoutConfig {
    fn default() -> Self {
        Self { p: 0.0 }
    }
}

impl BuildModule for FullEmbeddingDropoutConfig {
    fn build(&self, _vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError> {
        check_probability(self.p)?;
        Ok(Box::new(FullEmbeddingDropout { p: self.p }))
    }
}

/// Dropout of complete column embeddings.
///
/// Rather than dropping individual elements, this drops the full
/// embedding of a column. The mask is shared across the batch, so a
/// dropped column is dropped for every sample. The input has shape
/// `(batch_size, n_columns, width)`.
#[derive(Clone, Debug)]
pub struct FullEmbeddingDropout {
    p: f32,
}

impl ModuleT for FullEmbeddingDropout {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor, candle_core::Error> {
        if !train || self.p == 0. {
            return Ok(xs.clone());
        }

        let n_columns = xs.dim(1)?;
        let scale = 1. / (1. - self.p as f64);
        let mask = Tensor::rand(0f32, 1f32, (n_columns, 1), xs.device())?
            .ge(self.p)?
            .to_dtype(xs.dtype())?;
        xs.broadcast_mul(&(mask * scale)?)
    }
}
