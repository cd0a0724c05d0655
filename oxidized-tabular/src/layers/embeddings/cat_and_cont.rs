use candle_core::{Module, ModuleT, Tensor};
use candle_nn::VarBuilder;
use snafu::{ensure, ResultExt, Snafu};

use crate::columns::{select, ColumnError, ColumnIndex};
use crate::error::BoxedError;
use crate::layers::activation::Activation;
use crate::layers::build_module::BuildModule;
use crate::layers::embeddings::{
    ContEmbeddings, ContEmbeddingsConfig, ContEmbeddingsError, SameSizeCatEmbeddings,
    SameSizeCatEmbeddingsConfig, SameSizeCatEmbeddingsError,
};
use crate::layers::normalization::ContNormLayer;

/// Configuration of combined categorical and continuous embeddings.
#[derive(Clone, Debug, Default)]
pub struct CatAndContEmbeddingsConfig {
    cat_embed: SameSizeCatEmbeddingsConfig,
    cat_embed_activation: Option<Activation>,
    cont_embed: ContEmbeddingsConfig,
    cont_embed_activation: Option<Activation>,
    cont_norm_layer: Option<ContNormLayer>,
    continuous_cols: Vec<String>,
    embed_continuous: bool,
}

impl CatAndContEmbeddingsConfig {
    /// Configuration of the categorical embeddings.
    ///
    /// Default: `SameSizeCatEmbeddingsConfig::default()`
    pub fn cat_embed(mut self, cat_embed: SameSizeCatEmbeddingsConfig) -> Self {
        self.cat_embed = cat_embed;
        self
    }

    /// Activation applied to the categorical embeddings.
    ///
    /// Default: `None`
    pub fn cat_embed_activation(mut self, cat_embed_activation: Option<Activation>) -> Self {
        self.cat_embed_activation = cat_embed_activation;
        self
    }

    /// Configuration of the continuous embeddings.
    ///
    /// The number of continuous columns is set from `continuous_cols`.
    ///
    /// Default: `ContEmbeddingsConfig::default()`
    pub fn cont_embed(mut self, cont_embed: ContEmbeddingsConfig) -> Self {
        self.cont_embed = cont_embed;
        self
    }

    /// Activation applied to the continuous embeddings.
    ///
    /// Only used when `embed_continuous` is set.
    ///
    /// Default: `None`
    pub fn cont_embed_activation(mut self, cont_embed_activation: Option<Activation>) -> Self {
        self.cont_embed_activation = cont_embed_activation;
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
    /// Default: `[]`
    pub fn continuous_cols(mut self, continuous_cols: Vec<String>) -> Self {
        self.continuous_cols = continuous_cols;
        self
    }

    /// Embed the continuous columns.
    ///
    /// If `false`, the normalized continuous columns are passed through.
    ///
    /// Default: `false`
    pub fn embed_continuous(mut self, embed_continuous: bool) -> Self {
        self.embed_continuous = embed_continuous;
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
    ) -> Result<CatAndContEmbeddings, CatAndContEmbeddingsError> {
        for activation in [self.cat_embed_activation, self.cont_embed_activation]
            .into_iter()
            .flatten()
        {
            ensure!(
                !activation.is_glu(),
                GatedActivationSnafu { activation }
            );
        }

        let cat_embed = if self.cat_embed.n_cat() > 0 {
            Some(
                self.cat_embed
                    .build(vb.push_prefix("cat_embed"), column_idx)
                    .context(CatEmbedSnafu)?,
            )
        } else {
            None
        };

        let n_cont = self.continuous_cols.len();
        let cont = if n_cont > 0 {
            let cont_idx = column_idx
                .indices(&self.continuous_cols)
                .context(ColumnSnafu)?;
            let norm = self
                .cont_norm_layer
                .map(|norm| norm.config(n_cont))
                .build(vb.push_prefix("cont_norm"))
                .context(BuildNormSnafu)?;
            let embed = if self.embed_continuous {
                Some(
                    self.cont_embed
                        .clone()
                        .n_cont(n_cont)
                        .build(vb.push_prefix("cont_embed"))
                        .context(ContEmbedSnafu)?,
                )
            } else {
                None
            };
            Some(Continuous {
                cont_idx,
                embed,
                norm,
            })
        } else {
            None
        };

        Ok(CatAndContEmbeddings {
            cat_embed,
            cat_embed_activation: self.cat_embed_activation,
            cont,
            cont_embed_activation: self.cont_embed_activation,
        })
    }
}

/// Errors for combined categorical and continuous embeddings.
#[derive(Debug, Snafu)]
pub enum CatAndContEmbeddingsError {
    #[snafu(display("Cannot apply embedding activation"))]
    Activation { source: candle_core::Error },

    #[snafu(display("Cannot build continuous normalization"))]
    BuildNorm { source: BoxedError },

    #[snafu(display("Cannot embed categorical columns"))]
    CatEmbed { source: SameSizeCatEmbeddingsError },

    #[snafu(display("Cannot resolve continuous column"))]
    Column { source: ColumnError },

    #[snafu(display("Cannot embed continuous columns"))]
    ContEmbed { source: ContEmbeddingsError },

    #[snafu(display("Cannot apply continuous embeddings"))]
    ContEmbedForward { source: candle_core::Error },

    #[snafu(display("Cannot select continuous columns"))]
    ContSelect { source: ColumnError },

    #[snafu(display(
        "Gated activation {activation:?} cannot be used as an embedding activation"
    ))]
    GatedActivation { activation: Activation },

    #[snafu(display("Cannot normalize continuous columns"))]
    Norm { source: candle_core::Error },
}

/// Normalization and embedding of the continuous columns.
struct Continuous {
    cont_idx: Vec<usize>,
    embed: Option<ContEmbeddings>,
    norm: Box<dyn ModuleT>,
}

/// Combined categorical and continuous embeddings for attention models.
pub struct CatAndContEmbeddings {
    cat_embed: Option<SameSizeCatEmbeddings>,
    cat_embed_activation: Option<Activation>,
    cont: Option<Continuous>,
    cont_embed_activation: Option<Activation>,
}

impl CatAndContEmbeddings {
    /// Embed the columns of the input.
    ///
    /// * `input` - Model input.
    ///   *Shape:* `(batch_size, n_columns)`
    /// * `train` - Whether to train the layer.
    ///
    /// Returns the categorical embeddings with shape
    /// `(batch_size, n_cat, width)` and the continuous columns. The
    /// continuous columns have shape `(batch_size, n_cont, width)` when
    /// embedded and `(batch_size, n_cont)` otherwise. Either is `None`
    /// when there are no columns of that kind.
    pub fn forward_t(
        &self,
        input: &Tensor,
        train: bool,
    ) -> Result<(Option<Tensor>, Option<Tensor>), CatAndContEmbeddingsError> {
        let x_cat = self
            .cat_embed
            .as_ref()
            .map(|cat_embed| -> Result<_, CatAndContEmbeddingsError> {
                let x_cat = cat_embed.forward_t(input, train).context(CatEmbedSnafu)?;
                apply_activation(self.cat_embed_activation, x_cat)
            })
            .transpose()?;

        let x_cont = self
            .cont
            .as_ref()
            .map(|cont| -> Result<_, CatAndContEmbeddingsError> {
                let x_cont = select(input, &cont.cont_idx).context(ContSelectSnafu)?;
                let x_cont = cont.norm.forward_t(&x_cont, train).context(NormSnafu)?;
                match &cont.embed {
                    Some(embed) => {
                        let x_cont = embed
                            .forward_t(&x_cont, train)
                            .context(ContEmbedForwardSnafu)?;
                        apply_activation(self.cont_embed_activation, x_cont)
                    }
                    None => Ok(x_cont),
                }
            })
            .transpose()?;

        Ok((x_cat, x_cont))
    }
}

fn apply_activation(
    activation: Option<Activation>,
    xs: Tensor,
) -> Result<Tensor, CatAndContEmbeddingsError> {
    match activation {
        Some(activation) => activation.forward(&xs).context(ActivationSnafu),
        None => Ok(xs),
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use rstest::rstest;
    use snafu::{report, OptionExt, ResultExt, Whatever};

    use crate::columns::ColumnIndex;
    use crate::layers::activation::Activation;
    use crate::layers::embeddings::{
        CatAndContEmbeddingsConfig, CatAndContEmbeddingsError, ContEmbeddingsConfig,
        SameSizeCatEmbeddingsConfig,
    };
    use crate::layers::normalization::ContNormLayer;

    fn column_idx() -> ColumnIndex {
        ColumnIndex::from_names(["a", "b", "x", "y"])
    }

    fn input() -> Tensor {
        Tensor::new(&[[1f32, 3., 0.5, -1.], [2., 4., 1.5, 2.]], &Device::Cpu).unwrap()
    }

    fn config() -> CatAndContEmbeddingsConfig {
        CatAndContEmbeddingsConfig::default()
            .cat_embed(
                SameSizeCatEmbeddingsConfig::default()
                    .embed_input(vec![("a".to_string(), 2), ("b".to_string(), 2)])
                    .embedding_width(8),
            )
            .cont_embed(ContEmbeddingsConfig::default().embedding_width(8))
            .continuous_cols(vec!["x".to_string(), "y".to_string()])
    }

    #[rstest]
    #[case(false, None, &[2, 2])]
    #[case(false, Some(ContNormLayer::Layernorm), &[2, 2])]
    #[case(true, Some(ContNormLayer::Batchnorm), &[2, 2, 8])]
    fn cat_and_cont_embeddings_have_correct_shapes(
        #[case] embed_continuous: bool,
        #[case] cont_norm_layer: Option<ContNormLayer>,
        #[case] cont_shape: &[usize],
    ) -> Result<(), Whatever> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let embeddings = config()
            .embed_continuous(embed_continuous)
            .cont_norm_layer(cont_norm_layer)
            .cat_embed_activation(Some(Activation::Relu))
            .build(vb, &column_idx())
            .whatever_context("Cannot build embeddings")?;
        let (x_cat, x_cont) = embeddings
            .forward_t(&input(), true)
            .whatever_context("Cannot embed input")?;

        assert_eq!(x_cat.map(|x_cat| x_cat.dims().to_vec()), Some(vec![2, 2, 8]));
        assert_eq!(x_cont.map(|x_cont| x_cont.dims().to_vec()), Some(cont_shape.to_vec()));

        let data = varmap.data().lock().unwrap();
        assert!(data.contains_key("cat_embed.embed.weight"));
        assert_eq!(data.contains_key("cont_embed.weight"), embed_continuous);
        assert_eq!(
            data.contains_key("cont_norm.weight"),
            cont_norm_layer.is_some()
        );

        Ok(())
    }

    #[test]
    #[report]
    fn cat_and_cont_embeddings_pass_raw_continuous_columns() -> Result<(), Whatever> {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let embeddings = config()
            .build(vb, &column_idx())
            .whatever_context("Cannot build embeddings")?;
        let (_, x_cont) = embeddings
            .forward_t(&input(), false)
            .whatever_context("Cannot embed input")?;
        let x_cont: Vec<Vec<f32>> = x_cont
            .whatever_context("Missing continuous columns")?
            .to_vec2()
            .whatever_context("Cannot convert continuous columns")?;
        assert_eq!(x_cont, vec![vec![0.5, -1.], vec![1.5, 2.]]);
        Ok(())
    }

    #[test]
    fn cat_and_cont_embeddings_reject_gated_activation() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        assert!(matches!(
            config()
                .cont_embed_activation(Some(Activation::Geglu))
                .build(vb, &column_idx()),
            Err(CatAndContEmbeddingsError::GatedActivation { .. })
        ));
    }
}
