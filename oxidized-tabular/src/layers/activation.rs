use candle_core::{Module, ModuleT, Tensor, D};
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};

use crate::error::BoxedError;
use crate::layers::build_module::BuildModule;

/// Negative slope of the leaky rectifier.
const LEAKY_RELU_NEGATIVE_SLOPE: f64 = 0.01;

/// Activation functions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// Hyperbolic tangent.
    Tanh,

    /// Rectified Linear Unit.
    ///
    /// See [Fukushima, 1969](https://ieeexplore.ieee.org/document/4082265).
    Relu,

    /// Leaky Rectified Linear Unit with a negative slope of `0.01`.
    LeakyRelu,

    /// Gausian Error Linear Unit.
    ///
    /// See [Hendrycks and Gimpel, 2016](https://arxiv.org/abs/1606.08415).
    Gelu,

    /// GELU-gated linear unit.
    ///
    /// The input is split in half along the last dimension into `x` and
    /// `gates`, the output is `x * gelu(gates)`. So, the output is half as
    /// wide as the input.
    ///
    /// See [Shazeer, 2020](https://arxiv.org/abs/2002.05202).
    Geglu,

    /// ReLU-gated linear unit.
    ///
    /// Like [`Activation::Geglu`], but gates using ReLU.
    Reglu,
}

impl Activation {
    /// Whether this is a gated linear unit.
    ///
    /// Gated activations halve the width of their input, so they can only
    /// be used in layers that account for this.
    pub fn is_glu(&self) -> bool {
        matches!(self, Activation::Geglu | Activation::Reglu)
    }
}

impl BuildModule for Activation {
    fn build(&self, _vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError> {
        Ok(Box::new(*self))
    }
}

impl Module for Activation {
    fn forward(&self, xs: &Tensor) -> Result<Tensor, candle_core::Error> {
        use Activation::*;
        match self {
            Tanh => xs.tanh(),
            Relu => xs.relu(),
            LeakyRelu => leaky_relu(xs),
            Gelu => xs.gelu_erf(),
            Geglu => gated(xs, |gates| gates.gelu_erf()),
            Reglu => gated(xs, |gates| gates.relu()),
        }
    }
}

fn leaky_relu(xs: &Tensor) -> Result<Tensor, candle_core::Error> {
    // relu(x) - slope * relu(-x)
    let negative = (xs.neg()?.relu()? * LEAKY_RELU_NEGATIVE_SLOPE)?;
    xs.relu()? - negative
}

fn gated(
    xs: &Tensor,
    activation: impl Fn(&Tensor) -> Result<Tensor, candle_core::Error>,
) -> Result<Tensor, candle_core::Error> {
    let chunks = xs.chunk(2, D::Minus1)?;
    chunks[0].mul(&activation(&chunks[1])?)
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Module, Tensor};
    use ndarray::array;
    use rstest::rstest;
    use snafu::{report, ResultExt, Whatever};

    use crate::layers::activation::Activation;
    use crate::util::tests::assert_tensor_eq;

    #[test]
    #[report]
    fn leaky_relu_scales_negative_inputs() -> Result<(), Whatever> {
        let input = Tensor::new(&[[-2f32, -1., 0., 3.]], &Device::Cpu)
            .whatever_context("Cannot create input")?;
        let output = Activation::LeakyRelu
            .forward(&input)
            .whatever_context("Cannot apply activation")?;
        assert_tensor_eq!(
            output,
            array![[-0.02f32, -0.01, 0., 3.]],
            epsilon = 1e-6
        );
        Ok(())
    }

    #[test]
    #[report]
    fn reglu_gates_first_half() -> Result<(), Whatever> {
        let input = Tensor::new(&[[1f32, 2., -1., 3.]], &Device::Cpu)
            .whatever_context("Cannot create input")?;
        let output = Activation::Reglu
            .forward(&input)
            .whatever_context("Cannot apply activation")?;
        assert_tensor_eq!(output, array![[0f32, 6.]], epsilon = 1e-6);
        Ok(())
    }

    #[rstest]
    #[case(Activation::Tanh, false)]
    #[case(Activation::Relu, false)]
    #[case(Activation::LeakyRelu, false)]
    #[case(Activation::Gelu, false)]
    #[case(Activation::Geglu, true)]
    #[case(Activation::Reglu, true)]
    fn gated_activations_are_detected(#[case] activation: Activation, #[case] is_glu: bool) {
        assert_eq!(activation.is_glu(), is_glu);
    }

    #[test]
    fn activations_deserialize_from_snake_case() {
        let activation: Activation = serde_json::from_str("\"leaky_relu\"").unwrap();
        assert_eq!(activation, Activation::LeakyRelu);
    }
}
