pub mod device;

#[cfg(test)]
pub(crate) mod tests {
    use std::error::Error;
    use std::fmt::Debug;

    use approx::{assert_relative_eq, AbsDiffEq, Relative, RelativeEq};
    use candle_core::{Device, Tensor, WithDType};
    use ndarray::{ArrayBase, ArrayD, Data, Dimension};
    use rand_core::RngCore;
    use rand_pcg::Pcg32;

    /// Conversion of tensors and arrays into dynamic-rank arrays.
    pub trait IntoArrayD<T> {
        fn into_arrayd(self) -> Result<ArrayD<T>, Box<dyn Error>>;
    }

    impl<T> IntoArrayD<T> for &Tensor
    where
        T: WithDType,
    {
        fn into_arrayd(self) -> Result<ArrayD<T>, Box<dyn Error>> {
            let values = self.flatten_all()?.to_vec1()?;
            Ok(ArrayD::from_shape_vec(self.dims(), values)?)
        }
    }

    impl<T> IntoArrayD<T> for Tensor
    where
        T: WithDType,
    {
        fn into_arrayd(self) -> Result<ArrayD<T>, Box<dyn Error>> {
            IntoArrayD::into_arrayd(&self)
        }
    }

    impl<S, D, T> IntoArrayD<T> for ArrayBase<S, D>
    where
        D: Dimension,
        S: Data<Elem = T>,
        T: Clone,
    {
        fn into_arrayd(self) -> Result<ArrayD<T>, Box<dyn Error>> {
            Ok(self.into_owned().into_dyn())
        }
    }

    /// Assert that two tensors or arrays have the same shape and are equal
    /// within the absolute (`epsilon`) and relative (`max_relative`)
    /// tolerances.
    macro_rules! assert_tensor_eq {
        ($lhs:expr, $rhs:expr $(, $opt:ident = $val:expr)* $(,)?) => {
            crate::util::tests::assert_tensor_eq_(
                $lhs,
                $rhs,
                approx::Relative::default()$(.$opt($val))*,
            )
        };
    }
    pub(crate) use assert_tensor_eq;

    pub(crate) fn assert_tensor_eq_<T>(
        lhs: impl IntoArrayD<T>,
        rhs: impl IntoArrayD<T>,
        tolerance: Relative<T>,
    ) where
        T: AbsDiffEq<Epsilon = T> + RelativeEq + Clone + Debug,
    {
        let lhs = lhs.into_arrayd().expect("Cannot convert left-hand side");
        let rhs = rhs.into_arrayd().expect("Cannot convert right-hand side");

        assert_eq!(lhs.shape(), rhs.shape(), "Shapes differ");
        assert_relative_eq!(
            lhs,
            rhs,
            epsilon = tolerance.epsilon,
            max_relative = tolerance.max_relative
        );
    }

    /// Deterministic pseudo-random tensors.
    pub(crate) trait PseudoRandom {
        /// Create a float32 vector of `len` values in `[-1, 1)`.
        ///
        /// The generator is seeded with `len`, so the same length always
        /// gives the same values.
        fn pseudo_random(len: usize, device: &Device) -> Self;
    }

    impl PseudoRandom for Tensor {
        fn pseudo_random(len: usize, device: &Device) -> Self {
            let mut rng = Pcg32::new(len as u64, 0);
            let shift = u32::BITS - f32::MANTISSA_DIGITS;
            let scale = (1u32 << f32::MANTISSA_DIGITS) as f32;
            let values = (0..len).map(|_| {
                let bits = rng.next_u32();
                // The low bit is not part of the mantissa and picks the sign.
                (bits >> shift) as f32 / scale - (bits & 1) as f32
            });
            Tensor::from_iter(values, device).expect("Cannot allocate random tensor")
        }
    }
}
