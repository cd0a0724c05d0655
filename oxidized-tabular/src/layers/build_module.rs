use std::fmt::Debug;

use candle_core::ModuleT;
use candle_nn::VarBuilder;

use crate::error::BoxedError;
use crate::layers::identity::Identity;

/// Traits for types that can build modules.
pub trait BuildModule: Debug {
    /// Build a module.
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError>;
}

impl BuildModule for Box<dyn BuildModule> {
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError> {
        self.as_ref().build(vb)
    }
}

/// Optional modules are replaced by the identity when absent.
impl<M> BuildModule for Option<M>
where
    M: BuildModule,
{
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError> {
        match self {
            Some(module) => module.build(vb),
            None => Identity.build(vb),
        }
    }
}
