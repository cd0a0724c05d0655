use std::error::Error;

/// Alias for boxed errors that can be sent across threads.
///
/// Used at the seams where modules can be swapped out, such as
/// [`BuildModule`](crate::layers::build_module::BuildModule) and
/// [`TabularModel`](crate::models::TabularModel).
pub type BoxedError = Box<dyn Error + Send + Sync>;
