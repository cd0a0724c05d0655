//! Deep learning models for tabular data.
//!
//! The models in this crate are built on top of candle. They take a single
//! two-dimensional input tensor where every column is a feature slot and
//! produce a fixed-width representation, so that they can be used as the
//! deep tabular component of a wide and deep model.

pub mod columns;
pub mod error;
pub mod layers;
pub mod models;
pub mod util;
