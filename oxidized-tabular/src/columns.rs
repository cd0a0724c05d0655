//! Column addressing for tabular inputs.
//!
//! Tabular models receive a single `(batch_size, n_columns)` tensor. A
//! [`ColumnIndex`] maps column names to positions in that tensor.
use std::collections::BTreeMap;

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};

/// Column errors.
#[derive(Debug, Snafu)]
pub enum ColumnError {
    #[snafu(display("Cannot select columns {indices:?}"))]
    Select {
        indices: Vec<usize>,
        source: candle_core::Error,
    },

    #[snafu(display("Unknown column: {name}"))]
    UnknownColumn { name: String },
}

/// Mapping of column names to their positions in the input tensor.
///
/// Deserializes from a JSON object, e.g. `{"age": 0, "education": 1}`.
/// Columns are ordered by name, so serialization is deterministic.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ColumnIndex(BTreeMap<String, usize>);

impl ColumnIndex {
    /// Create a column index from column names in input order.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ColumnIndex(
            names
                .into_iter()
                .enumerate()
                .map(|(idx, name)| (name.into(), idx))
                .collect(),
        )
    }

    /// Whether the index contains the given column.
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Get the position of a column.
    pub fn get(&self, name: &str) -> Result<usize, ColumnError> {
        self.0
            .get(name)
            .copied()
            .context(UnknownColumnSnafu { name })
    }

    /// Get the positions of the given columns, in the given order.
    pub fn indices<S>(&self, names: &[S]) -> Result<Vec<usize>, ColumnError>
    where
        S: AsRef<str>,
    {
        names.iter().map(|name| self.get(name.as_ref())).collect()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The number of columns.
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<S> FromIterator<(S, usize)> for ColumnIndex
where
    S: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (S, usize)>>(iter: T) -> Self {
        ColumnIndex(iter.into_iter().map(|(name, idx)| (name.into(), idx)).collect())
    }
}

/// Gather columns from a `(batch_size, n_columns)` tensor.
///
/// Returns a tensor with shape `(batch_size, indices.len())`.
pub fn select(input: &Tensor, indices: &[usize]) -> Result<Tensor, ColumnError> {
    let index = indices.iter().map(|&idx| idx as u32).collect::<Vec<_>>();
    Tensor::from_vec(index, indices.len(), input.device())
        .and_then(|index| input.index_select(&index, 1))
        .context(SelectSnafu { indices })
}

/// Get a categorical column as `u32` category indices.
///
/// Returns a tensor with shape `(batch_size,)`.
pub fn categorical(input: &Tensor, index: usize) -> Result<Tensor, ColumnError> {
    input
        .narrow(1, index, 1)
        .and_then(|column| column.squeeze(1))
        .and_then(|column| column.to_dtype(DType::U32))
        .context(SelectSnafu {
            indices: vec![index],
        })
}
