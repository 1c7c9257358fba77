#[macro_use]
mod macros;

/// A Smallvec instantiation with 4 embeddable values.
///
/// Used about everywhere in the tracer, for node inputs and outputs, or
/// tensor dimensions.
pub type TVec<T> = smallvec::SmallVec<[T; 4]>;

pub type MoError = anyhow::Error;
pub type MoResult<T> = anyhow::Result<T>;

pub mod prelude {
    pub use crate::datum::{Datum, DatumType};
    pub use crate::dim::{Dim, Shape, ToDim, parse_shape, to_shape, volume};
    pub use crate::tensor::litteral::*;
    pub use crate::tensor::{IntoArcTensor, Tensor};
    pub use crate::tvec;
    pub use crate::{MoError, MoResult, TVec};
}

pub mod internal {
    pub use crate::broadcast::multi_broadcast;
    pub use crate::prelude::*;
    pub use anyhow::{Context as _, bail, ensure, format_err};
    pub use itertools::Itertools;
    pub use ndarray as mo_ndarray;
    pub use smallvec as mo_smallvec;
    pub use std::sync::Arc;
}

pub use anyhow;

mod broadcast;
mod datum;
mod dim;
mod tensor;
