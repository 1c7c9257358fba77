use crate::internal::*;
use std::fmt;
use std::ops::{Add, Index, RangeBounds};

/// The value of `tensor.shape()`.
///
/// Arithmetic and indexing on shape values happen at trace time and never
/// produce graph nodes: `x.shape()[2]` is just a `Dim`.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ShapeValue(Shape);

impl ShapeValue {
    pub fn new(dims: impl Into<Shape>) -> ShapeValue {
        ShapeValue(dims.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Python-style access: negative indices count from the end.
    pub fn get(&self, ix: i64) -> MoResult<Dim> {
        let canonical = crate::infer::axis(ix, self.len())?;
        Ok(self.0[canonical])
    }

    pub fn slice(&self, range: impl RangeBounds<usize>) -> ShapeValue {
        use std::ops::Bound::*;
        let start = match range.start_bound() {
            Included(&s) => s,
            Excluded(&s) => s + 1,
            Unbounded => 0,
        };
        let end = match range.end_bound() {
            Included(&e) => e + 1,
            Excluded(&e) => e,
            Unbounded => self.len(),
        };
        let end = end.min(self.len());
        ShapeValue(if start < end { self.0[start..end].into() } else { tvec!() })
    }

    /// Tuple concatenation.
    pub fn concat(&self, other: impl AsRef<[Dim]>) -> ShapeValue {
        ShapeValue(self.0.iter().chain(other.as_ref().iter()).copied().collect())
    }

    pub fn volume(&self) -> Dim {
        volume(&self.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dim> {
        self.0.iter()
    }

    pub fn dims(&self) -> &[Dim] {
        &self.0
    }

    /// All dimensions as integers, failing on unresolved ones.
    pub fn to_i64s(&self) -> MoResult<TVec<i64>> {
        self.0.iter().map(|d| d.to_i64()).collect()
    }
}

impl AsRef<[Dim]> for ShapeValue {
    fn as_ref(&self) -> &[Dim] {
        &self.0
    }
}

impl Index<usize> for ShapeValue {
    type Output = Dim;
    fn index(&self, ix: usize) -> &Dim {
        &self.0[ix]
    }
}

impl<R: AsRef<[Dim]>> Add<R> for &ShapeValue {
    type Output = ShapeValue;
    fn add(self, rhs: R) -> ShapeValue {
        self.concat(rhs)
    }
}

impl<R: AsRef<[Dim]>> Add<R> for ShapeValue {
    type Output = ShapeValue;
    fn add(self, rhs: R) -> ShapeValue {
        self.concat(rhs)
    }
}

impl From<ShapeValue> for Shape {
    fn from(it: ShapeValue) -> Shape {
        it.0
    }
}

impl fmt::Display for ShapeValue {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "[{}]", self.0.iter().join(", "))
    }
}
