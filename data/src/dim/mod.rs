//! Tensor dimensions, as far as tracing can resolve them.
use crate::internal::*;
use num_integer::Integer;
use std::fmt;
use std::ops;

mod parse;

pub use self::parse::{parse_dim, parse_shape};

/// A tensor dimension.
///
/// Tracing runs once on placeholder inputs, so some dimensions (dynamic batch
/// or spatial sizes) are never resolved. `Unknown` absorbs every arithmetic
/// operation it takes part in.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum Dim {
    Val(i64),
    #[default]
    Unknown,
}

pub type Shape = TVec<Dim>;

use Dim::*;

impl Dim {
    pub fn is_known(&self) -> bool {
        matches!(self, Val(_))
    }

    pub fn is_one(&self) -> bool {
        *self == Val(1)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Val(v) => Some(*v),
            Unknown => None,
        }
    }

    /// Convert to regular integer.
    pub fn to_i64(&self) -> MoResult<i64> {
        self.as_i64().ok_or_else(|| format_err!("Dimension is not resolved"))
    }

    pub fn to_usize(&self) -> MoResult<usize> {
        let v = self.to_i64()?;
        ensure!(v >= 0, "Negative dimension {}", v);
        Ok(v as usize)
    }

    /// Integer division that fails instead of panicking, and refuses to
    /// silently drop a remainder.
    pub fn maybe_div(&self, other: &Dim) -> MoResult<Dim> {
        match (self, other) {
            (_, Val(0)) => bail!("Division by zero"),
            (Val(a), Val(b)) => {
                ensure!(a % b == 0, "Can't divide {} by {}", a, b);
                Ok(Val(a / b))
            }
            _ => Ok(Unknown),
        }
    }

    /// Floor division (rounding towards negative infinity).
    pub fn div_floor(&self, other: i64) -> Dim {
        self.map(|v| Integer::div_floor(&v, &other))
    }

    /// Integer division, rounding up to next integer.
    pub fn div_ceil(&self, other: i64) -> Dim {
        self.map(|v| Integer::div_ceil(&v, &other))
    }

    /// Numpy broadcasting of two dimensions.
    ///
    /// An unresolved dimension broadcast against a resolved one larger than 1
    /// takes its value: it can only be 1 or equal.
    pub fn broadcast(self, other: Dim) -> MoResult<Dim> {
        match (self, other) {
            (a, b) if a == b => Ok(a),
            (a, b) if a.is_one() => Ok(b),
            (a, b) if b.is_one() => Ok(a),
            (Unknown, b) => Ok(b),
            (a, Unknown) => Ok(a),
            (a, b) => bail!("Can not broadcast {} against {}", a, b),
        }
    }

    fn map(self, f: impl FnOnce(i64) -> i64) -> Dim {
        match self {
            Val(v) => Val(f(v)),
            Unknown => Unknown,
        }
    }

    fn zip(self, other: Dim, f: impl FnOnce(i64, i64) -> i64) -> Dim {
        match (self, other) {
            (Val(a), Val(b)) => Val(f(a, b)),
            _ => Unknown,
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Val(v) => write!(fmt, "{v}"),
            Unknown => write!(fmt, "?"),
        }
    }
}

pub trait ToDim {
    fn to_dim(&self) -> Dim;
}

macro_rules! to_dim {
    ($($t:ty),*) => { $(
        impl ToDim for $t {
            fn to_dim(&self) -> Dim {
                Val(*self as i64)
            }
        }

        impl From<$t> for Dim {
            fn from(it: $t) -> Dim {
                it.to_dim()
            }
        }
    )* }
}

to_dim!(i32, i64, u32, usize);

impl ToDim for Dim {
    fn to_dim(&self) -> Dim {
        *self
    }
}

impl<D: ToDim> ToDim for &D {
    fn to_dim(&self) -> Dim {
        (*self).to_dim()
    }
}

macro_rules! dim_op {
    ($Trait:ident, $method:ident, $AssignTrait:ident, $assign:ident, $f:expr) => {
        impl<I: Into<Dim>> ops::$Trait<I> for Dim {
            type Output = Dim;
            fn $method(self, rhs: I) -> Dim {
                self.zip(rhs.into(), $f)
            }
        }

        impl<I: Into<Dim>> ops::$AssignTrait<I> for Dim {
            fn $assign(&mut self, rhs: I) {
                *self = self.zip(rhs.into(), $f)
            }
        }
    };
}

dim_op!(Add, add, AddAssign, add_assign, |a, b| a + b);
dim_op!(Sub, sub, SubAssign, sub_assign, |a, b| a - b);
dim_op!(Mul, mul, MulAssign, mul_assign, |a, b| a * b);
dim_op!(Div, div, DivAssign, div_assign, |a, b| Integer::div_floor(&a, &b));
dim_op!(Rem, rem, RemAssign, rem_assign, |a, b| Integer::mod_floor(&a, &b));

impl ops::Neg for Dim {
    type Output = Dim;
    fn neg(self) -> Dim {
        self.map(|v| -v)
    }
}

impl std::iter::Sum for Dim {
    fn sum<I: Iterator<Item = Dim>>(iter: I) -> Dim {
        iter.fold(Val(0), |acc, d| acc + d)
    }
}

impl std::iter::Product for Dim {
    fn product<I: Iterator<Item = Dim>>(iter: I) -> Dim {
        iter.fold(Val(1), |acc, d| acc * d)
    }
}

impl<'a> std::iter::Product<&'a Dim> for Dim {
    fn product<I: Iterator<Item = &'a Dim>>(iter: I) -> Dim {
        iter.copied().product()
    }
}

/// Number of elements of a shape (1 for a scalar).
pub fn volume(shape: &[Dim]) -> Dim {
    shape.iter().product()
}

/// Build a shape from anything that looks like dimensions.
pub fn to_shape<D: ToDim>(dims: impl IntoIterator<Item = D>) -> Shape {
    dims.into_iter().map(|d| d.to_dim()).collect()
}
