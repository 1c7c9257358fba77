//! Constant tensors: weights, buffers, embedded scalars and generated tables.
use crate::internal::*;
use ndarray::{ArrayD, ArrayViewD, Dimension, IxDyn};
use std::fmt;

pub mod litteral;

/// An owned n-dimensional constant.
///
/// The tracer never computes on tensors: they are carried into the graph as
/// `Const` nodes or embedded attributes, so a plain ndarray per datum type is
/// all there is to it.
#[derive(Clone, PartialEq)]
pub enum Tensor {
    Bool(ArrayD<bool>),
    U8(ArrayD<u8>),
    I32(ArrayD<i32>),
    I64(ArrayD<i64>),
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
}

macro_rules! each {
    ($t:expr, $it:ident => $body:expr) => {
        match $t {
            Tensor::Bool($it) => $body,
            Tensor::U8($it) => $body,
            Tensor::I32($it) => $body,
            Tensor::I64($it) => $body,
            Tensor::F32($it) => $body,
            Tensor::F64($it) => $body,
        }
    };
}

impl Tensor {
    /// Create a tensor filled with zeroes.
    pub fn zeros(dt: DatumType, shape: &[usize]) -> MoResult<Tensor> {
        let shape = IxDyn(shape);
        Ok(match dt {
            DatumType::Bool => Tensor::Bool(ArrayD::default(shape)),
            DatumType::U8 => Tensor::U8(ArrayD::zeros(shape)),
            DatumType::I32 => Tensor::I32(ArrayD::zeros(shape)),
            DatumType::I64 => Tensor::I64(ArrayD::zeros(shape)),
            DatumType::F32 => Tensor::F32(ArrayD::zeros(shape)),
            DatumType::F64 => Tensor::F64(ArrayD::zeros(shape)),
            DatumType::F16 => bail!("No constant storage for {:?} tensors", dt),
        })
    }

    /// Create a tensor from a shape and its elements, in row-major order.
    pub fn from_shape<T: Datum>(shape: &[usize], data: &[T]) -> MoResult<Tensor> {
        let array = ArrayD::from_shape_vec(IxDyn(shape), data.to_vec())
            .with_context(|| format!("Building a {:?} tensor of shape {:?}", T::datum_type(), shape))?;
        Ok(T::wrap(array))
    }

    pub fn datum_type(&self) -> DatumType {
        match self {
            Tensor::Bool(_) => DatumType::Bool,
            Tensor::U8(_) => DatumType::U8,
            Tensor::I32(_) => DatumType::I32,
            Tensor::I64(_) => DatumType::I64,
            Tensor::F32(_) => DatumType::F32,
            Tensor::F64(_) => DatumType::F64,
        }
    }

    pub fn shape(&self) -> &[usize] {
        each!(self, it => it.shape())
    }

    pub fn rank(&self) -> usize {
        self.shape().len()
    }

    pub fn len(&self) -> usize {
        each!(self, it => it.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The tensor shape, as traced dimensions.
    pub fn dims(&self) -> Shape {
        to_shape(self.shape())
    }

    pub fn to_array_view<T: Datum>(&self) -> MoResult<ArrayViewD<T>> {
        match T::array(self) {
            Some(array) => Ok(array.view()),
            None => bail!(
                "Tensor datum type error: tensor is {:?}, accessed as {:?}",
                self.datum_type(),
                T::datum_type()
            ),
        }
    }

    pub fn as_slice<T: Datum>(&self) -> MoResult<&[T]> {
        let array = T::array(self).with_context(|| {
            format!("Accessing a {:?} tensor as {:?}", self.datum_type(), T::datum_type())
        })?;
        array.as_slice().context("Tensor is not contiguous")
    }

    pub fn to_scalar<T: Datum>(&self) -> MoResult<T> {
        ensure!(self.len() == 1, "to_scalar called on a tensor of shape {:?}", self.shape());
        Ok(self.as_slice::<T>()?[0])
    }

    /// Reshape, keeping elements in row-major order.
    pub fn into_shape(self, shape: &[usize]) -> MoResult<Tensor> {
        let from = self.shape().to_vec();
        let wrong = || format!("Reshaping a tensor of shape {from:?} to {shape:?}");
        Ok(match self {
            Tensor::Bool(it) => Tensor::Bool(it.into_shape_with_order(IxDyn(shape)).with_context(wrong)?),
            Tensor::U8(it) => Tensor::U8(it.into_shape_with_order(IxDyn(shape)).with_context(wrong)?),
            Tensor::I32(it) => Tensor::I32(it.into_shape_with_order(IxDyn(shape)).with_context(wrong)?),
            Tensor::I64(it) => Tensor::I64(it.into_shape_with_order(IxDyn(shape)).with_context(wrong)?),
            Tensor::F32(it) => Tensor::F32(it.into_shape_with_order(IxDyn(shape)).with_context(wrong)?),
            Tensor::F64(it) => Tensor::F64(it.into_shape_with_order(IxDyn(shape)).with_context(wrong)?),
        })
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{},{:?}", self.shape().iter().join(","), self.datum_type())?;
        if self.len() <= 12 {
            each!(self, it => write!(fmt, " {}", it.iter().join(", ")))?;
        }
        Ok(())
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, fmt)
    }
}

impl<T: Datum, D: Dimension> From<ndarray::Array<T, D>> for Tensor {
    fn from(it: ndarray::Array<T, D>) -> Tensor {
        T::wrap(it.into_dyn())
    }
}

macro_rules! from_scalar {
    ($($t:ty),*) => { $(
        impl From<$t> for Tensor {
            fn from(it: $t) -> Tensor {
                litteral::tensor0(it)
            }
        }
    )* }
}

from_scalar!(bool, u8, i32, i64, f32, f64);

pub trait IntoArcTensor {
    fn into_arc_tensor(self) -> Arc<Tensor>;
}

impl IntoArcTensor for Tensor {
    fn into_arc_tensor(self) -> Arc<Tensor> {
        Arc::new(self)
    }
}

impl IntoArcTensor for Arc<Tensor> {
    fn into_arc_tensor(self) -> Arc<Tensor> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeros() {
        let t = Tensor::zeros(DatumType::I32, &[2, 3]).unwrap();
        assert_eq!(t.shape(), &[2, 3]);
        assert_eq!(t.datum_type(), DatumType::I32);
        assert_eq!(t.as_slice::<i32>().unwrap(), &[0; 6]);
        assert!(Tensor::zeros(DatumType::F16, &[2]).is_err());
    }

    #[test]
    fn from_shape() {
        let t = Tensor::from_shape(&[2, 2], &[1f32, 2., 3., 4.]).unwrap();
        assert_eq!(t.dims(), to_shape([2, 2]));
        assert!(Tensor::from_shape(&[3, 2], &[1f32, 2., 3., 4.]).is_err());
    }

    #[test]
    fn wrong_datum_type() {
        let t = tensor1(&[1i64, 2]);
        assert!(t.as_slice::<f32>().is_err());
        assert!(t.to_array_view::<i64>().is_ok());
    }

    #[test]
    fn scalar() {
        let t = Tensor::from(2.5f32);
        assert_eq!(t.rank(), 0);
        assert_eq!(t.to_scalar::<f32>().unwrap(), 2.5);
    }

    #[test]
    fn reshape() {
        let t = tensor1(&[1f32, 2., 3., 4., 5., 6.]).into_shape(&[1, 2, 3]).unwrap();
        assert_eq!(t.shape(), &[1, 2, 3]);
        assert!(t.into_shape(&[4]).is_err());
    }
}
