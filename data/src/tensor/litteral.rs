use super::Tensor;
use crate::datum::Datum;
use ndarray::{arr0, arr1, arr2};
use std::sync::Arc;

pub fn tensor0<A: Datum>(x: A) -> Tensor {
    A::wrap(arr0(x).into_dyn())
}

pub fn tensor1<A: Datum>(xs: &[A]) -> Tensor {
    A::wrap(arr1(xs).into_dyn())
}

pub fn tensor2<A: Datum, const N: usize>(xs: &[[A; N]]) -> Tensor {
    A::wrap(arr2(xs).into_dyn())
}

pub fn rctensor0<A: Datum>(x: A) -> Arc<Tensor> {
    Arc::new(tensor0(x))
}

pub fn rctensor1<A: Datum>(xs: &[A]) -> Arc<Tensor> {
    Arc::new(tensor1(xs))
}
