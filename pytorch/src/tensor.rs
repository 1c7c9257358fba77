//! The proxy tensor: what flows through a traced `forward` instead of data.
use crate::hooks::NodeSpec;
use crate::index::{Idx, StridedSlice};
use crate::infer;
use crate::internal::*;
use std::fmt;
use std::rc::{Rc, Weak};

/// A stand-in for a tensor during tracing.
///
/// It knows which node and output port produced it, and its shape as far as
/// it could be inferred. Every operation applied to it records a node in the
/// trace graph and returns a new proxy.
#[derive(Clone)]
pub struct ProxyTensor {
    cx: Weak<TraceContext>,
    node: Option<String>,
    port: usize,
    shape: Shape,
    value: Option<Arc<Tensor>>,
}

impl ProxyTensor {
    pub(crate) fn wired(cx: Weak<TraceContext>, node: String, port: usize, shape: Shape) -> ProxyTensor {
        ProxyTensor { cx, node: Some(node), port, shape, value: None }
    }

    /// A proxy that belongs to no graph.
    pub fn detached(shape: impl Into<Shape>, value: Option<Arc<Tensor>>) -> ProxyTensor {
        ProxyTensor { cx: Weak::new(), node: None, port: 0, shape: shape.into(), value }
    }

    pub(crate) fn with_value(self, value: Option<Arc<Tensor>>) -> ProxyTensor {
        ProxyTensor { value, ..self }
    }

    pub(crate) fn weak_context(&self) -> &Weak<TraceContext> {
        &self.cx
    }

    /// The trace this proxy belongs to.
    pub fn context(&self) -> MoResult<Rc<TraceContext>> {
        match self.cx.upgrade() {
            Some(cx) => Ok(cx),
            None => bail!(TraceError::integrity(format!(
                "No graph found for tensor {}",
                self.node.as_deref().unwrap_or("<detached>")
            ))),
        }
    }

    pub fn node_name(&self) -> Option<&str> {
        self.node.as_deref()
    }

    pub fn port(&self) -> usize {
        self.port
    }

    pub fn dynamic_shape(&self) -> &[Dim] {
        &self.shape
    }

    pub fn shape(&self) -> ShapeValue {
        ShapeValue::new(self.shape.clone())
    }

    /// Python-style `size(dim)`, negative axes allowed.
    pub fn size(&self, axis: i64) -> MoResult<Dim> {
        Ok(self.shape[infer::axis(axis, self.shape.len())?])
    }

    /// Rank.
    pub fn dim(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> Dim {
        volume(&self.shape)
    }

    /// The constant this proxy wraps, if any.
    pub fn value(&self) -> Option<&Arc<Tensor>> {
        self.value.as_ref()
    }

    fn binary(&self, op: BinOp, rhs: Operand, reversed: bool) -> MoResult<ProxyTensor> {
        match rhs {
            Operand::Proxy(other) => {
                let shape = multi_broadcast(&[self.dynamic_shape(), other.dynamic_shape()])?;
                let inputs = if reversed { [other, self.clone()] } else { [self.clone(), other] };
                NodeSpec::new(op.name()).with_output_shape(shape).wire(&inputs)
            }
            Operand::Const(value) => {
                let shape = multi_broadcast(&[self.dynamic_shape(), &*value.dims()])?;
                let mut spec = NodeSpec::new(op.name()).with_attr(op.attr(), value);
                if reversed {
                    spec = spec.with_attr("reversed", true);
                }
                spec.with_output_shape(shape).wire(&[self.clone()])
            }
        }
    }

    pub fn try_add(&self, rhs: impl Into<Operand>) -> MoResult<ProxyTensor> {
        self.binary(BinOp::Add, rhs.into(), false)
    }

    pub fn try_sub(&self, rhs: impl Into<Operand>) -> MoResult<ProxyTensor> {
        self.binary(BinOp::Sub, rhs.into(), false)
    }

    pub fn try_mul(&self, rhs: impl Into<Operand>) -> MoResult<ProxyTensor> {
        self.binary(BinOp::Mul, rhs.into(), false)
    }

    pub fn try_div(&self, rhs: impl Into<Operand>) -> MoResult<ProxyTensor> {
        self.binary(BinOp::Div, rhs.into(), false)
    }

    /// `lhs - self`, for a constant `lhs`.
    pub fn try_rsub(&self, lhs: impl Into<Operand>) -> MoResult<ProxyTensor> {
        self.binary(BinOp::Sub, lhs.into(), true)
    }

    /// `lhs / self`, for a constant `lhs`.
    pub fn try_rdiv(&self, lhs: impl Into<Operand>) -> MoResult<ProxyTensor> {
        self.binary(BinOp::Div, lhs.into(), true)
    }

    /// `self[key]`, as a `StridedSlice` node.
    pub fn slice(&self, key: &[Idx]) -> MoResult<ProxyTensor> {
        let ss = StridedSlice::compute(&self.shape, key)
            .with_context(|| format!("Indexing [{}]", self.shape.iter().join(",")))?;
        NodeSpec::new("StridedSlice")
            .with_attr("begin_mask", ss.begin_mask)
            .with_attr("end_mask", ss.end_mask)
            .with_attr("shrink_axis_mask", ss.shrink_axis_mask)
            .with_attr("new_axis_mask", tvec![0i64; key.len()])
            .with_attr("ellipsis_mask", tvec![0i64; key.len()])
            .with_param("begin_id", tensor1(&ss.begin))
            .with_param("end_id", tensor1(&ss.end))
            .with_output_shape(ss.output_shape)
            .wire(&[self.clone()])
    }

    pub fn view(&self, shape: &[i64]) -> MoResult<ProxyTensor> {
        let resolved = infer::reshape(&self.shape, shape)?;
        let dims: TVec<i64> = resolved.iter().map(|d| d.as_i64().unwrap_or(-1)).collect();
        NodeSpec::new("Reshape").with_attr("shape", dims).with_output_shape(resolved).wire(&[self.clone()])
    }

    pub fn reshape(&self, shape: &[i64]) -> MoResult<ProxyTensor> {
        self.view(shape)
    }

    pub fn permute(&self, order: &[usize]) -> MoResult<ProxyTensor> {
        let shape = infer::permute(&self.shape, order)?;
        NodeSpec::new("Transpose").with_attr("order", order).with_output_shape(shape).wire(&[self.clone()])
    }

    pub fn transpose(&self, a: i64, b: i64) -> MoResult<ProxyTensor> {
        let a = infer::axis(a, self.dim())?;
        let b = infer::axis(b, self.dim())?;
        let mut order: TVec<usize> = (0..self.dim()).collect();
        order.swap(a, b);
        self.permute(&order)
    }

    /// Equal chunks of `size` along `axis`, as one multi-output `Split` node.
    pub fn split(&self, size: i64, axis: i64) -> MoResult<TVec<ProxyTensor>> {
        let axis = infer::axis(axis, self.dim())?;
        let (num_splits, shape) = infer::split(&self.shape, size, axis)?;
        NodeSpec::new("Split")
            .with_attr("axis", axis)
            .with_attr("num_splits", num_splits)
            .with_output_shapes(tvec![shape; num_splits])
            .wire_multi(&[self.clone()], num_splits)
    }

    /// No-op: proxies have no memory layout.
    pub fn contiguous(&self) -> ProxyTensor {
        self.clone()
    }

    pub fn sigmoid(&self) -> MoResult<ProxyTensor> {
        NodeSpec::new("Sigmoid").wire(&[self.clone()])
    }

    pub fn softmax(&self, dim: i64) -> MoResult<ProxyTensor> {
        let dim = infer::axis(dim, self.dim())?;
        NodeSpec::new("Softmax").with_attr("dim", dim).wire(&[self.clone()])
    }

    pub fn sqrt(&self) -> MoResult<ProxyTensor> {
        NodeSpec::new("Sqrt").wire(&[self.clone()])
    }

    pub fn log(&self) -> MoResult<ProxyTensor> {
        NodeSpec::new("Log").wire(&[self.clone()])
    }

    pub fn floor(&self) -> MoResult<ProxyTensor> {
        NodeSpec::new("Floor").wire(&[self.clone()])
    }

    pub fn clamp(&self, min: f64, max: f64) -> MoResult<ProxyTensor> {
        ensure!(min <= max, "Clamp to an empty range [{}, {}]", min, max);
        NodeSpec::new("Clamp").with_attr("min", min).with_attr("max", max).wire(&[self.clone()])
    }

    /// Elementwise comparison against a constant.
    pub fn eq_scalar(&self, value: impl Into<Operand>) -> MoResult<ProxyTensor> {
        let Operand::Const(value) = value.into() else {
            bail!("eq_scalar expects a constant")
        };
        let shape = multi_broadcast(&[self.dynamic_shape(), &*value.dims()])?;
        NodeSpec::new("Equal").with_attr("value", value).with_output_shape(shape).wire(&[self.clone()])
    }

    /// Element type conversion.
    pub fn to(&self, dt: DatumType) -> MoResult<ProxyTensor> {
        NodeSpec::new("Convert").with_attr("dtype", dt.ir_name()).wire(&[self.clone()])
    }

    pub fn flatten(&self, start: i64, end: i64) -> MoResult<ProxyTensor> {
        crate::functional::flatten(self, start, end)
    }

    pub fn unsqueeze(&self, dim: i64) -> MoResult<ProxyTensor> {
        crate::functional::unsqueeze(self, dim)
    }
}

impl fmt::Debug for ProxyTensor {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "{}:{} [{}]",
            self.node.as_deref().unwrap_or("<detached>"),
            self.port,
            self.shape.iter().join(",")
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinOp {
    pub fn name(&self) -> &'static str {
        match self {
            BinOp::Add => "Add",
            BinOp::Sub => "Sub",
            BinOp::Mul => "Mul",
            BinOp::Div => "Div",
        }
    }

    /// Attribute name of an embedded constant operand.
    pub fn attr(&self) -> &'static str {
        match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::Div => "div",
        }
    }
}

/// The other side of a binary operation.
#[derive(Clone, Debug)]
pub enum Operand {
    Proxy(ProxyTensor),
    Const(Arc<Tensor>),
}

impl From<&ProxyTensor> for Operand {
    fn from(it: &ProxyTensor) -> Operand {
        Operand::Proxy(it.clone())
    }
}

impl From<ProxyTensor> for Operand {
    fn from(it: ProxyTensor) -> Operand {
        Operand::Proxy(it)
    }
}

impl From<Tensor> for Operand {
    fn from(it: Tensor) -> Operand {
        Operand::Const(Arc::new(it))
    }
}

impl From<Arc<Tensor>> for Operand {
    fn from(it: Arc<Tensor>) -> Operand {
        Operand::Const(it)
    }
}

impl From<f32> for Operand {
    fn from(it: f32) -> Operand {
        Operand::Const(rctensor0(it))
    }
}

impl From<f64> for Operand {
    fn from(it: f64) -> Operand {
        Operand::Const(rctensor0(it as f32))
    }
}

impl From<i64> for Operand {
    fn from(it: i64) -> Operand {
        Operand::Const(rctensor0(it))
    }
}

impl From<i32> for Operand {
    fn from(it: i32) -> Operand {
        Operand::Const(rctensor0(it as i64))
    }
}

/// Operators cannot return errors: a failure here aborts the trace.
fn traced<T>(result: MoResult<T>) -> T {
    match result {
        Ok(t) => t,
        Err(e) => panic!("Tracing aborted: {e:?}"),
    }
}

macro_rules! bin_op {
    (@reversed $Trait:ident, $method:ident, $op:expr, $($scalar:ty),*) => { $(
        impl std::ops::$Trait<&ProxyTensor> for $scalar {
            type Output = ProxyTensor;
            fn $method(self, rhs: &ProxyTensor) -> ProxyTensor {
                traced(rhs.binary($op, self.into(), true))
            }
        }

        impl std::ops::$Trait<ProxyTensor> for $scalar {
            type Output = ProxyTensor;
            fn $method(self, rhs: ProxyTensor) -> ProxyTensor {
                traced(rhs.binary($op, self.into(), true))
            }
        }
    )* };
    ($Trait:ident, $method:ident, $AssignTrait:ident, $assign:ident, $op:expr) => {
        impl<R: Into<Operand>> std::ops::$Trait<R> for &ProxyTensor {
            type Output = ProxyTensor;
            fn $method(self, rhs: R) -> ProxyTensor {
                traced(self.binary($op, rhs.into(), false))
            }
        }

        impl<R: Into<Operand>> std::ops::$Trait<R> for ProxyTensor {
            type Output = ProxyTensor;
            fn $method(self, rhs: R) -> ProxyTensor {
                traced(self.binary($op, rhs.into(), false))
            }
        }

        bin_op!(@reversed $Trait, $method, $op, f32, f64);

        impl<R: Into<Operand>> std::ops::$AssignTrait<R> for ProxyTensor {
            fn $assign(&mut self, rhs: R) {
                *self = traced(self.binary($op, rhs.into(), false))
            }
        }
    };
}

bin_op!(Add, add, AddAssign, add_assign, BinOp::Add);
bin_op!(Sub, sub, SubAssign, sub_assign, BinOp::Sub);
bin_op!(Mul, mul, MulAssign, mul_assign, BinOp::Mul);
bin_op!(Div, div, DivAssign, div_assign, BinOp::Div);
