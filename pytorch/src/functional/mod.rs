//! Interception of the framework's free functions.
//!
//! Tensor methods are implemented on `ProxyTensor` directly. Free functions
//! (convolution, pooling, concatenation, ...) go through a `FunctionTable`:
//! each call is lowered into an `Args` list and dispatched to a handler,
//! which describes the node to emit with a `NodeSpec`.
use crate::internal::*;
use std::collections::HashMap;
use std::fmt;

mod array;
mod nn;

macro_rules! functions {
    ($($variant:ident => $name:expr),* $(,)?) => {
        /// Identity of an intercepted free function.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum Function {
            $($variant),*
        }

        impl Function {
            pub const ALL: &'static [Function] = &[$(Function::$variant),*];

            pub fn name(&self) -> &'static str {
                match self {
                    $(Function::$variant => $name),*
                }
            }
        }
    }
}

functions!(
    AdaptiveAvgPool2d => "adaptive_avg_pool2d",
    AvgPool2d => "avg_pool2d",
    MaxPool2d => "max_pool2d",
    BatchNorm => "batch_norm",
    InstanceNorm => "instance_norm",
    LayerNorm => "layer_norm",
    Interpolate => "interpolate",
    Embedding => "embedding",
    Matmul => "matmul",
    Addmm => "addmm",
    Linear => "linear",
    Cat => "cat",
    Stack => "stack",
    Where => "where",
    Topk => "topk",
    Gather => "gather",
    Conv2d => "conv2d",
    Conv3d => "conv3d",
    Relu => "relu",
    ReluInplace => "relu_",
    LeakyRelu => "leaky_relu",
    Sigmoid => "sigmoid",
    Tanh => "tanh",
    Softmax => "softmax",
    Pow => "pow",
    Unsqueeze => "unsqueeze",
    Flatten => "flatten",
    Rsub => "rsub",
    Dropout => "dropout",
);

impl fmt::Display for Function {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", self.name())
    }
}

/// One argument of an intercepted call.
#[derive(Clone, Debug)]
pub enum Arg {
    Tensor(ProxyTensor),
    /// A framework tensor holding actual data.
    Native(Arc<Tensor>),
    /// A tensor of a type interception knows nothing about.
    Foreign(String),
    Int(i64),
    Float(f64),
    Ints(TVec<i64>),
    Floats(TVec<f64>),
    Bool(bool),
    Str(String),
    List(Vec<Arg>),
    None,
}

impl Arg {
    /// Tensor-like leaves: proxies, native and foreign tensors.
    fn tensor_leaves(&self) -> Vec<&Arg> {
        match self {
            Arg::Tensor(_) | Arg::Native(_) | Arg::Foreign(_) => vec![self],
            Arg::List(items) => items.iter().flat_map(|i| i.tensor_leaves()).collect(),
            _ => vec![],
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Arg::Tensor(_) => "proxy tensor",
            Arg::Native(_) => "tensor",
            Arg::Foreign(_) => "foreign tensor",
            Arg::Int(_) => "int",
            Arg::Float(_) => "float",
            Arg::Ints(_) => "ints",
            Arg::Floats(_) => "floats",
            Arg::Bool(_) => "bool",
            Arg::Str(_) => "string",
            Arg::List(_) => "list",
            Arg::None => "None",
        }
    }
}

macro_rules! arg_from {
    ($($t:ty => |$it:ident| $e:expr),* $(,)?) => { $(
        impl From<$t> for Arg {
            fn from($it: $t) -> Arg {
                $e
            }
        }
    )* }
}

arg_from!(
    ProxyTensor => |it| Arg::Tensor(it),
    &ProxyTensor => |it| Arg::Tensor(it.clone()),
    Tensor => |it| Arg::Native(Arc::new(it)),
    Arc<Tensor> => |it| Arg::Native(it),
    i64 => |it| Arg::Int(it),
    i32 => |it| Arg::Int(it as i64),
    usize => |it| Arg::Int(it as i64),
    f64 => |it| Arg::Float(it),
    f32 => |it| Arg::Float(it as f64),
    bool => |it| Arg::Bool(it),
    &str => |it| Arg::Str(it.to_string()),
    &[i64] => |it| Arg::Ints(it.into()),
    &[f64] => |it| Arg::Floats(it.into()),
    Vec<Arg> => |it| Arg::List(it),
);

impl<A: Into<Arg>> From<Option<A>> for Arg {
    fn from(it: Option<A>) -> Arg {
        it.map(|a| a.into()).unwrap_or(Arg::None)
    }
}

impl From<&[ProxyTensor]> for Arg {
    fn from(it: &[ProxyTensor]) -> Arg {
        Arg::List(it.iter().map(Arg::from).collect())
    }
}

/// Positional arguments of an intercepted call, with typed accessors.
///
/// Missing trailing arguments and `None` fall back to the framework default
/// the accessor is given.
#[derive(Clone, Debug)]
pub struct Args {
    function: Function,
    args: Vec<Arg>,
}

impl Args {
    pub fn new(function: Function, args: Vec<Arg>) -> Args {
        Args { function, args }
    }

    pub fn function(&self) -> Function {
        self.function
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    fn arg(&self, ix: usize) -> Option<&Arg> {
        self.args.get(ix).filter(|a| !matches!(a, Arg::None))
    }

    fn wrong(&self, ix: usize, expected: &str) -> MoError {
        format_err!(
            "{}: argument {} should be {}, got {}",
            self.function,
            ix,
            expected,
            self.args.get(ix).map(|a| a.kind()).unwrap_or("nothing")
        )
    }

    pub fn is_none(&self, ix: usize) -> bool {
        self.arg(ix).is_none()
    }

    pub fn proxy(&self, ix: usize) -> MoResult<&ProxyTensor> {
        match self.arg(ix) {
            Some(Arg::Tensor(t)) => Ok(t),
            _ => Err(self.wrong(ix, "a proxy tensor")),
        }
    }

    pub fn native(&self, ix: usize) -> MoResult<&Arc<Tensor>> {
        match self.arg(ix) {
            Some(Arg::Native(t)) => Ok(t),
            _ => Err(self.wrong(ix, "a tensor")),
        }
    }

    pub fn opt_native(&self, ix: usize) -> MoResult<Option<&Arc<Tensor>>> {
        if self.is_none(ix) { Ok(None) } else { self.native(ix).map(Some) }
    }

    /// A proxy, or a native tensor turned into a `Const` node.
    pub fn tensor(&self, cx: &TraceContext, ix: usize) -> MoResult<ProxyTensor> {
        match self.arg(ix) {
            Some(arg) => coerce(cx, arg).with_context(|| format!("{}: argument {}", self.function, ix)),
            None => Err(self.wrong(ix, "a tensor")),
        }
    }

    /// A list of tensors, natives coerced.
    pub fn tensors(&self, cx: &TraceContext, ix: usize) -> MoResult<TVec<ProxyTensor>> {
        match self.arg(ix) {
            Some(Arg::List(items)) => items.iter().map(|a| coerce(cx, a)).collect(),
            _ => Err(self.wrong(ix, "a list of tensors")),
        }
    }

    pub fn int(&self, ix: usize, default: i64) -> MoResult<i64> {
        match self.arg(ix) {
            None => Ok(default),
            Some(Arg::Int(i)) => Ok(*i),
            Some(Arg::Ints(v)) if v.len() == 1 => Ok(v[0]),
            _ => Err(self.wrong(ix, "an int")),
        }
    }

    pub fn opt_int(&self, ix: usize) -> MoResult<Option<i64>> {
        if self.is_none(ix) { Ok(None) } else { self.int(ix, 0).map(Some) }
    }

    /// An int or a tuple of `rank` ints (`kernel_size=3` vs `(3, 3)`).
    pub fn ints(&self, ix: usize, rank: usize, default: &[i64]) -> MoResult<TVec<i64>> {
        let ints: TVec<i64> = match self.arg(ix) {
            None => default.into(),
            Some(Arg::Int(i)) => tvec![*i; rank],
            Some(Arg::Ints(v)) => v.clone(),
            _ => return Err(self.wrong(ix, "ints")),
        };
        if ints.len() == 1 && rank > 1 {
            return Ok(tvec![ints[0]; rank]);
        }
        ensure!(
            ints.len() == rank,
            "{}: argument {} has {} values, {} expected",
            self.function,
            ix,
            ints.len(),
            rank
        );
        Ok(ints)
    }

    pub fn opt_ints(&self, ix: usize) -> MoResult<Option<TVec<i64>>> {
        match self.arg(ix) {
            None => Ok(None),
            Some(Arg::Int(i)) => Ok(Some(tvec!(*i))),
            Some(Arg::Ints(v)) => Ok(Some(v.clone())),
            _ => Err(self.wrong(ix, "ints")),
        }
    }

    pub fn float(&self, ix: usize, default: f64) -> MoResult<f64> {
        match self.arg(ix) {
            None => Ok(default),
            Some(Arg::Float(f)) => Ok(*f),
            Some(Arg::Int(i)) => Ok(*i as f64),
            _ => Err(self.wrong(ix, "a float")),
        }
    }

    pub fn opt_floats(&self, ix: usize) -> MoResult<Option<TVec<f64>>> {
        match self.arg(ix) {
            None => Ok(None),
            Some(Arg::Float(f)) => Ok(Some(tvec!(*f))),
            Some(Arg::Int(i)) => Ok(Some(tvec!(*i as f64))),
            Some(Arg::Floats(v)) => Ok(Some(v.clone())),
            _ => Err(self.wrong(ix, "floats")),
        }
    }

    pub fn bool(&self, ix: usize, default: bool) -> MoResult<bool> {
        match self.arg(ix) {
            None => Ok(default),
            Some(Arg::Bool(b)) => Ok(*b),
            _ => Err(self.wrong(ix, "a bool")),
        }
    }

    pub fn str(&self, ix: usize, default: &'static str) -> MoResult<String> {
        match self.arg(ix) {
            None => Ok(default.to_string()),
            Some(Arg::Str(s)) => Ok(s.clone()),
            _ => Err(self.wrong(ix, "a string")),
        }
    }

    /// The first proxy among the arguments, which the call is traced on.
    pub fn first_proxy(&self) -> Option<&ProxyTensor> {
        self.args.iter().flat_map(|a| a.tensor_leaves()).find_map(|a| match a {
            Arg::Tensor(t) => Some(t),
            _ => None,
        })
    }
}

fn coerce(cx: &TraceContext, arg: &Arg) -> MoResult<ProxyTensor> {
    match arg {
        Arg::Tensor(t) => Ok(t.clone()),
        Arg::Native(t) => cx.constant(t.clone()),
        Arg::Float(f) => cx.constant(tensor0(*f as f32)),
        Arg::Int(i) => cx.constant(tensor0(*i)),
        other => bail!("Expected a tensor, got {}", other.kind()),
    }
}

pub type Handler = fn(&TraceContext, &Args) -> MoResult<Value>;

/// The outcome of a dispatch.
#[derive(Debug)]
pub enum Dispatch {
    Handled(Value),
    /// Interception declined: the call is left to the framework.
    NotHandled,
}

/// Handlers of the intercepted free functions, one per `Function`.
#[derive(Clone)]
pub struct FunctionTable(HashMap<Function, Handler>);

impl FunctionTable {
    pub fn empty() -> FunctionTable {
        FunctionTable(HashMap::new())
    }

    pub fn insert(&mut self, function: Function, handler: Handler) {
        self.0.insert(function, handler);
    }

    pub fn remove(&mut self, function: Function) -> Option<Handler> {
        self.0.remove(&function)
    }

    pub fn contains(&self, function: Function) -> bool {
        self.0.contains_key(&function)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Intercept a call if its arguments allow it.
    ///
    /// Every tensor-like argument must be a proxy or a native tensor, and at
    /// least one must be a proxy.
    pub fn dispatch(&self, function: Function, args: Vec<Arg>) -> MoResult<Dispatch> {
        let Some(handler) = self.0.get(&function) else { return Ok(Dispatch::NotHandled) };
        let args = Args::new(function, args);
        let leaves = args.args.iter().flat_map(|a| a.tensor_leaves()).collect_vec();
        if leaves.iter().any(|a| matches!(a, Arg::Foreign(_))) {
            trace!("{function}: declined, foreign tensor argument");
            return Ok(Dispatch::NotHandled);
        }
        let Some(proxy) = args.first_proxy() else {
            trace!("{function}: declined, no proxy argument");
            return Ok(Dispatch::NotHandled);
        };
        let cx = proxy.context()?;
        let value = handler(&cx, &args).with_context(|| format!("Intercepting {function}"))?;
        Ok(Dispatch::Handled(value))
    }
}

impl Default for FunctionTable {
    fn default() -> FunctionTable {
        let mut table = FunctionTable::empty();
        nn::register_all_functions(&mut table);
        array::register_all_functions(&mut table);
        table
    }
}

/// Call an intercepted function, failing if interception declines.
pub fn call_function(function: Function, args: Vec<Arg>) -> MoResult<Value> {
    let args = Args::new(function, args);
    let Some(proxy) = args.first_proxy() else {
        bail!(TraceError::unsupported(function.name()))
    };
    let cx = proxy.context()?;
    match cx.functions().dispatch(function, args.args)? {
        Dispatch::Handled(value) => Ok(value),
        Dispatch::NotHandled => bail!(TraceError::unsupported(function.name())),
    }
}

fn call_tensor(function: Function, args: Vec<Arg>) -> MoResult<ProxyTensor> {
    call_function(function, args)?.into_tensor()
}

pub fn adaptive_avg_pool2d(x: &ProxyTensor, output_size: &[i64]) -> MoResult<ProxyTensor> {
    call_tensor(Function::AdaptiveAvgPool2d, vec![x.into(), output_size.into()])
}

pub fn avg_pool2d(
    x: &ProxyTensor,
    kernel_size: &[i64],
    stride: Option<&[i64]>,
    padding: &[i64],
    ceil_mode: bool,
    count_include_pad: bool,
) -> MoResult<ProxyTensor> {
    call_tensor(
        Function::AvgPool2d,
        vec![x.into(), kernel_size.into(), stride.into(), padding.into(), ceil_mode.into(), count_include_pad.into()],
    )
}

pub fn max_pool2d(
    x: &ProxyTensor,
    kernel_size: &[i64],
    stride: Option<&[i64]>,
    padding: &[i64],
    dilation: &[i64],
    ceil_mode: bool,
) -> MoResult<ProxyTensor> {
    call_tensor(
        Function::MaxPool2d,
        vec![x.into(), kernel_size.into(), stride.into(), padding.into(), dilation.into(), ceil_mode.into()],
    )
}

#[allow(clippy::too_many_arguments)]
pub fn batch_norm(
    x: &ProxyTensor,
    running_mean: Arc<Tensor>,
    running_var: Arc<Tensor>,
    weight: Option<Arc<Tensor>>,
    bias: Option<Arc<Tensor>>,
    training: bool,
    momentum: f64,
    eps: f64,
) -> MoResult<ProxyTensor> {
    call_tensor(
        Function::BatchNorm,
        vec![
            x.into(),
            running_mean.into(),
            running_var.into(),
            weight.into(),
            bias.into(),
            training.into(),
            momentum.into(),
            eps.into(),
        ],
    )
}

pub fn instance_norm(
    x: &ProxyTensor,
    weight: Option<Arc<Tensor>>,
    bias: Option<Arc<Tensor>>,
    eps: f64,
) -> MoResult<ProxyTensor> {
    call_tensor(
        Function::InstanceNorm,
        vec![x.into(), Arg::None, Arg::None, weight.into(), bias.into(), true.into(), 0.1.into(), eps.into()],
    )
}

pub fn layer_norm(
    x: &ProxyTensor,
    normalized_shape: &[i64],
    weight: Option<Arc<Tensor>>,
    bias: Option<Arc<Tensor>>,
    eps: f64,
) -> MoResult<ProxyTensor> {
    call_tensor(
        Function::LayerNorm,
        vec![x.into(), normalized_shape.into(), weight.into(), bias.into(), eps.into()],
    )
}

pub fn interpolate(
    x: &ProxyTensor,
    size: Option<&[i64]>,
    scale_factor: Option<&[f64]>,
    mode: &str,
    align_corners: Option<bool>,
) -> MoResult<ProxyTensor> {
    call_tensor(
        Function::Interpolate,
        vec![x.into(), size.into(), scale_factor.into(), mode.into(), align_corners.into()],
    )
}

pub fn embedding(indices: &ProxyTensor, weight: Arc<Tensor>) -> MoResult<ProxyTensor> {
    call_tensor(Function::Embedding, vec![weight.into(), indices.into()])
}

pub fn matmul(a: impl Into<Arg>, b: impl Into<Arg>) -> MoResult<ProxyTensor> {
    call_tensor(Function::Matmul, vec![a.into(), b.into()])
}

/// `bias + mat1 @ mat2`.
pub fn addmm(bias: Arc<Tensor>, mat1: &ProxyTensor, mat2: Arc<Tensor>) -> MoResult<ProxyTensor> {
    call_tensor(Function::Addmm, vec![bias.into(), mat1.into(), mat2.into()])
}

pub fn linear(x: &ProxyTensor, weight: Arc<Tensor>, bias: Option<Arc<Tensor>>) -> MoResult<ProxyTensor> {
    call_tensor(Function::Linear, vec![x.into(), weight.into(), bias.into()])
}

pub fn cat(tensors: Vec<Arg>, dim: i64) -> MoResult<ProxyTensor> {
    call_tensor(Function::Cat, vec![Arg::List(tensors), dim.into()])
}

pub fn stack(tensors: Vec<Arg>, dim: i64) -> MoResult<ProxyTensor> {
    call_tensor(Function::Stack, vec![Arg::List(tensors), dim.into()])
}

pub fn where_(condition: impl Into<Arg>, x: impl Into<Arg>, y: impl Into<Arg>) -> MoResult<ProxyTensor> {
    call_tensor(Function::Where, vec![condition.into(), x.into(), y.into()])
}

/// Values and indices of the `k` largest (or smallest) entries along `dim`.
pub fn topk(
    x: &ProxyTensor,
    k: i64,
    dim: i64,
    largest: bool,
    sorted: bool,
) -> MoResult<(ProxyTensor, ProxyTensor)> {
    let outputs = call_function(Function::Topk, vec![x.into(), k.into(), dim.into(), largest.into(), sorted.into()])?
        .tensors()?;
    match &*outputs {
        [values, indices] => Ok((values.clone(), indices.clone())),
        _ => bail!(TraceError::Arity { op: "TopK".into(), expected: 2, got: outputs.len() }),
    }
}

pub fn gather(x: &ProxyTensor, dim: i64, index: impl Into<Arg>) -> MoResult<ProxyTensor> {
    call_tensor(Function::Gather, vec![x.into(), dim.into(), index.into()])
}

pub fn conv2d(
    x: &ProxyTensor,
    weight: Arc<Tensor>,
    bias: Option<Arc<Tensor>>,
    stride: &[i64],
    padding: &[i64],
    dilation: &[i64],
    groups: i64,
) -> MoResult<ProxyTensor> {
    call_tensor(
        Function::Conv2d,
        vec![x.into(), weight.into(), bias.into(), stride.into(), padding.into(), dilation.into(), groups.into()],
    )
}

pub fn conv3d(
    x: &ProxyTensor,
    weight: Arc<Tensor>,
    bias: Option<Arc<Tensor>>,
    stride: &[i64],
    padding: &[i64],
    dilation: &[i64],
    groups: i64,
) -> MoResult<ProxyTensor> {
    call_tensor(
        Function::Conv3d,
        vec![x.into(), weight.into(), bias.into(), stride.into(), padding.into(), dilation.into(), groups.into()],
    )
}

pub fn relu(x: &ProxyTensor) -> MoResult<ProxyTensor> {
    call_tensor(Function::Relu, vec![x.into()])
}

pub fn relu_(x: &ProxyTensor) -> MoResult<ProxyTensor> {
    call_tensor(Function::ReluInplace, vec![x.into()])
}

pub fn leaky_relu(x: &ProxyTensor, negative_slope: f64) -> MoResult<ProxyTensor> {
    call_tensor(Function::LeakyRelu, vec![x.into(), negative_slope.into()])
}

pub fn sigmoid(x: &ProxyTensor) -> MoResult<ProxyTensor> {
    call_tensor(Function::Sigmoid, vec![x.into()])
}

pub fn tanh(x: &ProxyTensor) -> MoResult<ProxyTensor> {
    call_tensor(Function::Tanh, vec![x.into()])
}

pub fn softmax(x: &ProxyTensor, dim: i64) -> MoResult<ProxyTensor> {
    call_tensor(Function::Softmax, vec![x.into(), dim.into()])
}

pub fn pow(x: &ProxyTensor, exponent: f64) -> MoResult<ProxyTensor> {
    call_tensor(Function::Pow, vec![x.into(), exponent.into()])
}

pub fn unsqueeze(x: &ProxyTensor, dim: i64) -> MoResult<ProxyTensor> {
    call_tensor(Function::Unsqueeze, vec![x.into(), dim.into()])
}

pub fn flatten(x: &ProxyTensor, start_dim: i64, end_dim: i64) -> MoResult<ProxyTensor> {
    call_tensor(Function::Flatten, vec![x.into(), start_dim.into(), end_dim.into()])
}

/// `other - x`.
pub fn rsub(x: &ProxyTensor, other: impl Into<Arg>) -> MoResult<ProxyTensor> {
    call_tensor(Function::Rsub, vec![x.into(), other.into()])
}

pub fn dropout(x: &ProxyTensor, p: f64, training: bool) -> MoResult<ProxyTensor> {
    call_tensor(Function::Dropout, vec![x.into(), p.into(), training.into()])
}
