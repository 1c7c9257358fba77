//! Built-in leaf modules and containers.
//!
//! Parameters are zero-initialized: tracing never reads them, it only
//! materializes them as `Const` nodes. Real values are loaded with the
//! `with_*` setters.
use crate::infer::{self, Window};
use crate::internal::*;
use mo_ndarray::{ArrayD, IxDyn};

fn zeros(shape: &[usize]) -> Arc<Tensor> {
    Arc::new(ArrayD::<f32>::zeros(IxDyn(shape)).into())
}

fn ones(shape: &[usize]) -> Arc<Tensor> {
    Arc::new(ArrayD::<f32>::ones(IxDyn(shape)).into())
}

fn checked(name: &str, current: &Arc<Tensor>, value: impl IntoArcTensor) -> MoResult<Arc<Tensor>> {
    let value = value.into_arc_tensor();
    ensure!(
        value.shape() == current.shape(),
        "{} should be of shape {:?}, got {:?}",
        name,
        current.shape(),
        value.shape()
    );
    Ok(value)
}

/// Captured state of a pooling window.
pub fn window_attrs(window: &Window) -> Attrs {
    Attrs::new()
        .with("kernel_size", window.kernel.clone())
        .with("stride", window.stride.clone())
        .with("padding", window.padding.clone())
        .with("dilation", window.dilation.clone())
        .with("ceil_mode", window.ceil_mode)
}

/// Captured state of a convolution.
pub fn conv_attrs(window: &Window, groups: usize, in_channels: usize, out_channels: usize) -> Attrs {
    let mut attrs = window_attrs(window);
    attrs.remove("ceil_mode");
    attrs
        .with("groups", groups)
        .with("in_channels", in_channels)
        .with("out_channels", out_channels)
}

macro_rules! module {
    ($t:ty, $class:expr) => {
        impl Module for $t {
            fn class_name(&self) -> &str {
                $class
            }
        }
    };
}

#[derive(Clone, Debug)]
pub struct Conv2d {
    pub in_channels: usize,
    pub out_channels: usize,
    pub window: Window,
    pub groups: usize,
    pub weight: Arc<Tensor>,
    pub bias: Option<Arc<Tensor>>,
}

impl Conv2d {
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize) -> Conv2d {
        let k = kernel_size as i64;
        Conv2d {
            in_channels,
            out_channels,
            window: Window {
                kernel: tvec!(k, k),
                stride: tvec!(1, 1),
                padding: tvec!(0, 0),
                dilation: tvec!(1, 1),
                ceil_mode: false,
            },
            groups: 1,
            weight: zeros(&[out_channels, in_channels, kernel_size, kernel_size]),
            bias: Some(zeros(&[out_channels])),
        }
    }

    pub fn with_stride(mut self, stride: i64) -> Conv2d {
        self.window.stride = tvec!(stride, stride);
        self
    }

    pub fn with_padding(mut self, padding: i64) -> Conv2d {
        self.window.padding = tvec!(padding, padding);
        self
    }

    pub fn with_dilation(mut self, dilation: i64) -> Conv2d {
        self.window.dilation = tvec!(dilation, dilation);
        self
    }

    pub fn with_groups(mut self, groups: usize) -> MoResult<Conv2d> {
        ensure!(
            groups > 0 && self.in_channels % groups == 0 && self.out_channels % groups == 0,
            "{} groups for {} -> {} channels",
            groups,
            self.in_channels,
            self.out_channels
        );
        let k = self.weight.shape()[2..].to_vec();
        self.groups = groups;
        self.weight = zeros(&[self.out_channels, self.in_channels / groups, k[0], k[1]]);
        Ok(self)
    }

    pub fn without_bias(mut self) -> Conv2d {
        self.bias = None;
        self
    }

    pub fn with_weight(mut self, weight: impl IntoArcTensor) -> MoResult<Conv2d> {
        self.weight = checked("Conv2d weight", &self.weight, weight)?;
        Ok(self)
    }

    pub fn with_bias(mut self, bias: impl IntoArcTensor) -> MoResult<Conv2d> {
        self.bias = Some(checked("Conv2d bias", &zeros(&[self.out_channels]), bias)?);
        Ok(self)
    }
}

impl TracedOp for Conv2d {
    fn type_name(&self) -> &str {
        "Conv2d"
    }

    fn module_attrs(&self) -> Attrs {
        conv_attrs(&self.window, self.groups, self.in_channels, self.out_channels)
    }

    fn state_dict(&self) -> Vec<(String, Arc<Tensor>)> {
        let mut state = vec![("weight".to_string(), self.weight.clone())];
        if let Some(bias) = &self.bias {
            state.push(("bias".to_string(), bias.clone()));
        }
        state
    }

    fn infer_shapes(&self, inputs: &[ProxyTensor]) -> MoResult<Option<TVec<Shape>>> {
        Ok(Some(tvec!(self.window.conv(inputs[0].dynamic_shape(), self.out_channels)?)))
    }
}
module!(Conv2d, "torch.nn.modules.conv.Conv2d");

#[derive(Clone, Debug)]
pub struct Linear {
    pub in_features: usize,
    pub out_features: usize,
    pub weight: Arc<Tensor>,
    pub bias: Option<Arc<Tensor>>,
}

impl Linear {
    pub fn new(in_features: usize, out_features: usize) -> Linear {
        Linear {
            in_features,
            out_features,
            weight: zeros(&[out_features, in_features]),
            bias: Some(zeros(&[out_features])),
        }
    }

    pub fn without_bias(mut self) -> Linear {
        self.bias = None;
        self
    }

    pub fn with_weight(mut self, weight: impl IntoArcTensor) -> MoResult<Linear> {
        self.weight = checked("Linear weight", &self.weight, weight)?;
        Ok(self)
    }
}

impl TracedOp for Linear {
    fn type_name(&self) -> &str {
        "Linear"
    }

    fn module_attrs(&self) -> Attrs {
        Attrs::new().with("in_features", self.in_features).with("out_features", self.out_features)
    }

    fn state_dict(&self) -> Vec<(String, Arc<Tensor>)> {
        let mut state = vec![("weight".to_string(), self.weight.clone())];
        if let Some(bias) = &self.bias {
            state.push(("bias".to_string(), bias.clone()));
        }
        state
    }

    fn infer_shapes(&self, inputs: &[ProxyTensor]) -> MoResult<Option<TVec<Shape>>> {
        Ok(Some(tvec!(infer::linear(inputs[0].dynamic_shape(), self.in_features, self.out_features)?)))
    }
}
module!(Linear, "torch.nn.modules.linear.Linear");

macro_rules! activation {
    ($name:ident, $class:expr) => {
        #[derive(Clone, Copy, Debug, Default)]
        pub struct $name;

        impl TracedOp for $name {
            fn type_name(&self) -> &str {
                stringify!($name)
            }
        }
        module!($name, $class);
    };
}

activation!(ReLU, "torch.nn.modules.activation.ReLU");
activation!(Sigmoid, "torch.nn.modules.activation.Sigmoid");
activation!(Tanh, "torch.nn.modules.activation.Tanh");
activation!(Identity, "torch.nn.modules.linear.Identity");

#[derive(Clone, Copy, Debug)]
pub struct LeakyReLU {
    pub negative_slope: f64,
}

impl Default for LeakyReLU {
    fn default() -> LeakyReLU {
        LeakyReLU { negative_slope: 0.01 }
    }
}

impl TracedOp for LeakyReLU {
    fn type_name(&self) -> &str {
        "LeakyReLU"
    }

    fn module_attrs(&self) -> Attrs {
        Attrs::new().with("negative_slope", self.negative_slope)
    }
}
module!(LeakyReLU, "torch.nn.modules.activation.LeakyReLU");

#[derive(Clone, Copy, Debug)]
pub struct Softmax {
    pub dim: i64,
}

impl TracedOp for Softmax {
    fn type_name(&self) -> &str {
        "Softmax"
    }

    fn module_attrs(&self) -> Attrs {
        Attrs::new().with("dim", self.dim)
    }
}
module!(Softmax, "torch.nn.modules.activation.Softmax");

#[derive(Clone, Debug)]
pub struct MaxPool2d {
    pub window: Window,
}

impl MaxPool2d {
    /// Stride defaults to the kernel size.
    pub fn new(kernel_size: i64) -> MaxPool2d {
        MaxPool2d {
            window: Window {
                kernel: tvec!(kernel_size, kernel_size),
                stride: tvec!(kernel_size, kernel_size),
                padding: tvec!(0, 0),
                dilation: tvec!(1, 1),
                ceil_mode: false,
            },
        }
    }

    pub fn with_stride(mut self, stride: i64) -> MaxPool2d {
        self.window.stride = tvec!(stride, stride);
        self
    }

    pub fn with_padding(mut self, padding: i64) -> MaxPool2d {
        self.window.padding = tvec!(padding, padding);
        self
    }

    pub fn with_ceil_mode(mut self, ceil_mode: bool) -> MaxPool2d {
        self.window.ceil_mode = ceil_mode;
        self
    }
}

impl TracedOp for MaxPool2d {
    fn type_name(&self) -> &str {
        "MaxPool2d"
    }

    fn module_attrs(&self) -> Attrs {
        window_attrs(&self.window)
    }

    fn infer_shapes(&self, inputs: &[ProxyTensor]) -> MoResult<Option<TVec<Shape>>> {
        Ok(Some(tvec!(self.window.pool(inputs[0].dynamic_shape())?)))
    }
}
module!(MaxPool2d, "torch.nn.modules.pooling.MaxPool2d");

#[derive(Clone, Debug)]
pub struct AvgPool2d {
    pub window: Window,
    pub count_include_pad: bool,
}

impl AvgPool2d {
    pub fn new(kernel_size: i64) -> AvgPool2d {
        AvgPool2d { window: MaxPool2d::new(kernel_size).window, count_include_pad: true }
    }

    pub fn with_stride(mut self, stride: i64) -> AvgPool2d {
        self.window.stride = tvec!(stride, stride);
        self
    }

    pub fn with_padding(mut self, padding: i64) -> AvgPool2d {
        self.window.padding = tvec!(padding, padding);
        self
    }
}

impl TracedOp for AvgPool2d {
    fn type_name(&self) -> &str {
        "AvgPool2d"
    }

    fn module_attrs(&self) -> Attrs {
        window_attrs(&self.window).with("count_include_pad", self.count_include_pad)
    }

    fn infer_shapes(&self, inputs: &[ProxyTensor]) -> MoResult<Option<TVec<Shape>>> {
        Ok(Some(tvec!(self.window.pool(inputs[0].dynamic_shape())?)))
    }
}
module!(AvgPool2d, "torch.nn.modules.pooling.AvgPool2d");

#[derive(Clone, Copy, Debug)]
pub struct AdaptiveAvgPool2d {
    pub output_size: [i64; 2],
}

impl TracedOp for AdaptiveAvgPool2d {
    fn type_name(&self) -> &str {
        "AdaptiveAvgPool2d"
    }

    fn module_attrs(&self) -> Attrs {
        Attrs::new().with("output_size", self.output_size)
    }

    fn infer_shapes(&self, inputs: &[ProxyTensor]) -> MoResult<Option<TVec<Shape>>> {
        Ok(Some(tvec!(infer::adaptive_pool(inputs[0].dynamic_shape(), &self.output_size)?)))
    }
}
module!(AdaptiveAvgPool2d, "torch.nn.modules.pooling.AdaptiveAvgPool2d");

#[derive(Clone, Debug)]
pub struct BatchNorm2d {
    pub num_features: usize,
    pub eps: f64,
    pub momentum: f64,
    pub weight: Arc<Tensor>,
    pub bias: Arc<Tensor>,
    pub running_mean: Arc<Tensor>,
    pub running_var: Arc<Tensor>,
}

impl BatchNorm2d {
    pub fn new(num_features: usize) -> BatchNorm2d {
        BatchNorm2d {
            num_features,
            eps: 1e-5,
            momentum: 0.1,
            weight: ones(&[num_features]),
            bias: zeros(&[num_features]),
            running_mean: zeros(&[num_features]),
            running_var: ones(&[num_features]),
        }
    }

    pub fn with_stats(
        mut self,
        running_mean: impl IntoArcTensor,
        running_var: impl IntoArcTensor,
    ) -> MoResult<BatchNorm2d> {
        self.running_mean = checked("BatchNorm2d running_mean", &self.running_mean, running_mean)?;
        self.running_var = checked("BatchNorm2d running_var", &self.running_var, running_var)?;
        Ok(self)
    }
}

impl TracedOp for BatchNorm2d {
    fn type_name(&self) -> &str {
        "BatchNorm2d"
    }

    fn module_attrs(&self) -> Attrs {
        Attrs::new()
            .with("num_features", self.num_features)
            .with("eps", self.eps)
            .with("momentum", self.momentum)
    }

    fn state_dict(&self) -> Vec<(String, Arc<Tensor>)> {
        vec![
            ("weight".to_string(), self.weight.clone()),
            ("bias".to_string(), self.bias.clone()),
            ("running_mean".to_string(), self.running_mean.clone()),
            ("running_var".to_string(), self.running_var.clone()),
        ]
    }
}
module!(BatchNorm2d, "torch.nn.modules.batchnorm.BatchNorm2d");

#[derive(Clone, Copy, Debug)]
pub struct Dropout {
    pub p: f64,
}

impl TracedOp for Dropout {
    fn type_name(&self) -> &str {
        "Dropout"
    }

    fn module_attrs(&self) -> Attrs {
        Attrs::new().with("p", self.p)
    }
}
module!(Dropout, "torch.nn.modules.dropout.Dropout");

#[derive(Clone, Copy, Debug)]
pub struct Flatten {
    pub start_dim: i64,
    pub end_dim: i64,
}

impl Default for Flatten {
    fn default() -> Flatten {
        Flatten { start_dim: 1, end_dim: -1 }
    }
}

impl TracedOp for Flatten {
    fn type_name(&self) -> &str {
        "Flatten"
    }

    fn module_attrs(&self) -> Attrs {
        Attrs::new().with("start_dim", self.start_dim).with("end_dim", self.end_dim)
    }

    fn infer_shapes(&self, inputs: &[ProxyTensor]) -> MoResult<Option<TVec<Shape>>> {
        Ok(Some(tvec!(infer::flatten(inputs[0].dynamic_shape(), self.start_dim, self.end_dim)?)))
    }
}
module!(Flatten, "torch.nn.modules.flatten.Flatten");

/// Children called in order, each on the output of the previous one.
#[derive(Default)]
pub struct Sequential(pub Vec<Box<dyn Module>>);

impl Sequential {
    pub fn new(modules: Vec<Box<dyn Module>>) -> Sequential {
        Sequential(modules)
    }

    pub fn push(mut self, module: impl Module) -> Sequential {
        self.0.push(Box::new(module));
        self
    }
}

impl TracedOp for Sequential {
    fn type_name(&self) -> &str {
        "Sequential"
    }
}

impl Module for Sequential {
    fn class_name(&self) -> &str {
        "torch.nn.modules.container.Sequential"
    }

    fn children(&self) -> Vec<&dyn Module> {
        self.0.iter().map(|m| &**m).collect()
    }

    fn forward(&self, cx: &TraceContext, inputs: &[Value]) -> MoResult<Value> {
        let mut current = inputs.to_vec();
        for module in &self.0 {
            current = vec![cx.call(&**module, &current)?];
        }
        current.pop().context("Empty Sequential")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn setup(shape: &[i64]) -> (Rc<TraceContext>, ProxyTensor) {
        crate::setup_test_logger();
        let cx = TraceContext::new(FunctionTable::default());
        let x = cx.source("input", to_shape(shape), DatumType::F32).unwrap();
        (cx, x)
    }

    fn hooked_call(cx: &TraceContext, module: &dyn Module, x: &ProxyTensor) -> ProxyTensor {
        cx.hook(module);
        cx.call(module, &[x.into()]).unwrap().into_tensor().unwrap()
    }

    #[test]
    fn pooling_shapes() {
        let (cx, x) = setup(&[1, 8, 7, 7]);
        let y = hooked_call(&cx, &MaxPool2d::new(2), &x);
        assert_eq!(y.dynamic_shape(), &*to_shape([1, 8, 3, 3]));
        let y = hooked_call(&cx, &MaxPool2d::new(2).with_ceil_mode(true), &x);
        assert_eq!(y.dynamic_shape(), &*to_shape([1, 8, 4, 4]));
        let y = hooked_call(&cx, &AdaptiveAvgPool2d { output_size: [1, 1] }, &x);
        assert_eq!(y.dynamic_shape(), &*to_shape([1, 8, 1, 1]));
    }

    #[test]
    fn batch_norm_params() {
        let (cx, x) = setup(&[1, 4, 2, 2]);
        let y = hooked_call(&cx, &BatchNorm2d::new(4), &x);
        assert_eq!(y.dynamic_shape(), x.dynamic_shape());
        let graph = cx.graph();
        let srcs = graph.in_edges(y.node_name().unwrap()).iter().map(|e| e.src.clone()).collect_vec();
        assert_eq!(
            srcs,
            vec![
                "input",
                "BatchNorm2d_0/weight",
                "BatchNorm2d_0/bias",
                "BatchNorm2d_0/running_mean",
                "BatchNorm2d_0/running_var"
            ]
        );
    }

    #[test]
    fn linear_checks_features() {
        let (cx, x) = setup(&[2, 16]);
        let y = hooked_call(&cx, &Linear::new(16, 4), &x);
        assert_eq!(y.dynamic_shape(), &*to_shape([2, 4]));
        let fc = Linear::new(8, 4);
        cx.hook(&fc);
        assert!(cx.call(&fc, &[x.into()]).is_err());
    }

    #[test]
    fn weights_are_shape_checked() {
        assert!(Conv2d::new(3, 8, 3).with_weight(tensor0(1f32)).is_err());
        assert!(Conv2d::new(4, 8, 3).with_groups(3).is_err());
        let conv = Conv2d::new(4, 8, 3).with_groups(2).unwrap();
        assert_eq!(conv.weight.shape(), &[8, 2, 3, 3]);
    }

    #[test]
    fn sequential_chains_children() {
        let (cx, x) = setup(&[1, 3, 8, 8]);
        let model = Sequential::default().push(Conv2d::new(3, 4, 3)).push(ReLU).push(Flatten::default());
        for leaf in crate::module::leaf_modules(&model) {
            cx.hook(leaf);
        }
        let y = cx.call(&model, &[x.into()]).unwrap().into_tensor().unwrap();
        assert_eq!(y.node_name(), Some("Flatten_2"));
        assert_eq!(y.dynamic_shape(), &*to_shape([1, 144]));
    }
}
