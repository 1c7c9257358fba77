use super::{Args, Function, FunctionTable};
use crate::infer::{self, Window};
use crate::internal::*;
use crate::nn::{conv_attrs, window_attrs};
use mo_ndarray::{ArrayD, IxDyn};

pub fn register_all_functions(table: &mut FunctionTable) {
    table.insert(Function::AdaptiveAvgPool2d, adaptive_avg_pool2d);
    table.insert(Function::AvgPool2d, avg_pool2d);
    table.insert(Function::MaxPool2d, max_pool2d);
    table.insert(Function::BatchNorm, batch_norm);
    table.insert(Function::InstanceNorm, instance_norm);
    table.insert(Function::LayerNorm, layer_norm);
    table.insert(Function::Interpolate, interpolate);
    table.insert(Function::Embedding, embedding);
    table.insert(Function::Addmm, addmm);
    table.insert(Function::Linear, linear);
    table.insert(Function::Conv2d, conv);
    table.insert(Function::Conv3d, conv);
    table.insert(Function::Relu, |_, args| unary("ReLU", args));
    table.insert(Function::ReluInplace, |_, args| unary("ReLU", args));
    table.insert(Function::Sigmoid, |_, args| unary("Sigmoid", args));
    table.insert(Function::Tanh, |_, args| unary("Tanh", args));
    table.insert(Function::LeakyRelu, leaky_relu);
    table.insert(Function::Softmax, softmax);
    table.insert(Function::Dropout, dropout);
}

fn unary(op: &str, args: &Args) -> MoResult<Value> {
    Ok(NodeSpec::new(op).wire(&[args.proxy(0)?.clone()])?.into())
}

fn leaky_relu(_cx: &TraceContext, args: &Args) -> MoResult<Value> {
    let x = args.proxy(0)?;
    let slope = args.float(1, 0.01)?;
    Ok(NodeSpec::new("LeakyReLU").with_attr("negative_slope", slope).wire(&[x.clone()])?.into())
}

fn softmax(_cx: &TraceContext, args: &Args) -> MoResult<Value> {
    let x = args.proxy(0)?;
    let Some(dim) = args.opt_int(1)? else { bail!("softmax without an explicit dim") };
    let dim = infer::axis(dim, x.dim())?;
    Ok(NodeSpec::new("Softmax").with_attr("dim", dim).wire(&[x.clone()])?.into())
}

fn dropout(_cx: &TraceContext, args: &Args) -> MoResult<Value> {
    ensure!(!args.bool(2, true)?, "dropout in training mode");
    Ok(args.proxy(0)?.into())
}

fn adaptive_avg_pool2d(_cx: &TraceContext, args: &Args) -> MoResult<Value> {
    let x = args.proxy(0)?;
    let size = args.ints(1, 2, &[])?;
    let shape = infer::adaptive_pool(x.dynamic_shape(), &size)?;
    Ok(NodeSpec::new("AdaptiveAvgPool2d")
        .with_attr("output_size", size)
        .with_output_shape(shape)
        .wire(&[x.clone()])?
        .into())
}

fn pool_window(args: &Args, dilation: Option<usize>, ceil_mode: usize) -> MoResult<Window> {
    let kernel = args.ints(1, 2, &[])?;
    Ok(Window {
        stride: args.ints(2, 2, &kernel)?,
        padding: args.ints(3, 2, &[0])?,
        dilation: match dilation {
            Some(ix) => args.ints(ix, 2, &[1])?,
            None => tvec!(1, 1),
        },
        ceil_mode: args.bool(ceil_mode, false)?,
        kernel,
    })
}

fn avg_pool2d(_cx: &TraceContext, args: &Args) -> MoResult<Value> {
    let x = args.proxy(0)?;
    let window = pool_window(args, None, 4)?;
    let shape = window.pool(x.dynamic_shape())?;
    Ok(NodeSpec::new("AvgPool2d")
        .with_attrs(window_attrs(&window))
        .with_attr("count_include_pad", args.bool(5, true)?)
        .with_output_shape(shape)
        .wire(&[x.clone()])?
        .into())
}

fn max_pool2d(_cx: &TraceContext, args: &Args) -> MoResult<Value> {
    let x = args.proxy(0)?;
    let window = pool_window(args, Some(4), 5)?;
    let shape = window.pool(x.dynamic_shape())?;
    Ok(NodeSpec::new("MaxPool2d")
        .with_attrs(window_attrs(&window))
        .with_output_shape(shape)
        .wire(&[x.clone()])?
        .into())
}

fn filled(len: usize, value: f32) -> Arc<Tensor> {
    Arc::new(ArrayD::from_elem(IxDyn(&[len]), value).into())
}

fn batch_norm(_cx: &TraceContext, args: &Args) -> MoResult<Value> {
    let x = args.proxy(0)?;
    if args.bool(5, false)? {
        bail!("BatchNorm in training mode is not supported")
    }
    let mean = args.native(1)?;
    let var = args.native(2)?;
    let features = mean.len();
    let weight = args.opt_native(3)?.cloned().unwrap_or_else(|| filled(features, 1.0));
    let bias = args.opt_native(4)?.cloned().unwrap_or_else(|| filled(features, 0.0));
    Ok(NodeSpec::new("BatchNorm2d")
        .with_attr("num_features", features)
        .with_attr("momentum", args.float(6, 0.1)?)
        .with_attr("eps", args.float(7, 1e-5)?)
        .with_param("weight", weight)
        .with_param("bias", bias)
        .with_param("running_mean", mean.clone())
        .with_param("running_var", var.clone())
        .wire(&[x.clone()])?
        .into())
}

fn instance_norm(_cx: &TraceContext, args: &Args) -> MoResult<Value> {
    let x = args.proxy(0)?;
    let mut spec = NodeSpec::new("InstanceNorm")
        .with_attr("use_input_stats", args.bool(5, true)?)
        .with_attr("eps", args.float(7, 1e-5)?)
        .with_attr("dims", x.dim());
    if let Some(weight) = args.opt_native(3)? {
        spec = spec.with_param("weight", weight.clone());
    }
    if let Some(bias) = args.opt_native(4)? {
        spec = spec.with_param("bias", bias.clone());
    }
    Ok(spec.wire(&[x.clone()])?.into())
}

fn layer_norm(_cx: &TraceContext, args: &Args) -> MoResult<Value> {
    let x = args.proxy(0)?;
    let normalized = args.opt_ints(1)?.context("layer_norm without normalized_shape")?;
    ensure!(normalized.len() <= x.dim(), "layer_norm over more axes than the input has");
    let mut spec = NodeSpec::new("LayerNorm")
        .with_attr("normalized_shape", normalized)
        .with_attr("eps", args.float(4, 1e-5)?);
    if let Some(weight) = args.opt_native(2)? {
        spec = spec.with_param("weight", weight.clone());
    }
    if let Some(bias) = args.opt_native(3)? {
        spec = spec.with_param("bias", bias.clone());
    }
    Ok(spec.wire(&[x.clone()])?.into())
}

fn interpolate(_cx: &TraceContext, args: &Args) -> MoResult<Value> {
    let x = args.proxy(0)?;
    let size = args.opt_ints(1)?;
    let scale = args.opt_floats(2)?;
    let shape = infer::interpolate(x.dynamic_shape(), size.as_deref(), scale.as_deref())?;
    let mut spec = NodeSpec::new("Upsample")
        .with_attr("mode", args.str(3, "nearest")?)
        .with_attr("align_corners", args.bool(4, false)?)
        .with_attr("dims", x.dim());
    if let Some(size) = size {
        spec = spec.with_attr("size", size);
    }
    if let Some(scale) = scale {
        spec = spec.with_attr("scale_factor", scale);
    }
    Ok(spec.with_output_shape(shape).wire(&[x.clone()])?.into())
}

fn embedding(_cx: &TraceContext, args: &Args) -> MoResult<Value> {
    let weight = args.native(0)?;
    let indices = args.proxy(1)?;
    ensure!(weight.rank() == 2, "Embedding table must be of rank 2, got {:?}", weight.shape());
    let shape: Shape = indices.dynamic_shape().iter().copied().chain([weight.shape()[1].to_dim()]).collect();
    Ok(NodeSpec::new("Embedding")
        .with_param("weight", weight.clone())
        .with_output_shape(shape)
        .wire(&[indices.clone()])?
        .into())
}

fn addmm(_cx: &TraceContext, args: &Args) -> MoResult<Value> {
    let bias = args.native(0)?;
    let mat1 = args.proxy(1)?;
    let mat2 = args.native(2)?;
    ensure!(mat2.rank() == 2, "addmm: mat2 must be of rank 2, got {:?}", mat2.shape());
    let shape = infer::linear(mat1.dynamic_shape(), mat2.shape()[0], mat2.shape()[1])?;
    Ok(NodeSpec::new("Addmm")
        .with_param("weight", mat2.clone())
        .with_param("bias", bias.clone())
        .with_output_shape(shape)
        .wire(&[mat1.clone()])?
        .into())
}

fn linear(_cx: &TraceContext, args: &Args) -> MoResult<Value> {
    let x = args.proxy(0)?;
    let weight = args.native(1)?;
    ensure!(weight.rank() == 2, "linear: weight must be of rank 2, got {:?}", weight.shape());
    let (out_features, in_features) = (weight.shape()[0], weight.shape()[1]);
    let shape = infer::linear(x.dynamic_shape(), in_features, out_features)?;
    let mut spec = NodeSpec::new("Linear")
        .with_attr("in_features", in_features)
        .with_attr("out_features", out_features)
        .with_param("weight", weight.clone());
    if let Some(bias) = args.opt_native(2)? {
        spec = spec.with_param("bias", bias.clone());
    }
    Ok(spec.with_output_shape(shape).wire(&[x.clone()])?.into())
}

fn conv(_cx: &TraceContext, args: &Args) -> MoResult<Value> {
    let x = args.proxy(0)?;
    let weight = args.native(1)?;
    let rank = match args.function() {
        Function::Conv3d => 3,
        _ => 2,
    };
    ensure!(
        weight.rank() == rank + 2,
        "{}: weight must be of rank {}, got {:?}",
        args.function(),
        rank + 2,
        weight.shape()
    );
    let groups = args.int(6, 1)?;
    ensure!(groups > 0, "{}: {} groups", args.function(), groups);
    let groups = groups as usize;
    let out_channels = weight.shape()[0];
    let in_channels = weight.shape()[1] * groups;
    if let Some(Dim::Val(c)) = x.dynamic_shape().get(1) {
        ensure!(*c == in_channels as i64, "Convolution expects {} channels, got {}", in_channels, c);
    }
    let window = Window {
        kernel: weight.shape()[2..].iter().map(|&k| k as i64).collect(),
        stride: args.ints(3, rank, &[1])?,
        padding: args.ints(4, rank, &[0])?,
        dilation: args.ints(5, rank, &[1])?,
        ceil_mode: false,
    };
    let shape = window.conv(x.dynamic_shape(), out_channels)?;
    let mut spec = NodeSpec::new("Convolution")
        .with_attrs(conv_attrs(&window, groups, in_channels, out_channels))
        .with_param("weight", weight.clone());
    if let Some(bias) = args.opt_native(2)? {
        spec = spec.with_param("bias", bias.clone());
    }
    Ok(spec.with_output_shape(shape).wire(&[x.clone()])?.into())
}
