use super::{Arg, Args, Function, FunctionTable};
use crate::infer;
use crate::internal::*;
use crate::tensor::Operand;

pub fn register_all_functions(table: &mut FunctionTable) {
    table.insert(Function::Matmul, matmul);
    table.insert(Function::Cat, cat);
    table.insert(Function::Stack, stack);
    table.insert(Function::Where, where_);
    table.insert(Function::Topk, topk);
    table.insert(Function::Gather, gather);
    table.insert(Function::Pow, pow);
    table.insert(Function::Unsqueeze, unsqueeze);
    table.insert(Function::Flatten, flatten);
    table.insert(Function::Rsub, rsub);
}

fn matmul(cx: &TraceContext, args: &Args) -> MoResult<Value> {
    let a = args.tensor(cx, 0)?;
    let b = args.tensor(cx, 1)?;
    let shape = infer::matmul(a.dynamic_shape(), b.dynamic_shape())?;
    Ok(NodeSpec::new("MatMul").with_output_shape(shape).wire(&[a, b])?.into())
}

fn shapes(inputs: &[ProxyTensor]) -> Vec<Shape> {
    inputs.iter().map(|i| i.dynamic_shape().into()).collect()
}

fn cat(cx: &TraceContext, args: &Args) -> MoResult<Value> {
    let inputs = args.tensors(cx, 0)?;
    let Some(first) = inputs.first() else { bail!("cat of an empty list") };
    let dim = infer::axis(args.int(1, 0)?, first.dim())?;
    let shape = infer::concat(&shapes(&inputs), dim as i64)?;
    Ok(NodeSpec::new("Concat").with_attr("dim", dim).with_output_shape(shape).wire(&inputs)?.into())
}

fn stack(cx: &TraceContext, args: &Args) -> MoResult<Value> {
    let inputs = args.tensors(cx, 0)?;
    let Some(first) = inputs.first() else { bail!("stack of an empty list") };
    let dim = infer::axis(args.int(1, 0)?, first.dim() + 1)?;
    let shape = infer::stack(&shapes(&inputs), dim as i64)?;
    Ok(NodeSpec::new("Stack").with_attr("dim", dim).with_output_shape(shape).wire(&inputs)?.into())
}

fn where_(cx: &TraceContext, args: &Args) -> MoResult<Value> {
    let inputs = [args.tensor(cx, 0)?, args.tensor(cx, 1)?, args.tensor(cx, 2)?];
    let shape = multi_broadcast(&shapes(&inputs))?;
    Ok(NodeSpec::new("Where").with_output_shape(shape).wire(&inputs)?.into())
}

fn topk(_cx: &TraceContext, args: &Args) -> MoResult<Value> {
    let x = args.proxy(0)?;
    let Some(k) = args.opt_int(1)? else { bail!("topk without k") };
    let dim = infer::axis(args.int(2, -1)?, x.dim())?;
    let shape = infer::topk(x.dynamic_shape(), k, dim)?;
    let outputs = NodeSpec::new("TopK")
        .with_attr("k", k)
        .with_attr("dim", dim)
        .with_attr("largest", args.bool(3, true)?)
        .with_attr("sorted", args.bool(4, true)?)
        .with_output_shapes(tvec!(shape.clone(), shape))
        .wire_multi(&[x.clone()], 2)?;
    Ok(Value::Tuple(outputs.into_iter().map(Value::from).collect()))
}

fn gather(cx: &TraceContext, args: &Args) -> MoResult<Value> {
    let x = args.tensor(cx, 0)?;
    let dim = infer::axis(args.int(1, 0)?, x.dim())?;
    let index = args.tensor(cx, 2)?;
    let shape = infer::gather(x.dynamic_shape(), index.dynamic_shape(), dim)?;
    Ok(NodeSpec::new("Gather").with_attr("dim", dim).with_output_shape(shape).wire(&[x, index])?.into())
}

fn pow(_cx: &TraceContext, args: &Args) -> MoResult<Value> {
    let x = args.proxy(0)?;
    let exponent = args.float(1, 1.0)?;
    Ok(NodeSpec::new("Pow").with_attr("exponent", exponent).wire(&[x.clone()])?.into())
}

fn unsqueeze(_cx: &TraceContext, args: &Args) -> MoResult<Value> {
    let x = args.proxy(0)?;
    let Some(dim) = args.opt_int(1)? else { bail!("unsqueeze without dim") };
    let shape = infer::unsqueeze(x.dynamic_shape(), dim)?;
    let dim = infer::axis(dim, x.dim() + 1)? as i64;
    Ok(NodeSpec::new("Unsqueeze")
        .with_param("unsqueeze_dims", tensor1(&[dim]))
        .with_output_shape(shape)
        .wire(&[x.clone()])?
        .into())
}

fn flatten(_cx: &TraceContext, args: &Args) -> MoResult<Value> {
    let x = args.proxy(0)?;
    let rank = x.dim().max(1);
    let start = infer::axis(args.int(1, 0)?, rank)?;
    let end = infer::axis(args.int(2, -1)?, rank)?;
    let shape = infer::flatten(x.dynamic_shape(), start as i64, end as i64)?;
    Ok(NodeSpec::new("Flatten")
        .with_attr("start_dim", start)
        .with_attr("end_dim", end)
        .with_output_shape(shape)
        .wire(&[x.clone()])?
        .into())
}

/// `other - x`, `other` usually a constant.
fn rsub(_cx: &TraceContext, args: &Args) -> MoResult<Value> {
    let x = args.proxy(0)?;
    let other = match args.args.get(1) {
        Some(Arg::Tensor(t)) => Operand::Proxy(t.clone()),
        Some(Arg::Native(t)) => Operand::Const(t.clone()),
        Some(Arg::Float(f)) => Operand::from(*f),
        Some(Arg::Int(i)) => Operand::from(*i),
        _ => bail!("rsub: argument 1 should be a tensor or a scalar"),
    };
    Ok(x.try_rsub(other)?.into())
}
