use super::typed;
use crate::internal::*;
use crate::tensor::BinOp;

pub fn register_all_ops(reg: &mut ExtractorRegistry) -> MoResult<()> {
    reg.insert("Add", |node| binary(node, BinOp::Add))?;
    reg.insert("Sub", |node| binary(node, BinOp::Sub))?;
    reg.insert("Mul", |node| binary(node, BinOp::Mul))?;
    reg.insert("Div", |node| binary(node, BinOp::Div))?;
    reg.insert("Pow", pow)?;
    reg.insert("Equal", equal)?;
    reg.insert("MatMul", |_| {
        Ok(Some(typed("MatMul").with("transpose_a", false).with("transpose_b", false)))
    })?;
    reg.insert("Sqrt", |_| Ok(Some(typed("Sqrt"))))?;
    reg.insert("Log", |_| Ok(Some(typed("Log"))))?;
    reg.insert("Floor", |_| Ok(Some(typed("Floor"))))?;
    reg.insert("Clamp", clamp)?;
    Ok(())
}

/// The IR op is the same whether the second operand is wired or embedded:
/// an embedded constant is carried as `value`.
fn binary(node: &Node, op: BinOp) -> MoResult<Option<Attrs>> {
    let mut attrs = typed(op.name());
    if node.module.contains(op.attr()) {
        attrs.insert("value", node.module.get_tensor(op.attr())?.clone());
        attrs.insert("reversed", node.module.get_opt_bool("reversed")?.unwrap_or(false));
    }
    Ok(Some(attrs))
}

fn pow(node: &Node) -> MoResult<Option<Attrs>> {
    Ok(Some(typed("Power").with("power", node.module.get_float("exponent")?)))
}

fn equal(node: &Node) -> MoResult<Option<Attrs>> {
    let mut attrs = typed("Equal");
    if node.module.contains("value") {
        attrs.insert("value", node.module.get_tensor("value")?.clone());
    }
    Ok(Some(attrs))
}

fn clamp(node: &Node) -> MoResult<Option<Attrs>> {
    Ok(Some(
        typed("Clamp").with("min", node.module.get_float("min")?).with("max", node.module.get_float("max")?),
    ))
}

#[cfg(test)]
mod tests {
    use crate::internal::*;

    #[test]
    fn embedded_operand() {
        let cx = TraceContext::new(FunctionTable::default());
        let x = cx.source("x", to_shape([2]), DatumType::F32).unwrap();
        let y = 2.0 - &x;
        let z = &y * &x;
        let mut graph = cx.take_graph();
        extract_node_attrs(&mut graph, &crate::ops::extractors().unwrap()).unwrap();
        let sub = graph.node(y.node_name().unwrap()).unwrap();
        assert_eq!(sub.ir_type.as_deref(), Some("Sub"));
        assert!(sub.attrs.get_bool("reversed").unwrap());
        assert_eq!(sub.attrs.get_tensor("value").unwrap().to_scalar::<f32>().unwrap(), 2.0);
        let mul = graph.node(z.node_name().unwrap()).unwrap();
        assert!(!mul.attrs.contains("value"));
    }
}
