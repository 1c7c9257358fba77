//! Extractors: from traced framework nodes to IR operations.
//!
//! Each one reads the node `op` and the module state captured at trace time,
//! and returns the IR attributes, `type` first among them.
use crate::internal::*;

mod activations;
mod array;
mod detection;
mod math;
mod nn;

/// Every extractor this front-end knows about.
pub fn extractors() -> MoResult<ExtractorRegistry> {
    let mut reg = ExtractorRegistry::default();
    register_all_ops(&mut reg)?;
    Ok(reg)
}

pub fn register_all_ops(reg: &mut ExtractorRegistry) -> MoResult<()> {
    reg.insert("Parameter", parameter)?;
    reg.insert("Const", konst)?;
    reg.insert("Result", |_| Ok(Some(typed("Result"))))?;
    activations::register_all_ops(reg)?;
    array::register_all_ops(reg)?;
    detection::register_all_ops(reg)?;
    math::register_all_ops(reg)?;
    nn::register_all_ops(reg)?;
    Ok(())
}

pub(crate) fn typed(ir_type: &str) -> Attrs {
    Attrs::new().with("type", ir_type)
}

fn parameter(node: &Node) -> MoResult<Option<Attrs>> {
    let shape = node.attrs.get_shape("shape")?;
    let data_type = node.attrs.get_opt_str("data_type")?.unwrap_or("f32").to_string();
    Ok(Some(typed("Parameter").with("shape", shape).with("element_type", data_type)))
}

fn konst(node: &Node) -> MoResult<Option<Attrs>> {
    let value = node.attrs.get_tensor("value")?;
    Ok(Some(typed("Const").with("element_type", value.datum_type().ir_name())))
}
