use super::typed;
use crate::internal::*;

pub fn register_all_ops(reg: &mut ExtractorRegistry) -> MoResult<()> {
    reg.insert("ReLU", |_| Ok(Some(typed("ReLU"))))?;
    reg.insert("Sigmoid", |_| Ok(Some(typed("Sigmoid"))))?;
    reg.insert("Tanh", |_| Ok(Some(typed("Tanh"))))?;
    reg.insert("LeakyReLU", leaky_relu)?;
    reg.insert("Softmax", softmax)?;
    reg.insert("Dropout", |_| Ok(Some(typed("Identity"))))?;
    reg.insert("Identity", |_| Ok(Some(typed("Identity"))))?;
    Ok(())
}

fn leaky_relu(node: &Node) -> MoResult<Option<Attrs>> {
    let slope = node.module.get_opt_float("negative_slope")?.unwrap_or(0.01);
    Ok(Some(typed("LeakyReLU").with("negative_slope", slope)))
}

fn softmax(node: &Node) -> MoResult<Option<Attrs>> {
    Ok(Some(typed("SoftMax").with("axis", node.module.get_int("dim")?)))
}
