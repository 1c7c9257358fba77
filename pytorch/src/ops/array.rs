use super::typed;
use crate::internal::*;

pub fn register_all_ops(reg: &mut ExtractorRegistry) -> MoResult<()> {
    reg.insert("StridedSlice", strided_slice)?;
    reg.insert("Reshape", |node| Ok(Some(typed("Reshape").with("dim", node.module.get_ints("shape")?))))?;
    reg.insert("Transpose", |node| {
        Ok(Some(typed("Transpose").with("order", node.module.get_ints("order")?)))
    })?;
    reg.insert("Split", split)?;
    reg.insert("Concat", |node| Ok(Some(typed("Concat").with("axis", node.module.get_int("dim")?))))?;
    reg.insert("Stack", |node| Ok(Some(typed("Pack").with("axis", node.module.get_int("dim")?))))?;
    reg.insert("Unsqueeze", |_| Ok(Some(typed("Unsqueeze"))))?;
    reg.insert("Flatten", flatten)?;
    reg.insert("Convert", |node| {
        Ok(Some(typed("Convert").with("destination_type", node.module.get_str("dtype")?)))
    })?;
    reg.insert("TopK", topk)?;
    reg.insert("Gather", |node| Ok(Some(typed("Gather").with("axis", node.module.get_int("dim")?))))?;
    reg.insert("Where", |_| Ok(Some(typed("Select"))))?;
    Ok(())
}

fn strided_slice(node: &Node) -> MoResult<Option<Attrs>> {
    let mut attrs = typed("StridedSlice");
    for mask in ["begin_mask", "end_mask", "shrink_axis_mask", "new_axis_mask", "ellipsis_mask"] {
        attrs.insert(mask, node.module.get_ints(mask)?);
    }
    Ok(Some(attrs))
}

fn split(node: &Node) -> MoResult<Option<Attrs>> {
    Ok(Some(
        typed("Split")
            .with("axis", node.module.get_int("axis")?)
            .with("num_splits", node.module.get_int("num_splits")?),
    ))
}

fn flatten(node: &Node) -> MoResult<Option<Attrs>> {
    Ok(Some(
        typed("Flatten")
            .with("axis", node.module.get_int("start_dim")?)
            .with("end_axis", node.module.get_int("end_dim")?),
    ))
}

fn topk(node: &Node) -> MoResult<Option<Attrs>> {
    let largest = node.module.get_opt_bool("largest")?.unwrap_or(true);
    let sorted = node.module.get_opt_bool("sorted")?.unwrap_or(true);
    Ok(Some(
        typed("TopK")
            .with("axis", node.module.get_int("dim")?)
            .with("k", node.module.get_int("k")?)
            .with("mode", if largest { "max" } else { "min" })
            .with("sort", if sorted { "value" } else { "none" }),
    ))
}
