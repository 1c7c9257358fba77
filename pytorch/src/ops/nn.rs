use super::typed;
use crate::internal::*;

pub fn register_all_ops(reg: &mut ExtractorRegistry) -> MoResult<()> {
    reg.insert("Conv2d", convolution)?;
    reg.insert("Convolution", convolution)?;
    reg.insert("MaxPool2d", |node| pooling(node, "max"))?;
    reg.insert("AvgPool2d", |node| pooling(node, "avg"))?;
    reg.insert("AdaptiveAvgPool2d", adaptive_avg_pool)?;
    reg.insert("BatchNorm2d", batch_norm)?;
    reg.insert("InstanceNorm", instance_norm)?;
    reg.insert("LayerNorm", layer_norm)?;
    reg.insert("Linear", |node| fully_connected(node, true))?;
    reg.insert("Addmm", |node| fully_connected(node, false))?;
    reg.insert("Embedding", |_| Ok(Some(typed("Embedding"))))?;
    reg.insert("Upsample", interpolate)?;
    Ok(())
}

fn window(node: &Node, rank: usize) -> MoResult<Attrs> {
    let padding = node.module.get_ints_for_rank("padding", rank)?;
    Ok(Attrs::new()
        .with("strides", node.module.get_ints_for_rank("stride", rank)?)
        .with("dilations", node.module.get_ints_for_rank("dilation", rank)?)
        .with("pads_begin", padding.clone())
        .with("pads_end", padding)
        .with("layout", "NCHW"))
}

fn convolution(node: &Node) -> MoResult<Option<Attrs>> {
    let kernel = node.module.get_ints("kernel_size")?;
    let group = node.module.get_opt_int("groups")?.unwrap_or(1);
    let mut attrs = typed(if group > 1 { "GroupConvolution" } else { "Convolution" });
    attrs.merge(window(node, kernel.len())?);
    Ok(Some(
        attrs
            .with("kernel_spatial", kernel)
            .with("group", group)
            .with("output", node.module.get_int("out_channels")?),
    ))
}

fn pooling(node: &Node, method: &str) -> MoResult<Option<Attrs>> {
    let kernel = node.module.get_ints("kernel_size")?;
    let mut attrs = typed(if method == "max" { "MaxPool" } else { "AvgPool" });
    attrs.merge(window(node, kernel.len())?);
    let ceil = node.module.get_opt_bool("ceil_mode")?.unwrap_or(false);
    attrs.insert("kernel", kernel);
    attrs.insert("pool_method", method);
    attrs.insert("rounding_type", if ceil { "ceil" } else { "floor" });
    if method == "avg" {
        let include_pad = node.module.get_opt_bool("count_include_pad")?.unwrap_or(true);
        attrs.insert("exclude_pad", !include_pad);
    }
    Ok(Some(attrs))
}

fn adaptive_avg_pool(node: &Node) -> MoResult<Option<Attrs>> {
    let size = node.module.get_ints_for_rank("output_size", 2)?;
    Ok(Some(typed("AdaptiveAvgPool").with("output_size", size)))
}

fn batch_norm(node: &Node) -> MoResult<Option<Attrs>> {
    Ok(Some(typed("BatchNormInference").with("epsilon", node.module.get_float("eps")?)))
}

fn instance_norm(node: &Node) -> MoResult<Option<Attrs>> {
    let dims = node.module.get_int("dims")?;
    ensure!(dims > 2, "InstanceNorm over a rank {} input", dims);
    Ok(Some(
        typed("MVN")
            .with("axes", (2..dims).collect::<Vec<i64>>())
            .with("eps", node.module.get_float("eps")?)
            .with("normalize_variance", true)
            .with("eps_mode", "inside_sqrt"),
    ))
}

fn layer_norm(node: &Node) -> MoResult<Option<Attrs>> {
    let normalized = node.module.get_ints("normalized_shape")?;
    let n = normalized.len() as i64;
    Ok(Some(
        typed("MVN")
            .with("axes", (-n..0).collect::<Vec<i64>>())
            .with("eps", node.module.get_float("eps")?)
            .with("normalize_variance", true)
            .with("eps_mode", "inside_sqrt"),
    ))
}

fn fully_connected(node: &Node, transpose_weights: bool) -> MoResult<Option<Attrs>> {
    let mut attrs = typed("FullyConnected").with("transpose_weights", transpose_weights);
    if let Some(out) = node.module.get_opt_int("out_features")? {
        attrs.insert("out-size", out);
    }
    Ok(Some(attrs))
}

fn interpolate(node: &Node) -> MoResult<Option<Attrs>> {
    let mode = match node.module.get_str("mode")? {
        "nearest" => "nearest",
        "linear" | "bilinear" | "trilinear" => "linear",
        "bicubic" => "cubic",
        other => bail!("Unsupported interpolation mode {}", other),
    };
    let dims = node.module.get_int("dims")?;
    let mut attrs = typed("Interpolate")
        .with("mode", mode)
        .with("align_corners", node.module.get_opt_bool("align_corners")?.unwrap_or(false))
        .with("axes", (2..dims).collect::<Vec<i64>>());
    if let Some(size) = node.module.get_opt_ints("size")? {
        attrs.insert("shape_calculation_mode", "sizes");
        attrs.insert("sizes", size);
    } else {
        attrs.insert("shape_calculation_mode", "scales");
        attrs.insert("scales", node.module.get_floats("scale_factor")?);
    }
    Ok(Some(attrs))
}
