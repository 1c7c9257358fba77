use super::typed;
use crate::internal::*;

pub fn register_all_ops(reg: &mut ExtractorRegistry) -> MoResult<()> {
    reg.insert("DetectionOutput", detection_output)?;
    reg.insert("ROIAlign", roi_align)?;
    Ok(())
}

/// The builders already speak IR: their attributes are passed through.
fn detection_output(node: &Node) -> MoResult<Option<Attrs>> {
    for required in ["num_classes", "top_k", "keep_top_k", "nms_threshold", "code_type"] {
        ensure!(node.module.contains(required), "DetectionOutput without {}", required);
    }
    let mut attrs = node.module.clone();
    attrs.insert("type", "DetectionOutput");
    Ok(Some(attrs))
}

fn roi_align(node: &Node) -> MoResult<Option<Attrs>> {
    let mut attrs = typed("ROIAlign");
    attrs.insert("pooled_h", node.module.get_int("pooled_h")?);
    attrs.insert("pooled_w", node.module.get_int("pooled_w")?);
    attrs.insert("sampling_ratio", node.module.get_int("sampling_ratio")?);
    attrs.insert("spatial_scale", node.module.get_float("spatial_scale")?);
    attrs.insert("mode", node.module.get_opt_str("mode")?.unwrap_or("avg").to_string());
    Ok(Some(attrs))
}
