//! Mask R-CNN: the torchvision detection model, traced through model hooks.
//!
//! Its real `forward` is data dependent (proposal filtering, NMS, per-image
//! loops) and can not be followed by proxies. The hook installed by
//! [`register_hook`] replaces the forward of the model, its region proposal
//! network and its RoI heads with subgraph builders emitting
//! `DetectionOutput` and `ROIAlign` nodes.
use crate::internal::*;

pub mod anchors;
pub mod roi_heads;
pub mod rpn;

pub use anchors::AnchorGenerator;
pub use roi_heads::{FastRCNNPredictor, MultiScaleRoIAlign, RoIHeads, TwoMLPHead};
pub use rpn::{RPNHead, RegionProposalNetwork};

pub const MASK_RCNN_CLASS: &str = "torchvision.models.detection.mask_rcnn.MaskRCNN";

/// Input normalization. Resizing is left to the caller: the traced input
/// shape is the model's input shape.
#[derive(Clone, Debug, PartialEq)]
pub struct GeneralizedRCNNTransform {
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
}

impl Default for GeneralizedRCNNTransform {
    fn default() -> GeneralizedRCNNTransform {
        GeneralizedRCNNTransform { image_mean: [0.485, 0.456, 0.406], image_std: [0.229, 0.224, 0.225] }
    }
}

impl GeneralizedRCNNTransform {
    /// `(x - mean[:, None, None]) / std[:, None, None]`
    pub fn normalize(&self, images: &ProxyTensor) -> MoResult<ProxyTensor> {
        let mean = tensor1(&self.image_mean).into_shape(&[3, 1, 1])?;
        let std = tensor1(&self.image_std).into_shape(&[3, 1, 1])?;
        images.try_sub(mean)?.try_div(std)
    }
}

pub struct MaskRCNN {
    pub transform: GeneralizedRCNNTransform,
    /// Returns an ordered dict of feature maps, finest first.
    pub backbone: Box<dyn Module>,
    pub rpn: RegionProposalNetwork,
    pub roi_heads: RoIHeads,
}

impl TracedOp for MaskRCNN {
    fn type_name(&self) -> &str {
        "MaskRCNN"
    }
}

impl Module for MaskRCNN {
    fn class_name(&self) -> &str {
        MASK_RCNN_CLASS
    }

    fn children(&self) -> Vec<&dyn Module> {
        vec![&*self.backbone, &self.rpn, &self.roi_heads]
    }

    fn forward(&self, _cx: &TraceContext, _inputs: &[Value]) -> MoResult<Value> {
        bail!(TraceError::unsupported(format!("{} without its model hook", MASK_RCNN_CLASS)))
    }
}

/// Model hook: swap the data dependent forwards for graph builders.
pub fn register_hook(module: &dyn Module, cx: &TraceContext) -> MoResult<()> {
    let model = module
        .downcast_ref::<MaskRCNN>()
        .with_context(|| format!("{} hook applied to {}", MASK_RCNN_CLASS, module.type_name()))?;
    cx.override_forward(model, model_forward)?;
    cx.override_forward(&model.rpn, rpn::forward)?;
    cx.override_forward(&model.roi_heads, roi_heads::forward)?;
    Ok(())
}

fn model_forward(module: &dyn Module, cx: &TraceContext, inputs: &[Value]) -> MoResult<Value> {
    let model = module.downcast_ref::<MaskRCNN>().context("Expected a MaskRCNN")?;
    let [images] = inputs else {
        bail!(TraceError::Arity { op: "MaskRCNN".into(), expected: 1, got: inputs.len() })
    };
    let images = model.transform.normalize(images.tensor()?)?;
    ensure!(images.dim() == 4, "MaskRCNN expects NCHW images, got {:?}", images);
    let image_size = images.shape().slice(2..);
    let features = cx.call(&*model.backbone, &[images.clone().into()])?;
    let proposals = cx.call(&model.rpn, &[images.into(), features.clone()])?;
    let detections = cx.call(&model.roi_heads, &[features, proposals, image_size.into()])?;
    debug!("MaskRCNN traced: {} nodes", cx.graph().nodes().len());
    Ok(detections)
}

/// Image height and width, which anchors and RoI scales are computed from.
pub(crate) fn image_hw(size: &ShapeValue) -> MoResult<(usize, usize)> {
    ensure!(size.len() == 2, "Image size should be [h, w], got {}", size);
    Ok((size[0].to_usize()?, size[1].to_usize()?))
}

/// The ordered feature maps of a backbone output.
pub(crate) fn feature_maps(features: &Value) -> MoResult<Vec<(String, ProxyTensor)>> {
    match features {
        Value::Dict(items) => {
            items.iter().map(|(name, v)| Ok((name.clone(), v.tensor()?.clone()))).collect()
        }
        Value::Tensor(t) => Ok(vec![("0".to_string(), t.clone())]),
        other => bail!("Backbone should return a dict of feature maps, got {}", other.kind()),
    }
}

/// The detection layer: box decoding, per-class NMS and top-k selection.
///
/// Produces `[1, 1, keep_top_k, 7]` rows of
/// `[image_id, label, confidence, x_min, y_min, x_max, y_max]`.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionOutput {
    pub num_classes: usize,
    pub top_k: usize,
    pub nms_threshold: f64,
    pub confidence_threshold: f64,
    pub background_label_id: i64,
}

impl DetectionOutput {
    pub fn spec(&self) -> NodeSpec {
        NodeSpec::new("DetectionOutput")
            .with_attr("num_classes", self.num_classes)
            .with_attr("top_k", self.top_k)
            .with_attr("keep_top_k", self.top_k)
            .with_attr("nms_threshold", self.nms_threshold)
            .with_attr("confidence_threshold", self.confidence_threshold)
            .with_attr("background_label_id", self.background_label_id)
            .with_attr("code_type", "caffe.PriorBoxParameter.CENTER_SIZE")
            .with_attr("variance_encoded_in_target", true)
            .with_attr("clip_before_nms", true)
            .with_attr("share_location", false)
            .with_attr("normalized", true)
            .with_output_shape(to_shape([1, 1, self.top_k, 7]))
    }

    /// Inputs are box deltas, class scores and prior boxes, in that order.
    pub fn wire(&self, deltas: &ProxyTensor, scores: &ProxyTensor, priors: &ProxyTensor) -> MoResult<ProxyTensor> {
        ensure!(self.top_k > 0, "DetectionOutput keeping no box");
        self.spec().wire(&[deltas.clone(), scores.clone(), priors.clone()])
    }
}

/// Bilinear pooling of fixed size windows over one feature map.
#[derive(Clone, Debug, PartialEq, new)]
pub struct RoIAlign {
    pub output_size: [usize; 2],
    pub spatial_scale: f64,
    pub sampling_ratio: i64,
}

impl RoIAlign {
    /// `[rois, channels, pooled_h, pooled_w]`, every box read from image 0.
    pub fn wire(&self, features: &ProxyTensor, rois: &ProxyTensor) -> MoResult<ProxyTensor> {
        ensure!(features.dim() == 4, "ROIAlign features should be NCHW, got {:?}", features);
        ensure!(rois.dim() == 2, "ROIAlign boxes should be [n, 4], got {:?}", rois);
        let num_rois = rois.dynamic_shape()[0].to_usize().context("ROIAlign needs a known box count")?;
        let cx = features.context()?;
        let batch_indices = cx.constant(Tensor::zeros(DatumType::I32, &[num_rois])?)?;
        let shape: Shape = tvec!(
            rois.dynamic_shape()[0],
            features.dynamic_shape()[1],
            self.output_size[0].into(),
            self.output_size[1].into()
        );
        NodeSpec::new("ROIAlign")
            .with_attr("pooled_h", self.output_size[0])
            .with_attr("pooled_w", self.output_size[1])
            .with_attr("sampling_ratio", self.sampling_ratio)
            .with_attr("mode", "avg")
            .with_attr("spatial_scale", self.spatial_scale)
            .with_output_shape(shape)
            .wire(&[features.clone(), rois.clone(), batch_indices])
    }
}
