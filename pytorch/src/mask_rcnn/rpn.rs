//! Region proposal network, traced as one `DetectionOutput` per level and a
//! global top-k over their proposals.
use super::{AnchorGenerator, DetectionOutput, feature_maps, image_hw};
use crate::functional::{self, Arg};
use crate::internal::*;
use crate::nn::Conv2d;
use mo_ndarray::s;

/// Objectness and box deltas for every anchor of every level.
pub struct RPNHead {
    pub conv: Conv2d,
    pub cls_logits: Conv2d,
    pub bbox_pred: Conv2d,
}

impl RPNHead {
    pub fn new(in_channels: usize, num_anchors: usize) -> RPNHead {
        RPNHead {
            conv: Conv2d::new(in_channels, in_channels, 3).with_padding(1),
            cls_logits: Conv2d::new(in_channels, num_anchors, 1),
            bbox_pred: Conv2d::new(in_channels, num_anchors * 4, 1),
        }
    }
}

impl TracedOp for RPNHead {
    fn type_name(&self) -> &str {
        "RPNHead"
    }
}

impl Module for RPNHead {
    fn class_name(&self) -> &str {
        "torchvision.models.detection.rpn.RPNHead"
    }

    fn children(&self) -> Vec<&dyn Module> {
        vec![&self.conv, &self.cls_logits, &self.bbox_pred]
    }

    /// One feature map per input, returns `(logits, deltas)`, one of each
    /// per level.
    fn forward(&self, cx: &TraceContext, inputs: &[Value]) -> MoResult<Value> {
        let mut logits = vec![];
        let mut deltas = vec![];
        for feature in inputs {
            let t = cx.call(&self.conv, std::slice::from_ref(feature))?;
            let t = Value::from(functional::relu(t.tensor()?)?);
            logits.push(cx.call(&self.cls_logits, std::slice::from_ref(&t))?);
            deltas.push(cx.call(&self.bbox_pred, std::slice::from_ref(&t))?);
        }
        Ok(Value::Tuple(vec![Value::Tuple(logits), Value::Tuple(deltas)]))
    }
}

pub struct RegionProposalNetwork {
    pub anchor_generator: AnchorGenerator,
    pub head: RPNHead,
    /// Proposals kept per level, and overall.
    pub post_nms_top_n: usize,
    pub nms_thresh: f64,
}

impl RegionProposalNetwork {
    pub fn new(anchor_generator: AnchorGenerator, head: RPNHead) -> RegionProposalNetwork {
        RegionProposalNetwork { anchor_generator, head, post_nms_top_n: 1000, nms_thresh: 0.7 }
    }
}

impl TracedOp for RegionProposalNetwork {
    fn type_name(&self) -> &str {
        "RegionProposalNetwork"
    }
}

impl Module for RegionProposalNetwork {
    fn class_name(&self) -> &str {
        "torchvision.models.detection.rpn.RegionProposalNetwork"
    }

    fn children(&self) -> Vec<&dyn Module> {
        vec![&self.head]
    }

    fn forward(&self, _cx: &TraceContext, _inputs: &[Value]) -> MoResult<Value> {
        bail!(TraceError::unsupported("RegionProposalNetwork without its model hook"))
    }
}

fn dims(t: &ProxyTensor) -> MoResult<TVec<i64>> {
    t.shape().to_i64s().with_context(|| format!("Region proposals need known shapes, got {t:?}"))
}

/// `[N, A*C, H, W]` to `[N, H*W*A, C]`.
fn permute_and_flatten(layer: &ProxyTensor, c: i64) -> MoResult<ProxyTensor> {
    let dims = dims(layer)?;
    let [n, _, h, w] = dims[..] else { bail!("Expected a NCHW prediction, got {:?}", layer) };
    layer.view(&[n, -1, c, h, w])?.permute(&[0, 3, 4, 1, 2])?.reshape(&[n, -1, c])
}

/// All levels' predictions as `[anchors, classes]` scores and `[anchors, 4]`
/// deltas.
pub fn concat_box_prediction_layers(
    logits: &[ProxyTensor],
    deltas: &[ProxyTensor],
) -> MoResult<(ProxyTensor, ProxyTensor)> {
    ensure!(logits.len() == deltas.len(), "{} logits for {} box deltas", logits.len(), deltas.len());
    let mut flat_logits = vec![];
    let mut flat_deltas = vec![];
    for (cls, reg) in logits.iter().zip(deltas) {
        let anchors = dims(reg)?[1] / 4;
        ensure!(anchors > 0, "No anchor in box deltas {:?}", reg);
        let classes = dims(cls)?[1] / anchors;
        flat_logits.push(Arg::from(permute_and_flatten(cls, classes)?));
        flat_deltas.push(Arg::from(permute_and_flatten(reg, 4)?));
    }
    let logits = functional::cat(flat_logits, 1)?.flatten(0, -2)?;
    let deltas = functional::cat(flat_deltas, 1)?.reshape(&[-1, 4])?;
    Ok((logits, deltas))
}

/// Proposals, as `[post_nms_top_n, 4]` boxes normalized to the image size.
pub(super) fn forward(module: &dyn Module, cx: &TraceContext, inputs: &[Value]) -> MoResult<Value> {
    let rpn = module.downcast_ref::<RegionProposalNetwork>().context("Expected a RegionProposalNetwork")?;
    let [images, features] = inputs else {
        bail!(TraceError::Arity { op: "RegionProposalNetwork".into(), expected: 2, got: inputs.len() })
    };
    let image = image_hw(&images.tensor()?.shape().slice(2..))?;
    let features = feature_maps(features)?;
    let maps = features.iter().map(|(_, f)| Value::from(f)).collect_vec();
    let head = cx.call(&rpn.head, &maps)?;
    let [objectness, deltas] = head.items()? else { bail!("RPN head should return logits and deltas") };
    let (objectness, deltas) = (objectness.tensors()?, deltas.tensors()?);

    let grids = features
        .iter()
        .map(|(_, f)| Ok((f.size(-2)?.to_usize()?, f.size(-1)?.to_usize()?)))
        .collect::<MoResult<Vec<_>>>()?;
    let anchors = rpn.anchor_generator.normalized_anchors(image, &grids)?;
    let counts = objectness.iter().map(|o| o.numel().to_usize()).collect::<MoResult<Vec<_>>>()?;
    ensure!(
        counts.iter().sum::<usize>() == anchors.nrows(),
        "{} anchors for {} objectness scores",
        anchors.nrows(),
        counts.iter().sum::<usize>()
    );

    let (objectness, deltas) = concat_box_prediction_layers(&objectness, &deltas)?;
    let objectness = objectness.reshape(&[1, -1])?.sigmoid()?;
    let deltas = deltas.reshape(&[1, -1, 4])?;

    let mut proposals = vec![];
    let mut start = 0;
    for (level, &count) in counts.iter().enumerate() {
        let end = start + count;
        let scores = objectness.slice(&idx![.., start..end])?;
        let level_deltas = deltas.slice(&idx![.., start..end])?.reshape(&[1, -1])?;
        let priors = anchors.slice(s![start..end, ..]).iter().copied().collect_vec();
        let priors = cx.constant(Tensor::from_shape(&[1, 1, 4 * count], &priors)?)?;
        let detection = DetectionOutput {
            num_classes: 1,
            top_k: count.min(rpn.post_nms_top_n),
            nms_threshold: rpn.nms_thresh,
            confidence_threshold: 0.0,
            background_label_id: 2,
        };
        trace!("RPN level {}: {} anchors, keeping {}", level, count, detection.top_k);
        proposals.push(Arg::from(detection.wire(&level_deltas, &scores, &priors)?));
        start = end;
    }

    let proposals = functional::cat(proposals, 2)?;
    let k = proposals.size(2)?.to_i64()?.min(rpn.post_nms_top_n as i64);
    let (_, best) = functional::topk(&proposals.slice(&idx![0, 0, .., 2])?, k, -1, true, true)?;
    let proposals = functional::gather(&proposals, 2, &best)?.reshape(&[-1, 7])?.slice(&idx![.., 3..])?;
    Ok(proposals.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask_rcnn::tests::{prepare, tiny_model};

    #[test]
    fn prediction_layers() {
        crate::setup_test_logger();
        let cx = TraceContext::new(FunctionTable::default());
        let cls = [
            cx.source("cls0", to_shape([1, 3, 4, 4]), DatumType::F32).unwrap(),
            cx.source("cls1", to_shape([1, 3, 2, 2]), DatumType::F32).unwrap(),
        ];
        let reg = [
            cx.source("reg0", to_shape([1, 12, 4, 4]), DatumType::F32).unwrap(),
            cx.source("reg1", to_shape([1, 12, 2, 2]), DatumType::F32).unwrap(),
        ];
        let (logits, deltas) = concat_box_prediction_layers(&cls, &reg).unwrap();
        assert_eq!(logits.dynamic_shape(), &*to_shape([60, 1]));
        assert_eq!(deltas.dynamic_shape(), &*to_shape([60, 4]));
    }

    #[test]
    fn proposals() {
        crate::setup_test_logger();
        let cx = TraceContext::new(FunctionTable::default());
        let model = tiny_model(3);
        prepare(&cx, &model);
        let images = cx.source("input", to_shape([1, 3, 32, 32]), DatumType::F32).unwrap();
        let features = cx.call(&*model.backbone, &[images.clone().into()]).unwrap();
        let proposals = cx.call(&model.rpn, &[images.into(), features]).unwrap().into_tensor().unwrap();
        assert_eq!(proposals.dynamic_shape(), &*to_shape([20, 4]));

        let graph = cx.graph();
        let detections = graph.nodes().iter().filter(|n| n.op == "DetectionOutput").collect_vec();
        assert_eq!(detections.len(), 2);
        for det in &detections {
            assert_eq!(det.module.get_int("top_k").unwrap(), 20);
            assert_eq!(det.module.get_int("background_label_id").unwrap(), 2);
            let priors = &graph.in_edges(&det.name)[2].src;
            assert_eq!(graph.node(priors).unwrap().op, "Const");
        }
        assert_eq!(graph.nodes().iter().filter(|n| n.op == "TopK").count(), 1);
        assert_eq!(graph.nodes().iter().filter(|n| n.op == "Gather").count(), 1);
    }

    #[test]
    fn wrong_arity() {
        let cx = TraceContext::new(FunctionTable::default());
        let model = tiny_model(3);
        crate::mask_rcnn::register_hook(&model, &cx).unwrap();
        let err = cx.call(&model.rpn, &[]).unwrap_err();
        assert!(matches!(err.downcast_ref::<TraceError>(), Some(TraceError::Arity { expected: 2, .. })));
    }
}
