//! Box and mask heads over RPN proposals.
use super::{DetectionOutput, RoIAlign, feature_maps, image_hw};
use crate::functional;
use crate::internal::*;
use crate::nn::Linear;

/// Assigns each box to the pyramid level matching its size.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LevelMapper {
    pub k_min: i64,
    pub k_max: i64,
    pub canonical_scale: f64,
    pub canonical_level: f64,
    pub eps: f64,
}

impl LevelMapper {
    pub fn new(k_min: i64, k_max: i64) -> LevelMapper {
        LevelMapper { k_min, k_max, canonical_scale: 224.0, canonical_level: 4.0, eps: 1e-6 }
    }

    /// Level of a box of the given area, relative to `k_min`.
    pub fn level(&self, area: f64) -> i64 {
        let level = (self.canonical_level + (area.sqrt() / self.canonical_scale).log2() + self.eps).floor();
        (level as i64).clamp(self.k_min, self.k_max) - self.k_min
    }

    /// [`LevelMapper::level`] as a subgraph, over `[n, 4]` absolute boxes.
    pub fn wire(&self, boxes: &ProxyTensor) -> MoResult<ProxyTensor> {
        let x0 = boxes.slice(&idx![.., 0])?;
        let y0 = boxes.slice(&idx![.., 1])?;
        let x1 = boxes.slice(&idx![.., 2])?;
        let y1 = boxes.slice(&idx![.., 3])?;
        let area = x1.try_sub(&x0)?.try_mul(y1.try_sub(&y0)?)?;
        area.sqrt()?
            .try_div(self.canonical_scale as f32)?
            .log()?
            .try_mul(std::f32::consts::LOG2_E)?
            .try_add((self.canonical_level + self.eps) as f32)?
            .floor()?
            .clamp(self.k_min as f64, self.k_max as f64)?
            .try_sub(self.k_min as f32)?
            .to(DatumType::I64)
    }
}

/// RoI pooling over several feature maps, each box read from the level its
/// size maps to.
#[derive(Clone, Debug, PartialEq)]
pub struct MultiScaleRoIAlign {
    pub featmap_names: Vec<String>,
    pub output_size: [usize; 2],
    pub sampling_ratio: i64,
}

impl MultiScaleRoIAlign {
    pub fn new(featmap_names: &[&str], output_size: usize, sampling_ratio: i64) -> MultiScaleRoIAlign {
        MultiScaleRoIAlign {
            featmap_names: featmap_names.iter().map(|s| s.to_string()).collect(),
            output_size: [output_size; 2],
            sampling_ratio,
        }
    }

    /// Feature maps to pool from, in backbone order.
    fn select<'f>(&self, features: &'f [(String, ProxyTensor)]) -> MoResult<Vec<&'f ProxyTensor>> {
        let maps = features
            .iter()
            .filter(|(name, _)| self.featmap_names.contains(name))
            .map(|(_, f)| f)
            .collect_vec();
        ensure!(
            maps.len() == self.featmap_names.len(),
            "RoI pooling over [{}], backbone has [{}]",
            self.featmap_names.join(","),
            features.iter().map(|(n, _)| n).join(",")
        );
        Ok(maps)
    }

    /// Power of two ratio of each feature map to the image.
    pub fn scales(maps: &[&ProxyTensor], image: (usize, usize)) -> MoResult<Vec<f64>> {
        maps.iter()
            .map(|f| {
                let h = f.size(-2)?.to_usize()? as f64 / image.0 as f64;
                let w = f.size(-1)?.to_usize()? as f64 / image.1 as f64;
                let (h, w) = (h.log2().round().exp2(), w.log2().round().exp2());
                ensure!(h == w, "Feature map {:?} scales height and width differently", f);
                Ok(h)
            })
            .collect()
    }

    /// `[n, channels, h, w]` pooled features for `[n, 4]` normalized boxes.
    pub fn forward(
        &self,
        features: &[(String, ProxyTensor)],
        boxes: &ProxyTensor,
        image: (usize, usize),
    ) -> MoResult<ProxyTensor> {
        let maps = self.select(features)?;
        let scales = Self::scales(&maps, image)?;
        let (h, w) = (image.0 as f32, image.1 as f32);
        let rois = boxes.try_mul(tensor1(&[w, h, w, h]))?;
        let align = |feature: &ProxyTensor, spatial_scale: f64| {
            RoIAlign::new(self.output_size, spatial_scale, self.sampling_ratio).wire(feature, &rois)
        };
        if let ([feature], [scale]) = (&*maps, &*scales) {
            return align(*feature, *scale);
        }
        let (Some(first), Some(last)) = (scales.first(), scales.last()) else {
            bail!("RoI pooling without feature maps")
        };
        let mapper = LevelMapper::new(-first.log2().round() as i64, -last.log2().round() as i64);
        let levels = mapper.wire(&rois)?.reshape(&[-1, 1, 1, 1])?;
        let mut pooled: Option<ProxyTensor> = None;
        for (level, (feature, scale)) in maps.iter().zip(&scales).enumerate() {
            let mask = levels.eq_scalar(level as i64)?.to(DatumType::F32)?;
            let level_features = align(*feature, *scale)?.try_mul(&mask)?;
            pooled = Some(match pooled {
                Some(acc) => acc.try_add(&level_features)?,
                None => level_features,
            });
        }
        pooled.context("RoI pooling without feature maps")
    }
}

/// Two fully connected layers over flattened pooled features.
pub struct TwoMLPHead {
    pub fc6: Linear,
    pub fc7: Linear,
}

impl TwoMLPHead {
    pub fn new(in_channels: usize, representation_size: usize) -> TwoMLPHead {
        TwoMLPHead {
            fc6: Linear::new(in_channels, representation_size),
            fc7: Linear::new(representation_size, representation_size),
        }
    }
}

impl TracedOp for TwoMLPHead {
    fn type_name(&self) -> &str {
        "TwoMLPHead"
    }
}

impl Module for TwoMLPHead {
    fn class_name(&self) -> &str {
        "torchvision.models.detection.faster_rcnn.TwoMLPHead"
    }

    fn children(&self) -> Vec<&dyn Module> {
        vec![&self.fc6, &self.fc7]
    }

    fn forward(&self, cx: &TraceContext, inputs: &[Value]) -> MoResult<Value> {
        let [x] = inputs else { bail!(TraceError::Arity { op: "TwoMLPHead".into(), expected: 1, got: inputs.len() }) };
        let x = x.tensor()?.flatten(1, -1)?;
        let x = functional::relu(cx.call(&self.fc6, &[x.into()])?.tensor()?)?;
        let x = functional::relu(cx.call(&self.fc7, &[x.into()])?.tensor()?)?;
        Ok(x.into())
    }
}

/// Class logits and per-class box deltas.
pub struct FastRCNNPredictor {
    pub cls_score: Linear,
    pub bbox_pred: Linear,
}

impl FastRCNNPredictor {
    pub fn new(in_channels: usize, num_classes: usize) -> FastRCNNPredictor {
        FastRCNNPredictor {
            cls_score: Linear::new(in_channels, num_classes),
            bbox_pred: Linear::new(in_channels, num_classes * 4),
        }
    }

    pub fn num_classes(&self) -> usize {
        self.cls_score.out_features
    }
}

impl TracedOp for FastRCNNPredictor {
    fn type_name(&self) -> &str {
        "FastRCNNPredictor"
    }
}

impl Module for FastRCNNPredictor {
    fn class_name(&self) -> &str {
        "torchvision.models.detection.faster_rcnn.FastRCNNPredictor"
    }

    fn children(&self) -> Vec<&dyn Module> {
        vec![&self.cls_score, &self.bbox_pred]
    }

    fn forward(&self, cx: &TraceContext, inputs: &[Value]) -> MoResult<Value> {
        let [x] = inputs else {
            bail!(TraceError::Arity { op: "FastRCNNPredictor".into(), expected: 1, got: inputs.len() })
        };
        let x = Value::from(x.tensor()?.flatten(1, -1)?);
        let scores = cx.call(&self.cls_score, std::slice::from_ref(&x))?;
        let deltas = cx.call(&self.bbox_pred, std::slice::from_ref(&x))?;
        Ok(Value::Tuple(vec![scores, deltas]))
    }
}

pub struct RoIHeads {
    pub box_roi_pool: MultiScaleRoIAlign,
    pub box_head: Box<dyn Module>,
    pub box_predictor: FastRCNNPredictor,
    pub mask_roi_pool: MultiScaleRoIAlign,
    pub mask_head: Box<dyn Module>,
    pub mask_predictor: Box<dyn Module>,
    /// Scaling of `(dx, dy, dw, dh)` box deltas.
    pub box_coder_weights: [f32; 4],
    pub score_thresh: f64,
    pub nms_thresh: f64,
    pub detections_per_img: usize,
}

impl TracedOp for RoIHeads {
    fn type_name(&self) -> &str {
        "RoIHeads"
    }
}

impl Module for RoIHeads {
    fn class_name(&self) -> &str {
        "torchvision.models.detection.roi_heads.RoIHeads"
    }

    fn children(&self) -> Vec<&dyn Module> {
        vec![&*self.box_head, &self.box_predictor, &*self.mask_head, &*self.mask_predictor]
    }

    fn forward(&self, _cx: &TraceContext, _inputs: &[Value]) -> MoResult<Value> {
        bail!(TraceError::unsupported("RoIHeads without its model hook"))
    }
}

/// Detections and masks, as a `{boxes, masks}` dict.
///
/// `boxes` is the raw `[1, 1, detections_per_img, 7]` detection output,
/// `masks` the per-class mask probabilities of each detection.
pub(super) fn forward(module: &dyn Module, cx: &TraceContext, inputs: &[Value]) -> MoResult<Value> {
    let heads = module.downcast_ref::<RoIHeads>().context("Expected RoIHeads")?;
    let [features, proposals, Value::Shape(image_size)] = inputs else {
        bail!(TraceError::integrity("RoIHeads expects features, proposals and the image size"))
    };
    let features = feature_maps(features)?;
    let proposals = proposals.tensor()?;
    let image = image_hw(image_size)?;

    let box_features = heads.box_roi_pool.forward(&features, proposals, image)?;
    let box_features = cx.call(&*heads.box_head, &[box_features.into()])?;
    let predictions = cx.call(&heads.box_predictor, &[box_features])?.tensors()?;
    let [class_logits, box_regression] = &*predictions else {
        bail!(TraceError::Arity { op: "FastRCNNPredictor".into(), expected: 2, got: predictions.len() })
    };

    let priors = proposals.reshape(&[1, 1, -1])?;
    let deltas = box_regression.reshape(&[1, -1, 4])?.try_div(tensor1(&heads.box_coder_weights))?.reshape(&[1, -1])?;
    let scores = class_logits.softmax(1)?.reshape(&[1, -1])?;
    let detections = DetectionOutput {
        num_classes: heads.box_predictor.num_classes(),
        top_k: heads.detections_per_img,
        nms_threshold: heads.nms_thresh,
        confidence_threshold: heads.score_thresh,
        background_label_id: 0,
    }
    .wire(&deltas, &scores, &priors)?;

    let boxes = detections.slice(&idx![0, 0, .., 3..])?;
    let mask_features = heads.mask_roi_pool.forward(&features, &boxes, image)?;
    let mask_features = cx.call(&*heads.mask_head, &[mask_features.into()])?;
    let mask_logits = cx.call(&*heads.mask_predictor, &[mask_features])?;
    let masks = mask_logits.tensor()?.sigmoid()?;
    Ok(Value::Dict(vec![("boxes".to_string(), detections.into()), ("masks".to_string(), masks.into())]))
}
