#[macro_use]
extern crate maplit;

use approx::assert_abs_diff_eq;
use mo_pytorch::internal::*;
use mo_pytorch::mask_rcnn::*;
use mo_pytorch::nn::{Conv2d, ReLU, Sequential};

fn setup_test_logger() {
    let _ = env_logger::Builder::from_env("MO_LOG").try_init();
}

/// A two level feature pyramid: strides 2 and 4.
struct Pyramid {
    stem: Conv2d,
    down: Conv2d,
}

impl TracedOp for Pyramid {
    fn type_name(&self) -> &str {
        "Pyramid"
    }
}

impl Module for Pyramid {
    fn children(&self) -> Vec<&dyn Module> {
        vec![&self.stem, &self.down]
    }

    fn forward(&self, cx: &TraceContext, inputs: &[Value]) -> MoResult<Value> {
        let p2 = cx.call(&self.stem, inputs)?;
        let p3 = cx.call(&self.down, std::slice::from_ref(&p2))?;
        Ok(Value::Dict(vec![("p2".to_string(), p2), ("p3".to_string(), p3)]))
    }
}

fn model(num_classes: usize) -> MaskRCNN {
    let channels = 4;
    let anchors = AnchorGenerator { sizes: vec![tvec!(16.), tvec!(32.)], aspect_ratios: vec![tvec!(0.5, 1.0, 2.0); 2] };
    let mut rpn = RegionProposalNetwork::new(anchors, RPNHead::new(channels, 3));
    rpn.post_nms_top_n = 50;
    MaskRCNN {
        transform: GeneralizedRCNNTransform::default(),
        backbone: Box::new(Pyramid {
            stem: Conv2d::new(3, channels, 3).with_stride(2).with_padding(1),
            down: Conv2d::new(channels, channels, 3).with_stride(2).with_padding(1),
        }),
        rpn,
        roi_heads: RoIHeads {
            box_roi_pool: MultiScaleRoIAlign::new(&["p2", "p3"], 7, 2),
            box_head: Box::new(TwoMLPHead::new(channels * 7 * 7, 64)),
            box_predictor: FastRCNNPredictor::new(64, num_classes),
            mask_roi_pool: MultiScaleRoIAlign::new(&["p2", "p3"], 14, 2),
            mask_head: Box::new(
                Sequential::default().push(Conv2d::new(channels, channels, 3).with_padding(1)).push(ReLU),
            ),
            mask_predictor: Box::new(Conv2d::new(channels, num_classes, 1)),
            box_coder_weights: [10., 10., 5., 5.],
            score_thresh: 0.05,
            nms_thresh: 0.5,
            detections_per_img: 25,
        },
    }
}

fn config() -> TraceConfig {
    TraceConfig::single(to_shape([1, 3, 64, 64]))
}

#[test]
fn converts() {
    setup_test_logger();
    let graph = mo_pytorch::pytorch().unwrap().load(&model(5), &config()).unwrap();
    assert!(graph.nodes().iter().all(|n| n.is_typed()));

    let outputs = graph.outputs();
    assert_eq!(outputs.len(), 2);
    let producers = outputs.iter().map(|o| &*graph.node(&graph.in_edges(&o.name)[0].src).unwrap().op).collect_vec();
    assert_eq!(producers, vec!["DetectionOutput", "Sigmoid"]);

    let counts = graph.nodes().iter().filter_map(|n| n.ir_type.as_deref()).counts();
    for (ir_type, count) in hashmap! {
        "DetectionOutput" => 3,
        "ROIAlign" => 4,
        "TopK" => 1,
        "Gather" => 1,
        "Equal" => 4,
        "FullyConnected" => 4,
    } {
        assert_eq!(counts.get(ir_type), Some(&count), "{ir_type}");
    }
}

#[test]
fn detection_parameters() {
    setup_test_logger();
    let graph = mo_pytorch::pytorch().unwrap().load(&model(5), &config()).unwrap();
    let detections = graph.nodes().iter().filter(|n| n.op == "DetectionOutput").collect_vec();
    let (rpn, heads) = (&detections[..2], &detections[2]);

    // 32x32 and 16x16 grids, 3 anchors per cell, 50 kept per level
    for det in rpn {
        assert_eq!(det.attrs.get_int("top_k").unwrap(), 50);
        assert_eq!(det.attrs.get_int("background_label_id").unwrap(), 2);
        assert_eq!(det.attrs.get_float("confidence_threshold").unwrap(), 0.0);
        assert!(!det.attrs.get_bool("share_location").unwrap());
    }
    assert_eq!(heads.attrs.get_int("num_classes").unwrap(), 5);
    assert_eq!(heads.attrs.get_int("keep_top_k").unwrap(), 25);
    assert_eq!(heads.attrs.get_int("background_label_id").unwrap(), 0);
    assert_eq!(heads.attrs.get_float("nms_threshold").unwrap(), 0.5);

    let align = graph.nodes().iter().filter(|n| n.op == "ROIAlign").collect_vec();
    let scales = align.iter().map(|n| n.attrs.get_float("spatial_scale").unwrap()).collect_vec();
    assert_eq!(scales, vec![0.5, 0.25, 0.5, 0.25]);
    assert_eq!(align[2].attrs.get_int("pooled_h").unwrap(), 14);
}

#[test]
fn priors_are_normalized_anchors() {
    setup_test_logger();
    let graph = mo_pytorch::pytorch().unwrap().load(&model(2), &config()).unwrap();
    let det = graph.nodes().iter().find(|n| n.op == "DetectionOutput").unwrap();
    let priors = graph.node(&graph.in_edges(&det.name)[2].src).unwrap();
    let priors = priors.attrs.get_tensor("value").unwrap();
    assert_eq!(priors.shape(), &[1, 1, 32 * 32 * 3 * 4]);
    let priors = priors.as_slice::<f32>().unwrap();
    // first cell, aspect ratio 0.5: [-11, -6, 11, 6] over a 64x64 image
    for (got, expected) in priors[..4].iter().zip([-11., -6., 11., 6.]) {
        assert_abs_diff_eq!(*got, expected / 64., epsilon = 1e-6);
    }
    // last cell of the level, aspect ratio 2.0
    let last = &priors[priors.len() - 4..];
    for (got, expected) in last.iter().zip([62. - 6., 62. - 11., 62. + 6., 62. + 11.]) {
        assert_abs_diff_eq!(*got, expected / 64., epsilon = 1e-6);
    }
}

#[test]
fn model_hook_is_required() {
    setup_test_logger();
    let mut loader = mo_pytorch::pytorch().unwrap();
    loader.model_hooks = Default::default();
    let err = loader.load(&model(2), &config()).unwrap_err();
    assert!(matches!(err.downcast_ref::<TraceError>(), Some(TraceError::Unsupported { .. })));
}
