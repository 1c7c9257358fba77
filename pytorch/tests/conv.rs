#[macro_use]
extern crate maplit;

use mo_pytorch::internal::*;
use mo_pytorch::nn::{BatchNorm2d, Conv2d, MaxPool2d, ReLU, Sequential};
use std::collections::BTreeMap;

fn setup_test_logger() {
    let _ = env_logger::Builder::from_env("MO_LOG").try_init();
}

fn op_counts(graph: &Graph) -> BTreeMap<&str, usize> {
    graph.nodes().iter().map(|n| n.op.as_str()).counts().into_iter().collect()
}

#[test]
fn conv_output_shape() {
    setup_test_logger();
    let cx = TraceContext::new(FunctionTable::default());
    let conv = Conv2d::new(3, 16, 3);
    cx.hook(&conv);
    let x = cx.source("input", to_shape([1, 3, 32, 32]), DatumType::F32).unwrap();
    let y = cx.call(&conv, &[x.into()]).unwrap().into_tensor().unwrap();
    assert_eq!(y.dynamic_shape(), &*to_shape([1, 16, 30, 30]));
    assert_eq!(y.node_name(), Some("Conv2d_0"));
}

#[test]
fn conv_graph() {
    setup_test_logger();
    let graph = mo_pytorch::pytorch()
        .unwrap()
        .load(&Conv2d::new(3, 16, 3), &TraceConfig::single(to_shape([1, 3, 32, 32])))
        .unwrap();
    assert_eq!(
        op_counts(&graph),
        btreemap! { "Parameter" => 1, "Const" => 2, "Conv2d" => 1, "Result" => 1 }
    );
    let inputs = graph.in_edges("Conv2d_0").iter().map(|e| (e.src.as_str(), e.inlet)).collect_vec();
    assert_eq!(inputs, vec![("input", 0), ("Conv2d_0/weight", 1), ("Conv2d_0/bias", 2)]);
    assert_eq!(graph.node("Conv2d_0/weight").unwrap().attrs.get_shape("shape").unwrap(), to_shape([16, 3, 3, 3]));

    let conv = graph.node("Conv2d_0").unwrap();
    assert_eq!(conv.ir_type.as_deref(), Some("Convolution"));
    assert_eq!(conv.attrs.get_ints("strides").unwrap(), tvec!(1, 1));
    assert_eq!(conv.attrs.get_ints("pads_begin").unwrap(), tvec!(0, 0));
    assert_eq!(conv.attrs.get_int("output").unwrap(), 16);
    assert!(graph.nodes().iter().all(|n| n.is_typed()));
}

#[test]
fn grouped_conv() {
    setup_test_logger();
    let model = Conv2d::new(8, 8, 3).with_groups(4).unwrap().with_padding(1);
    let graph =
        mo_pytorch::pytorch().unwrap().load(&model, &TraceConfig::single(to_shape([1, 8, 16, 16]))).unwrap();
    let conv = graph.node("Conv2d_0").unwrap();
    assert_eq!(conv.ir_type.as_deref(), Some("GroupConvolution"));
    assert_eq!(conv.attrs.get_int("group").unwrap(), 4);
    assert_eq!(conv.attrs.get_ints("pads_end").unwrap(), tvec!(1, 1));
}

#[test]
fn conv_bn_relu_pool() {
    setup_test_logger();
    let model = Sequential::default()
        .push(Conv2d::new(3, 8, 3).with_padding(1).without_bias())
        .push(BatchNorm2d::new(8))
        .push(ReLU)
        .push(MaxPool2d::new(2));
    let loader = mo_pytorch::pytorch().unwrap();
    let graph = loader.load(&model, &TraceConfig::single(to_shape([1, 3, 32, 32]))).unwrap();
    assert_eq!(
        op_counts(&graph),
        btreemap! {
            "Parameter" => 1,
            "Const" => 5,
            "Conv2d" => 1,
            "BatchNorm2d" => 1,
            "ReLU" => 1,
            "MaxPool2d" => 1,
            "Result" => 1,
        }
    );
    let types = graph.nodes().iter().filter_map(|n| n.ir_type.as_deref()).collect_vec();
    for expected in ["Convolution", "BatchNormInference", "ReLU", "MaxPool"] {
        assert!(types.contains(&expected), "{expected} in {types:?}");
    }
    let relu = graph.nodes().iter().find(|n| n.op == "ReLU").unwrap();
    let pool = graph.nodes().iter().find(|n| n.op == "MaxPool2d").unwrap();
    assert_eq!(graph.in_edges(&pool.name)[0].src, relu.name);
    assert_eq!(graph.in_edges("output")[0].src, pool.name);
}

#[test]
fn same_leaf_called_twice() {
    setup_test_logger();
    struct Twice(Conv2d);
    impl TracedOp for Twice {
        fn type_name(&self) -> &str {
            "Twice"
        }
    }
    impl Module for Twice {
        fn children(&self) -> Vec<&dyn Module> {
            vec![&self.0]
        }
        fn forward(&self, cx: &TraceContext, inputs: &[Value]) -> MoResult<Value> {
            let once = cx.call(&self.0, inputs)?;
            cx.call(&self.0, &[once])
        }
    }
    let graph = mo_pytorch::pytorch()
        .unwrap()
        .load(&Twice(Conv2d::new(4, 4, 1)), &TraceConfig::single(to_shape([1, 4, 8, 8])))
        .unwrap();
    assert_eq!(op_counts(&graph)["Conv2d"], 2);
    assert_eq!(graph.in_edges("Conv2d_1")[0].src, "Conv2d_0");
    assert!(graph.contains("Conv2d_1/weight"));
}
