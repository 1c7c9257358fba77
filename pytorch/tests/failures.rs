use mo_pytorch::functional::{self, Arg, Dispatch, Function};
use mo_pytorch::internal::*;
use mo_pytorch::nn::{Conv2d, Sequential};

fn setup_test_logger() {
    let _ = env_logger::Builder::from_env("MO_LOG").try_init();
}

fn trace_error(err: &MoError) -> &TraceError {
    err.downcast_ref::<TraceError>().unwrap_or_else(|| panic!("not a trace error: {err:?}"))
}

/// A leaf no extractor knows about.
struct Mystery;

impl TracedOp for Mystery {
    fn type_name(&self) -> &str {
        "Mystery"
    }
}

impl Module for Mystery {}

#[test]
fn unknown_op_fails_extraction() {
    setup_test_logger();
    let model = Sequential::default().push(Conv2d::new(3, 3, 1)).push(Mystery);
    let loader = mo_pytorch::pytorch().unwrap();
    let config = TraceConfig::single(to_shape([1, 3, 4, 4]));
    let traced = loader.trace(&model, &config).unwrap();
    assert!(traced.nodes().iter().any(|n| n.op == "Mystery"));
    let err = loader.load(&model, &config).unwrap_err();
    assert_eq!(trace_error(&err), &TraceError::Unsupported { op: "Mystery".into() });
}

/// Feeds a leaf with a tensor created outside of the trace.
struct Orphan(Conv2d);

impl TracedOp for Orphan {
    fn type_name(&self) -> &str {
        "Orphan"
    }
}

impl Module for Orphan {
    fn children(&self) -> Vec<&dyn Module> {
        vec![&self.0]
    }

    fn forward(&self, cx: &TraceContext, inputs: &[Value]) -> MoResult<Value> {
        let shape = inputs[0].tensor()?.dynamic_shape().to_vec();
        cx.call(&self.0, &[ProxyTensor::detached(shape, None).into()])
    }
}

#[test]
fn input_without_producer_aborts() {
    setup_test_logger();
    let err = mo_pytorch::pytorch()
        .unwrap()
        .load(&Orphan(Conv2d::new(3, 3, 1)), &TraceConfig::single(to_shape([1, 3, 4, 4])))
        .unwrap_err();
    assert!(matches!(trace_error(&err), TraceError::Integrity(msg) if msg.contains("Input not found")));
}

/// Claims two outputs, returns one.
struct Liar;

impl TracedOp for Liar {
    fn type_name(&self) -> &str {
        "Liar"
    }

    fn infer_shapes(&self, inputs: &[ProxyTensor]) -> MoResult<Option<TVec<Shape>>> {
        let shape: Shape = inputs[0].dynamic_shape().into();
        Ok(Some(tvec!(shape.clone(), shape)))
    }
}

impl Module for Liar {}

#[test]
fn output_arity_mismatch_aborts() {
    setup_test_logger();
    let err = mo_pytorch::pytorch().unwrap().load(&Liar, &TraceConfig::single(to_shape([1, 3]))).unwrap_err();
    assert_eq!(trace_error(&err), &TraceError::Arity { op: "Liar".into(), expected: 1, got: 2 });
}

#[test]
fn foreign_tensors_are_declined() {
    setup_test_logger();
    let cx = TraceContext::new(FunctionTable::default());
    let x = cx.source("x", to_shape([1, 3]), DatumType::F32).unwrap();
    let args = vec![Arg::List(vec![Arg::from(&x), Arg::Foreign("SparseTensor".into())]), Arg::Int(0)];
    assert!(matches!(cx.functions().dispatch(Function::Cat, args).unwrap(), Dispatch::NotHandled));
    let err = functional::cat(vec![Arg::from(&x), Arg::Foreign("SparseTensor".into())], 0).unwrap_err();
    assert_eq!(trace_error(&err), &TraceError::Unsupported { op: "cat".into() });
    assert_eq!(cx.graph().nodes().len(), 1);
}

#[test]
fn removed_handler_is_unsupported() {
    setup_test_logger();
    let mut functions = FunctionTable::default();
    functions.remove(Function::Relu);
    let cx = TraceContext::new(functions);
    let x = cx.source("x", to_shape([1, 3]), DatumType::F32).unwrap();
    let err = functional::relu(&x).unwrap_err();
    assert_eq!(trace_error(&err), &TraceError::Unsupported { op: "relu".into() });
}

#[test]
fn training_batch_norm_aborts() {
    setup_test_logger();
    let cx = TraceContext::new(FunctionTable::default());
    let x = cx.source("x", to_shape([1, 3, 4, 4]), DatumType::F32).unwrap();
    assert!(functional::batch_norm(&x, rctensor1(&[0f32; 3]), rctensor1(&[1f32; 3]), None, None, true, 0.1, 1e-5).is_err());
}

#[test]
fn dropped_trace_is_an_integrity_error() {
    let x = {
        let cx = TraceContext::new(FunctionTable::default());
        cx.source("x", to_shape([2]), DatumType::F32).unwrap()
    };
    let err = x.try_add(1.0f32).unwrap_err();
    assert!(matches!(trace_error(&err), TraceError::Integrity(_)));
}
