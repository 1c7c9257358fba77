//! The forward hook: how a leaf module call or an intercepted operator
//! becomes a graph node.
use crate::internal::*;
use crate::trace::const_attrs;

type ShapeFn = Box<dyn Fn(&[ProxyTensor]) -> MoResult<TVec<Shape>>>;

/// An ephemeral description of the node an intercepted operator emits.
///
/// Built inline at the interception site, wired once, then dropped.
pub struct NodeSpec {
    op: String,
    attrs: Attrs,
    params: Vec<(String, Arc<Tensor>)>,
    shape_fn: Option<ShapeFn>,
}

impl NodeSpec {
    pub fn new(op: impl Into<String>) -> NodeSpec {
        NodeSpec { op: op.into(), attrs: Attrs::default(), params: vec![], shape_fn: None }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<Attr>) -> NodeSpec {
        self.attrs.insert(name, value);
        self
    }

    pub fn with_attrs(mut self, attrs: Attrs) -> NodeSpec {
        self.attrs.merge(attrs);
        self
    }

    /// A constant input, materialized after the explicit inputs.
    pub fn with_param(mut self, name: impl Into<String>, value: impl IntoArcTensor) -> NodeSpec {
        self.params.push((name.into(), value.into_arc_tensor()));
        self
    }

    pub fn with_shape_fn(
        mut self,
        f: impl Fn(&[ProxyTensor]) -> MoResult<TVec<Shape>> + 'static,
    ) -> NodeSpec {
        self.shape_fn = Some(Box::new(f));
        self
    }

    pub fn with_output_shape(self, shape: impl Into<Shape>) -> NodeSpec {
        let shape = shape.into();
        self.with_shape_fn(move |_| Ok(tvec!(shape.clone())))
    }

    pub fn with_output_shapes(self, shapes: TVec<Shape>) -> NodeSpec {
        self.with_shape_fn(move |_| Ok(shapes.clone()))
    }

    /// Emit a single-output node fed by `inputs`.
    pub fn wire(&self, inputs: &[ProxyTensor]) -> MoResult<ProxyTensor> {
        forward_hook(self, inputs, Value::Opaque)?.into_tensor()
    }

    /// Emit a node with `outputs` output ports.
    pub fn wire_multi(&self, inputs: &[ProxyTensor], outputs: usize) -> MoResult<TVec<ProxyTensor>> {
        forward_hook(self, inputs, Value::Tuple(vec![Value::Opaque; outputs]))?.tensors()
    }
}

impl TracedOp for NodeSpec {
    fn type_name(&self) -> &str {
        &self.op
    }

    fn module_attrs(&self) -> Attrs {
        self.attrs.clone()
    }

    fn state_dict(&self) -> Vec<(String, Arc<Tensor>)> {
        self.params.clone()
    }

    fn infer_shapes(&self, inputs: &[ProxyTensor]) -> MoResult<Option<TVec<Shape>>> {
        self.shape_fn.as_ref().map(|f| f(inputs)).transpose()
    }
}

/// Record the call of `op` on `inputs` in the trace graph.
///
/// `output` is what the real call returned. If it is already linked to the
/// graph (a composite that traced its own body, or a shape value) it is
/// passed through untouched; otherwise one node is created for the call, and
/// fresh proxies for its outputs are returned.
pub fn forward_hook<O: TracedOp + ?Sized>(
    op: &O,
    inputs: &[ProxyTensor],
    output: Value,
) -> MoResult<Value> {
    if output.is_traced() {
        return Ok(output);
    }
    let type_name = op.type_name();
    let Some(first) = inputs.first() else {
        bail!(TraceError::integrity(format!("{type_name} called without tensor inputs")))
    };
    let cx = first.context()?;
    for (ix, input) in inputs.iter().enumerate() {
        if input.node_name().is_none() {
            bail!(TraceError::integrity(format!(
                "Input not found: argument {ix} of {type_name} has no producing node"
            )))
        }
        if !cx.owns(input) {
            bail!(TraceError::integrity(format!(
                "Input not found: argument {ix} of {type_name} belongs to another trace"
            )))
        }
    }

    let name = {
        let mut graph = cx.graph_mut();
        let name = graph.unique_id(&format!("{type_name}_"));
        graph.add_node(&name, NodeKind::Op, type_name, Attrs::new().with("name", &*name))?;
        graph.node_mut(&name)?.module = op.module_attrs();
        for (ix, input) in inputs.iter().enumerate() {
            let src = input.node_name().unwrap_or_default();
            graph.add_edge(Edge::new(src, &name, input.port(), ix))?;
            trace!("  {}:{} -> {}:{}", src, input.port(), name, ix);
        }
        for (ix, (key, value)) in op.state_dict().into_iter().enumerate() {
            let param = format!("{name}/{key}");
            graph.add_node(&param, NodeKind::Op, "Const", const_attrs(&param, &value))?;
            graph.add_edge(Edge::new(&param, &name, 0, inputs.len() + ix))?;
        }
        name
    };
    debug!("Traced {name}");

    match output {
        Value::Tuple(items) => {
            let Some(shapes) = op.infer_shapes(inputs).with_context(|| format!("Inferring shapes of {name}"))? else {
                bail!(TraceError::MissingShapeInference { op: type_name.to_string() })
            };
            if shapes.len() != items.len() {
                bail!(TraceError::Arity { op: type_name.to_string(), expected: items.len(), got: shapes.len() })
            }
            Ok(Value::Tuple(
                shapes
                    .into_iter()
                    .enumerate()
                    .map(|(port, shape)| ProxyTensor::wired(cx.weak(), name.clone(), port, shape).into())
                    .collect(),
            ))
        }
        Value::Dict(_) => {
            bail!(TraceError::integrity(format!("{type_name} returned a dict, which can not be hooked")))
        }
        single => {
            let shape = match op.infer_shapes(inputs).with_context(|| format!("Inferring shapes of {name}"))? {
                Some(shapes) if shapes.len() == 1 => shapes.into_iter().next().unwrap_or_default(),
                Some(shapes) => {
                    bail!(TraceError::Arity { op: type_name.to_string(), expected: 1, got: shapes.len() })
                }
                None => first.dynamic_shape().into(),
            };
            let value = match &single {
                Value::Tensor(t) => t.value().cloned(),
                _ => None,
            };
            Ok(ProxyTensor::wired(cx.weak(), name, 0, shape).with_value(value).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn setup() -> (Rc<TraceContext>, ProxyTensor) {
        crate::setup_test_logger();
        let cx = TraceContext::new(FunctionTable::default());
        let x = cx.source("input", to_shape([1, 3, 8, 8]), DatumType::F32).unwrap();
        (cx, x)
    }

    struct Doubler;

    impl TracedOp for Doubler {
        fn type_name(&self) -> &str {
            "Doubler"
        }

        fn infer_shapes(&self, inputs: &[ProxyTensor]) -> MoResult<Option<TVec<Shape>>> {
            let shape: Shape = inputs[0].dynamic_shape().into();
            Ok(Some(tvec!(shape.clone(), shape.clone(), shape)))
        }
    }

    #[test]
    fn names_are_unique_per_type() {
        let (cx, x) = setup();
        let a = NodeSpec::new("ReLU").wire(&[x.clone()]).unwrap();
        let b = NodeSpec::new("ReLU").wire(&[a.clone()]).unwrap();
        assert_eq!(a.node_name(), Some("ReLU_0"));
        assert_eq!(b.node_name(), Some("ReLU_1"));
        assert_eq!(b.dynamic_shape(), x.dynamic_shape());
        assert_eq!(cx.graph().in_edges("ReLU_1")[0].src, "ReLU_0");
    }

    #[test]
    fn params_follow_inputs() {
        let (cx, x) = setup();
        let y = NodeSpec::new("Conv")
            .with_param("weight", tensor0(1f32))
            .with_param("bias", tensor0(0f32))
            .wire(&[x])
            .unwrap();
        let graph = cx.graph();
        let edges = graph.in_edges(y.node_name().unwrap());
        assert_eq!(
            edges.iter().map(|e| (e.src.as_str(), e.inlet)).collect::<Vec<_>>(),
            vec![("input", 0), ("Conv_0/weight", 1), ("Conv_0/bias", 2)]
        );
        assert_eq!(graph.node("Conv_0/weight").unwrap().op, "Const");
    }

    #[test]
    fn traced_output_passes_through() {
        let (cx, x) = setup();
        let before = cx.graph().nodes().len();
        let out = forward_hook(&NodeSpec::new("Noop"), &[x.clone()], Value::Tensor(x.clone())).unwrap();
        assert_eq!(out.tensor().unwrap().node_name(), Some("input"));
        let shape = forward_hook(&NodeSpec::new("Noop"), &[x.clone()], x.shape().into()).unwrap();
        assert!(matches!(shape, Value::Shape(_)));
        assert_eq!(cx.graph().nodes().len(), before);
    }

    #[test]
    fn multi_output() {
        let (_cx, x) = setup();
        let out = forward_hook(&Doubler, &[x], vec![Value::Opaque; 3].into()).unwrap();
        let outs = out.tensors().unwrap();
        assert_eq!(outs.iter().map(|o| o.port()).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn multi_output_arity() {
        let (_cx, x) = setup();
        let err = forward_hook(&Doubler, &[x], vec![Value::Opaque; 2].into()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<TraceError>(),
            Some(&TraceError::Arity { op: "Doubler".into(), expected: 2, got: 3 })
        );
    }

    #[test]
    fn single_output_arity() {
        let (_cx, x) = setup();
        let err = forward_hook(&Doubler, &[x], Value::Opaque).unwrap_err();
        assert!(matches!(err.downcast_ref::<TraceError>(), Some(TraceError::Arity { expected: 1, .. })));
    }

    #[test]
    fn multi_output_needs_shapes() {
        let (_cx, x) = setup();
        let err = NodeSpec::new("Unknown").wire_multi(&[x], 2).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TraceError>(),
            Some(TraceError::MissingShapeInference { .. })
        ));
    }

    #[test]
    fn input_without_producer() {
        let (_cx, x) = setup();
        let orphan = ProxyTensor::detached(to_shape([1, 3, 8, 8]), None);
        let err = NodeSpec::new("Add").wire(&[x, orphan]).unwrap_err();
        assert!(format!("{err:?}").contains("Input not found"));
    }

    #[test]
    fn foreign_trace() {
        let (_cx, x) = setup();
        let (_other, y) = setup();
        let err = NodeSpec::new("Add").wire(&[x, y]).unwrap_err();
        assert!(matches!(err.downcast_ref::<TraceError>(), Some(TraceError::Integrity(_))));
    }
}
