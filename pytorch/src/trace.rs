//! The state of one trace: the graph under construction and the hooks.
use crate::hooks::forward_hook;
use crate::internal::*;
use crate::module::ModuleId;
use std::cell::{Ref, RefCell, RefMut};
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};

/// A replacement `forward` for a module instance, installed by model hooks.
pub type ForwardOverride = Rc<dyn Fn(&dyn Module, &TraceContext, &[Value]) -> MoResult<Value>>;

/// Owns the graph for the duration of a trace.
///
/// Proxies only hold a weak handle to it, so a proxy escaping the trace can
/// not keep the graph alive, and using it afterwards is an integrity error.
pub struct TraceContext {
    graph: RefCell<Graph>,
    functions: FunctionTable,
    hooked: RefCell<HashSet<ModuleId>>,
    overrides: RefCell<HashMap<ModuleId, ForwardOverride>>,
    myself: Weak<TraceContext>,
}

impl TraceContext {
    pub fn new(functions: FunctionTable) -> Rc<TraceContext> {
        Rc::new_cyclic(|myself| TraceContext {
            graph: RefCell::new(Graph::default()),
            functions,
            hooked: RefCell::default(),
            overrides: RefCell::default(),
            myself: myself.clone(),
        })
    }

    pub fn graph(&self) -> Ref<'_, Graph> {
        self.graph.borrow()
    }

    pub(crate) fn graph_mut(&self) -> RefMut<'_, Graph> {
        self.graph.borrow_mut()
    }

    /// Move the graph out, leaving an empty one behind.
    pub fn take_graph(&self) -> Graph {
        self.graph.take()
    }

    pub fn functions(&self) -> &FunctionTable {
        &self.functions
    }

    pub(crate) fn weak(&self) -> Weak<TraceContext> {
        self.myself.clone()
    }

    pub(crate) fn owns(&self, proxy: &ProxyTensor) -> bool {
        Weak::ptr_eq(&self.myself, proxy.weak_context())
    }

    /// A graph input: a `Parameter` node and its proxy.
    pub fn source(&self, name: &str, shape: impl Into<Shape>, dt: DatumType) -> MoResult<ProxyTensor> {
        let shape = shape.into();
        let attrs = Attrs::new()
            .with("name", name)
            .with("shape", shape.clone())
            .with("data_type", dt.ir_name());
        self.graph_mut().add_node(name, NodeKind::Op, "Parameter", attrs)?;
        debug!("Input {} [{}] {:?}", name, shape.iter().join(","), dt);
        Ok(ProxyTensor::wired(self.weak(), name.to_string(), 0, shape))
    }

    /// A named constant node (a frozen input).
    pub fn frozen(&self, name: &str, value: impl IntoArcTensor) -> MoResult<ProxyTensor> {
        let value = value.into_arc_tensor();
        self.graph_mut().add_node(name, NodeKind::Op, "Const", const_attrs(name, &value))?;
        debug!("Frozen input {} {:?}", name, value);
        Ok(ProxyTensor::wired(self.weak(), name.to_string(), 0, value.dims()).with_value(Some(value)))
    }

    /// An anonymous constant node.
    pub fn constant(&self, value: impl IntoArcTensor) -> MoResult<ProxyTensor> {
        let value = value.into_arc_tensor();
        let name = {
            let mut graph = self.graph_mut();
            let name = graph.unique_id("Const_");
            graph.add_node(&name, NodeKind::Op, "Const", const_attrs(&name, &value))?;
            name
        };
        Ok(ProxyTensor::wired(self.weak(), name, 0, value.dims()).with_value(Some(value)))
    }

    /// A graph output: a `Result` node fed by the proxy.
    pub fn output(&self, proxy: &ProxyTensor) -> MoResult<String> {
        let Some(src) = proxy.node_name() else {
            bail!(TraceError::integrity("Model output has no producing node"))
        };
        if !self.owns(proxy) {
            bail!(TraceError::integrity(format!("Model output {src} belongs to another trace")))
        }
        let mut graph = self.graph_mut();
        let name = if graph.contains("output") { graph.unique_id("output_") } else { "output".to_string() };
        graph.add_node(&name, NodeKind::Op, "Result", Attrs::new().with("name", &*name))?;
        graph.add_edge(Edge::new(src, &name, proxy.port(), 0))?;
        Ok(name)
    }

    /// Attach the forward hook to a (leaf) module.
    pub fn hook(&self, module: &dyn Module) {
        trace!("Hooking {}", module.type_name());
        self.hooked.borrow_mut().insert(ModuleId::of(module));
    }

    pub fn is_hooked(&self, module: &dyn Module) -> bool {
        self.hooked.borrow().contains(&ModuleId::of(module))
    }

    /// Replace the `forward` of one module instance for this trace.
    ///
    /// Zero-sized modules are refused: their instances share a `ModuleId`,
    /// so the override could not be told to apply to this one only.
    pub fn override_forward(
        &self,
        module: &dyn Module,
        forward: impl Fn(&dyn Module, &TraceContext, &[Value]) -> MoResult<Value> + 'static,
    ) -> MoResult<()> {
        ensure!(
            std::mem::size_of_val(module) > 0,
            "Can not override the forward of {}: zero-sized modules have no instance identity",
            module.class_name()
        );
        debug!("Overriding forward of {}", module.class_name());
        self.overrides.borrow_mut().insert(ModuleId::of(module), Rc::new(forward));
        Ok(())
    }

    /// Call a module: its forward (or override), then its hook if it has one.
    pub fn call(&self, module: &dyn Module, inputs: &[Value]) -> MoResult<Value> {
        let id = ModuleId::of(module);
        let replaced = self.overrides.borrow().get(&id).cloned();
        let output = match replaced {
            Some(forward) => forward(module, self, inputs),
            None => module.forward(self, inputs),
        }
        .with_context(|| format!("Running {}", module.type_name()))?;
        if !self.hooked.borrow().contains(&id) {
            return Ok(output);
        }
        let proxies = inputs
            .iter()
            .enumerate()
            .map(|(ix, input)| match input {
                Value::Tensor(t) => Ok(t.clone()),
                other => Err(format_err!(TraceError::integrity(format!(
                    "Input not found: argument {} of {} is a {}",
                    ix,
                    module.type_name(),
                    other.kind()
                )))),
            })
            .collect::<MoResult<TVec<_>>>()?;
        forward_hook(module, &proxies, output)
    }
}

pub(crate) fn const_attrs(name: &str, value: &Arc<Tensor>) -> Attrs {
    Attrs::new().with("name", name).with("value", value.clone()).with("shape", value.dims())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::leaf_modules;
    use crate::nn::{Linear, ReLU, Sequential};

    #[test]
    fn zero_sized_modules_share_hooks() {
        crate::setup_test_logger();
        let cx = TraceContext::new(FunctionTable::default());
        let net = Sequential::default().push(ReLU).push(ReLU);
        cx.hook(&*net.0[0]);
        assert!(cx.is_hooked(&*net.0[1]));
        for leaf in leaf_modules(&net) {
            cx.hook(leaf);
        }
        let x = cx.source("input", to_shape([2, 3]), DatumType::F32).unwrap();
        cx.call(&net, &[x.into()]).unwrap();
        let relus = cx.graph().nodes().iter().filter(|n| n.op == "ReLU").count();
        assert_eq!(relus, 2);
    }

    #[test]
    fn overrides_need_an_instance() {
        let cx = TraceContext::new(FunctionTable::default());
        assert!(cx.override_forward(&ReLU, |_, _, inputs| Ok(inputs[0].clone())).is_err());

        let (a, b) = (Linear::new(3, 3), Linear::new(3, 3));
        cx.override_forward(&a, |_, _, inputs| Ok(inputs[0].clone())).unwrap();
        let x = cx.source("input", to_shape([2, 3]), DatumType::F32).unwrap();
        assert!(cx.call(&a, &[x.clone().into()]).unwrap().is_traced());
        assert!(matches!(cx.call(&b, &[x.into()]).unwrap(), Value::Opaque));
    }
}
