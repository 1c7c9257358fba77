//! The module tree being traced.
use crate::internal::*;
use downcast_rs::{Downcast, impl_downcast};
use std::any::{Any, TypeId};

/// Anything the forward hook can turn into a graph node: a leaf module, or
/// the ephemeral `NodeSpec` of an intercepted operator.
pub trait TracedOp {
    /// Runtime type name, used as node `op` and name prefix.
    fn type_name(&self) -> &str;

    /// Raw state captured on the node for extractors.
    fn module_attrs(&self) -> Attrs {
        Attrs::default()
    }

    /// Learned parameters and buffers, in enumeration order.
    fn state_dict(&self) -> Vec<(String, Arc<Tensor>)> {
        vec![]
    }

    /// Output shapes, for operators that do not preserve their first input
    /// shape. `None` means "same as input 0".
    fn infer_shapes(&self, _inputs: &[ProxyTensor]) -> MoResult<Option<TVec<Shape>>> {
        Ok(None)
    }
}

/// A node of the network module tree.
///
/// Leaves (modules without children) get a forward hook during tracing,
/// composites run their `forward`, calling children through
/// `TraceContext::call`.
pub trait Module: TracedOp + Downcast {
    /// Fully qualified class name, which model hooks are keyed by.
    fn class_name(&self) -> &str {
        self.type_name()
    }

    fn children(&self) -> Vec<&dyn Module> {
        vec![]
    }

    /// Runs the module. A leaf has nothing to compute on proxies: its hook
    /// builds the output.
    fn forward(&self, _cx: &TraceContext, _inputs: &[Value]) -> MoResult<Value> {
        Ok(Value::Opaque)
    }
}
impl_downcast!(Module);

/// Identity of a module instance for the duration of a trace.
///
/// The address alone is ambiguous for a struct and its first field, so the
/// concrete type is part of it. Instances of a zero-sized type still share
/// an id: hooking one hooks them all, which is harmless as they hold no
/// state, and `TraceContext::override_forward` refuses them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ModuleId(usize, TypeId);

impl ModuleId {
    pub fn of(module: &dyn Module) -> ModuleId {
        ModuleId(std::ptr::from_ref(module).cast::<()>() as usize, Any::type_id(module.as_any()))
    }
}

pub fn is_leaf(module: &dyn Module) -> bool {
    module.children().is_empty()
}

/// All modules of the tree, pre-order, root first.
pub fn modules(root: &dyn Module) -> Vec<&dyn Module> {
    let mut found = vec![root];
    let mut ix = 0;
    while ix < found.len() {
        let current = found[ix];
        let children = current.children();
        found.splice(ix + 1..ix + 1, children);
        ix += 1;
    }
    found
}

pub fn leaf_modules(root: &dyn Module) -> Vec<&dyn Module> {
    modules(root).into_iter().filter(|m| is_leaf(*m)).collect()
}

/// A value flowing through `forward`.
#[derive(Clone, Debug)]
pub enum Value {
    Tensor(ProxyTensor),
    Shape(ShapeValue),
    /// A framework result with no graph linkage yet (what a leaf returns
    /// before its hook runs).
    Opaque,
    Tuple(Vec<Value>),
    Dict(Vec<(String, Value)>),
}

impl Value {
    pub fn tensor(&self) -> MoResult<&ProxyTensor> {
        match self {
            Value::Tensor(t) => Ok(t),
            other => bail!("Expected a tensor, got {}", other.kind()),
        }
    }

    pub fn into_tensor(self) -> MoResult<ProxyTensor> {
        match self {
            Value::Tensor(t) => Ok(t),
            other => bail!("Expected a tensor, got {}", other.kind()),
        }
    }

    pub fn items(&self) -> MoResult<&[Value]> {
        match self {
            Value::Tuple(items) => Ok(items),
            other => bail!("Expected a tuple, got {}", other.kind()),
        }
    }

    /// The tensors of a tuple (or a lone tensor).
    pub fn tensors(&self) -> MoResult<TVec<ProxyTensor>> {
        match self {
            Value::Tensor(t) => Ok(tvec!(t.clone())),
            Value::Tuple(items) => items.iter().map(|i| i.tensor().cloned()).collect(),
            other => bail!("Expected tensors, got {}", other.kind()),
        }
    }

    pub fn get(&self, key: &str) -> MoResult<&Value> {
        match self {
            Value::Dict(items) => items
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v)
                .with_context(|| format!("No entry {key:?} in dict")),
            other => bail!("Expected a dict, got {}", other.kind()),
        }
    }

    /// Leaves of nested tuples and dicts, in order.
    pub fn leaves(&self) -> Vec<&Value> {
        match self {
            Value::Tuple(items) => items.iter().flat_map(|i| i.leaves()).collect(),
            Value::Dict(items) => items.iter().flat_map(|(_, i)| i.leaves()).collect(),
            leaf => vec![leaf],
        }
    }

    /// Whether the value already carries graph linkage (or needs none).
    pub fn is_traced(&self) -> bool {
        match self {
            Value::Tensor(t) => t.node_name().is_some(),
            Value::Shape(_) => true,
            Value::Tuple(items) => !items.is_empty() && items.iter().all(|i| i.is_traced()),
            Value::Opaque | Value::Dict(_) => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Tensor(_) => "tensor",
            Value::Shape(_) => "shape",
            Value::Opaque => "untraced value",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
        }
    }
}

impl From<ProxyTensor> for Value {
    fn from(it: ProxyTensor) -> Value {
        Value::Tensor(it)
    }
}

impl From<&ProxyTensor> for Value {
    fn from(it: &ProxyTensor) -> Value {
        Value::Tensor(it.clone())
    }
}

impl From<ShapeValue> for Value {
    fn from(it: ShapeValue) -> Value {
        Value::Shape(it)
    }
}

impl<V: Into<Value>> From<Vec<V>> for Value {
    fn from(it: Vec<V>) -> Value {
        Value::Tuple(it.into_iter().map(|v| v.into()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Leaf(&'static str);

    impl TracedOp for Leaf {
        fn type_name(&self) -> &str {
            self.0
        }
    }

    impl Module for Leaf {}

    struct Pair {
        a: Leaf,
        b: Leaf,
    }

    impl TracedOp for Pair {
        fn type_name(&self) -> &str {
            "Pair"
        }
    }

    impl Module for Pair {
        fn children(&self) -> Vec<&dyn Module> {
            vec![&self.a, &self.b]
        }
    }

    struct Net {
        first: Pair,
        last: Leaf,
    }

    impl TracedOp for Net {
        fn type_name(&self) -> &str {
            "Net"
        }
    }

    impl Module for Net {
        fn class_name(&self) -> &str {
            "my.models.Net"
        }

        fn children(&self) -> Vec<&dyn Module> {
            vec![&self.first, &self.last]
        }
    }

    fn net() -> Net {
        Net { first: Pair { a: Leaf("A"), b: Leaf("B") }, last: Leaf("C") }
    }

    #[test]
    fn pre_order() {
        let net = net();
        let names = modules(&net).iter().map(|m| m.type_name().to_string()).collect::<Vec<_>>();
        assert_eq!(names, vec!["Net", "Pair", "A", "B", "C"]);
        let leaves = leaf_modules(&net).iter().map(|m| m.type_name().to_string()).collect::<Vec<_>>();
        assert_eq!(leaves, vec!["A", "B", "C"]);
    }

    #[test]
    fn struct_and_first_field_are_distinct() {
        let pair = Pair { a: Leaf("A"), b: Leaf("B") };
        assert_ne!(ModuleId::of(&pair), ModuleId::of(&pair.a));
        assert_eq!(ModuleId::of(&pair.a), ModuleId::of(&pair.a));
    }

    #[test]
    fn downcast() {
        let net = net();
        let m: &dyn Module = &net;
        assert_eq!(m.class_name(), "my.models.Net");
        assert!(m.downcast_ref::<Net>().is_some());
        assert!(m.downcast_ref::<Pair>().is_none());
    }

    #[test]
    fn values() {
        let v = Value::Dict(vec![
            ("boxes".into(), Value::Opaque),
            ("extra".into(), Value::Tuple(vec![Value::Opaque, Value::Opaque])),
        ]);
        assert_eq!(v.leaves().len(), 3);
        assert!(v.get("boxes").is_ok());
        assert!(v.get("masks").is_err());
        assert!(!v.is_traced());
        assert!(Value::Shape(ShapeValue::default()).is_traced());
    }
}
