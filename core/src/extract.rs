//! Turning framework-level nodes into typed IR operations.
use crate::internal::*;
use std::collections::HashMap;

/// Reads a node (its `op`, attributes and captured module state) and returns
/// the IR attributes, including a mandatory `type`. `None` means the node is
/// not supported.
pub type Extractor = fn(&Node) -> MoResult<Option<Attrs>>;

/// Extractors, keyed by operator tag.
///
/// Tags are matched case-insensitively against node `op`s, so two tags that
/// only differ by case are a registration conflict.
#[derive(Clone, Default)]
pub struct ExtractorRegistry {
    ops: HashMap<String, Extractor>,
}

impl ExtractorRegistry {
    pub fn insert(&mut self, op: &str, extractor: Extractor) -> MoResult<()> {
        let key = op.to_lowercase();
        ensure!(!self.ops.contains_key(&key), "Duplicate extractor for operator {}", op);
        self.ops.insert(key, extractor);
        Ok(())
    }

    pub fn get(&self, op: &str) -> Option<&Extractor> {
        self.ops.get(&op.to_lowercase())
    }

    pub fn contains(&self, op: &str) -> bool {
        self.get(op).is_some()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Registered tags, sorted.
    pub fn ops(&self) -> Vec<&str> {
        self.ops.keys().map(|s| s.as_str()).sorted().collect()
    }
}

/// Run the registered extractor of every untyped node.
///
/// The wiring is checked first. Extraction stops at the first node without an
/// extractor (or whose extractor declines), failing with a
/// `TraceError::Unsupported` naming its op.
pub fn extract_node_attrs(graph: &mut Graph, registry: &ExtractorRegistry) -> MoResult<()> {
    graph.check_wiring()?;
    let mut extracted = 0;
    for node in graph.nodes_mut() {
        if node.is_typed() {
            continue;
        }
        let Some(extractor) = registry.get(&node.op) else {
            return Err(TraceError::unsupported(&node.op))
                .with_context(|| format!("No extractor for node {}", node.name));
        };
        let attrs = extractor(node)
            .with_context(|| format!("Extracting attributes of node {}", node.name))?;
        let Some(attrs) = attrs else {
            return Err(TraceError::unsupported(&node.op))
                .with_context(|| format!("Extractor declined node {}", node.name));
        };
        let ir_type = attrs
            .get_str("type")
            .with_context(|| format!("Extractor for {} returned no IR type", node.op))?
            .to_string();
        debug!("{} -> {}", node, ir_type);
        node.attrs.merge(attrs);
        node.ir_type = Some(ir_type);
        extracted += 1;
    }
    info!("Extracted {} node(s)", extracted);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relu(_node: &Node) -> MoResult<Option<Attrs>> {
        Ok(Some(Attrs::new().with("type", "ReLU")))
    }

    fn decline(_node: &Node) -> MoResult<Option<Attrs>> {
        Ok(None)
    }

    fn untyped(_node: &Node) -> MoResult<Option<Attrs>> {
        Ok(Some(Attrs::new().with("axis", 1)))
    }

    fn registry() -> ExtractorRegistry {
        let mut reg = ExtractorRegistry::default();
        reg.insert("ReLU", relu).unwrap();
        reg.insert("Dropout", decline).unwrap();
        reg.insert("Broken", untyped).unwrap();
        reg
    }

    fn graph(op: &str) -> Graph {
        let mut g = Graph::default();
        g.add_node("n", NodeKind::Op, op, Attrs::new().with("name", "n")).unwrap();
        g
    }

    #[test]
    fn lookup_is_case_insensitive() {
        crate::setup_test_logger();
        let mut g = graph("relu");
        extract_node_attrs(&mut g, &registry()).unwrap();
        let node = g.node("n").unwrap();
        assert_eq!(node.ir_type.as_deref(), Some("ReLU"));
        assert_eq!(node.attrs.get_str("name").unwrap(), "n");
    }

    #[test]
    fn duplicates_collide_once_lowered() {
        let mut reg = registry();
        assert!(reg.insert("relu", relu).is_err());
        assert_eq!(reg.ops(), vec!["broken", "dropout", "relu"]);
    }

    #[test]
    fn missing_extractor_names_the_op() {
        let mut g = graph("aten::foo");
        let err = extract_node_attrs(&mut g, &registry()).unwrap_err();
        assert_eq!(err.downcast_ref::<TraceError>(), Some(&TraceError::unsupported("aten::foo")));
    }

    #[test]
    fn declining_is_unsupported() {
        let mut g = graph("Dropout");
        let err = extract_node_attrs(&mut g, &registry()).unwrap_err();
        assert_eq!(err.downcast_ref::<TraceError>(), Some(&TraceError::unsupported("Dropout")));
    }

    #[test]
    fn type_is_mandatory() {
        let mut g = graph("Broken");
        assert!(extract_node_attrs(&mut g, &registry()).is_err());
    }

    #[test]
    fn typed_nodes_are_left_alone() {
        let mut g = graph("aten::foo");
        g.node_mut("n").unwrap().ir_type = Some("Foo".into());
        extract_node_attrs(&mut g, &registry()).unwrap();
    }
}
