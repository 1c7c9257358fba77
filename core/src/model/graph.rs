use super::{Attr, Attrs, Edge, Node, NodeKind};
use crate::errors::TraceError;
use mo_data::internal::*;
use std::collections::{BTreeMap, HashMap};

/// A directed multigraph of named nodes, with ported data edges.
///
/// Nodes are kept in insertion order, which is also the order tracing
/// discovered them in.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    by_name: HashMap<String, usize>,
    edges: Vec<Edge>,
    /// Per node id, the indices in `edges` of its incoming edges.
    inputs: Vec<TVec<usize>>,
    /// Per node id, the indices in `edges` of its outgoing edges.
    outputs: Vec<TVec<usize>>,
    /// Graph level properties (`fw`, `layout`, ...).
    pub properties: BTreeMap<String, Attr>,
    next_id: usize,
}

impl Graph {
    /// Add a node. Names are unique within a graph.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        kind: NodeKind,
        op: impl Into<String>,
        attrs: Attrs,
    ) -> MoResult<usize> {
        let name = name.into();
        if self.by_name.contains_key(&name) {
            bail!(TraceError::integrity(format!("Duplicate node name {name}")));
        }
        let id = self.nodes.len();
        let node = Node {
            id,
            name: name.clone(),
            kind,
            op: op.into(),
            attrs,
            module: Attrs::default(),
            ir_type: None,
        };
        trace!("Adding node {node}");
        self.nodes.push(node);
        self.inputs.push(tvec!());
        self.outputs.push(tvec!());
        self.by_name.insert(name, id);
        Ok(id)
    }

    /// Connect an output port to an input port.
    ///
    /// Several edges may join the same pair of nodes, but an input port is
    /// fed by exactly one edge.
    pub fn add_edge(&mut self, edge: Edge) -> MoResult<()> {
        let endpoint = |end: &str| {
            self.by_name.get(end).copied().ok_or_else(|| {
                format_err!(TraceError::integrity(format!(
                    "Edge {}:{} -> {}:{} refers to unknown node {}",
                    edge.src, edge.out, edge.dst, edge.inlet, end
                )))
            })
        };
        let (src, dst) = (endpoint(&edge.src)?, endpoint(&edge.dst)?);
        if let Some(previous) =
            self.inputs[dst].iter().map(|&ix| &self.edges[ix]).find(|e| e.inlet == edge.inlet)
        {
            bail!(TraceError::integrity(format!(
                "Input {} of node {} is already wired from {}:{}",
                edge.inlet, edge.dst, previous.src, previous.out
            )));
        }
        trace!("Adding edge {}:{} -> {}:{}", edge.src, edge.out, edge.dst, edge.inlet);
        let ix = self.edges.len();
        self.edges.push(edge);
        self.inputs[dst].push(ix);
        self.outputs[src].push(ix);
        Ok(())
    }

    /// A fresh node name: `prefix` followed by a per-graph counter.
    ///
    /// Names already taken (by explicit `add_node` calls) are skipped.
    pub fn unique_id(&mut self, prefix: &str) -> String {
        loop {
            let candidate = format!("{prefix}{}", self.next_id);
            self.next_id += 1;
            if !self.by_name.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn node(&self, name: &str) -> MoResult<&Node> {
        self.by_name
            .get(name)
            .map(|&id| &self.nodes[id])
            .with_context(|| format!("No node named {name}"))
    }

    pub fn node_mut(&mut self, name: &str) -> MoResult<&mut Node> {
        let id = *self.by_name.get(name).with_context(|| format!("No node named {name}"))?;
        Ok(&mut self.nodes[id])
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn nodes_mut(&mut self) -> &mut [Node] {
        &mut self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    fn adjacent<'a>(&'a self, index: &'a [TVec<usize>], name: &str) -> impl Iterator<Item = &'a Edge> {
        self.by_name.get(name).into_iter().flat_map(move |&id| index[id].iter().map(|&ix| &self.edges[ix]))
    }

    /// Incoming edges of a node, ordered by input port.
    pub fn in_edges(&self, name: &str) -> Vec<&Edge> {
        self.adjacent(&self.inputs, name).sorted_by_key(|e| e.inlet).collect()
    }

    /// Outgoing edges of a node, ordered by output port then insertion.
    pub fn out_edges(&self, name: &str) -> Vec<&Edge> {
        self.adjacent(&self.outputs, name).sorted_by_key(|e| e.out).collect()
    }

    pub fn in_degree(&self, name: &str) -> usize {
        self.by_name.get(name).map(|&id| self.inputs[id].len()).unwrap_or(0)
    }

    /// Graph inputs: placeholder nodes.
    pub fn inputs(&self) -> Vec<&Node> {
        self.nodes.iter().filter(|n| n.op_is("Parameter")).collect()
    }

    /// Graph outputs: result nodes.
    pub fn outputs(&self) -> Vec<&Node> {
        self.nodes.iter().filter(|n| n.op_is("Result")).collect()
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<Attr>) {
        self.properties.insert(name.into(), value.into());
    }

    /// Check every node has its input ports wired contiguously from 0.
    pub fn check_wiring(&self) -> MoResult<()> {
        for node in &self.nodes {
            let edges = self.in_edges(&node.name);
            for (ix, edge) in edges.iter().enumerate() {
                if edge.inlet != ix {
                    bail!(TraceError::integrity(format!(
                        "Node {} has input ports [{}]: ports must be contiguous from 0",
                        node.name,
                        edges.iter().map(|e| e.inlet).join(",")
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> Graph {
        let mut g = Graph::default();
        g.add_node("input", NodeKind::Op, "Parameter", Attrs::default()).unwrap();
        g.add_node("w", NodeKind::Op, "Const", Attrs::default()).unwrap();
        g.add_node("add", NodeKind::Op, "Add", Attrs::default()).unwrap();
        g
    }

    #[test]
    fn duplicate_names() {
        let mut g = graph();
        let err = g.add_node("add", NodeKind::Op, "Add", Attrs::default()).unwrap_err();
        assert!(matches!(err.downcast_ref::<TraceError>(), Some(TraceError::Integrity(_))));
    }

    #[test]
    fn unique_ids_skip_taken_names() {
        let mut g = Graph::default();
        g.add_node("ReLU_1", NodeKind::Op, "ReLU", Attrs::default()).unwrap();
        let a = g.unique_id("ReLU_");
        g.add_node(&a, NodeKind::Op, "ReLU", Attrs::default()).unwrap();
        let b = g.unique_id("ReLU_");
        assert_eq!(a, "ReLU_0");
        assert_eq!(b, "ReLU_2");
    }

    #[test]
    fn edges_are_ported() {
        let mut g = graph();
        g.add_edge(Edge::new("w", "add", 0, 1)).unwrap();
        g.add_edge(Edge::new("input", "add", 0, 0)).unwrap();
        let ins = g.in_edges("add");
        assert_eq!(ins.iter().map(|e| e.src.as_str()).collect::<Vec<_>>(), vec!["input", "w"]);
        assert_eq!(g.in_degree("add"), 2);
        assert_eq!(g.out_edges("input").len(), 1);
        assert_eq!(ins[0].in_attrs, vec!["in", "name"]);
        assert_eq!(ins[0].fw_tensor_debug_info, vec![("input".to_string(), "input".to_string())]);
        g.check_wiring().unwrap();
    }

    #[test]
    fn parallel_edges() {
        let mut g = graph();
        g.add_edge(Edge::new("input", "add", 0, 0)).unwrap();
        g.add_edge(Edge::new("input", "add", 0, 1)).unwrap();
        assert_eq!(g.in_degree("add"), 2);
    }

    #[test]
    fn port_wired_twice() {
        let mut g = graph();
        g.add_edge(Edge::new("input", "add", 0, 0)).unwrap();
        assert!(g.add_edge(Edge::new("w", "add", 0, 0)).is_err());
    }

    #[test]
    fn unknown_endpoint() {
        let mut g = graph();
        assert!(g.add_edge(Edge::new("nope", "add", 0, 0)).is_err());
    }

    #[test]
    fn gap_in_ports() {
        let mut g = graph();
        g.add_edge(Edge::new("input", "add", 0, 0)).unwrap();
        g.add_edge(Edge::new("w", "add", 0, 2)).unwrap();
        let err = g.check_wiring().unwrap_err();
        assert!(err.to_string().contains("[0,2]"), "{err}");
    }

    #[test]
    fn long_chain() {
        let mut g = Graph::default();
        g.add_node("input", NodeKind::Op, "Parameter", Attrs::default()).unwrap();
        let mut previous = "input".to_string();
        for _ in 0..20_000 {
            let name = g.unique_id("ReLU_");
            g.add_node(&name, NodeKind::Op, "ReLU", Attrs::default()).unwrap();
            g.add_edge(Edge::new(&previous, &name, 0, 0)).unwrap();
            assert_eq!(g.in_edges(&name)[0].src, previous);
            previous = name;
        }
        assert_eq!(g.edges().len(), 20_000);
        assert_eq!(g.in_degree("ReLU_19999"), 1);
        assert_eq!(g.out_edges("ReLU_19999").len(), 0);
        assert_eq!(g.out_edges("input")[0].dst, "ReLU_0");
        assert!(g.in_edges("nope").is_empty());
        g.check_wiring().unwrap();
    }

    #[test]
    fn inputs_and_outputs() {
        let mut g = graph();
        g.add_node("output", NodeKind::Op, "Result", Attrs::default()).unwrap();
        assert_eq!(g.inputs().len(), 1);
        assert_eq!(g.outputs()[0].name, "output");
    }
}
