use super::Attrs;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Op,
    Data,
}

#[derive(Clone, Debug)]
pub struct Node {
    pub id: usize,
    pub name: String,
    pub kind: NodeKind,
    /// Framework-level kind tag: a module type name (`Conv2d`), an operator
    /// descriptor (`StridedSlice`), or a structural tag (`Parameter`,
    /// `Const`, `Result`).
    pub op: String,
    pub attrs: Attrs,
    /// Raw module / descriptor state captured at trace time.
    pub module: Attrs,
    /// IR operation type, once an extractor has run.
    pub ir_type: Option<String>,
}

impl Node {
    pub fn op_is(&self, op: &str) -> bool {
        self.op.eq_ignore_ascii_case(op)
    }

    pub fn is_typed(&self) -> bool {
        self.ir_type.is_some()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "#{} \"{}\" {}", self.id, self.name, self.op)
    }
}

/// A data edge, from output port `out` of `src` to input port `inlet` of
/// `dst`.
#[derive(Clone, Debug, PartialEq)]
pub struct Edge {
    pub src: String,
    pub dst: String,
    pub out: usize,
    pub inlet: usize,
    pub name: String,
    pub fw_tensor_debug_info: Vec<(String, String)>,
    pub in_attrs: Vec<String>,
    pub out_attrs: Vec<String>,
    pub data_attrs: Vec<String>,
}

impl Edge {
    /// An edge named after its producer, with the default attribute lists.
    pub fn new(src: impl Into<String>, dst: impl Into<String>, out: usize, inlet: usize) -> Edge {
        let src = src.into();
        Edge {
            name: src.clone(),
            fw_tensor_debug_info: vec![(src.clone(), src.clone())],
            in_attrs: vec!["in".into(), "name".into()],
            out_attrs: vec!["out".into(), "name".into()],
            data_attrs: vec!["fw_tensor_debug_info".into()],
            src,
            dst: dst.into(),
            out,
            inlet,
        }
    }
}
