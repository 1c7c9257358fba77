//! The IR graph a trace is recorded into.
mod attr;
mod graph;
mod node;

pub use self::attr::{Attr, Attrs};
pub use self::graph::Graph;
pub use self::node::{Edge, Node, NodeKind};
