//! # mo-core
//!
//! The attributed multigraph a traced model is reconstructed into, and the
//! machinery that turns its framework-level nodes into typed IR operations.
//!
//! ```
//! use mo_core::internal::*;
//!
//! let mut graph = Graph::default();
//! graph.add_node("input", NodeKind::Op, "Parameter", Attrs::default()).unwrap();
//! let relu = graph.unique_id("ReLU_");
//! graph.add_node(&relu, NodeKind::Op, "ReLU", Attrs::default()).unwrap();
//! graph.add_edge(Edge::new("input", &relu, 0, 0)).unwrap();
//! assert_eq!(graph.in_edges(&relu).len(), 1);
//! ```

#[allow(unused_imports)]
#[macro_use]
extern crate log;

pub mod errors;
pub mod extract;
pub mod model;

pub use mo_data;

pub mod prelude {
    pub use crate::errors::TraceError;
    pub use crate::extract::{Extractor, ExtractorRegistry, extract_node_attrs};
    pub use crate::model::{Attr, Attrs, Edge, Graph, Node, NodeKind};
    pub use mo_data::prelude::*;
}

pub mod internal {
    pub use crate::prelude::*;
    pub use mo_data::internal::*;
}

#[cfg(test)]
#[allow(dead_code)]
fn setup_test_logger() {
    let _ = env_logger::Builder::from_env("MO_LOG").try_init();
}
