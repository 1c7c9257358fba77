//! # mo-pytorch
//!
//! Converts a module tree into an attributed IR graph by running one
//! `forward` on proxy tensors.
//!
//! Leaf modules get a forward hook building one node per call, free functions
//! are intercepted through a dispatch table, and tensor methods on proxies
//! record their own nodes. Model hooks replace the forward of modules whose
//! real computation can not be traced (Mask R-CNN). The traced graph then
//! goes through the extractors, which type every node as an IR operation.
//!
//! ```
//! use mo_pytorch::prelude::*;
//! use mo_pytorch::nn::{Conv2d, ReLU, Sequential};
//!
//! let model = Sequential::default().push(Conv2d::new(3, 8, 3)).push(ReLU);
//! let graph = mo_pytorch::pytorch()
//!     .unwrap()
//!     .load(&model, &TraceConfig::single(to_shape([1, 3, 32, 32])))
//!     .unwrap();
//! let conv = graph.nodes().iter().find(|n| n.op == "Conv2d").unwrap();
//! assert_eq!(conv.ir_type.as_deref(), Some("Convolution"));
//! ```

#[macro_use]
extern crate derive_new;
#[allow(unused_imports)]
#[macro_use]
extern crate log;

pub mod functional;
pub mod hooks;
pub mod index;
pub mod infer;
pub mod loader;
pub mod mask_rcnn;
pub mod module;
pub mod nn;
pub mod ops;
pub mod shape;
pub mod tensor;
pub mod trace;

pub use loader::pytorch;
pub use mo_core;

pub mod prelude {
    pub use crate::functional::FunctionTable;
    pub use crate::hooks::NodeSpec;
    pub use crate::idx;
    pub use crate::index::Idx;
    pub use crate::loader::{Loader, ModelHookRegistry, TraceConfig};
    pub use crate::module::{Module, TracedOp, Value};
    pub use crate::shape::ShapeValue;
    pub use crate::tensor::ProxyTensor;
    pub use crate::trace::TraceContext;
    pub use mo_core::prelude::*;
}

pub mod internal {
    pub use crate::prelude::*;
    pub use mo_core::internal::*;
}

#[cfg(test)]
#[allow(dead_code)]
fn setup_test_logger() {
    let _ = env_logger::Builder::from_env("MO_LOG").try_init();
}
