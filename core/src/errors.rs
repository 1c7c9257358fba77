//! Failures of a conversion that callers may want to tell apart.
//!
//! They travel as `anyhow::Error` like everything else, and can be recovered
//! with `err.downcast_ref::<TraceError>()`.
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceError {
    /// The graph under construction is in a state tracing never produces.
    Integrity(String),
    /// An operator that neither interception nor extraction knows about.
    Unsupported { op: String },
    /// A shape-inference capability disagrees with the number of outputs.
    Arity { op: String, expected: usize, got: usize },
    /// A multi-output operator without shape inference.
    MissingShapeInference { op: String },
}

impl TraceError {
    pub fn integrity(msg: impl Into<String>) -> TraceError {
        TraceError::Integrity(msg.into())
    }

    pub fn unsupported(op: impl Into<String>) -> TraceError {
        TraceError::Unsupported { op: op.into() }
    }
}

impl fmt::Display for TraceError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TraceError::Integrity(msg) => write!(fmt, "Graph integrity violation: {msg}"),
            TraceError::Unsupported { op } => write!(fmt, "Unsupported operator: {op}"),
            TraceError::Arity { op, expected, got } => write!(
                fmt,
                "Shape inference for {op} produced {got} shape(s), {expected} output(s) expected"
            ),
            TraceError::MissingShapeInference { op } => {
                write!(fmt, "{op} has several outputs but no shape inference")
            }
        }
    }
}

impl std::error::Error for TraceError {}
