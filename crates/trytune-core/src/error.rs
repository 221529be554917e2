use crate::{DType, Shape};

#[derive(Debug, thiserror::Error)]
pub enum TensorError {
    #[error("unsupported datatype {0}")]
    UnsupportedDType(String),

    #[error("invalid shape {0:?}")]
    InvalidShape(Vec<i64>),

    #[error("shape {0:?} has more than one dynamic dimension")]
    AmbiguousShape(Vec<i64>),

    #[error("{value} is out of range for {dtype}")]
    OutOfRange { dtype: DType, value: f64 },

    #[error("cannot view {numel} elements as shape {shape:?}")]
    NumelMismatch { shape: Vec<i64>, numel: usize },

    #[error("{dtype} tensor of shape {shape} needs {expected} bytes, got {got}")]
    ByteLength {
        dtype: DType,
        shape: Shape,
        expected: usize,
        got: usize,
    },

    #[error("expected {expected} tensor, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    #[error("cannot batch an empty set of tensors")]
    EmptyBatch,

    #[error("scalar tensors have no batch dimension")]
    ScalarBatch,

    #[error("tensor of shape {other} cannot be batched with shape {first}")]
    IncompatibleBatch { first: Shape, other: Shape },

    #[error("cannot split {rows} rows into chunks totalling {requested}")]
    BatchSplit { rows: usize, requested: usize },
}

/// A tensor failed its port contract.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing tensor for port {port}")]
    Missing { port: String },

    #[error("port {port} expects {expected}, got {got}")]
    Datatype {
        port: String,
        expected: DType,
        got: DType,
    },

    #[error("port {port} expects shape {expected}, got {got}")]
    Shape {
        port: String,
        expected: String,
        got: Shape,
    },
}
