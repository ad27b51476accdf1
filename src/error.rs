use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Shape error: {0}")]
    ShapeError(String),

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Incompatible shapes for operation {op}: {shape_a:?} and {shape_b:?}")]
    IncompatibleShapes {
        op: String,
        shape_a: Vec<usize>,
        shape_b: Vec<usize>,
    },

    #[error("Dimension mismatch: expected {0}, got {1}")]
    DimensionMismatch(usize, usize),

    #[cfg(feature = "reader")]
    #[error("CSV parsing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[cfg(feature = "serialization")]
    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[cfg(feature = "serialization")]
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Variable {0} has no value")]
    Uninitialized(String),

    #[error("Backward requires a scalar loss, {name} has shape {shape:?}")]
    NonScalarLoss { name: String, shape: Vec<usize> },

    #[error("Variable {name} was not produced by any operation on tape {tape_id}")]
    NotRecorded { name: String, tape_id: usize },

    #[error("Tape {0} has already been replayed")]
    TapeReplayed(usize),

    #[error("Variable {name} was produced on tape {producer}, cannot be used on tape {tape_id}")]
    StaleVariable {
        name: String,
        producer: usize,
        tape_id: usize,
    },

    #[error("Invalid attribute '{key}': {reason}")]
    InvalidAttribute { key: String, reason: String },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Record stream exhausted")]
    EndOfStream,

    #[error("Internal logic error: {0}")]
    InternalLogicError(String),

    #[error("Gradient check error: analytical={analytical:?}, numerical={numerical:?}, max_rel_error={max_rel_error}, max_abs_error={max_abs_error}, at_index={at_index}")]
    GradientCheckError {
        analytical: Vec<f32>,
        numerical: Vec<f32>,
        max_rel_error: f32,
        max_abs_error: f32,
        at_index: usize,
    },

    #[error("Operation not yet implemented: {0}")]
    Unimplemented(String),
}

impl Error {
    pub(crate) fn attribute(key: &str, reason: impl Into<String>) -> Self {
        Error::InvalidAttribute {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}
