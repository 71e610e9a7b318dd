//! Error types for the bridge layer.

use thiserror::Error;

use crate::tensor::ElementType;

/// Errors that can occur while driving a predictor.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// A null or stale predictor handle reached an entry point.
    #[error("invalid pointer to the predictor in {0}")]
    InvalidHandle(&'static str),

    /// The element type has no copyable representation.
    #[error("unsupported data type detected: {0}")]
    UnsupportedType(ElementType),

    /// Staged inputs do not match the model's declared inputs.
    #[error("invalid number of input tensors: model expects {expected}, got {actual}")]
    InputCountMismatch { expected: usize, actual: usize },

    /// A tensor shape is empty or carries a negative dimension.
    #[error("invalid shape: {0}")]
    InvalidShape(String),

    /// A converted output was requested past the end of the list.
    #[error("output index {index} out of range ({len} outputs converted)")]
    OutputIndex { index: usize, len: usize },

    /// Failed to load the ONNX model.
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    /// Failed to create an inference session.
    #[error("failed to create session: {0}")]
    SessionCreate(String),

    /// Inference execution failed.
    #[error("inference failed: {0}")]
    InferenceFailed(String),

    /// Output value extraction failed.
    #[error("failed to extract output: {0}")]
    OutputExtraction(String),

    /// Any other fault reported by the engine.
    #[error("engine error: {0}")]
    Engine(String),

    /// Profiling artifact or configuration I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The profiling artifact is not a valid trace.
    #[error("malformed profiling trace: {0}")]
    Trace(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Coarse failure classes reported across the boundary.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidHandle = 1,
    UnsupportedType = 2,
    InputCountMismatch = 3,
    EngineError = 4,
    IoError = 5,
    InvalidArgument = 6,
}

impl BridgeError {
    /// Classify this error for callers that only see a code.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::InvalidHandle(_) => ErrorKind::InvalidHandle,
            BridgeError::UnsupportedType(_) => ErrorKind::UnsupportedType,
            BridgeError::InputCountMismatch { .. } => ErrorKind::InputCountMismatch,
            BridgeError::InvalidShape(_)
            | BridgeError::OutputIndex { .. }
            | BridgeError::Config(_) => ErrorKind::InvalidArgument,
            BridgeError::ModelLoad(_)
            | BridgeError::SessionCreate(_)
            | BridgeError::InferenceFailed(_)
            | BridgeError::OutputExtraction(_)
            | BridgeError::Engine(_) => ErrorKind::EngineError,
            BridgeError::Io(_) | BridgeError::Trace(_) => ErrorKind::IoError,
        }
    }
}
