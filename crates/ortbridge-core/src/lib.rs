//! Bridge layer between foreign hosts and the ONNX Runtime inference engine.
//!
//! This crate provides:
//! - A typed value codec between host byte buffers and engine tensors
//! - Flattening of nested engine results (tensor, sequence, map) into an
//!   ordered list of host-owned tensors
//! - The predictor context lifecycle: stage inputs, run, convert, read, clear
//! - Profiling clock reconciliation and engine trace parsing
//!
//! The engine itself sits behind the [`Engine`] trait. With the `native`
//! feature, [`OrtEngine`] implements it on top of `ort`.

mod backend;
pub mod config;
mod error;
mod predictor;
pub mod profiling;
mod session;
mod tensor;
mod value;

pub use backend::Engine;
pub use config::{Device, PredictorConfig};
pub use error::{BridgeError, ErrorKind};
pub use predictor::PredictorContext;
pub use session::{InferenceSession, TensorInput};
pub use tensor::{
    decode_output, encode_input, ElementType, HostBuffer, NativeTensor, TensorDescriptor,
    TensorElement, UnsupportedKind,
};
pub use value::{flatten, EngineValue};

#[cfg(feature = "native")]
pub use backend::ort::OrtEngine;

#[cfg(any(test, feature = "testing"))]
pub use backend::scripted::{RecordedInput, RunLog, ScriptedEngine};

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;
