//! Engine implementations.

#[cfg(feature = "native")]
pub mod ort;

#[cfg(any(test, feature = "testing"))]
pub mod scripted;

use std::path::PathBuf;

use crate::profiling::Clock;
use crate::tensor::NativeTensor;
use crate::value::EngineValue;
use crate::Result;

/// An opaque inference engine holding one loaded model.
///
/// This trait is the seam between the predictor context and the native
/// runtime, allowing the context to be driven by ONNX Runtime in production
/// and by an in-memory engine in tests.
pub trait Engine: Send {
    /// Run inference once over inputs given in declared input order.
    ///
    /// # Returns
    /// One value per declared output, in declared output order
    fn run(&mut self, inputs: &[NativeTensor]) -> Result<Vec<EngineValue>>;

    /// Get the input names expected by the model.
    fn input_names(&self) -> &[String];

    /// Get the output names produced by the model.
    fn output_names(&self) -> &[String];

    /// Stop profiling and return the artifact the engine wrote, if any.
    fn end_profiling(&mut self) -> Result<Option<PathBuf>>;

    /// Profiling start time in nanoseconds on [`profiling_clock`](Self::profiling_clock).
    fn profiling_start_ns(&self) -> Result<i64>;

    /// The clock the engine stamps its profiling start with.
    fn profiling_clock(&self) -> &'static (dyn Clock + Sync);
}

impl<E: Engine + ?Sized> Engine for Box<E> {
    fn run(&mut self, inputs: &[NativeTensor]) -> Result<Vec<EngineValue>> {
        (**self).run(inputs)
    }

    fn input_names(&self) -> &[String] {
        (**self).input_names()
    }

    fn output_names(&self) -> &[String] {
        (**self).output_names()
    }

    fn end_profiling(&mut self) -> Result<Option<PathBuf>> {
        (**self).end_profiling()
    }

    fn profiling_start_ns(&self) -> Result<i64> {
        (**self).profiling_start_ns()
    }

    fn profiling_clock(&self) -> &'static (dyn Clock + Sync) {
        (**self).profiling_clock()
    }
}
