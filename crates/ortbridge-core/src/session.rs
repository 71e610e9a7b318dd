//! High-level inference session over a predictor context.

use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::predictor::PredictorContext;
use crate::profiling::{Clock, Trace, WallClock};
use crate::tensor::{ElementType, HostBuffer, TensorDescriptor};
use crate::{Engine, Result};

/// One input for [`InferenceSession::predict`].
#[derive(Debug)]
pub struct TensorInput {
    pub buffer: HostBuffer,
    pub shape: Vec<i64>,
    pub element_type: ElementType,
}

impl TensorInput {
    pub fn new(buffer: HostBuffer, shape: Vec<i64>, element_type: ElementType) -> Self {
        Self {
            buffer,
            shape,
            element_type,
        }
    }

    /// Input from typed elements.
    pub fn from_slice<T: crate::tensor::TensorElement>(data: &[T], shape: &[i64]) -> Self {
        Self::new(HostBuffer::from_slice(data), shape.to_vec(), T::ELEMENT_TYPE)
    }
}

/// Drives a predictor through repeated predict/read cycles and collects the
/// per-run profiling traces on close.
pub struct InferenceSession<E: Engine> {
    context: PredictorContext<E>,
    run_starts: Vec<i64>,
    run_ends: Vec<i64>,
}

#[cfg(feature = "native")]
impl InferenceSession<crate::OrtEngine> {
    /// Open an ONNX Runtime session from configuration.
    pub fn open(config: &crate::PredictorConfig) -> Result<Self> {
        Ok(Self::new(PredictorContext::open(config)?))
    }
}

impl<E: Engine> InferenceSession<E> {
    pub fn new(context: PredictorContext<E>) -> Self {
        Self {
            context,
            run_starts: Vec::new(),
            run_ends: Vec::new(),
        }
    }

    pub fn context(&self) -> &PredictorContext<E> {
        &self.context
    }

    /// Number of runs recorded for trace splitting.
    pub fn recorded_runs(&self) -> usize {
        self.run_ends.len()
    }

    /// Clear the previous cycle, stage `inputs` and run once.
    pub fn predict(&mut self, inputs: Vec<TensorInput>) -> Result<()> {
        if inputs.is_empty() {
            return Err(BridgeError::InputCountMismatch {
                expected: self.context.input_names().len(),
                actual: 0,
            });
        }

        self.context.clear();
        for input in inputs {
            self.context
                .add_input(input.buffer, &input.shape, input.element_type)?;
        }

        let profiling = self.context.profiling_enabled();
        let start = WallClock.now_ns();
        self.context.run()?;
        if profiling {
            self.run_starts.push(start);
            self.run_ends.push(WallClock.now_ns());
        }
        Ok(())
    }

    /// Convert the last run's results and return owned copies.
    pub fn read_outputs(&mut self) -> Result<Vec<TensorDescriptor>> {
        self.context.convert_outputs()?;
        if self.context.num_outputs() == 0 {
            return Err(BridgeError::OutputExtraction("zero output tensors".to_string()));
        }
        Ok(self.context.outputs().to_vec())
    }

    /// Tear the session down.
    ///
    /// With profiling enabled, returns the engine trace split into one
    /// [`Trace`] per recorded run; otherwise an empty list.
    pub fn close(mut self) -> Result<Vec<Trace>> {
        let traces = if self.context.profiling_enabled() {
            self.collect_traces()
        } else {
            Ok(Vec::new())
        };

        let destroyed = self.context.destroy();
        let traces = traces?;
        destroyed?;
        Ok(traces)
    }

    fn collect_traces(&mut self) -> Result<Vec<Trace>> {
        self.context.end_profiling()?;
        let start_ns = self.context.profiling_start_time_ns()?;
        let profile = self.context.read_profile()?;
        if profile.is_empty() {
            warn!("Profiling was enabled but the engine produced no trace");
            return Ok(Vec::new());
        }

        let trace = Trace::parse(&profile, start_ns)?;
        debug!(
            "Parsed {} profiling events across {} runs",
            trace.len(),
            self.run_ends.len()
        );
        Ok(trace.split(&self.run_starts, &self.run_ends))
    }
}
