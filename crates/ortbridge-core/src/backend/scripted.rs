//! In-memory engine with programmable results, for exercising predictors
//! without a native runtime.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::error::BridgeError;
use crate::profiling::{Clock, WallClock};
use crate::tensor::{ElementType, NativeTensor};
use crate::value::EngineValue;
use crate::{Engine, Result};

type Responder = Box<dyn FnMut(&[NativeTensor]) -> Result<Vec<EngineValue>> + Send>;

/// Snapshot of one input the engine received.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedInput {
    pub element_type: ElementType,
    pub shape: Vec<i64>,
    pub data: Vec<u8>,
}

/// Inputs received per run, shared with the test that built the engine.
pub type RunLog = Arc<Mutex<Vec<Vec<RecordedInput>>>>;

/// Engine that answers every run with a caller-supplied function.
pub struct ScriptedEngine {
    input_names: Vec<String>,
    output_names: Vec<String>,
    responder: Responder,
    log: RunLog,
    profile: Option<(PathBuf, String)>,
    profiling_start_ns: Option<i64>,
    profiling_clock: &'static (dyn Clock + Sync),
}

impl ScriptedEngine {
    /// Engine declaring the given inputs and outputs and producing nothing.
    pub fn new(inputs: &[&str], outputs: &[&str]) -> Self {
        Self {
            input_names: inputs.iter().map(|s| s.to_string()).collect(),
            output_names: outputs.iter().map(|s| s.to_string()).collect(),
            responder: Box::new(|_| Ok(Vec::new())),
            log: Arc::new(Mutex::new(Vec::new())),
            profile: None,
            profiling_start_ns: None,
            profiling_clock: &WallClock,
        }
    }

    /// Produce results with `f` on every run.
    pub fn respond_with<F>(mut self, f: F) -> Self
    where
        F: FnMut(&[NativeTensor]) -> Result<Vec<EngineValue>> + Send + 'static,
    {
        self.responder = Box::new(f);
        self
    }

    /// Fail every run with an inference error carrying `message`.
    pub fn failing(self, message: &str) -> Self {
        let message = message.to_string();
        self.respond_with(move |_| Err(BridgeError::InferenceFailed(message.clone())))
    }

    /// Write `contents` to `path` when profiling first ends, as a native
    /// engine would write its trace artifact. Later calls report nothing.
    pub fn with_profile(mut self, path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        self.profile = Some((path.into(), contents.into()));
        self
    }

    /// Fix the profiling start. Without it the start is read from the
    /// profiling clock when the first run begins.
    pub fn with_profiling_start_ns(mut self, start_ns: i64) -> Self {
        self.profiling_start_ns = Some(start_ns);
        self
    }

    /// Clock the profiling start is read from; the wall clock by default.
    pub fn with_profiling_clock(mut self, clock: &'static (dyn Clock + Sync)) -> Self {
        self.profiling_clock = clock;
        self
    }

    /// Handle to the inputs seen by each run.
    pub fn run_log(&self) -> RunLog {
        Arc::clone(&self.log)
    }
}

impl Engine for ScriptedEngine {
    fn run(&mut self, inputs: &[NativeTensor]) -> Result<Vec<EngineValue>> {
        if self.profiling_start_ns.is_none() {
            self.profiling_start_ns = Some(self.profiling_clock.now_ns());
        }

        let recorded = inputs
            .iter()
            .map(|t| RecordedInput {
                element_type: t.element_type(),
                shape: t.shape().to_vec(),
                data: t.bytes().to_vec(),
            })
            .collect();
        self.log
            .lock()
            .map_err(|e| BridgeError::Engine(format!("run log poisoned: {}", e)))?
            .push(recorded);

        (self.responder)(inputs)
    }

    fn input_names(&self) -> &[String] {
        &self.input_names
    }

    fn output_names(&self) -> &[String] {
        &self.output_names
    }

    fn end_profiling(&mut self) -> Result<Option<PathBuf>> {
        match self.profile.take() {
            Some((path, contents)) => {
                std::fs::write(&path, contents)?;
                Ok(Some(path))
            }
            None => Ok(None),
        }
    }

    fn profiling_start_ns(&self) -> Result<i64> {
        Ok(self
            .profiling_start_ns
            .unwrap_or_else(|| self.profiling_clock.now_ns()))
    }

    fn profiling_clock(&self) -> &'static (dyn Clock + Sync) {
        self.profiling_clock
    }
}
