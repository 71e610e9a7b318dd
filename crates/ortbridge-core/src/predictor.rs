//! The predictor context: one loaded model and its per-run buffers.
//!
//! Lifecycle: inputs are staged with [`PredictorContext::add_input`], the
//! model runs once with [`PredictorContext::run`], results are flattened by
//! [`PredictorContext::convert_outputs`] and read back by index. Calling
//! [`PredictorContext::clear`] returns the context to the staging state.
//! Call `convert_outputs` before reading any output.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::BridgeError;
use crate::profiling;
use crate::tensor::{encode_input, ElementType, HostBuffer, NativeTensor, TensorDescriptor};
use crate::value::{flatten, EngineValue};
use crate::{Engine, Result};

/// Owns one engine session plus its pending inputs and converted outputs.
///
/// Not synchronized; drive each context from one caller at a time.
pub struct PredictorContext<E: Engine> {
    engine: E,
    input_names: Vec<String>,
    output_names: Vec<String>,
    pending_inputs: Vec<NativeTensor>,
    raw_outputs: Vec<EngineValue>,
    converted_outputs: Vec<TensorDescriptor>,
    profiling_enabled: bool,
    profile_artifact_path: Option<PathBuf>,
}

#[cfg(feature = "native")]
impl PredictorContext<crate::OrtEngine> {
    /// Load the configured model into a new ONNX Runtime session.
    pub fn open(config: &crate::PredictorConfig) -> Result<Self> {
        let engine = crate::OrtEngine::from_config(config)?;
        Ok(Self::new(engine, config.enable_profiling))
    }
}

impl<E: Engine> PredictorContext<E> {
    /// Wrap a loaded engine, caching its input and output names.
    pub fn new(engine: E, profiling_enabled: bool) -> Self {
        let input_names = engine.input_names().to_vec();
        let output_names = engine.output_names().to_vec();

        debug!("Predictor inputs: {:?}", input_names);
        debug!("Predictor outputs: {:?}", output_names);

        Self {
            engine,
            input_names,
            output_names,
            pending_inputs: Vec::new(),
            raw_outputs: Vec::new(),
            converted_outputs: Vec::new(),
            profiling_enabled,
            profile_artifact_path: None,
        }
    }

    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }

    pub fn pending_input_count(&self) -> usize {
        self.pending_inputs.len()
    }

    pub fn profiling_enabled(&self) -> bool {
        self.profiling_enabled
    }

    /// Path of the profiling artifact, once profiling has ended.
    pub fn profile_artifact_path(&self) -> Option<&Path> {
        self.profile_artifact_path.as_deref()
    }

    /// Stage one input tensor. Inputs bind to model inputs in staging order.
    pub fn add_input(
        &mut self,
        buffer: HostBuffer,
        shape: &[i64],
        element_type: ElementType,
    ) -> Result<()> {
        let tensor = encode_input(buffer, shape, element_type)?;
        debug!(
            "Staged input {} as {} {:?}",
            self.pending_inputs.len(),
            element_type,
            shape
        );
        self.pending_inputs.push(tensor);
        Ok(())
    }

    /// Run the model once over the staged inputs.
    ///
    /// Staged inputs are kept until [`clear`](Self::clear).
    pub fn run(&mut self) -> Result<()> {
        if self.pending_inputs.len() != self.input_names.len() {
            return Err(BridgeError::InputCountMismatch {
                expected: self.input_names.len(),
                actual: self.pending_inputs.len(),
            });
        }

        info!("Running inference with {} inputs", self.pending_inputs.len());
        self.raw_outputs = self.engine.run(&self.pending_inputs)?;
        debug!("Engine returned {} output values", self.raw_outputs.len());
        Ok(())
    }

    /// Flatten every result of the last run into host-owned tensors.
    ///
    /// Each call appends; converting twice without clearing yields every
    /// output twice.
    pub fn convert_outputs(&mut self) -> Result<()> {
        let before = self.converted_outputs.len();
        for value in &self.raw_outputs {
            flatten(value, &mut self.converted_outputs)?;
        }
        debug!(
            "Converted {} output tensors",
            self.converted_outputs.len() - before
        );
        Ok(())
    }

    pub fn num_outputs(&self) -> usize {
        self.converted_outputs.len()
    }

    /// Converted output at flattened position `index`.
    pub fn output(&self, index: usize) -> Result<&TensorDescriptor> {
        self.converted_outputs
            .get(index)
            .ok_or(BridgeError::OutputIndex {
                index,
                len: self.converted_outputs.len(),
            })
    }

    pub fn outputs(&self) -> &[TensorDescriptor] {
        &self.converted_outputs
    }

    /// Release converted outputs, engine results and staged inputs.
    pub fn clear(&mut self) {
        if !self.pending_inputs.is_empty() || !self.converted_outputs.is_empty() {
            debug!(
                "Clearing {} inputs and {} outputs",
                self.pending_inputs.len(),
                self.converted_outputs.len()
            );
        }
        self.converted_outputs.clear();
        self.raw_outputs.clear();
        self.pending_inputs.clear();
    }

    /// Stop engine profiling and remember where the artifact was written.
    pub fn end_profiling(&mut self) -> Result<()> {
        if !self.profiling_enabled {
            return Ok(());
        }
        // The engine reports its artifact once; later calls must not forget it.
        if let Some(path) = self.engine.end_profiling()? {
            info!("Profiling artifact written to {}", path.display());
            self.profile_artifact_path = Some(path);
        }
        Ok(())
    }

    /// Contents of the profiling artifact, or an empty string if there is none.
    pub fn read_profile(&self) -> Result<String> {
        match &self.profile_artifact_path {
            Some(path) => Ok(std::fs::read_to_string(path)?),
            None => Ok(String::new()),
        }
    }

    /// Profiling start time on the wall clock, in nanoseconds since the epoch.
    pub fn profiling_start_time_ns(&self) -> Result<i64> {
        let engine_start = self.engine.profiling_start_ns()?;
        Ok(profiling::wall_clock_start_ns(
            engine_start,
            self.engine.profiling_clock(),
        ))
    }

    /// Clear, delete any profiling artifact, and release the session.
    pub fn destroy(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        self.clear();
        if let Some(path) = self.profile_artifact_path.take() {
            debug!("Removing profiling artifact {}", path.display());
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl<E: Engine> Drop for PredictorContext<E> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Failed to release predictor: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::scripted::ScriptedEngine;
    use crate::profiling::Clock;
    use pretty_assertions::assert_eq;

    fn doubling_engine() -> ScriptedEngine {
        ScriptedEngine::new(&["x"], &["y"]).respond_with(|inputs| {
            let data: Vec<f32> = bytemuck::pod_collect_to_vec::<u8, f32>(inputs[0].bytes())
                .iter()
                .map(|v| v * 2.0)
                .collect();
            Ok(vec![EngineValue::Tensor(NativeTensor::from_slice(
                &data,
                inputs[0].shape(),
            ))])
        })
    }

    fn stage_floats(ctx: &mut PredictorContext<ScriptedEngine>, values: &[f32], shape: &[i64]) {
        ctx.add_input(HostBuffer::from_slice(values), shape, ElementType::Float32)
            .unwrap();
    }

    #[test]
    fn test_end_to_end_single_tensor() {
        let mut ctx = PredictorContext::new(doubling_engine(), false);
        assert_eq!(ctx.input_names(), &["x".to_string()]);
        assert_eq!(ctx.output_names(), &["y".to_string()]);

        stage_floats(&mut ctx, &[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        ctx.run().unwrap();
        ctx.convert_outputs().unwrap();

        let out = ctx.output(0).unwrap();
        assert_eq!(out.element_type, ElementType::Float32);
        assert_eq!(out.shape, vec![2, 2]);
        assert_eq!(out.to_vec::<f32>().unwrap(), vec![2.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn test_end_to_end_nested_sequence() {
        let engine = ScriptedEngine::new(&["x"], &["y"]).respond_with(|_| {
            Ok(vec![EngineValue::Sequence(vec![
                EngineValue::Tensor(NativeTensor::from_slice(&[5i64], &[1])),
                EngineValue::Tensor(NativeTensor::from_slice(&[7i64], &[1])),
            ])])
        });
        let mut ctx = PredictorContext::new(engine, false);
        stage_floats(&mut ctx, &[0.0], &[1]);
        ctx.run().unwrap();
        ctx.convert_outputs().unwrap();

        assert_eq!(ctx.num_outputs(), 2);
        assert_eq!(ctx.output(0).unwrap().to_vec::<i64>().unwrap(), vec![5]);
        assert_eq!(ctx.output(1).unwrap().to_vec::<i64>().unwrap(), vec![7]);
    }

    #[test]
    fn test_input_count_mismatch() {
        let engine = ScriptedEngine::new(&["a", "b"], &["y"]);
        let log = engine.run_log();
        let mut ctx = PredictorContext::new(engine, false);
        stage_floats(&mut ctx, &[1.0], &[1]);

        let err = ctx.run().unwrap_err();
        assert!(matches!(
            err,
            BridgeError::InputCountMismatch { expected: 2, actual: 1 }
        ));
        assert_eq!(ctx.pending_input_count(), 1);
        assert!(log.lock().unwrap().is_empty());

        let err = PredictorContext::new(ScriptedEngine::new(&["x"], &[]), false)
            .run()
            .unwrap_err();
        assert!(matches!(err, BridgeError::InputCountMismatch { expected: 1, actual: 0 }));
    }

    #[test]
    fn test_unsupported_input_type_is_not_staged() {
        let mut ctx = PredictorContext::new(doubling_engine(), false);
        let err = ctx
            .add_input(
                HostBuffer::from_bytes(vec![0; 2]),
                &[1],
                ElementType::from_onnx_code(10),
            )
            .unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedType(_)));
        assert_eq!(ctx.pending_input_count(), 0);
    }

    #[test]
    fn test_clear_then_new_cycle() {
        let engine = doubling_engine();
        let log = engine.run_log();
        let mut ctx = PredictorContext::new(engine, false);

        stage_floats(&mut ctx, &[1.0, 2.0], &[2]);
        ctx.run().unwrap();
        ctx.convert_outputs().unwrap();
        assert_eq!(ctx.num_outputs(), 1);

        ctx.clear();
        assert_eq!(ctx.num_outputs(), 0);
        assert_eq!(ctx.pending_input_count(), 0);
        ctx.clear();

        // Nothing left to convert until the next run.
        ctx.convert_outputs().unwrap();
        assert_eq!(ctx.num_outputs(), 0);

        stage_floats(&mut ctx, &[10.0, 20.0, 30.0], &[3]);
        ctx.run().unwrap();
        ctx.convert_outputs().unwrap();
        assert_eq!(ctx.num_outputs(), 1);
        assert_eq!(ctx.output(0).unwrap().to_vec::<f32>().unwrap(), vec![20.0, 40.0, 60.0]);
        assert_eq!(ctx.output(0).unwrap().shape, vec![3]);

        let runs = log.lock().unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[1][0].shape, vec![3]);
    }

    #[test]
    fn test_convert_twice_duplicates_outputs() {
        let engine = ScriptedEngine::new(&["x"], &["a", "b"]).respond_with(|_| {
            Ok(vec![
                EngineValue::Tensor(NativeTensor::from_slice(&[1u8, 2], &[2])),
                EngineValue::Map(vec![EngineValue::Tensor(NativeTensor::from_slice(
                    &[0.5f64],
                    &[1],
                ))]),
            ])
        });
        let mut ctx = PredictorContext::new(engine, false);
        stage_floats(&mut ctx, &[1.0], &[1]);
        ctx.run().unwrap();

        ctx.convert_outputs().unwrap();
        let first: Vec<TensorDescriptor> = ctx.outputs().to_vec();
        ctx.convert_outputs().unwrap();

        assert_eq!(ctx.num_outputs(), 4);
        assert_eq!(&ctx.outputs()[..2], first.as_slice());
        assert_eq!(&ctx.outputs()[2..], first.as_slice());
    }

    #[test]
    fn test_output_index_out_of_range() {
        let ctx = PredictorContext::new(doubling_engine(), false);
        let err = ctx.output(0).unwrap_err();
        assert!(matches!(err, BridgeError::OutputIndex { index: 0, len: 0 }));
    }

    #[test]
    fn test_engine_failure_surfaces() {
        let engine = ScriptedEngine::new(&["x"], &["y"]).failing("shape mismatch on node 3");
        let mut ctx = PredictorContext::new(engine, false);
        stage_floats(&mut ctx, &[1.0], &[1]);

        let err = ctx.run().unwrap_err();
        assert_eq!(err.to_string(), "inference failed: shape mismatch on node 3");
        ctx.convert_outputs().unwrap();
        assert_eq!(ctx.num_outputs(), 0);
    }

    #[test]
    fn test_profiling_artifact_removed_on_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("onnxruntime_profile.json");
        let engine = doubling_engine()
            .with_profile(&path, "[]")
            .with_profiling_start_ns(123);

        let mut ctx = PredictorContext::new(engine, true);
        assert_eq!(ctx.read_profile().unwrap(), "");

        ctx.end_profiling().unwrap();
        assert_eq!(ctx.profile_artifact_path(), Some(path.as_path()));
        assert_eq!(ctx.read_profile().unwrap(), "[]");
        assert!(path.exists());

        ctx.destroy().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_profiling_disabled_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never_written.json");
        let engine = doubling_engine().with_profile(&path, "[]");

        let mut ctx = PredictorContext::new(engine, false);
        ctx.end_profiling().unwrap();
        assert_eq!(ctx.profile_artifact_path(), None);
        assert_eq!(ctx.read_profile().unwrap(), "");
        ctx.destroy().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_artifact_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dropped.json");
        let mut ctx = PredictorContext::new(doubling_engine().with_profile(&path, "[]"), true);
        ctx.end_profiling().unwrap();
        assert!(path.exists());
        drop(ctx);
        assert!(!path.exists());
    }

    #[test]
    fn test_ending_profiling_twice_keeps_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("onnxruntime_profile.json");
        let mut ctx = PredictorContext::new(doubling_engine().with_profile(&path, "[]"), true);

        ctx.end_profiling().unwrap();
        ctx.end_profiling().unwrap();
        assert_eq!(ctx.profile_artifact_path(), Some(path.as_path()));
        assert_eq!(ctx.read_profile().unwrap(), "[]");

        ctx.destroy().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_monotonic_start_time_lands_on_wall_clock() {
        let ctx = PredictorContext::new(
            doubling_engine()
                .with_profiling_clock(&profiling::MonotonicClock)
                .with_profiling_start_ns(profiling::MonotonicClock.now_ns()),
            true,
        );
        let start = ctx.profiling_start_time_ns().unwrap();
        let wall = chrono::Utc::now().timestamp_nanos_opt().unwrap();
        assert!((wall - start).abs() < 1_000_000_000);
    }

    #[test]
    fn test_epoch_start_time_is_not_shifted() {
        let engine_start = profiling::WallClock.now_ns();
        let ctx = PredictorContext::new(
            doubling_engine()
                .with_profiling_clock(&profiling::WallClock)
                .with_profiling_start_ns(engine_start),
            true,
        );
        let start = ctx.profiling_start_time_ns().unwrap();
        assert!((start - engine_start).abs() < 1_000_000_000);
    }
}
