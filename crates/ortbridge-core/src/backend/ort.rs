//! ONNX Runtime (ort) engine for native platforms.

use std::fmt::Debug;
use std::path::{Path, PathBuf};

use bytemuck::Pod;
use ort::ep::XNNPACK;
use ort::memory::Allocator;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::{Session, SessionInputValue};
use ort::tensor::{PrimitiveTensorElementType, TensorElementType};
use ort::value::{DynValue, DynValueTypeMarker, Tensor, ValueType};
use tracing::{debug, info};

use crate::config::{Device, PredictorConfig};
use crate::error::BridgeError;
use crate::profiling::{Clock, HighResolutionClock};
use crate::tensor::{ElementType, NativeTensor, UnsupportedKind};
use crate::value::EngineValue;
use crate::{Engine, Result};

/// Engine backed by an ONNX Runtime session.
pub struct OrtEngine {
    session: Session,
    input_names: Vec<String>,
    output_names: Vec<String>,
    profiling: bool,
}

impl OrtEngine {
    /// Load a model file on the CPU with default settings.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_config(&PredictorConfig::new(path.as_ref()))
    }

    /// Load the model a configuration points at.
    pub fn from_config(config: &PredictorConfig) -> Result<Self> {
        config.validate()?;
        info!("Loading ONNX model from: {}", config.model_path.display());

        let session = session_builder(config)?
            .commit_from_file(&config.model_path)
            .map_err(|e| BridgeError::ModelLoad(e.to_string()))?;

        Ok(Self::from_session(session, config.enable_profiling))
    }

    /// Load a model from bytes.
    pub fn from_bytes(bytes: &[u8], config: &PredictorConfig) -> Result<Self> {
        debug!("Loading ONNX model from {} bytes", bytes.len());

        let session = session_builder(config)?
            .commit_from_memory(bytes)
            .map_err(|e| BridgeError::ModelLoad(e.to_string()))?;

        Ok(Self::from_session(session, config.enable_profiling))
    }

    fn from_session(session: Session, profiling: bool) -> Self {
        let input_names: Vec<String> = session
            .inputs()
            .iter()
            .map(|i| i.name().to_string())
            .collect();

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        debug!("Model inputs: {:?}", input_names);
        debug!("Model outputs: {:?}", output_names);

        Self {
            session,
            input_names,
            output_names,
            profiling,
        }
    }
}

fn session_builder(config: &PredictorConfig) -> Result<SessionBuilder> {
    let level = match config.optimization_level {
        0 => GraphOptimizationLevel::Disable,
        1 => GraphOptimizationLevel::Level1,
        2 => GraphOptimizationLevel::Level2,
        _ => GraphOptimizationLevel::Level3,
    };

    let mut builder = Session::builder()
        .map_err(|e| BridgeError::SessionCreate(e.to_string()))?
        .with_optimization_level(level)
        .map_err(|e| BridgeError::SessionCreate(e.to_string()))?;

    builder = match config.device {
        Device::Cpu => builder
            .with_execution_providers([XNNPACK::default().build()])
            .map_err(|e| BridgeError::SessionCreate(e.to_string()))?,
        Device::Cuda { device_id } => with_cuda(builder, device_id)?,
    };

    if config.intra_threads > 0 {
        builder = builder
            .with_intra_threads(config.intra_threads)
            .map_err(|e| BridgeError::SessionCreate(e.to_string()))?;
    }

    if config.enable_profiling {
        builder = builder
            .with_profiling(&config.profile_prefix)
            .map_err(|e| BridgeError::SessionCreate(e.to_string()))?;
    }

    Ok(builder)
}

#[cfg(feature = "cuda")]
fn with_cuda(builder: SessionBuilder, device_id: i32) -> Result<SessionBuilder> {
    let cuda = ort::ep::CUDA::default().with_device_id(device_id).build();
    builder
        .with_execution_providers([cuda, XNNPACK::default().build()])
        .map_err(|e| BridgeError::SessionCreate(e.to_string()))
}

#[cfg(not(feature = "cuda"))]
fn with_cuda(_builder: SessionBuilder, device_id: i32) -> Result<SessionBuilder> {
    Err(BridgeError::SessionCreate(format!(
        "CUDA device {} requested but ortbridge was built without the `cuda` feature",
        device_id
    )))
}

fn to_session_value<T>(tensor: &NativeTensor) -> Result<SessionInputValue<'static>>
where
    T: PrimitiveTensorElementType + Pod + Debug,
{
    let shape: Vec<i64> = tensor.shape().to_vec();
    let data: Vec<T> = bytemuck::pod_collect_to_vec(tensor.bytes());
    Tensor::from_array((shape, data))
        .map(Into::into)
        .map_err(|e| BridgeError::Engine(e.to_string()))
}

fn convert_input(tensor: &NativeTensor) -> Result<SessionInputValue<'static>> {
    match tensor.element_type() {
        ElementType::Int8 => to_session_value::<i8>(tensor),
        ElementType::Int16 => to_session_value::<i16>(tensor),
        ElementType::Int32 => to_session_value::<i32>(tensor),
        ElementType::Int64 => to_session_value::<i64>(tensor),
        ElementType::Uint8 => to_session_value::<u8>(tensor),
        ElementType::Uint16 => to_session_value::<u16>(tensor),
        ElementType::Uint32 => to_session_value::<u32>(tensor),
        ElementType::Uint64 => to_session_value::<u64>(tensor),
        ElementType::Float32 => to_session_value::<f32>(tensor),
        ElementType::Float64 => to_session_value::<f64>(tensor),
        ElementType::Bool => {
            let shape: Vec<i64> = tensor.shape().to_vec();
            let data: Vec<bool> = tensor.bytes().iter().map(|&b| b != 0).collect();
            Tensor::from_array((shape, data))
                .map(Into::into)
                .map_err(|e| BridgeError::Engine(e.to_string()))
        }
        other => Err(BridgeError::UnsupportedType(other)),
    }
}

fn element_type(ty: TensorElementType) -> ElementType {
    match ty {
        TensorElementType::Float32 => ElementType::Float32,
        TensorElementType::Float64 => ElementType::Float64,
        TensorElementType::Int8 => ElementType::Int8,
        TensorElementType::Int16 => ElementType::Int16,
        TensorElementType::Int32 => ElementType::Int32,
        TensorElementType::Int64 => ElementType::Int64,
        TensorElementType::Uint8 => ElementType::Uint8,
        TensorElementType::Uint16 => ElementType::Uint16,
        TensorElementType::Uint32 => ElementType::Uint32,
        TensorElementType::Uint64 => ElementType::Uint64,
        TensorElementType::Bool => ElementType::Bool,
        TensorElementType::Float16 => ElementType::Unsupported(UnsupportedKind::Float16),
        TensorElementType::Bfloat16 => ElementType::Unsupported(UnsupportedKind::BFloat16),
        TensorElementType::String => ElementType::Unsupported(UnsupportedKind::String),
        TensorElementType::Complex64 => ElementType::Unsupported(UnsupportedKind::Complex64),
        TensorElementType::Complex128 => ElementType::Unsupported(UnsupportedKind::Complex128),
        TensorElementType::Undefined => ElementType::Unsupported(UnsupportedKind::Undefined),
        _ => ElementType::Unsupported(UnsupportedKind::Unknown(-1)),
    }
}

fn copy_tensor<T>(value: &DynValue, element_type: ElementType) -> Result<NativeTensor>
where
    T: PrimitiveTensorElementType + Pod,
{
    let (shape, data) = value
        .try_extract_tensor::<T>()
        .map_err(|e| BridgeError::OutputExtraction(e.to_string()))?;
    let shape: Vec<i64> = shape.iter().copied().collect();
    Ok(NativeTensor::new(
        element_type,
        shape,
        bytemuck::cast_slice(data).to_vec(),
    ))
}

fn convert_tensor(value: &DynValue, ty: TensorElementType) -> Result<NativeTensor> {
    let element_type = element_type(ty);
    match element_type {
        ElementType::Int8 => copy_tensor::<i8>(value, element_type),
        ElementType::Int16 => copy_tensor::<i16>(value, element_type),
        ElementType::Int32 => copy_tensor::<i32>(value, element_type),
        ElementType::Int64 => copy_tensor::<i64>(value, element_type),
        ElementType::Uint8 => copy_tensor::<u8>(value, element_type),
        ElementType::Uint16 => copy_tensor::<u16>(value, element_type),
        ElementType::Uint32 => copy_tensor::<u32>(value, element_type),
        ElementType::Uint64 => copy_tensor::<u64>(value, element_type),
        ElementType::Float32 => copy_tensor::<f32>(value, element_type),
        ElementType::Float64 => copy_tensor::<f64>(value, element_type),
        ElementType::Bool => {
            let (shape, data) = value
                .try_extract_tensor::<bool>()
                .map_err(|e| BridgeError::OutputExtraction(e.to_string()))?;
            Ok(NativeTensor::new(
                element_type,
                shape.iter().copied().collect(),
                data.iter().map(|&b| b as u8).collect(),
            ))
        }
        // Flattening reports the unsupported type when it reaches this leaf.
        ElementType::Unsupported(_) => Ok(NativeTensor::new(element_type, Vec::new(), Vec::new())),
    }
}

macro_rules! map_values {
    ($value:expr, $key:ty, $val:ty) => {{
        let map = $value
            .try_extract_map::<$key, $val>()
            .map_err(|e| BridgeError::OutputExtraction(e.to_string()))?;
        // The engine hands maps back unordered; key order keeps results stable.
        let mut entries: Vec<($key, $val)> = map.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let values: Vec<$val> = entries.into_iter().map(|(_, v)| v).collect();
        NativeTensor::from_slice(&values, &[values.len() as i64])
    }};
}

fn convert_map(
    value: &DynValue,
    key: TensorElementType,
    val: TensorElementType,
) -> Result<EngineValue> {
    use TensorElementType as T;

    let tensor = match (key, val) {
        (T::Int64, T::Float32) => map_values!(value, i64, f32),
        (T::Int64, T::Float64) => map_values!(value, i64, f64),
        (T::Int64, T::Int64) => map_values!(value, i64, i64),
        (T::String, T::Float32) => map_values!(value, String, f32),
        (T::String, T::Float64) => map_values!(value, String, f64),
        (T::String, T::Int64) => map_values!(value, String, i64),
        (key, other) => {
            let ty = element_type(other);
            return Err(if ty.is_supported() {
                BridgeError::OutputExtraction(format!("unsupported map key type {:?}", key))
            } else {
                BridgeError::UnsupportedType(ty)
            });
        }
    };

    Ok(EngineValue::Map(vec![EngineValue::Tensor(tensor)]))
}

fn convert_value(value: &DynValue) -> Result<EngineValue> {
    match value.dtype() {
        ValueType::Tensor { ty, .. } => Ok(EngineValue::Tensor(convert_tensor(value, *ty)?)),
        ValueType::Sequence(_) => {
            let allocator = Allocator::default();
            let children = value
                .try_extract_sequence::<DynValueTypeMarker>(&allocator)
                .map_err(|e| BridgeError::OutputExtraction(e.to_string()))?;
            let children = children
                .iter()
                .map(|child| convert_value(child))
                .collect::<Result<Vec<_>>>()?;
            Ok(EngineValue::Sequence(children))
        }
        ValueType::Map { key, value: val } => convert_map(value, *key, *val),
        other => Err(BridgeError::OutputExtraction(format!(
            "unsupported output value type: {:?}",
            other
        ))),
    }
}

impl Engine for OrtEngine {
    fn run(&mut self, inputs: &[NativeTensor]) -> Result<Vec<EngineValue>> {
        let ort_inputs: Vec<(&str, SessionInputValue<'static>)> = self
            .input_names
            .iter()
            .zip(inputs)
            .map(|(name, tensor)| Ok((name.as_str(), convert_input(tensor)?)))
            .collect::<Result<Vec<_>>>()?;

        let outputs = self
            .session
            .run(ort_inputs)
            .map_err(|e| BridgeError::InferenceFailed(e.to_string()))?;

        let mut results = Vec::with_capacity(outputs.len());
        for (name, value) in outputs.iter() {
            debug!("Converting output '{}'", name);
            results.push(convert_value(&value)?);
        }

        Ok(results)
    }

    fn input_names(&self) -> &[String] {
        &self.input_names
    }

    fn output_names(&self) -> &[String] {
        &self.output_names
    }

    fn end_profiling(&mut self) -> Result<Option<PathBuf>> {
        if !self.profiling {
            return Ok(None);
        }
        let path = self
            .session
            .end_profiling()
            .map_err(|e| BridgeError::Engine(e.to_string()))?;
        self.profiling = false;
        Ok((!path.is_empty()).then(|| PathBuf::from(path)))
    }

    fn profiling_start_ns(&self) -> Result<i64> {
        self.session
            .profiling_start_ns()
            .map(|ns| ns as i64)
            .map_err(|e| BridgeError::Engine(e.to_string()))
    }

    fn profiling_clock(&self) -> &'static (dyn Clock + Sync) {
        &HighResolutionClock
    }
}
