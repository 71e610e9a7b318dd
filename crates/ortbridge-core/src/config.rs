//! Predictor configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::Result;

/// Device a session executes on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    #[default]
    Cpu,
    Cuda { device_id: i32 },
}

/// Everything needed to open one model session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    /// ONNX model file.
    pub model_path: PathBuf,

    /// Execution device.
    pub device: Device,

    /// Record engine profiling events for this session.
    pub enable_profiling: bool,

    /// File prefix the engine writes its profiling artifact under.
    pub profile_prefix: String,

    /// Number of intra-op threads (0 lets the engine decide).
    pub intra_threads: usize,

    /// Graph optimization level, 0 (disabled) to 3 (all).
    pub optimization_level: u8,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            device: Device::Cpu,
            enable_profiling: false,
            profile_prefix: "onnxruntime".to_string(),
            intra_threads: 0,
            optimization_level: 3,
        }
    }
}

impl PredictorConfig {
    /// Configuration for a model with every other setting at its default.
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            ..Self::default()
        }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn with_profiling(mut self, enable: bool) -> Self {
        self.enable_profiling = enable;
        self
    }

    pub fn with_profile_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.profile_prefix = prefix.into();
        self
    }

    pub fn with_intra_threads(mut self, threads: usize) -> Self {
        self.intra_threads = threads;
        self
    }

    pub fn with_optimization_level(mut self, level: u8) -> Self {
        self.optimization_level = level;
        self
    }

    /// Check settings that do not depend on the engine.
    pub fn validate(&self) -> Result<()> {
        if self.model_path.as_os_str().is_empty() {
            return Err(BridgeError::Config("model path is empty".to_string()));
        }
        if self.optimization_level > 3 {
            return Err(BridgeError::Config(format!(
                "optimization level {} out of range 0..=3",
                self.optimization_level
            )));
        }
        if self.enable_profiling && self.profile_prefix.is_empty() {
            return Err(BridgeError::Config("profiling enabled without a file prefix".to_string()));
        }
        if let Device::Cuda { device_id } = self.device {
            if device_id < 0 {
                return Err(BridgeError::Config(format!("invalid CUDA device id {}", device_id)));
            }
        }
        Ok(())
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| BridgeError::Config(e.to_string()))
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).map_err(|e| BridgeError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
