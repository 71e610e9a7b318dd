//! Plain data shapes shared with C callers.

use std::ptr;

use ortbridge_core::{Device, TensorDescriptor};

use crate::error::{FfiError, FfiResult};

pub const ORTB_DEVICE_UNKNOWN: i32 = 0;
pub const ORTB_DEVICE_CPU: i32 = 1;
pub const ORTB_DEVICE_CUDA: i32 = 2;

/// A converted output as seen from C.
///
/// `data` and `shape` point into the predictor and stay valid until the
/// predictor is cleared or deleted. The caller never frees them.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct OrtbTensor {
    /// ONNX `TensorProto.DataType` code.
    pub element_type: i32,
    pub data: *const u8,
    pub byte_len: usize,
    pub shape: *const i64,
    pub rank: usize,
}

impl OrtbTensor {
    pub fn empty() -> Self {
        Self {
            element_type: 0,
            data: ptr::null(),
            byte_len: 0,
            shape: ptr::null(),
            rank: 0,
        }
    }
}

impl From<&TensorDescriptor> for OrtbTensor {
    fn from(desc: &TensorDescriptor) -> Self {
        Self {
            element_type: desc.element_type.onnx_code(),
            data: desc.data.as_ptr(),
            byte_len: desc.data.len(),
            shape: desc.shape.as_ptr(),
            rank: desc.rank(),
        }
    }
}

/// Map a boundary device code to a device.
pub fn device_from_code(function: &'static str, code: i32, device_id: i32) -> FfiResult<Device> {
    match code {
        ORTB_DEVICE_CPU => Ok(Device::Cpu),
        ORTB_DEVICE_CUDA => Ok(Device::Cuda { device_id }),
        other => Err(FfiError::invalid_argument(
            function,
            format!("unknown device kind {}", other),
        )),
    }
}
