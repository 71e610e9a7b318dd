//! Element types and the typed value codec.
//!
//! Host buffers travel into the engine without a copy ([`encode_input`]) and
//! come back as freshly owned bytes ([`decode_output`]), because engine-side
//! memory does not outlive the inference cycle that produced it.

use std::fmt;
use std::ptr::NonNull;

use bytemuck::Pod;
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::Result;

/// Element kinds the engine knows about but that have no copyable
/// representation on the host side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnsupportedKind {
    Undefined,
    Float16,
    BFloat16,
    Complex64,
    Complex128,
    String,
    /// A code outside the known ONNX range.
    Unknown(i32),
}

/// Tensor element types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Bool,
    Float32,
    Float64,
    Unsupported(UnsupportedKind),
}

impl ElementType {
    /// Size of a single element in bytes.
    ///
    /// Fails with [`BridgeError::UnsupportedType`] for unsupported kinds.
    pub fn element_size(self) -> Result<usize> {
        let size = match self {
            ElementType::Int8 | ElementType::Uint8 | ElementType::Bool => 1,
            ElementType::Int16 | ElementType::Uint16 => 2,
            ElementType::Int32 | ElementType::Uint32 | ElementType::Float32 => 4,
            ElementType::Int64 | ElementType::Uint64 | ElementType::Float64 => 8,
            ElementType::Unsupported(_) => return Err(BridgeError::UnsupportedType(self)),
        };
        Ok(size)
    }

    pub fn is_supported(self) -> bool {
        !matches!(self, ElementType::Unsupported(_))
    }

    /// Map an ONNX `TensorProto.DataType` code.
    pub fn from_onnx_code(code: i32) -> Self {
        match code {
            0 => ElementType::Unsupported(UnsupportedKind::Undefined),
            1 => ElementType::Float32,
            2 => ElementType::Uint8,
            3 => ElementType::Int8,
            4 => ElementType::Uint16,
            5 => ElementType::Int16,
            6 => ElementType::Int32,
            7 => ElementType::Int64,
            8 => ElementType::Unsupported(UnsupportedKind::String),
            9 => ElementType::Bool,
            10 => ElementType::Unsupported(UnsupportedKind::Float16),
            11 => ElementType::Float64,
            12 => ElementType::Uint32,
            13 => ElementType::Uint64,
            14 => ElementType::Unsupported(UnsupportedKind::Complex64),
            15 => ElementType::Unsupported(UnsupportedKind::Complex128),
            16 => ElementType::Unsupported(UnsupportedKind::BFloat16),
            other => ElementType::Unsupported(UnsupportedKind::Unknown(other)),
        }
    }

    /// The ONNX `TensorProto.DataType` code for this type.
    pub fn onnx_code(self) -> i32 {
        match self {
            ElementType::Float32 => 1,
            ElementType::Uint8 => 2,
            ElementType::Int8 => 3,
            ElementType::Uint16 => 4,
            ElementType::Int16 => 5,
            ElementType::Int32 => 6,
            ElementType::Int64 => 7,
            ElementType::Bool => 9,
            ElementType::Float64 => 11,
            ElementType::Uint32 => 12,
            ElementType::Uint64 => 13,
            ElementType::Unsupported(kind) => match kind {
                UnsupportedKind::Undefined => 0,
                UnsupportedKind::String => 8,
                UnsupportedKind::Float16 => 10,
                UnsupportedKind::Complex64 => 14,
                UnsupportedKind::Complex128 => 15,
                UnsupportedKind::BFloat16 => 16,
                UnsupportedKind::Unknown(code) => code,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ElementType::Int8 => "int8",
            ElementType::Int16 => "int16",
            ElementType::Int32 => "int32",
            ElementType::Int64 => "int64",
            ElementType::Uint8 => "uint8",
            ElementType::Uint16 => "uint16",
            ElementType::Uint32 => "uint32",
            ElementType::Uint64 => "uint64",
            ElementType::Bool => "bool",
            ElementType::Float32 => "float32",
            ElementType::Float64 => "float64",
            ElementType::Unsupported(kind) => match kind {
                UnsupportedKind::Undefined => "undefined",
                UnsupportedKind::Float16 => "float16",
                UnsupportedKind::BFloat16 => "bfloat16",
                UnsupportedKind::Complex64 => "complex64",
                UnsupportedKind::Complex128 => "complex128",
                UnsupportedKind::String => "string",
                UnsupportedKind::Unknown(_) => "unknown",
            },
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementType::Unsupported(UnsupportedKind::Unknown(code)) => {
                write!(f, "unknown({})", code)
            }
            other => f.write_str(other.as_str()),
        }
    }
}

/// Rust scalar types with a fixed element type.
pub trait TensorElement: Pod {
    const ELEMENT_TYPE: ElementType;
}

macro_rules! tensor_element {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl TensorElement for $ty {
            const ELEMENT_TYPE: ElementType = ElementType::$variant;
        })*
    };
}

tensor_element! {
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u8 => Uint8,
    u16 => Uint16,
    u32 => Uint32,
    u64 => Uint64,
    f32 => Float32,
    f64 => Float64,
}

/// Bytes backing an input tensor.
///
/// Either owned by the buffer itself, or borrowed from a host that keeps the
/// region alive until the predictor is cleared.
pub struct HostBuffer {
    repr: Repr,
}

enum Repr {
    Owned(Vec<u8>),
    Borrowed { ptr: NonNull<u8>, len: usize },
}

// SAFETY: a borrowed region is only read, and the host guarantees it stays
// valid and unaliased by writers until the owning context is cleared.
unsafe impl Send for HostBuffer {}

impl HostBuffer {
    /// Take ownership of raw bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            repr: Repr::Owned(bytes),
        }
    }

    /// Copy typed elements into a new owned buffer.
    pub fn from_slice<T: TensorElement>(data: &[T]) -> Self {
        Self::from_bytes(bytemuck::cast_slice(data).to_vec())
    }

    /// Borrow a host-owned region without copying it.
    ///
    /// # Safety
    /// `ptr` must be valid for reads of `len` bytes until this buffer is
    /// dropped, and nothing may write to the region in the meantime.
    pub unsafe fn from_raw_parts(ptr: *const u8, len: usize) -> Self {
        match NonNull::new(ptr as *mut u8) {
            Some(ptr) if len > 0 => Self {
                repr: Repr::Borrowed { ptr, len },
            },
            _ => Self::from_bytes(Vec::new()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &self.repr {
            Repr::Owned(bytes) => bytes,
            // SAFETY: upheld by the `from_raw_parts` contract.
            Repr::Borrowed { ptr, len } => unsafe {
                std::slice::from_raw_parts(ptr.as_ptr(), *len)
            },
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_borrowed(&self) -> bool {
        matches!(self.repr, Repr::Borrowed { .. })
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("len", &self.len())
            .field("borrowed", &self.is_borrowed())
            .finish()
    }
}

/// An engine-side tensor view.
#[derive(Debug)]
pub struct NativeTensor {
    element_type: ElementType,
    shape: Vec<i64>,
    data: HostBuffer,
}

impl NativeTensor {
    /// Build a tensor over engine-produced bytes.
    pub fn new(element_type: ElementType, shape: Vec<i64>, data: Vec<u8>) -> Self {
        Self {
            element_type,
            shape,
            data: HostBuffer::from_bytes(data),
        }
    }

    /// Build a tensor from typed elements.
    pub fn from_slice<T: TensorElement>(data: &[T], shape: &[i64]) -> Self {
        Self {
            element_type: T::ELEMENT_TYPE,
            shape: shape.to_vec(),
            data: HostBuffer::from_slice(data),
        }
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    /// Linear element count; negative (symbolic) dimensions count as zero.
    pub fn element_count(&self) -> usize {
        element_count(&self.shape)
    }

    pub fn bytes(&self) -> &[u8] {
        self.data.as_bytes()
    }
}

/// A flat, host-owned tensor.
///
/// `data.len() == element_size(element_type) * product(shape)`.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorDescriptor {
    pub element_type: ElementType,
    pub data: Vec<u8>,
    pub shape: Vec<i64>,
}

impl TensorDescriptor {
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn element_count(&self) -> usize {
        element_count(&self.shape)
    }

    /// View the data as typed elements.
    pub fn as_slice<T: TensorElement>(&self) -> Result<&[T]> {
        if T::ELEMENT_TYPE != self.element_type {
            return Err(BridgeError::OutputExtraction(format!(
                "tensor holds {} elements, requested {}",
                self.element_type,
                T::ELEMENT_TYPE
            )));
        }
        bytemuck::try_cast_slice(self.data.as_slice())
            .map_err(|e| BridgeError::OutputExtraction(format!("{:?}", e)))
    }

    /// Copy the data out as typed elements.
    pub fn to_vec<T: TensorElement>(&self) -> Result<Vec<T>> {
        if T::ELEMENT_TYPE != self.element_type {
            return Err(BridgeError::OutputExtraction(format!(
                "tensor holds {} elements, requested {}",
                self.element_type,
                T::ELEMENT_TYPE
            )));
        }
        // Copying avoids alignment requirements on the byte buffer.
        Ok(bytemuck::pod_collect_to_vec(self.data.as_slice()))
    }
}

fn element_count(shape: &[i64]) -> usize {
    shape.iter().map(|&d| usize::try_from(d).unwrap_or(0)).product()
}

/// Wrap a host buffer as an engine tensor without copying it.
///
/// The buffer length is trusted to match `product(shape)` elements.
pub fn encode_input(
    buffer: HostBuffer,
    shape: &[i64],
    element_type: ElementType,
) -> Result<NativeTensor> {
    element_type.element_size()?;

    if shape.is_empty() {
        return Err(BridgeError::InvalidShape("shape must have at least one dimension".into()));
    }
    if let Some(dim) = shape.iter().find(|&&d| d < 0) {
        return Err(BridgeError::InvalidShape(format!(
            "negative dimension {} in {:?}",
            dim, shape
        )));
    }

    Ok(NativeTensor {
        element_type,
        shape: shape.to_vec(),
        data: buffer,
    })
}

/// Copy `size` elements out of an engine tensor into a new owned buffer.
pub fn decode_output(tensor: &NativeTensor, size: usize) -> Result<Vec<u8>> {
    let element_size = tensor.element_type.element_size()?;
    let byte_len = element_size.checked_mul(size).ok_or_else(|| {
        BridgeError::OutputExtraction(format!("{} elements overflow the address space", size))
    })?;

    let bytes = tensor.bytes().get(..byte_len).ok_or_else(|| {
        BridgeError::Engine(format!(
            "tensor backing holds {} bytes, {} required",
            tensor.bytes().len(),
            byte_len
        ))
    })?;

    Ok(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SUPPORTED: [ElementType; 11] = [
        ElementType::Int8,
        ElementType::Int16,
        ElementType::Int32,
        ElementType::Int64,
        ElementType::Uint8,
        ElementType::Uint16,
        ElementType::Uint32,
        ElementType::Uint64,
        ElementType::Bool,
        ElementType::Float32,
        ElementType::Float64,
    ];

    const UNSUPPORTED: [UnsupportedKind; 7] = [
        UnsupportedKind::Undefined,
        UnsupportedKind::Float16,
        UnsupportedKind::BFloat16,
        UnsupportedKind::Complex64,
        UnsupportedKind::Complex128,
        UnsupportedKind::String,
        UnsupportedKind::Unknown(42),
    ];

    #[test]
    fn test_round_trip_every_supported_type() {
        let shape = [2i64, 3];
        for ty in SUPPORTED {
            let size = ty.element_size().unwrap();
            let bytes: Vec<u8> = (0..size * 6).map(|i| (i % 2) as u8).collect();

            let tensor = encode_input(HostBuffer::from_bytes(bytes.clone()), &shape, ty).unwrap();
            assert_eq!(tensor.element_count(), 6);
            let decoded = decode_output(&tensor, tensor.element_count()).unwrap();

            assert_eq!(decoded, bytes, "{} round trip", ty);
            assert_eq!(tensor.shape(), &shape);
            assert_eq!(tensor.element_type(), ty);
        }
    }

    #[test]
    fn test_unsupported_types_rejected() {
        for kind in UNSUPPORTED {
            let ty = ElementType::Unsupported(kind);
            assert!(matches!(ty.element_size(), Err(BridgeError::UnsupportedType(t)) if t == ty));

            let err = encode_input(HostBuffer::from_bytes(vec![0; 4]), &[2], ty).unwrap_err();
            assert!(matches!(err, BridgeError::UnsupportedType(_)));

            let tensor = NativeTensor::new(ty, vec![2], vec![0; 4]);
            let err = decode_output(&tensor, 2).unwrap_err();
            assert!(matches!(err, BridgeError::UnsupportedType(_)));
        }
    }

    #[test]
    fn test_encode_does_not_copy_borrowed_buffer() {
        let host = [1.0f32, 2.0, 3.0, 4.0];
        let bytes: &[u8] = bytemuck::cast_slice(&host[..]);
        let buffer = unsafe { HostBuffer::from_raw_parts(bytes.as_ptr(), bytes.len()) };
        assert!(buffer.is_borrowed());

        let tensor = encode_input(buffer, &[2, 2], ElementType::Float32).unwrap();
        assert_eq!(tensor.bytes().as_ptr(), bytes.as_ptr());
    }

    #[test]
    fn test_null_raw_parts_is_empty() {
        let buffer = unsafe { HostBuffer::from_raw_parts(std::ptr::null(), 16) };
        assert!(buffer.is_empty());
        assert!(!buffer.is_borrowed());
    }

    #[test]
    fn test_encode_rejects_bad_shapes() {
        let err = encode_input(HostBuffer::from_bytes(vec![]), &[], ElementType::Float32)
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidShape(_)));

        let err = encode_input(HostBuffer::from_bytes(vec![]), &[2, -1], ElementType::Float32)
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidShape(_)));
    }

    #[test]
    fn test_decode_short_backing_is_an_error() {
        let tensor = NativeTensor::new(ElementType::Int32, vec![4], vec![0; 8]);
        let err = decode_output(&tensor, 4).unwrap_err();
        assert!(matches!(err, BridgeError::Engine(_)));
    }

    #[test]
    fn test_onnx_codes() {
        for ty in SUPPORTED {
            assert_eq!(ElementType::from_onnx_code(ty.onnx_code()), ty);
        }
        assert_eq!(ElementType::from_onnx_code(1), ElementType::Float32);
        assert_eq!(ElementType::from_onnx_code(9), ElementType::Bool);
        assert_eq!(
            ElementType::from_onnx_code(10),
            ElementType::Unsupported(UnsupportedKind::Float16)
        );
        assert_eq!(
            ElementType::from_onnx_code(99),
            ElementType::Unsupported(UnsupportedKind::Unknown(99))
        );
        assert_eq!(ElementType::from_onnx_code(99).onnx_code(), 99);
    }

    #[test]
    fn test_descriptor_typed_access() {
        let desc = TensorDescriptor {
            element_type: ElementType::Float32,
            data: bytemuck::cast_slice(&[2.0f32, 4.0][..]).to_vec(),
            shape: vec![2],
        };
        assert_eq!(desc.to_vec::<f32>().unwrap(), vec![2.0, 4.0]);
        assert_eq!(desc.rank(), 1);
        assert!(desc.to_vec::<i32>().is_err());
    }
}
