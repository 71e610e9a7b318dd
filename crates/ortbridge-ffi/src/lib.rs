//! C ABI for driving ortbridge predictors from foreign hosts.
//!
//! Every entry point resets this thread's error slot, checks its handle
//! before doing any work and reports failures through
//! [`ortb_last_error_kind`] and [`ortb_last_error_message`]. The value a
//! failing call returns (null, zero, `-1`, an empty string) can also be a
//! legitimate answer, so callers check the error slot after each call.
//!
//! A predictor handle must be driven by one thread at a time.

mod error;
mod types;

use std::ffi::{c_char, CStr, CString};
use std::slice;

use ortbridge_core::{BridgeError, ElementType, Engine, HostBuffer, PredictorContext};
use tracing::info;

pub use error::{FfiError, FfiResult, ORTB_ERROR_PANIC, ORTB_OK};
pub use types::{
    device_from_code, OrtbTensor, ORTB_DEVICE_CPU, ORTB_DEVICE_CUDA, ORTB_DEVICE_UNKNOWN,
};

use error::boundary;

/// Opaque predictor handed to C callers.
pub struct OrtbPredictor {
    context: PredictorContext<Box<dyn Engine>>,
}

/// Hand a predictor context to C. Release it with [`ortb_predictor_delete`].
pub fn into_handle(context: PredictorContext<Box<dyn Engine>>) -> *mut OrtbPredictor {
    Box::into_raw(Box::new(OrtbPredictor { context }))
}

/// Borrow the predictor behind `handle`.
///
/// # Safety
/// `handle` must be null or come from [`into_handle`] and not yet be deleted.
unsafe fn borrow_predictor<'a>(
    handle: *mut OrtbPredictor,
    function: &'static str,
) -> FfiResult<&'a mut OrtbPredictor> {
    unsafe { handle.as_mut() }.ok_or(FfiError::Bridge(BridgeError::InvalidHandle(function)))
}

#[cfg(feature = "native")]
fn open_engine(config: &ortbridge_core::PredictorConfig) -> FfiResult<Box<dyn Engine>> {
    Ok(Box::new(ortbridge_core::OrtEngine::from_config(config)?))
}

#[cfg(not(feature = "native"))]
fn open_engine(_config: &ortbridge_core::PredictorConfig) -> FfiResult<Box<dyn Engine>> {
    Err(BridgeError::SessionCreate(
        "ortbridge was built without the `native` feature".to_string(),
    )
    .into())
}

/// Load a model and create a predictor.
///
/// Returns null on failure.
///
/// # Safety
/// `model_path` must be null or a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ortb_new_predictor(
    model_path: *const c_char,
    device_kind: i32,
    enable_profiling: bool,
    device_id: i32,
) -> *mut OrtbPredictor {
    const NAME: &str = "ortb_new_predictor";
    boundary(NAME, || {
        if model_path.is_null() {
            return Err(FfiError::invalid_argument(NAME, "model path is null"));
        }
        let path = unsafe { CStr::from_ptr(model_path) }
            .to_str()
            .map_err(|e| FfiError::invalid_argument(NAME, e.to_string()))?;
        let device = device_from_code(NAME, device_kind, device_id)?;

        let config = ortbridge_core::PredictorConfig::new(path)
            .with_device(device)
            .with_profiling(enable_profiling);
        config.validate()?;

        let engine = open_engine(&config)?;
        info!("Created predictor for {}", path);
        Ok(into_handle(PredictorContext::new(engine, enable_profiling)))
    })
    .unwrap_or(std::ptr::null_mut())
}

/// Stage one input.
///
/// The buffer is borrowed, not copied; its byte length is derived from
/// `shape` and `element_type` (an ONNX `TensorProto.DataType` code).
///
/// # Safety
/// `handle` must be null or a live predictor. `shape` must point to `rank`
/// dimensions. `data` must stay valid and unmodified for the derived length
/// until the predictor is cleared or deleted.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ortb_predictor_add_input(
    handle: *mut OrtbPredictor,
    data: *const u8,
    shape: *const i64,
    rank: usize,
    element_type: i32,
) {
    const NAME: &str = "ortb_predictor_add_input";
    boundary(NAME, || {
        let predictor = unsafe { borrow_predictor(handle, NAME) }?;
        let element_type = ElementType::from_onnx_code(element_type);
        let element_size = element_type.element_size()?;

        let shape: &[i64] = match (shape.is_null(), rank) {
            (_, 0) => &[],
            (true, _) => return Err(FfiError::invalid_argument(NAME, "shape is null")),
            (false, _) => unsafe { slice::from_raw_parts(shape, rank) },
        };
        let count = shape
            .iter()
            .try_fold(1usize, |acc, &dim| {
                usize::try_from(dim).ok().and_then(|d| acc.checked_mul(d))
            })
            .ok_or_else(|| BridgeError::InvalidShape(format!("{:?}", shape)))?;
        let byte_len = count
            .checked_mul(element_size)
            .ok_or_else(|| BridgeError::InvalidShape(format!("{:?}", shape)))?;

        if data.is_null() && byte_len > 0 {
            return Err(FfiError::invalid_argument(NAME, "data is null"));
        }
        let buffer = unsafe { HostBuffer::from_raw_parts(data, byte_len) };
        predictor.context.add_input(buffer, shape, element_type)?;
        Ok(())
    });
}

/// Run the model over the staged inputs.
///
/// # Safety
/// `handle` must be null or a live predictor.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ortb_predictor_run(handle: *mut OrtbPredictor) {
    const NAME: &str = "ortb_predictor_run";
    boundary(NAME, || {
        let predictor = unsafe { borrow_predictor(handle, NAME) }?;
        predictor.context.run()?;
        Ok(())
    });
}

/// Flatten the last run's results into readable outputs.
///
/// # Safety
/// `handle` must be null or a live predictor.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ortb_predictor_convert_output(handle: *mut OrtbPredictor) {
    const NAME: &str = "ortb_predictor_convert_output";
    boundary(NAME, || {
        let predictor = unsafe { borrow_predictor(handle, NAME) }?;
        predictor.context.convert_outputs()?;
        Ok(())
    });
}

/// Number of converted outputs; 0 on failure.
///
/// # Safety
/// `handle` must be null or a live predictor.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ortb_predictor_num_outputs(handle: *mut OrtbPredictor) -> usize {
    const NAME: &str = "ortb_predictor_num_outputs";
    boundary(NAME, || {
        let predictor = unsafe { borrow_predictor(handle, NAME) }?;
        Ok(predictor.context.num_outputs())
    })
    .unwrap_or(0)
}

/// Converted output at `index`; an all-null tensor on failure.
///
/// # Safety
/// `handle` must be null or a live predictor.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ortb_predictor_get_output(
    handle: *mut OrtbPredictor,
    index: usize,
) -> OrtbTensor {
    const NAME: &str = "ortb_predictor_get_output";
    boundary(NAME, || {
        let predictor = unsafe { borrow_predictor(handle, NAME) }?;
        Ok(OrtbTensor::from(predictor.context.output(index)?))
    })
    .unwrap_or_else(OrtbTensor::empty)
}

/// Release outputs and staged inputs.
///
/// # Safety
/// `handle` must be null or a live predictor.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ortb_predictor_clear(handle: *mut OrtbPredictor) {
    const NAME: &str = "ortb_predictor_clear";
    boundary(NAME, || {
        let predictor = unsafe { borrow_predictor(handle, NAME) }?;
        predictor.context.clear();
        Ok(())
    });
}

/// Destroy a predictor, removing its profiling artifact.
///
/// The handle is invalid afterwards even if an error is reported.
///
/// # Safety
/// `handle` must be null or a live predictor.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ortb_predictor_delete(handle: *mut OrtbPredictor) {
    const NAME: &str = "ortb_predictor_delete";
    boundary(NAME, || {
        if handle.is_null() {
            return Err(BridgeError::InvalidHandle(NAME).into());
        }
        let OrtbPredictor { context } = *unsafe { Box::from_raw(handle) };
        context.destroy()?;
        Ok(())
    });
}

/// Stop profiling so the artifact can be read.
///
/// # Safety
/// `handle` must be null or a live predictor.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ortb_end_profiling(handle: *mut OrtbPredictor) {
    const NAME: &str = "ortb_end_profiling";
    boundary(NAME, || {
        let predictor = unsafe { borrow_predictor(handle, NAME) }?;
        predictor.context.end_profiling()?;
        Ok(())
    });
}

/// Profiling artifact contents; empty when profiling never ran.
///
/// Always returns a string to be released with [`ortb_string_free`], empty
/// on failure.
///
/// # Safety
/// `handle` must be null or a live predictor.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ortb_profiling_read(handle: *mut OrtbPredictor) -> *mut c_char {
    const NAME: &str = "ortb_profiling_read";
    boundary(NAME, || {
        let predictor = unsafe { borrow_predictor(handle, NAME) }?;
        let profile = predictor.context.read_profile()?;
        CString::new(profile).map_err(|e| FfiError::invalid_argument(NAME, e.to_string()))
    })
    .unwrap_or_default()
    .into_raw()
}

/// Release a string returned by this library.
///
/// # Safety
/// `s` must be null or come from [`ortb_profiling_read`] and not be freed yet.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ortb_string_free(s: *mut c_char) {
    if !s.is_null() {
        drop(unsafe { CString::from_raw(s) });
    }
}

/// Profiling start in wall-clock nanoseconds since the epoch; -1 on failure.
///
/// # Safety
/// `handle` must be null or a live predictor.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ortb_profiling_get_start_time(handle: *mut OrtbPredictor) -> i64 {
    const NAME: &str = "ortb_profiling_get_start_time";
    boundary(NAME, || {
        let predictor = unsafe { borrow_predictor(handle, NAME) }?;
        Ok(predictor.context.profiling_start_time_ns()?)
    })
    .unwrap_or(-1)
}

/// Error code of the last call on this thread, [`ORTB_OK`] if it succeeded.
#[unsafe(no_mangle)]
pub extern "C" fn ortb_last_error_kind() -> i32 {
    error::last_error_code()
}

/// Message of the last failed call on this thread, or null.
///
/// The string is owned by the library and valid until the next call on this
/// thread.
#[unsafe(no_mangle)]
pub extern "C" fn ortb_last_error_message() -> *const c_char {
    error::last_error_message()
}
