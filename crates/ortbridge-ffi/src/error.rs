//! Per-thread error reporting for the C boundary.

use std::any::Any;
use std::cell::RefCell;
use std::ffi::{c_char, CString};
use std::panic::{self, AssertUnwindSafe};

use ortbridge_core::BridgeError;
use thiserror::Error;
use tracing::{debug, warn};

/// No error recorded by the last call on this thread.
pub const ORTB_OK: i32 = 0;

/// Code for a panic caught at the boundary. Codes 1 to 6 follow
/// [`ortbridge_core::ErrorKind`].
pub const ORTB_ERROR_PANIC: i32 = 7;

/// Failures raised at the boundary itself, on top of the bridge errors.
#[derive(Error, Debug)]
pub enum FfiError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// A raw argument could not be interpreted.
    #[error("invalid argument in {function}: {message}")]
    InvalidArgument {
        function: &'static str,
        message: String,
    },

    #[error("panic in {function}: {message}")]
    Panic {
        function: &'static str,
        message: String,
    },
}

impl FfiError {
    pub fn invalid_argument(function: &'static str, message: impl Into<String>) -> Self {
        FfiError::InvalidArgument {
            function,
            message: message.into(),
        }
    }

    /// Integer code reported by `ortb_last_error_kind`.
    pub fn code(&self) -> i32 {
        match self {
            FfiError::Bridge(e) => e.kind() as i32,
            FfiError::InvalidArgument { .. } => ortbridge_core::ErrorKind::InvalidArgument as i32,
            FfiError::Panic { .. } => ORTB_ERROR_PANIC,
        }
    }
}

pub type FfiResult<T> = std::result::Result<T, FfiError>;

struct LastError {
    code: i32,
    message: CString,
}

thread_local! {
    static LAST_ERROR: RefCell<Option<LastError>> = const { RefCell::new(None) };
}

pub(crate) fn clear_last_error() {
    LAST_ERROR.with(|slot| slot.borrow_mut().take());
}

pub(crate) fn set_last_error(err: &FfiError) {
    let message = CString::new(err.to_string().replace('\0', " ")).unwrap_or_default();
    LAST_ERROR.with(|slot| {
        *slot.borrow_mut() = Some(LastError {
            code: err.code(),
            message,
        })
    });
}

pub(crate) fn last_error_code() -> i32 {
    LAST_ERROR.with(|slot| slot.borrow().as_ref().map_or(ORTB_OK, |e| e.code))
}

/// Pointer into the slot; valid until the next boundary call on this thread.
pub(crate) fn last_error_message() -> *const c_char {
    LAST_ERROR.with(|slot| {
        slot.borrow()
            .as_ref()
            .map_or(std::ptr::null(), |e| e.message.as_ptr())
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Run one entry point body.
///
/// Resets this thread's error slot, then records any error or panic from
/// `body`. Returns `None` on failure so the caller can substitute its
/// sentinel.
pub(crate) fn boundary<T>(function: &'static str, body: impl FnOnce() -> FfiResult<T>) -> Option<T> {
    clear_last_error();

    let result = match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!("Caught panic in {}: {}", function, message);
            Err(FfiError::Panic { function, message })
        }
    };

    match result {
        Ok(value) => Some(value),
        Err(err) => {
            debug!("{} failed: {}", function, err);
            set_last_error(&err);
            None
        }
    }
}
