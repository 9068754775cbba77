//! Panic guards for exported functions
//!
//! No exported function may unwind into the caller. Every body runs inside
//! one of these helpers, which log the failure and fall back to a status
//! code or a default value.

use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::{error, warn};

use tessera_kernel::error::panic_message;

use crate::error::{FfiResult, TESSERA_ERR_FAILED, TESSERA_OK};

/// Run `f`, mapping its error or a panic to a status code
pub(crate) fn guard_status(op: &'static str, f: impl FnOnce() -> FfiResult<()>) -> i32 {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => TESSERA_OK,
        Ok(Err(e)) => {
            warn!(op, error = %e, "FFI call failed");
            e.status()
        }
        Err(payload) => {
            error!(op, panic = %panic_message(payload.as_ref()), "Panic in FFI call");
            TESSERA_ERR_FAILED
        }
    }
}

/// Run `f`, returning `default` when it fails or panics
pub(crate) fn guard_with_default<T>(op: &'static str, default: T, f: impl FnOnce() -> FfiResult<T>) -> T {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            warn!(op, error = %e, "FFI call failed");
            default
        }
        Err(payload) => {
            error!(op, panic = %panic_message(payload.as_ref()), "Panic in FFI call");
            default
        }
    }
}

pub(crate) fn guard_void(op: &'static str, f: impl FnOnce()) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        error!(op, panic = %panic_message(payload.as_ref()), "Panic in FFI call");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FfiError, TESSERA_ERR_INVALID_STATE};

    #[test]
    fn test_status_mapping() {
        assert_eq!(guard_status("ok", || Ok(())), TESSERA_OK);
        assert_eq!(
            guard_status("null", || Err(FfiError::NullPointer("object"))),
            TESSERA_ERR_INVALID_STATE
        );
        assert_eq!(guard_status("panic", || panic!("boom")), TESSERA_ERR_FAILED);
    }

    #[test]
    fn test_default_on_panic() {
        assert_eq!(guard_with_default("value", 0u32, || Ok(7)), 7);
        assert_eq!(guard_with_default("panic", 0u32, || panic!("boom")), 0);
    }
}
