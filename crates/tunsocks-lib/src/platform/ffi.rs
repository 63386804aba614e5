// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: GPL-3.0-only

//! C ABI for embedders (JNI shims, Swift wrappers, plain C callers).
//!
//! Handles no memory beyond the call: strings are copied in, the stats array
//! is written into caller-provided storage, and the failure callback receives
//! a message pointer that is only valid for the duration of the call.

use std::{
    ffi::{c_char, c_int, c_void, CStr, CString},
    os::fd::RawFd,
};

use crate::error::Error;

pub const TUNSOCKS_OK: c_int = 0;
pub const TUNSOCKS_ERROR: c_int = -1;
pub const TUNSOCKS_ERROR_INVALID_ARG: c_int = -2;
pub const TUNSOCKS_ERROR_ALREADY_RUNNING: c_int = -3;
pub const TUNSOCKS_ERROR_CONFIG: c_int = -4;
pub const TUNSOCKS_ERROR_DESCRIPTOR: c_int = -5;

/// Failure callback type: `(code, message, context)`. The message pointer is
/// only valid during the call.
pub type FailureCallbackFn =
    extern "C" fn(code: c_int, message: *const c_char, context: *mut c_void);

struct CallbackContext(*mut c_void);

// The context pointer is owned by the embedder, which promises it outlives
// the registration and tolerates calls from any thread.
unsafe impl Send for CallbackContext {}
unsafe impl Sync for CallbackContext {}

fn error_code(error: &Error) -> c_int {
    match error {
        Error::Config(_) => TUNSOCKS_ERROR_CONFIG,
        Error::AlreadyRunning => TUNSOCKS_ERROR_ALREADY_RUNNING,
        Error::Descriptor(_) => TUNSOCKS_ERROR_DESCRIPTOR,
        Error::NotRunning | Error::UpstreamUnreachable(_) => TUNSOCKS_ERROR,
    }
}

/// Start the engine with a config file path and a TUN descriptor. Returns
/// `TUNSOCKS_OK` once the engine run is spawned; asynchronous failures are
/// routed through the registered failure callback.
///
/// # Safety
///
/// `config_path` must be a valid null-terminated string.
#[no_mangle]
pub unsafe extern "C" fn tunsocks_start(config_path: *const c_char, descriptor: c_int) -> c_int {
    if config_path.is_null() {
        return TUNSOCKS_ERROR_INVALID_ARG;
    }
    let Ok(config_path) = CStr::from_ptr(config_path).to_str() else {
        return TUNSOCKS_ERROR_INVALID_ARG;
    };

    match super::start(config_path, descriptor as RawFd) {
        Ok(()) => TUNSOCKS_OK,
        Err(err) => error_code(&err),
    }
}

/// Stop the engine and wait for its tasks to wind down. Idempotent.
#[no_mangle]
pub extern "C" fn tunsocks_stop() -> c_int {
    super::stop();
    TUNSOCKS_OK
}

/// Write the traffic counters as `[bytes_in, bytes_out, packets_in,
/// packets_out]` into caller-provided storage for four `u64` values.
///
/// # Safety
///
/// `out_stats` must point to space for four `u64` values.
#[no_mangle]
pub unsafe extern "C" fn tunsocks_get_stats(out_stats: *mut u64) -> c_int {
    if out_stats.is_null() {
        return TUNSOCKS_ERROR_INVALID_ARG;
    }
    let snapshot = super::get_stats().to_array();
    std::ptr::copy_nonoverlapping(snapshot.as_ptr(), out_stats, snapshot.len());
    TUNSOCKS_OK
}

/// Register the failure callback. Passing a null callback unregisters it.
#[no_mangle]
pub extern "C" fn tunsocks_set_failure_callback(
    callback: Option<FailureCallbackFn>,
    context: *mut c_void,
) -> c_int {
    match callback {
        Some(callback) => {
            let context = CallbackContext(context);
            super::set_failure_callback(Box::new(move |error| {
                // Capture the whole `CallbackContext` (Send + Sync) rather than
                // its bare pointer field, which edition-2021 disjoint closure
                // capture would otherwise grab.
                let context = &context;
                let code = error_code(error);
                let message = CString::new(error.to_string())
                    .unwrap_or_else(|_| CString::from(c"engine failure"));
                callback(code, message.as_ptr(), context.0);
            }));
        }
        None => super::clear_failure_callback(),
    }
    TUNSOCKS_OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(error_code(&Error::AlreadyRunning), TUNSOCKS_ERROR_ALREADY_RUNNING);
        assert_eq!(
            error_code(&Error::Config(crate::config::ConfigError::ZeroPort)),
            TUNSOCKS_ERROR_CONFIG
        );
        assert_eq!(
            error_code(&Error::Descriptor(std::io::Error::other("gone"))),
            TUNSOCKS_ERROR_DESCRIPTOR
        );
    }

    #[test]
    fn null_arguments_are_refused() {
        assert_eq!(
            unsafe { tunsocks_start(std::ptr::null(), 3) },
            TUNSOCKS_ERROR_INVALID_ARG
        );
        assert_eq!(
            unsafe { tunsocks_get_stats(std::ptr::null_mut()) },
            TUNSOCKS_ERROR_INVALID_ARG
        );
    }
}
