//! Thin shims over the raw libmdbx FFI surface.
//!
//! Everything `unsafe` about talking to the engine funnels through here:
//! return-code mapping, `MDBX_val` conversion, and the old-value preserver
//! trampoline used by `mdbx_replace_ex`. The rest of the crate holds raw
//! engine handles but calls the engine only with slices and typed flags.

use std::ffi::CStr;
use std::os::raw::{c_int, c_void};
use std::ptr;

pub(crate) use mdbx_sys as ffi;

use crate::error::{Error, Result};

pub(crate) const EMPTY_VAL: ffi::MDBX_val = ffi::MDBX_val {
    iov_base: ptr::null_mut(),
    iov_len: 0,
};

/// Maps an engine return code, surfacing `MDBX_RESULT_TRUE` as `Ok(true)`.
pub(crate) fn mdbx_result(code: c_int) -> Result<bool> {
    match code {
        ffi::MDBX_SUCCESS => Ok(false),
        ffi::MDBX_RESULT_TRUE => Ok(true),
        other => Err(Error::from_code(other)),
    }
}

/// Borrows a byte slice as an engine value descriptor.
///
/// The engine never writes through the pointer unless the call site passes
/// a mutation flag such as `MDBX_RESERVE`.
pub(crate) fn to_val(bytes: &[u8]) -> ffi::MDBX_val {
    ffi::MDBX_val {
        iov_base: bytes.as_ptr() as *mut c_void,
        iov_len: bytes.len(),
    }
}

/// Reborrows an engine value descriptor as a slice.
///
/// # Safety
///
/// The descriptor must point into memory that stays mapped and unmodified
/// for the duration of `'a` (in practice: the lifetime of the transaction
/// or snapshot the descriptor came from).
pub(crate) unsafe fn from_val<'a>(val: ffi::MDBX_val) -> &'a [u8] {
    if val.iov_len == 0 {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(val.iov_base as *const u8, val.iov_len) }
    }
}

/// `MDBX_preserve_func` trampoline: copies the about-to-be-replaced value
/// into the `Option<Vec<u8>>` passed as context, so callers can observe the
/// old value after the engine has overwritten the page.
pub(crate) unsafe extern "C" fn preserve_to_vec(
    context: *mut c_void,
    target: *mut ffi::MDBX_val,
    src: *const c_void,
    bytes: usize,
) -> c_int {
    let slot = unsafe { &mut *(context as *mut Option<Vec<u8>>) };
    let mut copy = Vec::with_capacity(bytes);
    if bytes > 0 {
        copy.extend_from_slice(unsafe { std::slice::from_raw_parts(src as *const u8, bytes) });
    }
    let copy = slot.insert(copy);
    let target = unsafe { &mut *target };
    target.iov_base = copy.as_mut_ptr() as *mut c_void;
    target.iov_len = copy.len();
    ffi::MDBX_SUCCESS
}

/// Human-readable engine message for a return code.
pub(crate) fn error_message(code: c_int) -> String {
    unsafe {
        let msg = ffi::mdbx_strerror(code);
        if msg.is_null() {
            format!("unknown engine error {code}")
        } else {
            CStr::from_ptr(msg).to_string_lossy().into_owned()
        }
    }
}
