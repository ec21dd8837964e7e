//! Native unwinder interface
//!
//! The minimal slice of the Itanium C++ unwind ABI the personality bridge
//! forwards to. Exception objects and unwind contexts are opaque here:
//! this layer never owns or mutates them, it only passes them through to
//! the native personality routine the embedder registers.

use std::ffi::{c_int, c_void};
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// `_Unwind_Reason_Code` values the bridge traffics in.
pub const URC_NO_REASON: c_int = 0;
pub const URC_FATAL_PHASE2_ERROR: c_int = 2;
pub const URC_FATAL_PHASE1_ERROR: c_int = 3;
pub const URC_HANDLER_FOUND: c_int = 6;
pub const URC_INSTALL_CONTEXT: c_int = 7;
pub const URC_CONTINUE_UNWIND: c_int = 8;

/// In-flight exception object. Forwarded, never owned.
#[repr(C)]
pub struct UnwindException {
    _opaque: [u8; 0],
}

/// Unwinder frame-walk state. Forwarded, never owned.
#[repr(C)]
pub struct UnwindContext {
    _opaque: [u8; 0],
}

/// Signature of a native personality routine.
pub type PersonalityFn = unsafe extern "C" fn(
    version: c_int,
    actions: c_int,
    exception_class: u64,
    exception: *mut UnwindException,
    context: *mut UnwindContext,
) -> c_int;

static NATIVE_PERSONALITY: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());

/// Registers the native personality routine the bridge delegates to.
/// Called once by the embedder before any compiled frame can unwind. An
/// atomic slot rather than a lock: the reader runs mid-unwind.
pub fn set_native_personality(f: PersonalityFn) {
    NATIVE_PERSONALITY.store(f as *mut c_void, Ordering::Release);
}

/// The registered routine, if any.
pub(crate) fn native_personality() -> Option<PersonalityFn> {
    let p = NATIVE_PERSONALITY.load(Ordering::Acquire);
    if p.is_null() {
        None
    } else {
        Some(unsafe { mem::transmute::<*mut c_void, PersonalityFn>(p) })
    }
}
