//! Upcall entry points callable from compiled Sable code
//!
//! These extern "C" functions are the fixed runtime services the compiler
//! knows about and generates calls to. They are invoked on the managed
//! stack and, in most cases, immediately switch to the native stack for
//! the real work; the stack growth/shrink/limit group deliberately stays
//! on the calling stack.
//!
//! The calling convention is part of the code-generator contract: changing
//! any signature here means bumping [`ABI_VERSION`](super::ABI_VERSION)
//! and coordinating with the compiler.

use std::ffi::{CStr, c_char, c_int, c_void};

use tracing::trace;

use super::boxed::{BoxHeader, TypeDesc};
use super::task::{Task, TaskFailed};
use super::unwind::{self, URC_CONTINUE_UNWIND, URC_NO_REASON, UnwindContext, UnwindException};

// =========================================================================
// Stack-switch shims
// =========================================================================

/// Switches to the native stack and invokes `f(args)` there. Results
/// travel through a field of the argument block. With no current task
/// installed (startup, foreign threads) there is no native/managed
/// distinction: the target runs directly on the caller's stack, with no
/// headroom check.
#[unsafe(no_mangle)]
pub extern "C" fn upcall_call_shim_on_native_stack(
    args: *mut c_void,
    f: extern "C" fn(*mut c_void),
) {
    match Task::try_current() {
        Some(task) => unsafe { task.call_on_native_stack_raw(args, f) },
        // No task. Call the function and hope for the best.
        None => f(args),
    }
}

/// The opposite direction: starts on the native stack and switches to the
/// managed stack. The only upcall entered from the native stack.
#[unsafe(no_mangle)]
pub extern "C" fn upcall_call_shim_on_managed_stack(
    args: *mut c_void,
    f: extern "C" fn(*mut c_void),
) {
    match Task::try_current() {
        Some(task) => unsafe { task.call_on_managed_stack_raw(args, f) },
        // No task. Call the function and hope for the best.
        None => f(args),
    }
}

// =========================================================================
// Failure
// =========================================================================

/// Records a failure against the current task and begins teardown. The
/// recording runs on the native stack; the transfer into teardown is
/// raised here on the managed stack once the switch has returned, so it
/// never has to unwind across a switch point.
#[unsafe(no_mangle)]
pub extern "C" fn upcall_fail(expr: *const c_char, file: *const c_char, line: usize) -> ! {
    let task = Task::current();
    trace!(task = task.id(), task_name = task.name(), "upcall_fail");

    struct FailArgs {
        expr: *const c_char,
        file: *const c_char,
        line: usize,
    }
    task.call_on_native_stack(FailArgs { expr, file, line }, |task, a| {
        let expr = cstr_or(a.expr, "<unknown>");
        let file = cstr_or(a.file, "<unknown>");
        task.begin_failure(&expr, &file, a.line);
    });

    std::panic::panic_any(TaskFailed { task_id: task.id() })
}

// =========================================================================
// Task-local box allocation
// =========================================================================

/// Allocates a box in the current task's local heap, sized for `td` (or
/// `size` bytes when non-zero), and registers it with the origin tracker.
/// Returns the opaque box handle; the body sits at
/// [`BoxHeader::BODY_OFFSET`] from it.
#[unsafe(no_mangle)]
pub extern "C" fn upcall_malloc(td: *const TypeDesc, size: usize) -> *mut BoxHeader {
    let task = Task::current();
    trace!(task = task.id(), task_name = task.name(), "upcall_malloc");

    struct MallocArgs {
        td: *const TypeDesc,
        size: usize,
    }
    task.call_on_native_stack(MallocArgs { td, size }, |task, a| {
        let boxp = task.boxed().malloc(a.td, a.size);
        task.origins().track(boxp as usize, task.id());
        boxp
    })
}

/// Returns a box to the current task's local heap. The handle must have
/// come from [`upcall_malloc`] and not been freed; no defensive check is
/// made.
#[unsafe(no_mangle)]
pub extern "C" fn upcall_free(boxp: *mut BoxHeader) {
    let task = Task::current();
    trace!(task = task.id(), task_name = task.name(), "upcall_free");

    task.call_on_native_stack(boxp, |task, boxp| {
        task.origins().untrack(*boxp as usize);
        unsafe { task.boxed().free(*boxp) };
    });
}

// =========================================================================
// Exception-handling personality
// =========================================================================

#[repr(C)]
struct PersonalityArgs {
    retval: c_int,
    version: c_int,
    actions: c_int,
    exception_class: u64,
    exception: *mut UnwindException,
    context: *mut UnwindContext,
}

extern "C" fn personality_shim(p: *mut c_void) {
    let a = unsafe { &mut *(p as *mut PersonalityArgs) };
    a.retval = match unwind::native_personality() {
        Some(f) => unsafe { f(a.version, a.actions, a.exception_class, a.exception, a.context) },
        // Nothing registered: hand the frame back to the platform
        // unwinder.
        None => URC_CONTINUE_UNWIND,
    };
}

/// The exception-handling personality routine compiled frames name in
/// their unwind tables. The unwinder runs it on the stack of whatever
/// frame last threw or landed, which is sometimes the managed stack; the
/// native routine's table lookups assume native-stack invariants, so
/// switch first in that case and delegate in place otherwise. No logging
/// on any path here: this runs mid-unwind.
#[unsafe(no_mangle)]
pub extern "C" fn upcall_personality(
    version: c_int,
    actions: c_int,
    exception_class: u64,
    exception: *mut UnwindException,
    context: *mut UnwindContext,
) -> c_int {
    let mut args = PersonalityArgs {
        retval: URC_NO_REASON,
        version,
        actions,
        exception_class,
        exception,
        context,
    };
    let p = &mut args as *mut PersonalityArgs as *mut c_void;
    match Task::try_current() {
        Some(task) if task.on_managed_stack() => unsafe {
            task.call_on_native_stack_raw(p, personality_shim)
        },
        // Already on the native stack (or no task, which implies the
        // same): switching mid-unwind would be redundant and unsafe.
        _ => personality_shim(p),
    }
    args.retval
}

// =========================================================================
// Stack growth, shrink, limit reset
// =========================================================================

/// Pushes a new stack segment and returns the stack pointer compiled code
/// continues on, with the argument block copied to the segment top.
/// NB: This needs to be blazing fast. Don't switch stacks.
#[unsafe(no_mangle)]
pub extern "C" fn upcall_new_stack(size: usize, args: *mut c_void, args_size: usize) -> *mut u8 {
    let task = Task::current();
    task.new_stack(size, args, args_size)
}

/// Pops the newest stack segment.
/// NB: This needs to be blazing fast. Don't switch stacks.
#[unsafe(no_mangle)]
pub extern "C" fn upcall_del_stack() {
    let task = Task::current();
    task.prev_stack();
}

/// Reinstalls the overflow-guard limit from the live stack pointer.
/// Landing pads call this so the next guarded call cannot spuriously
/// fault. NB: Must run on the managed stack; it needs the genuine stack
/// pointer at the call site.
#[unsafe(no_mangle)]
pub extern "C" fn upcall_reset_stack_limit() {
    let task = Task::current();
    task.reset_stack_limit();
}

// =========================================================================
// Link-compatibility aliases
// =========================================================================
// Pure pass-throughs for the older code-generation path, which emits
// `sable_`-prefixed symbols to avoid clashing with its own wrappers.
// TODO: retire these once that path stops referencing them.

#[unsafe(no_mangle)]
pub extern "C" fn sable_upcall_fail(expr: *const c_char, file: *const c_char, line: usize) -> ! {
    upcall_fail(expr, file, line)
}

#[unsafe(no_mangle)]
pub extern "C" fn sable_upcall_malloc(td: *const TypeDesc, size: usize) -> *mut BoxHeader {
    upcall_malloc(td, size)
}

#[unsafe(no_mangle)]
pub extern "C" fn sable_upcall_free(boxp: *mut BoxHeader) {
    upcall_free(boxp)
}

// =========================================================================
// Helper functions
// =========================================================================

fn cstr_or(p: *const c_char, fallback: &str) -> String {
    if p.is_null() {
        return fallback.to_string();
    }
    unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned()
}
