//! Per-architecture stack primitives.
//!
//! Each architecture provides two operations:
//! - `switch_and_call`: run a function with the stack pointer moved to a
//!   caller-chosen address, then return on the original stack
//! - `current_stack_pointer`: read the live stack pointer at the call site

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use x86_64::{current_stack_pointer, switch_and_call};

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use aarch64::{current_stack_pointer, switch_and_call};
