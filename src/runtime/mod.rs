//! Runtime kernel for native Sable code
//!
//! This module provides the upcall layer that compiled Sable code calls
//! into. It separates:
//! - Stack switching between the managed and native stacks (switch.rs,
//!   arch/)
//! - Growable segmented stacks and their guard limits (stack.rs)
//! - Task-local box allocation with origin tracking (boxed.rs, origin.rs)
//! - The task context and current-task lifecycle (task.rs)
//! - The exception-personality bridge (unwind.rs)
//! - The extern "C" entry points themselves (upcalls.rs)
//!
//! Compiled code targets only the symbols in `upcalls.rs`; everything
//! else is the machinery behind them.

pub mod abi_version;
pub mod arch;
pub mod boxed;
pub mod origin;
pub mod stack;
pub mod switch;
pub mod task;
pub mod unwind;
pub mod upcalls;

pub use abi_version::{ABI_NAME, ABI_VERSION};
pub use boxed::{BoxAllocator, BoxHeader, TypeDesc};
pub use stack::{StackConfig, StackError, StackSegment};
pub use task::{FailureInfo, Task, TaskFailed, TaskGuard};
pub use unwind::{PersonalityFn, set_native_personality};
