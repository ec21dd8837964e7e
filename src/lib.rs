//! Library target for building the runtime as a static library
//!
//! Compiled Sable programs link against this crate built via
//! `cargo rustc --lib --crate-type=staticlib`; the upcall symbols in
//! `runtime::upcalls` are the only ones the code generator references.

pub mod runtime;

pub use runtime::*;
