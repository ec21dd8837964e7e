//! Upcall ABI version
//!
//! Stamps the entry-point table in `upcalls.rs`. The code generator
//! embeds the version it was built against; a mismatch at link time means
//! compiler and runtime disagree about upcall signatures.

/// Version of the upcall ABI. Bump on any signature change in
/// `upcalls.rs`, in coordination with the code generator.
pub const ABI_VERSION: u32 = 1;

/// Symbol-prefix name of the ABI, as used by the link-compatibility
/// aliases.
pub const ABI_NAME: &str = "sable";
