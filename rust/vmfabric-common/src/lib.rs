//! Core definitions shared by all vmfabric-* crates: the error type, the `Result`
//! alias and argument verification helpers.

pub mod error;
pub mod result;

pub use result::Result;
