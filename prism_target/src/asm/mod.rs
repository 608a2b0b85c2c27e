//! Minimal machine-code emission and decoding.
//!
//! Only what hand-assembled stubs and adapters need; compiled methods are
//! produced by external compilers.

pub mod amd64;
pub mod decoder;

pub use amd64::{Amd64Assembler, Mem};
