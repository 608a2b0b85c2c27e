//! Executable memory: regions, the code cache and code patching.

pub mod cache;
pub mod patch;
pub mod region;

pub use cache::{CodeCache, CodeCacheStats};
pub use patch::{PatchError, StopTheWorld, Unpublished, WorldStopped};
pub use region::{CodeRegion, CodeSpan};
