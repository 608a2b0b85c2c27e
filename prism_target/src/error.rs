//! Recoverable error types.
//!
//! Only conditions that managed code or an embedder can react to live here.
//! Broken invariants go through [`crate::fatal!`] instead.

use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by linking, dispatch and compilation.
#[derive(Debug, Clone, Error)]
pub enum TargetError {
    /// Dispatch selected an abstract member.
    #[error("abstract method invoked: {method}")]
    AbstractMethod { method: String },

    /// A dispatch index names no member of the receiver's type.
    #[error("incompatible class change: {hub} has no method at dispatch index {index}")]
    IncompatibleClassChange { hub: String, index: usize },

    /// The code-generation service rejected the method.
    #[error("compilation of {method} by {compiler} failed: {source}")]
    CompilationFailed {
        method: String,
        compiler: String,
        #[source]
        source: CompileError,
    },

    /// The code cache cannot hold another bundle.
    #[error("code cache full: requested {requested} bytes, {available} available")]
    CodeCacheFull { requested: usize, available: usize },

    /// Generated code has stops beyond the encodable safepoint position.
    #[error("code for {method} is {size} bytes; safepoint positions end at {max}")]
    CodeTooLarge { method: String, size: usize, max: usize },

    /// Mapping a code region failed.
    #[error("failed to map a code region of {size} bytes")]
    RegionAllocation { size: usize },

    /// The method has no body to compile.
    #[error("no code available for {method}")]
    Unavailable { method: String },

    /// A bounded wait for a compilation expired.
    #[error("timed out waiting for compilation of {method}")]
    Timeout { method: String },

    /// The runtime configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Failure reported by a [`crate::compile::RuntimeCompiler`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CompileError {
    pub message: String,
    /// The compiler gave up on a construct it does not support.
    pub bailout: bool,
}

impl CompileError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            bailout: false,
        }
    }

    pub fn bailout(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            bailout: true,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type TargetResult<T> = Result<T, TargetError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_compilation_failed_keeps_source() {
        let err = TargetError::CompilationFailed {
            method: "Foo.bar".into(),
            compiler: "c1x".into(),
            source: CompileError::bailout("unsupported jsr"),
        };
        assert_eq!(
            err.to_string(),
            "compilation of Foo.bar by c1x failed: unsupported jsr"
        );
        let source = err.source().expect("source");
        assert_eq!(source.to_string(), "unsupported jsr");
    }

    #[test]
    fn test_abstract_method_message() {
        let err = TargetError::AbstractMethod {
            method: "Shape.area".into(),
        };
        assert_eq!(err.to_string(), "abstract method invoked: Shape.area");
    }
}
