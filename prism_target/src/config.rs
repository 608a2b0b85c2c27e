//! Runtime configuration for the compiled-code subsystem.

use std::time::Duration;

use regex::Regex;
use thiserror::Error;

use crate::compile::Nature;
use crate::platform::Platform;

/// Configuration for code installation, linking and compilation.
///
/// # Example
///
/// ```ignore
/// use prism_target::TargetConfig;
///
/// let config = TargetConfig {
///     code_cache_size: 64 * 1024 * 1024,
///     fail_over_compilation: false,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct TargetConfig {
    // =========================================================================
    // Platform
    // =========================================================================
    /// Platform whose register configurations and stubs are generated.
    ///
    /// Default: the host platform
    pub platform: Platform,

    // =========================================================================
    // Code Cache
    // =========================================================================
    /// Size of the code region backing all bundles, in bytes.
    ///
    /// Default: 16MB
    pub code_cache_size: usize,

    /// Map code pages executable.
    ///
    /// Pages are mapped read-write-execute when set and read-write otherwise.
    /// Tools that only inspect generated code leave this off.
    ///
    /// Default: true
    pub executable_code: bool,

    // =========================================================================
    // Compilation
    // =========================================================================
    /// Retry a failed compilation once with the other compiler.
    ///
    /// Default: true
    pub fail_over_compilation: bool,

    /// Log compile lifecycle events at `info` instead of `debug`.
    ///
    /// Default: false
    pub verbose_compilation: bool,

    /// Compiler used when a request does not name a nature.
    ///
    /// Default: `Nature::Baseline`
    pub default_nature: Nature,

    /// Per-method compiler overrides, first match wins.
    pub compile_commands: Vec<CompileCommand>,

    /// Interval at which waiting threads re-check their interrupt flag.
    ///
    /// Default: 10ms
    pub compile_wait_poll: Duration,

    // =========================================================================
    // Dispatch
    // =========================================================================
    /// First vtable index that names a real method.
    ///
    /// Lower indexes overlap the hub header and share the invalid-index
    /// trampoline.
    ///
    /// Default: 4
    pub first_valid_vtable_index: usize,

    /// First itable index that names a real method.
    ///
    /// Default: 2
    pub first_valid_itable_index: usize,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            platform: Platform::host(),
            code_cache_size: 16 * 1024 * 1024, // 16MB
            executable_code: true,
            fail_over_compilation: true,
            verbose_compilation: false,
            default_nature: Nature::Baseline,
            compile_commands: Vec::new(),
            compile_wait_poll: Duration::from_millis(10),
            first_valid_vtable_index: 4,
            first_valid_itable_index: 2,
        }
    }
}

impl TargetConfig {
    /// Minimum code cache size (one 64KB region).
    pub const MIN_CODE_CACHE_SIZE: usize = 64 * 1024;

    /// Configuration for interactive development: verbose compile logging.
    pub fn development() -> Self {
        Self {
            verbose_compilation: true,
            ..Default::default()
        }
    }

    /// Configuration for unit tests.
    ///
    /// Generates AMD64 Linux code regardless of the host and never maps
    /// pages executable.
    pub fn for_testing() -> Self {
        Self {
            platform: Platform::amd64_linux(),
            code_cache_size: 1024 * 1024, // 1MB
            executable_code: false,
            compile_wait_poll: Duration::from_millis(1),
            ..Default::default()
        }
    }

    /// Add a compile command.
    pub fn with_compile_command(mut self, command: CompileCommand) -> Self {
        self.compile_commands.push(command);
        self
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.code_cache_size < Self::MIN_CODE_CACHE_SIZE {
            return Err(ConfigError::CodeCacheTooSmall {
                size: self.code_cache_size,
            });
        }
        if self.compile_wait_poll.is_zero() {
            return Err(ConfigError::ZeroPollInterval);
        }
        if self.first_valid_vtable_index == 0 && self.first_valid_itable_index == 0 {
            // Both tables would start at the hub header.
            return Err(ConfigError::InvalidDispatchStart);
        }
        Ok(())
    }
}

// =============================================================================
// Compile Commands
// =============================================================================

/// Routes methods whose qualified name matches `pattern` to a named compiler.
#[derive(Debug, Clone)]
pub struct CompileCommand {
    pattern: Regex,
    compiler: String,
}

impl CompileCommand {
    /// Parse a command; `pattern` is matched against `Holder.method`.
    pub fn new(pattern: &str, compiler: impl Into<String>) -> Result<Self, ConfigError> {
        let pattern = Regex::new(pattern).map_err(|err| ConfigError::InvalidCompileCommand {
            pattern: pattern.to_string(),
            reason: err.to_string(),
        })?;
        Ok(Self {
            pattern,
            compiler: compiler.into(),
        })
    }

    #[inline]
    pub fn matches(&self, qualified_name: &str) -> bool {
        self.pattern.is_match(qualified_name)
    }

    #[inline]
    pub fn compiler(&self) -> &str {
        &self.compiler
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("code cache size {size} is below the 64KB minimum")]
    CodeCacheTooSmall { size: usize },
    #[error("compile wait poll interval must be non-zero")]
    ZeroPollInterval,
    #[error("vtable and itable cannot both start at index 0")]
    InvalidDispatchStart,
    #[error("invalid compile command pattern `{pattern}`: {reason}")]
    InvalidCompileCommand { pattern: String, reason: String },
}
