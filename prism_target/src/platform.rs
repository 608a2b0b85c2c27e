//! Target platform description.

use std::fmt;

/// Instruction set architectures with register configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Isa {
    Amd64,
    Aarch64,
    Arm,
    Riscv64,
}

/// Operating systems the runtime distinguishes between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Os {
    Linux,
    Darwin,
    Windows,
}

/// An ISA/OS pair plus the machine parameters derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Platform {
    pub isa: Isa,
    pub os: Os,
    /// Size of a machine word in bytes.
    pub word_size: usize,
    /// Required stack alignment at call sites.
    pub stack_alignment: usize,
}

impl Platform {
    /// Create a platform description for the given ISA and OS.
    pub const fn new(isa: Isa, os: Os) -> Self {
        let (word_size, stack_alignment) = match isa {
            Isa::Amd64 | Isa::Aarch64 | Isa::Riscv64 => (8, 16),
            Isa::Arm => (4, 8),
        };
        Self {
            isa,
            os,
            word_size,
            stack_alignment,
        }
    }

    /// AMD64 on Linux.
    pub const fn amd64_linux() -> Self {
        Self::new(Isa::Amd64, Os::Linux)
    }

    /// Detect the platform this process runs on.
    ///
    /// Hosts outside the supported set are a fatal condition.
    pub fn host() -> Self {
        let isa = if cfg!(target_arch = "x86_64") {
            Isa::Amd64
        } else if cfg!(target_arch = "aarch64") {
            Isa::Aarch64
        } else if cfg!(target_arch = "arm") {
            Isa::Arm
        } else if cfg!(target_arch = "riscv64") {
            Isa::Riscv64
        } else {
            crate::fatal!("unsupported host architecture {}", std::env::consts::ARCH)
        };
        let os = if cfg!(target_os = "linux") {
            Os::Linux
        } else if cfg!(target_os = "macos") {
            Os::Darwin
        } else if cfg!(target_os = "windows") {
            Os::Windows
        } else {
            crate::fatal!("unsupported host operating system {}", std::env::consts::OS)
        };
        Self::new(isa, os)
    }

    /// Round a frame size so the stack stays aligned across calls.
    ///
    /// On AMD64 the return address already occupies one word of the
    /// alignment unit, so the frame is sized to `align(size + word) - word`.
    pub const fn align_frame_size(&self, size: usize) -> usize {
        match self.isa {
            Isa::Amd64 => {
                align_up(size + self.word_size, self.stack_alignment) - self.word_size
            }
            Isa::Aarch64 | Isa::Riscv64 | Isa::Arm => align_up(size, self.stack_alignment),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.isa, self.os)
    }
}

/// Round `value` up to a power-of-two `alignment`.
#[inline]
pub const fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amd64_frame_alignment() {
        let platform = Platform::amd64_linux();
        assert_eq!(platform.align_frame_size(0), 8);
        assert_eq!(platform.align_frame_size(8), 8);
        assert_eq!(platform.align_frame_size(16), 24);
        assert_eq!(platform.align_frame_size(128), 136);
        assert_eq!(platform.align_frame_size(136), 136);
    }

    #[test]
    fn test_aarch64_frame_alignment() {
        let platform = Platform::new(Isa::Aarch64, Os::Linux);
        assert_eq!(platform.align_frame_size(8), 16);
        assert_eq!(platform.align_frame_size(32), 32);
    }

    #[test]
    fn test_word_sizes() {
        assert_eq!(Platform::new(Isa::Arm, Os::Linux).word_size, 4);
        assert_eq!(Platform::new(Isa::Riscv64, Os::Linux).word_size, 8);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(17, 16), 32);
    }
}
