//! Value kinds used by signatures, literals and per-kind stubs.

use std::fmt;

/// The machine-level kind of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    Boolean,
    Byte,
    Short,
    Char,
    Int,
    Float,
    Long,
    Double,
    Object,
    Word,
    Void,
}

impl Kind {
    /// Kinds that survive on the operand stack, in stub-table order.
    pub const STACK_KINDS: [Kind; 7] = [
        Kind::Void,
        Kind::Int,
        Kind::Long,
        Kind::Float,
        Kind::Double,
        Kind::Object,
        Kind::Word,
    ];

    /// Widen sub-int kinds to `Int`.
    #[inline]
    pub const fn stack_kind(self) -> Kind {
        match self {
            Kind::Boolean | Kind::Byte | Kind::Short | Kind::Char | Kind::Int => Kind::Int,
            other => other,
        }
    }

    /// Index into per-stack-kind tables (see [`Kind::STACK_KINDS`]).
    #[inline]
    pub const fn stack_index(self) -> usize {
        match self.stack_kind() {
            Kind::Void => 0,
            Kind::Int => 1,
            Kind::Long => 2,
            Kind::Float => 3,
            Kind::Double => 4,
            Kind::Object => 5,
            _ => 6,
        }
    }

    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, Kind::Float | Kind::Double)
    }

    #[inline]
    pub const fn is_reference(self) -> bool {
        matches!(self, Kind::Object)
    }

    #[inline]
    pub const fn is_void(self) -> bool {
        matches!(self, Kind::Void)
    }

    /// Size of a value of this kind in memory.
    pub const fn size_in_bytes(self, word_size: usize) -> usize {
        match self {
            Kind::Boolean | Kind::Byte => 1,
            Kind::Short | Kind::Char => 2,
            Kind::Int | Kind::Float => 4,
            Kind::Long | Kind::Double => 8,
            Kind::Object | Kind::Word => word_size,
            Kind::Void => 0,
        }
    }

    /// Single-character type code.
    pub const fn type_char(self) -> char {
        match self {
            Kind::Boolean => 'Z',
            Kind::Byte => 'B',
            Kind::Short => 'S',
            Kind::Char => 'C',
            Kind::Int => 'I',
            Kind::Float => 'F',
            Kind::Long => 'J',
            Kind::Double => 'D',
            Kind::Object => 'L',
            Kind::Word => 'W',
            Kind::Void => 'V',
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Boolean => "boolean",
            Kind::Byte => "byte",
            Kind::Short => "short",
            Kind::Char => "char",
            Kind::Int => "int",
            Kind::Float => "float",
            Kind::Long => "long",
            Kind::Double => "double",
            Kind::Object => "object",
            Kind::Word => "word",
            Kind::Void => "void",
        };
        f.write_str(name)
    }
}
