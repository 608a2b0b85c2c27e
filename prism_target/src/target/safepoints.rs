//! Safepoint/stop tables.
//!
//! A stop is a code position where the thread may be observed by the runtime:
//! a call's return address or a safepoint poll. Each entry is packed into 32
//! bits:
//!
//! ```text
//!  31        27 26   24 23                     0
//! +------------+-------+------------------------+
//! | attributes | cause |        position        |
//! +------------+-------+------------------------+
//! ```
//!
//! `cause` is the distance back from the position to the instruction that
//! caused the stop. For a call the position is the return address and the
//! cause is the call instruction itself.

use std::fmt;

// =============================================================================
// Encoding
// =============================================================================

/// Width of the position field.
///
/// Three cause bits and five attribute bits leave 24 bits of a 32-bit entry,
/// so one method's code is limited to 16 MiB. Installing larger code fails
/// with [`TargetError::CodeTooLarge`](crate::TargetError::CodeTooLarge).
pub const POS_BITS: u32 = 24;
pub const POS_MASK: u32 = (1 << POS_BITS) - 1;
pub const CAUSE_OFFSET_SHIFT: u32 = POS_BITS;
pub const CAUSE_OFFSET_BITS: u32 = 3;
pub const CAUSE_OFFSET_MASK: u32 = (1 << CAUSE_OFFSET_BITS) - 1;
/// Largest encodable `position - cause_position`.
pub const MAX_CAUSE_OFFSET: usize = CAUSE_OFFSET_MASK as usize;
/// Largest encodable position.
pub const MAX_POS: usize = POS_MASK as usize;

pub const DIRECT_CALL: u32 = 1 << 27;
pub const INDIRECT_CALL: u32 = 1 << 28;
pub const NATIVE_CALL: u32 = 1 << 29;
pub const TEMPLATE_CALL: u32 = 1 << 30;
pub const SAFEPOINT: u32 = 1 << 31;

pub const CALL_ATTRS: u32 = DIRECT_CALL | INDIRECT_CALL;
pub const ATTRS_MASK: u32 = DIRECT_CALL | INDIRECT_CALL | NATIVE_CALL | TEMPLATE_CALL | SAFEPOINT;

const ATTR_NAMES: [(u32, &str); 5] = [
    (DIRECT_CALL, "DIRECT_CALL"),
    (INDIRECT_CALL, "INDIRECT_CALL"),
    (NATIVE_CALL, "NATIVE_CALL"),
    (TEMPLATE_CALL, "TEMPLATE_CALL"),
    (SAFEPOINT, "SAFEPOINT"),
];

/// Encode one entry.
///
/// Positions beyond [`MAX_POS`] or cause distances beyond
/// [`MAX_CAUSE_OFFSET`] are contract violations.
#[inline]
pub fn make(pos: usize, cause_pos: usize, attrs: u32) -> u32 {
    assert!(pos <= MAX_POS, "safepoint position {pos} exceeds {MAX_POS}");
    assert!(cause_pos <= pos, "cause position {cause_pos} after position {pos}");
    let cause_offset = pos - cause_pos;
    assert!(
        cause_offset <= MAX_CAUSE_OFFSET,
        "cause offset {cause_offset} exceeds {MAX_CAUSE_OFFSET}"
    );
    assert!(attrs & !ATTRS_MASK == 0, "unknown safepoint attributes {attrs:#x}");
    (pos as u32) | ((cause_offset as u32) << CAUSE_OFFSET_SHIFT) | attrs
}

/// A non-call safepoint poll at `pos`.
#[inline]
pub fn make_safepoint(pos: usize) -> u32 {
    make(pos, pos, SAFEPOINT)
}

/// Decode an entry into `(pos, cause_pos, attrs)`.
#[inline]
pub const fn decode(entry: u32) -> (usize, usize, u32) {
    let pos = (entry & POS_MASK) as usize;
    let cause_offset = ((entry >> CAUSE_OFFSET_SHIFT) & CAUSE_OFFSET_MASK) as usize;
    (pos, pos - cause_offset, entry & ATTRS_MASK)
}

/// Position of the return address for a call at `call_pos` of `call_size`
/// bytes.
#[inline]
pub const fn safepoint_pos_for_call(call_pos: usize, call_size: usize) -> usize {
    call_pos + call_size
}

// =============================================================================
// Table
// =============================================================================

/// Sorted table of packed stop entries.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Safepoints {
    entries: Box<[u32]>,
}

/// Structural defects [`Safepoints::validate`] reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafepointDefect {
    NotAscending { index: usize },
    NativeNotIndirect { index: usize },
    TemplateNotCall { index: usize },
    NonCallWithCause { index: usize },
    DirectAndIndirect { index: usize },
}

impl Safepoints {
    /// Build a table from packed entries.
    pub fn new(entries: impl Into<Box<[u32]>>) -> Self {
        let table = Self {
            entries: entries.into(),
        };
        debug_assert_eq!(table.validate(), Ok(()), "malformed safepoint table");
        table
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn entries(&self) -> &[u32] {
        &self.entries
    }

    #[inline]
    pub fn pos_at(&self, index: usize) -> usize {
        (self.entries[index] & POS_MASK) as usize
    }

    #[inline]
    pub fn cause_pos_at(&self, index: usize) -> usize {
        decode(self.entries[index]).1
    }

    #[inline]
    pub fn is_set_at(&self, attr: u32, index: usize) -> bool {
        self.entries[index] & attr != 0
    }

    #[inline]
    pub fn attrs_at(&self, index: usize) -> u32 {
        self.entries[index] & ATTRS_MASK
    }

    /// Index of the entry at exactly `pos`.
    pub fn index_of(&self, pos: usize) -> Option<usize> {
        self.entries
            .binary_search_by_key(&pos, |e| (e & POS_MASK) as usize)
            .ok()
    }

    /// First direct-call entry at or after `start`.
    pub fn next_direct_call(&self, start: usize) -> Option<usize> {
        (start..self.len()).find(|&i| self.is_set_at(DIRECT_CALL, i))
    }

    /// Indices of all direct-call entries in ascending order.
    pub fn direct_calls(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.next_direct_call(0), move |&i| {
            self.next_direct_call(i + 1)
        })
    }

    pub fn number_of_direct_calls(&self) -> usize {
        self.count(DIRECT_CALL)
    }

    pub fn number_of_indirect_calls(&self) -> usize {
        self.count(INDIRECT_CALL)
    }

    fn count(&self, attr: u32) -> usize {
        self.entries.iter().filter(|e| *e & attr != 0).count()
    }

    /// Decoded `(pos, cause_pos, attrs)` triples.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, u32)> + '_ {
        self.entries.iter().map(|e| decode(*e))
    }

    /// Check the structural invariants of the table.
    pub fn validate(&self) -> Result<(), SafepointDefect> {
        for (index, &entry) in self.entries.iter().enumerate() {
            let (pos, cause_pos, attrs) = decode(entry);
            if index > 0 && self.pos_at(index - 1) >= pos {
                return Err(SafepointDefect::NotAscending { index });
            }
            let is_call = attrs & CALL_ATTRS != 0;
            if attrs & NATIVE_CALL != 0 && attrs & INDIRECT_CALL == 0 {
                return Err(SafepointDefect::NativeNotIndirect { index });
            }
            if attrs & TEMPLATE_CALL != 0 && !is_call {
                return Err(SafepointDefect::TemplateNotCall { index });
            }
            if !is_call && cause_pos != pos {
                return Err(SafepointDefect::NonCallWithCause { index });
            }
            if attrs & CALL_ATTRS == CALL_ATTRS {
                return Err(SafepointDefect::DirectAndIndirect { index });
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Safepoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| format!("{e:#010x}")))
            .finish()
    }
}

impl fmt::Display for Safepoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (pos, cause_pos, attrs)) in self.iter().enumerate() {
            write!(f, "{i}: pos={pos}")?;
            if cause_pos != pos {
                write!(f, " cause={cause_pos}")?;
            }
            for (bit, name) in ATTR_NAMES {
                if attrs & bit != 0 {
                    write!(f, " {name}")?;
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
