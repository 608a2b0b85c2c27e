//! Layout of the co-located literal and code arrays of a target method.
//!
//! A bundle is one contiguous code-cache allocation holding up to three
//! cells, in this order:
//!
//! ```text
//! +----------------------+-------------------------+---------------+
//! | scalar literal bytes | reference literal slots | code bytes    |
//! +----------------------+-------------------------+---------------+
//! ```
//!
//! Every cell is an array: a two-word header (type word, length word)
//! followed by its elements, padded to a word boundary. Keeping literals
//! next to the code lets compiled code address them RIP-relative.

use crate::platform::align_up;

use super::method::TargetMethod;

/// One of the arrays in a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArrayField {
    ScalarLiterals,
    ReferenceLiterals,
    Code,
}

impl ArrayField {
    pub const VALUES: [ArrayField; 3] = [
        ArrayField::ScalarLiterals,
        ArrayField::ReferenceLiterals,
        ArrayField::Code,
    ];

    #[inline]
    const fn index(self) -> usize {
        match self {
            ArrayField::ScalarLiterals => 0,
            ArrayField::ReferenceLiterals => 1,
            ArrayField::Code => 2,
        }
    }

    /// Bytes per element.
    #[inline]
    pub const fn element_size(self, word_size: usize) -> usize {
        match self {
            ArrayField::ReferenceLiterals => word_size,
            ArrayField::ScalarLiterals | ArrayField::Code => 1,
        }
    }

    /// Whether the cell exists even when it has no elements.
    #[inline]
    pub const fn allocate_when_empty(self) -> bool {
        matches!(self, ArrayField::Code)
    }
}

/// Offsets and sizes of the cells in one bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleLayout {
    word_size: usize,
    lengths: [usize; 3],
    cell_offsets: [Option<usize>; 3],
    bundle_size: usize,
}

impl BundleLayout {
    /// Lay out a bundle for the given array lengths (in elements).
    pub fn new(word_size: usize, scalar_bytes: usize, reference_count: usize, code_bytes: usize) -> Self {
        let mut layout = Self {
            word_size,
            lengths: [scalar_bytes, reference_count, code_bytes],
            cell_offsets: [None; 3],
            bundle_size: 0,
        };
        layout.recompute();
        layout
    }

    /// Recover the layout of an installed method.
    pub fn from_target_method(tm: &TargetMethod) -> Self {
        Self::new(
            tm.word_size(),
            tm.scalar_literals_len(),
            tm.reference_literals().len(),
            tm.code_len(),
        )
    }

    fn recompute(&mut self) {
        let mut offset = 0;
        for field in ArrayField::VALUES {
            let i = field.index();
            if self.lengths[i] == 0 && !field.allocate_when_empty() {
                self.cell_offsets[i] = None;
                continue;
            }
            self.cell_offsets[i] = Some(offset);
            offset += self.cell_size(field);
        }
        self.bundle_size = offset;
    }

    /// Change the length of `field` and lay the bundle out again.
    ///
    /// Returns the new bundle size.
    pub fn update(&mut self, field: ArrayField, length: usize) -> usize {
        self.lengths[field.index()] = length;
        self.recompute();
        self.bundle_size
    }

    /// Size of a cell header.
    #[inline]
    pub const fn header_size(&self) -> usize {
        2 * self.word_size
    }

    #[inline]
    pub fn word_size(&self) -> usize {
        self.word_size
    }

    /// Element count of `field`.
    #[inline]
    pub fn length(&self, field: ArrayField) -> usize {
        self.lengths[field.index()]
    }

    #[inline]
    pub fn is_allocated(&self, field: ArrayField) -> bool {
        self.cell_offsets[field.index()].is_some()
    }

    /// Offset of the cell of `field` from the bundle start.
    ///
    /// Asking for a cell that was not allocated is fatal.
    pub fn cell_offset(&self, field: ArrayField) -> usize {
        match self.cell_offsets[field.index()] {
            Some(offset) => offset,
            None => crate::fatal!("{field:?} has no cell in this bundle"),
        }
    }

    /// Word-aligned size of the cell of `field`, header included.
    pub fn cell_size(&self, field: ArrayField) -> usize {
        let payload = self.length(field) * field.element_size(self.word_size);
        align_up(self.header_size() + payload, self.word_size)
    }

    /// Offset of the first element of `field` from the bundle start.
    #[inline]
    pub fn first_element_offset(&self, field: ArrayField) -> usize {
        self.cell_offset(field) + self.header_size()
    }

    /// Total bytes of the bundle. Always a multiple of the word size.
    #[inline]
    pub fn bundle_size(&self) -> usize {
        self.bundle_size
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_only_bundle() {
        let layout = BundleLayout::new(8, 0, 0, 13);
        assert!(!layout.is_allocated(ArrayField::ScalarLiterals));
        assert!(!layout.is_allocated(ArrayField::ReferenceLiterals));
        assert_eq!(layout.cell_offset(ArrayField::Code), 0);
        assert_eq!(layout.first_element_offset(ArrayField::Code), 16);
        assert_eq!(layout.bundle_size(), 32);
    }

    #[test]
    fn test_full_bundle_offsets() {
        let layout = BundleLayout::new(8, 20, 3, 100);
        assert_eq!(layout.cell_offset(ArrayField::ScalarLiterals), 0);
        assert_eq!(layout.cell_size(ArrayField::ScalarLiterals), 40);
        assert_eq!(layout.cell_offset(ArrayField::ReferenceLiterals), 40);
        assert_eq!(layout.cell_size(ArrayField::ReferenceLiterals), 40);
        assert_eq!(layout.cell_offset(ArrayField::Code), 80);
        assert_eq!(layout.bundle_size(), 80 + 120);
        assert_eq!(layout.length(ArrayField::ReferenceLiterals), 3);
    }

    #[test]
    fn test_empty_code_still_allocated() {
        let layout = BundleLayout::new(8, 0, 0, 0);
        assert!(layout.is_allocated(ArrayField::Code));
        assert_eq!(layout.bundle_size(), 16);
    }

    #[test]
    fn test_update_relayouts() {
        let mut layout = BundleLayout::new(8, 0, 1, 8);
        assert_eq!(layout.cell_offset(ArrayField::ReferenceLiterals), 0);
        let size = layout.update(ArrayField::ScalarLiterals, 16);
        assert_eq!(layout.cell_offset(ArrayField::ReferenceLiterals), 32);
        assert_eq!(size, 32 + 24 + 24);
        assert_eq!(size % 8, 0);
    }

    #[test]
    #[should_panic(expected = "has no cell")]
    fn test_cell_offset_of_missing_cell_is_fatal() {
        BundleLayout::new(8, 0, 0, 4).cell_offset(ArrayField::ScalarLiterals);
    }
}
