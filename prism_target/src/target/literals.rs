//! Literal serialization and RIP-relative patching.
//!
//! Scalar literals are packed into the scalar cell of the bundle, each slot
//! starting on a 2-word boundary. Object literals go into the reference cell
//! one word each. Equal scalars (same kind and bits) and identical objects
//! share a slot.

use rustc_hash::FxHashMap;

use crate::asm::decoder::{DecodeError, patch_rip_operand};
use crate::platform::align_up;

use super::bundle::{ArrayField, BundleLayout};
use super::codegen_result::{Constant, DataPatch, ObjectConstant};

/// Where a data patch points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiteralSlot {
    /// Byte offset inside the scalar cell.
    Scalar(usize),
    /// Index inside the reference cell.
    Reference(usize),
}

/// Serialized literals of one method.
#[derive(Debug, Default)]
pub struct Literals {
    scalar_bytes: Vec<u8>,
    references: Vec<ObjectConstant>,
    /// `(pc_offset, slot)` per data patch.
    uses: Vec<(usize, LiteralSlot)>,
}

impl Literals {
    /// Serialize the constants of `patches`.
    pub fn serialize(word_size: usize, patches: &[DataPatch]) -> Self {
        let scalar_alignment = 2 * word_size;
        let mut literals = Literals::default();
        let mut scalar_slots: FxHashMap<(u8, u64), usize> = FxHashMap::default();

        for patch in patches {
            let slot = match &patch.constant {
                Constant::Object(object) => {
                    let index = match literals.references.iter().position(|o| o.ptr_eq(object)) {
                        Some(index) => index,
                        None => {
                            literals.references.push(object.clone());
                            literals.references.len() - 1
                        }
                    };
                    LiteralSlot::Reference(index)
                }
                scalar => {
                    let key = scalar_key(scalar);
                    let offset = *scalar_slots.entry(key).or_insert_with(|| {
                        let offset = align_up(literals.scalar_bytes.len(), scalar_alignment);
                        literals.scalar_bytes.resize(offset, 0);
                        if let Some(bytes) = scalar.scalar_bytes() {
                            literals.scalar_bytes.extend_from_slice(&bytes);
                        }
                        offset
                    });
                    LiteralSlot::Scalar(offset)
                }
            };
            literals.uses.push((patch.pc_offset, slot));
        }
        literals
    }

    #[inline]
    pub fn scalar_bytes(&self) -> &[u8] {
        &self.scalar_bytes
    }

    #[inline]
    pub fn references(&self) -> &[ObjectConstant] {
        &self.references
    }

    pub fn into_references(self) -> Vec<ObjectConstant> {
        self.references
    }

    #[inline]
    pub fn uses(&self) -> &[(usize, LiteralSlot)] {
        &self.uses
    }

    /// Rewrite every literal-loading instruction in `code` to address its
    /// slot in a bundle laid out as `layout`.
    pub fn patch_code(&self, code: &mut [u8], layout: &BundleLayout) -> Result<(), DecodeError> {
        let code_start = layout.first_element_offset(ArrayField::Code) as i64;
        for &(pc_offset, slot) in &self.uses {
            let literal = match slot {
                LiteralSlot::Scalar(offset) => {
                    layout.first_element_offset(ArrayField::ScalarLiterals) + offset
                }
                LiteralSlot::Reference(index) => {
                    layout.first_element_offset(ArrayField::ReferenceLiterals) + index * layout.word_size()
                }
            } as i64;
            patch_rip_operand(code, pc_offset, literal - code_start - pc_offset as i64)?;
        }
        Ok(())
    }
}

fn scalar_key(constant: &Constant) -> (u8, u64) {
    match constant {
        Constant::Int(v) => (0, *v as u32 as u64),
        Constant::Long(v) => (1, *v as u64),
        Constant::Float(v) => (2, v.to_bits() as u64),
        Constant::Double(v) => (3, v.to_bits()),
        Constant::Object(o) => (4, o.address() as u64),
    }
}
