//! Stack walking over target-method frames.
//!
//! The walker itself lives outside this crate. For each frame it finds the
//! target method whose code contains the frame's instruction pointer and asks
//! it to step to the caller, to describe the live references, or to find an
//! exception handler.

use crate::registers::CalleeSaveLayout;

use super::method::{TargetKind, TargetMethod};
use super::stub::StubType;

/// Register state of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub ip: usize,
    pub sp: usize,
    pub fp: usize,
}

impl Cursor {
    pub const fn new(ip: usize, sp: usize, fp: usize) -> Self {
        Self { ip, sp, fp }
    }
}

/// Memory access and frame stepping supplied by the stack walker.
pub trait StackFrameWalker {
    /// Read the word at `address`.
    fn read_word(&self, address: usize) -> usize;

    /// Continue the walk in the caller's frame.
    fn advance(&mut self, ip: usize, sp: usize, fp: usize);
}

/// Receives the references live in a frame.
pub trait ReferenceMapPreparer {
    /// The stack slot at `address` holds a reference.
    fn mark_stack_slot(&mut self, address: usize);

    /// The register numbered `number` holds a reference in this frame.
    fn mark_register(&mut self, number: u8);
}

/// Frame geometry of a target method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameLayout {
    pub frame_size: usize,
    pub callee_save_layout: Option<CalleeSaveLayout>,
}

/// Result of [`TargetMethod::catch_exception`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchOutcome {
    /// Resume at `handler`.
    Caught { handler: usize },
    NotCaught,
}

impl TargetMethod {
    pub fn frame_layout(&self) -> FrameLayout {
        FrameLayout {
            frame_size: self.frame_size(),
            callee_save_layout: self.callee_save_layout().cloned(),
        }
    }

    /// Address of the slot holding the caller's return address.
    pub fn return_address_pointer(&self, cursor: &Cursor) -> usize {
        if let TargetKind::Adapter(info) = self.kind() {
            let in_frame = self.pos_for(cursor.ip).is_some_and(|pos| info.has_frame_at(pos));
            // Outside its frame an adapter has only the prologue's return
            // address on the stack, above which sits the caller's.
            return if in_frame {
                cursor.sp + self.frame_size()
            } else {
                cursor.sp + self.word_size()
            };
        }
        cursor.sp + self.frame_size()
    }

    /// Step `walker` from this frame to its caller.
    pub fn advance(&self, cursor: &Cursor, walker: &mut dyn StackFrameWalker) {
        let rap = self.return_address_pointer(cursor);
        let ip = walker.read_word(rap);
        let sp = rap + self.word_size();
        let fp = match self.kind() {
            TargetKind::Adapter(info) if self.saves_frame_pointer(cursor, info) => {
                // enter pushed rbp below the prologue's return address
                walker.read_word(rap - 2 * self.word_size())
            }
            _ => cursor.fp,
        };
        walker.advance(ip, sp, fp);
    }

    fn saves_frame_pointer(&self, cursor: &Cursor, info: &super::adapter::AdapterInfo) -> bool {
        info.adapter_type == super::adapter::AdapterType::Baseline2Opt
            && self.pos_for(cursor.ip).is_some_and(|pos| info.has_frame_at(pos))
    }

    /// Report the references live at the stop `cursor.ip` to `preparer`.
    ///
    /// A compiled frame that is not stopped at a safepoint is fatal.
    pub fn prepare_reference_map(&self, cursor: &Cursor, preparer: &mut dyn ReferenceMapPreparer) {
        let word = self.word_size();
        match self.kind() {
            TargetKind::Adapter(info) => {
                for slot in info.frame_reference_map.frame_slots() {
                    preparer.mark_stack_slot(cursor.sp + slot * word);
                }
            }
            TargetKind::Stub(info) => {
                if matches!(
                    info.stub_type,
                    StubType::VirtualTrampoline | StubType::InterfaceTrampoline
                ) {
                    self.mark_trampoline_receiver(cursor, preparer);
                }
            }
            TargetKind::Compiled => {
                let Some(index) = self.find_safepoint_index(cursor.ip) else {
                    crate::fatal!("{}: no safepoint at {:#x}", self.name(), cursor.ip)
                };
                let Some(map) = self.reference_map(index) else {
                    return;
                };
                for slot in map.frame_slots() {
                    preparer.mark_stack_slot(cursor.sp + slot * word);
                }
                for number in (0..64u8).filter(|n| map.registers() & (1u64 << n) != 0) {
                    preparer.mark_register(number);
                }
            }
        }
    }

    /// The receiver of a dynamic trampoline travels in the first parameter
    /// register, saved in the trampoline's callee-save area.
    fn mark_trampoline_receiver(&self, cursor: &Cursor, preparer: &mut dyn ReferenceMapPreparer) {
        let Some(csl) = self.callee_save_layout() else {
            return;
        };
        let receiver = crate::registers::amd64::CPU_PARAMETERS[0];
        if let Some(offset) = csl.offset_of(receiver) {
            let csa = cursor.sp + csl.frame_offset_to_csa.unwrap_or(0);
            preparer.mark_stack_slot(csa + offset);
        }
    }

    /// Find the handler covering `cursor.ip` whose catch type `catches`
    /// accepts.
    ///
    /// Exceptions never originate in adapters; observing one there is fatal.
    pub fn catch_exception(&self, cursor: &Cursor, catches: &dyn Fn(Option<&str>) -> bool) -> CatchOutcome {
        match self.kind() {
            TargetKind::Adapter(_) => {
                crate::fatal!("exception observed in adapter {}", self.name())
            }
            TargetKind::Stub(_) => CatchOutcome::NotCaught,
            TargetKind::Compiled => {
                let Some(pos) = self.pos_for(cursor.ip) else {
                    return CatchOutcome::NotCaught;
                };
                self.exception_handlers()
                    .iter()
                    .find(|h| pos >= h.start && pos < h.end && catches(h.catch_type.as_deref()))
                    .map_or(CatchOutcome::NotCaught, |h| CatchOutcome::Caught {
                        handler: self.code_at(h.handler),
                    })
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
