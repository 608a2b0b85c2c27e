//! Output of a code-generation service.
//!
//! A [`CodegenResult`] is machine code plus the metadata needed to install it:
//! call and safepoint sites, literal references, exception handlers and
//! frame information. [`super::TargetMethod::install_codegen`] turns it into
//! an installed method.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::compile::Nature;
use crate::method::MethodRef;
use crate::registers::CalleeSaveLayout;

use super::call_target::RuntimeRoutine;
use super::method::TargetMethod;

// =============================================================================
// Constants
// =============================================================================

/// A heap object referenced from compiled code.
///
/// Identity is pointer identity: two constants are the same literal only if
/// they share an allocation.
#[derive(Clone)]
pub struct ObjectConstant(Arc<dyn Any + Send + Sync>);

impl ObjectConstant {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn from_arc(value: Arc<dyn Any + Send + Sync>) -> Self {
        Self(value)
    }

    /// Address written into the reference literal slot.
    #[inline]
    pub fn address(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    #[inline]
    pub fn ptr_eq(&self, other: &ObjectConstant) -> bool {
        self.address() == other.address()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for ObjectConstant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectConstant({:#x})", self.address())
    }
}

/// A literal loaded by compiled code.
#[derive(Debug, Clone)]
pub enum Constant {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Object(ObjectConstant),
}

impl Constant {
    /// Bytes of a scalar constant, `None` for objects.
    pub fn scalar_bytes(&self) -> Option<SmallVec<[u8; 8]>> {
        match self {
            Constant::Int(v) => Some(SmallVec::from_slice(&v.to_le_bytes())),
            Constant::Float(v) => Some(SmallVec::from_slice(&v.to_le_bytes())),
            Constant::Long(v) => Some(SmallVec::from_slice(&v.to_le_bytes())),
            Constant::Double(v) => Some(SmallVec::from_slice(&v.to_le_bytes())),
            Constant::Object(_) => None,
        }
    }
}

/// An instruction at `pc_offset` loading `constant` RIP-relative.
#[derive(Debug, Clone)]
pub struct DataPatch {
    pub pc_offset: usize,
    pub constant: Constant,
}

// =============================================================================
// Reference Maps
// =============================================================================

/// Live references at a stop: frame slots and registers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceMap {
    frame: SmallVec<[u64; 2]>,
    registers: u64,
}

impl ReferenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark frame slot `index` (in words from the stack pointer).
    pub fn with_frame_slot(mut self, index: usize) -> Self {
        self.set_frame_slot(index);
        self
    }

    /// Mark the register with number `number`.
    pub fn with_register(mut self, number: u8) -> Self {
        self.registers |= 1u64 << number;
        self
    }

    pub fn set_frame_slot(&mut self, index: usize) {
        let word = index / 64;
        if self.frame.len() <= word {
            self.frame.resize(word + 1, 0);
        }
        self.frame[word] |= 1u64 << (index % 64);
    }

    pub fn is_frame_slot_set(&self, index: usize) -> bool {
        self.frame
            .get(index / 64)
            .is_some_and(|w| w & (1u64 << (index % 64)) != 0)
    }

    /// Marked frame slots in ascending order.
    pub fn frame_slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.frame.iter().enumerate().flat_map(|(w, bits)| {
            (0..64usize).filter(move |b| bits & (1u64 << b) != 0).map(move |b| w * 64 + b)
        })
    }

    #[inline]
    pub fn registers(&self) -> u64 {
        self.registers
    }

    pub fn is_empty(&self) -> bool {
        self.registers == 0 && self.frame.iter().all(|w| *w == 0)
    }
}

// =============================================================================
// Sites
// =============================================================================

/// What a call site calls.
#[derive(Debug, Clone)]
pub enum CallTarget {
    /// A managed method.
    Method(MethodRef),
    /// A runtime routine.
    Runtime(RuntimeRoutine),
    /// Template code shared between baseline methods.
    Template(RuntimeRoutine),
    /// A native function, by symbol name.
    Native(String),
    /// A target computed at run time (vtable, register).
    Indirect,
}

/// A call instruction in generated code.
#[derive(Debug, Clone)]
pub struct CallSite {
    /// Offset of the call instruction.
    pub pc_offset: usize,
    /// Size of the call instruction in bytes.
    pub size: usize,
    pub target: CallTarget,
    /// `call rel32` to a statically known target.
    pub direct: bool,
    pub reference_map: Option<ReferenceMap>,
}

/// A site the runtime may stop at.
#[derive(Debug, Clone)]
pub enum Site {
    Call(CallSite),
    Safepoint {
        pc_offset: usize,
        reference_map: Option<ReferenceMap>,
    },
}

impl Site {
    pub fn pc_offset(&self) -> usize {
        match self {
            Site::Call(call) => call.pc_offset,
            Site::Safepoint { pc_offset, .. } => *pc_offset,
        }
    }
}

/// A protected code range and its handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// First covered code offset.
    pub start: usize,
    /// End of the covered range (exclusive).
    pub end: usize,
    /// Offset of the handler code.
    pub handler: usize,
    /// Type caught, `None` for catch-all.
    pub catch_type: Option<String>,
}

/// How long installed code is expected to live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lifespan {
    /// May be evicted from the code cache.
    #[default]
    Short,
    /// Never evicted (stubs, adapters, boot code).
    Long,
}

// =============================================================================
// Result
// =============================================================================

/// Everything a compiler produces for one method.
#[derive(Debug, Clone)]
pub struct CodegenResult {
    pub code: Vec<u8>,
    pub frame_size: usize,
    /// Offset of the callee-save restore epilogue, if the method saves
    /// registers.
    pub register_restore_epilogue_offset: Option<usize>,
    pub callee_save_layout: Option<CalleeSaveLayout>,
    /// Adapter called from the method prologue, if any.
    pub adapter: Option<Arc<TargetMethod>>,
    pub data_patches: Vec<DataPatch>,
    pub sites: Vec<Site>,
    pub exception_handlers: Vec<ExceptionHandler>,
    /// Classification of the produced code.
    pub nature: Nature,
    pub lifespan: Lifespan,
}

impl CodegenResult {
    pub fn new(code: Vec<u8>, nature: Nature) -> Self {
        Self {
            code,
            frame_size: 0,
            register_restore_epilogue_offset: None,
            callee_save_layout: None,
            adapter: None,
            data_patches: Vec::new(),
            sites: Vec::new(),
            exception_handlers: Vec::new(),
            nature,
            lifespan: Lifespan::Short,
        }
    }

    pub fn with_frame_size(mut self, frame_size: usize) -> Self {
        self.frame_size = frame_size;
        self
    }

    pub fn with_adapter(mut self, adapter: Option<Arc<TargetMethod>>) -> Self {
        self.adapter = adapter;
        self
    }

    pub fn with_data_patch(mut self, pc_offset: usize, constant: Constant) -> Self {
        self.data_patches.push(DataPatch {
            pc_offset,
            constant,
        });
        self
    }

    pub fn with_site(mut self, site: Site) -> Self {
        self.sites.push(site);
        self
    }

    pub fn with_exception_handler(mut self, handler: ExceptionHandler) -> Self {
        self.exception_handlers.push(handler);
        self
    }

    pub fn with_callee_save(mut self, csl: CalleeSaveLayout, restore_epilogue_offset: usize) -> Self {
        self.callee_save_layout = Some(csl);
        self.register_restore_epilogue_offset = Some(restore_epilogue_offset);
        self
    }

    pub fn with_lifespan(mut self, lifespan: Lifespan) -> Self {
        self.lifespan = lifespan;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_map_slots() {
        let map = ReferenceMap::new().with_frame_slot(1).with_frame_slot(70).with_register(3);
        assert!(map.is_frame_slot_set(70));
        assert!(!map.is_frame_slot_set(2));
        assert_eq!(map.frame_slots().collect::<Vec<_>>(), vec![1, 70]);
        assert_eq!(map.registers(), 1 << 3);
        assert!(!map.is_empty());
        assert!(ReferenceMap::new().is_empty());
    }

    #[test]
    fn test_object_constant_identity() {
        let a = ObjectConstant::new(String::from("x"));
        let b = a.clone();
        let c = ObjectConstant::new(String::from("x"));
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
        assert_eq!(a.downcast_ref::<String>().map(String::as_str), Some("x"));
    }

    #[test]
    fn test_scalar_bytes() {
        assert_eq!(Constant::Int(1).scalar_bytes().unwrap().len(), 4);
        assert_eq!(Constant::Double(1.0).scalar_bytes().unwrap().len(), 8);
        assert!(Constant::Object(ObjectConstant::new(0u8)).scalar_bytes().is_none());
    }
}
