//! Virtual and interface dispatch tables.
//!
//! A [`Hub`] is the dispatch-relevant part of a type: one vtable and one
//! itable, each slot holding the member method and the code address calls
//! through that slot currently reach. Slots start out pointing at the
//! dynamic trampoline for their index and are overwritten with the resolved
//! entry point on first use.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::TargetError;
use crate::method::MethodRef;
use crate::runtime::TargetRuntime;
use crate::target::CallEntryPoint;

/// Which table of a hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchTable {
    Vtable,
    Itable,
}

impl DispatchTable {
    fn first_valid_index(self, rt: &TargetRuntime) -> usize {
        match self {
            DispatchTable::Vtable => rt.config().first_valid_vtable_index,
            DispatchTable::Itable => rt.config().first_valid_itable_index,
        }
    }
}

impl fmt::Display for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchTable::Vtable => f.write_str("vtable"),
            DispatchTable::Itable => f.write_str("itable"),
        }
    }
}

/// One table slot.
#[derive(Debug)]
pub struct DispatchEntry {
    method: Option<MethodRef>,
    address: AtomicUsize,
}

impl DispatchEntry {
    #[inline]
    pub fn method(&self) -> Option<&MethodRef> {
        self.method.as_ref()
    }

    #[inline]
    pub fn address(&self) -> usize {
        self.address.load(Ordering::Acquire)
    }
}

/// Dispatch tables of one type.
pub struct Hub {
    name: String,
    vtable: Box<[DispatchEntry]>,
    itable: Box<[DispatchEntry]>,
}

impl Hub {
    /// Build a hub whose slots all reach their dynamic trampolines.
    ///
    /// Slots below the first valid index overlap the hub header; their
    /// members are ignored.
    pub fn new(
        rt: &TargetRuntime,
        name: impl Into<String>,
        vtable: Vec<Option<MethodRef>>,
        itable: Vec<Option<MethodRef>>,
    ) -> Result<Self, TargetError> {
        let vtable = Self::build_table(rt, DispatchTable::Vtable, vtable)?;
        let itable = Self::build_table(rt, DispatchTable::Itable, itable)?;
        Ok(Self {
            name: name.into(),
            vtable,
            itable,
        })
    }

    fn build_table(
        rt: &TargetRuntime,
        table: DispatchTable,
        members: Vec<Option<MethodRef>>,
    ) -> Result<Box<[DispatchEntry]>, TargetError> {
        let first_valid = table.first_valid_index(rt);
        members
            .into_iter()
            .enumerate()
            .map(|(index, method)| {
                let trampoline = match table {
                    DispatchTable::Vtable => rt.stubs().virtual_trampoline(rt, index)?,
                    DispatchTable::Itable => rt.stubs().interface_trampoline(rt, index)?,
                };
                Ok(DispatchEntry {
                    method: if index < first_valid { None } else { method },
                    address: AtomicUsize::new(trampoline.get_entry_point(CallEntryPoint::Vtable)),
                })
            })
            .collect()
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn table(&self, table: DispatchTable) -> &[DispatchEntry] {
        match table {
            DispatchTable::Vtable => &self.vtable,
            DispatchTable::Itable => &self.itable,
        }
    }

    pub fn len(&self, table: DispatchTable) -> usize {
        self.table(table).len()
    }

    pub fn entry(&self, table: DispatchTable, index: usize) -> Option<&DispatchEntry> {
        self.table(table).get(index)
    }

    /// Member at `index`, failing for header slots, holes and indexes past
    /// the end.
    pub fn member(&self, rt: &TargetRuntime, table: DispatchTable, index: usize) -> Result<&MethodRef, TargetError> {
        let incompatible = || TargetError::IncompatibleClassChange {
            hub: self.name.clone(),
            index,
        };
        if index < table.first_valid_index(rt) {
            return Err(incompatible());
        }
        self.entry(table, index)
            .and_then(DispatchEntry::method)
            .ok_or_else(incompatible)
    }

    /// Cache a resolved entry point in slot `index`.
    pub fn set_entry(&self, table: DispatchTable, index: usize, address: usize) {
        match self.entry(table, index) {
            Some(entry) => entry.address.store(address, Ordering::Release),
            None => crate::fatal!("{}: {table} index {index} out of range", self.name),
        }
    }

    /// Overwrite every slot of both tables reaching `old` with `new`.
    /// Returns the number of slots changed.
    pub fn replace_entry(&self, old: usize, new: usize) -> usize {
        self.vtable
            .iter()
            .chain(self.itable.iter())
            .filter(|entry| {
                entry
                    .address
                    .compare_exchange(old, new, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            })
            .count()
    }
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("name", &self.name)
            .field("vtable", &self.vtable.len())
            .field("itable", &self.itable.len())
            .finish()
    }
}
