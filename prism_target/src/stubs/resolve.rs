//! Runtime routines behind the trampolines.
//!
//! The dynamic trampolines call [`resolve_virtual_call`] or
//! [`resolve_interface_call`] and tail-call the address they return. The
//! static trampoline calls [`patch_static_trampoline_call_site`] and then
//! re-executes the call it just patched.

use std::sync::Arc;

use crate::compile::CompileContext;
use crate::dispatch::{DispatchTable, Hub};
use crate::error::TargetError;
use crate::method::MethodRef;
use crate::runtime::TargetRuntime;
use crate::target::{CallEntryPoint, Callee, TargetMethod};

/// Compile attempts before code invalidated as fast as it is produced is
/// treated as a livelock.
const MAX_RESOLVE_ATTEMPTS: usize = 8;

/// Translate a vtable entry into the entry `caller`'s convention uses.
#[inline]
pub fn adjust_entry_point_for_caller(vtable_entry: usize, caller: &TargetMethod) -> usize {
    vtable_entry + caller.call_entry_point().offset() - CallEntryPoint::Vtable.offset()
}

/// Resolve the vtable slot `index` of `hub` for a call returning to
/// `return_address`.
pub fn resolve_virtual_call(
    rt: &TargetRuntime,
    hub: &Hub,
    index: usize,
    return_address: usize,
    ctx: &mut CompileContext,
) -> Result<usize, TargetError> {
    resolve(rt, hub, DispatchTable::Vtable, index, return_address, ctx)
}

/// Resolve the itable slot `index` of `hub` for a call returning to
/// `return_address`.
pub fn resolve_interface_call(
    rt: &TargetRuntime,
    hub: &Hub,
    index: usize,
    return_address: usize,
    ctx: &mut CompileContext,
) -> Result<usize, TargetError> {
    resolve(rt, hub, DispatchTable::Itable, index, return_address, ctx)
}

fn resolve(
    rt: &TargetRuntime,
    hub: &Hub,
    table: DispatchTable,
    index: usize,
    return_address: usize,
    ctx: &mut CompileContext,
) -> Result<usize, TargetError> {
    let method = hub.member(rt, table, index)?;
    if method.is_abstract() {
        return Err(TargetError::AbstractMethod {
            method: method.qualified_name(),
        });
    }
    let tm = valid_code(rt, method, ctx)?;
    let vtable_entry = tm.get_entry_point(CallEntryPoint::Vtable);
    hub.set_entry(table, index, vtable_entry);

    let entry = match rt.code_cache().find_by_ip(return_address) {
        Some(caller) => adjust_entry_point_for_caller(vtable_entry, &caller),
        None => vtable_entry,
    };
    tracing::trace!(
        hub = hub.name(),
        %table,
        index,
        method = %method.qualified_name(),
        entry,
        "resolved dispatch"
    );
    Ok(entry)
}

/// Current code of `method`, compiling until a version that is not
/// invalidated is available.
fn valid_code(
    rt: &TargetRuntime,
    method: &MethodRef,
    ctx: &mut CompileContext,
) -> Result<Arc<TargetMethod>, TargetError> {
    for _ in 0..MAX_RESOLVE_ATTEMPTS {
        let tm = rt.broker().compiled_code(rt, method, ctx)?;
        if !tm.is_invalidated() {
            return Ok(tm);
        }
    }
    crate::fatal!(
        "{}: code invalidated {MAX_RESOLVE_ATTEMPTS} times during resolution",
        method.qualified_name()
    )
}

/// Link the direct call at `call_site` to its callee's current code.
///
/// Returns the entry point the call now reaches.
pub fn patch_static_trampoline_call_site(
    rt: &TargetRuntime,
    call_site: usize,
    ctx: &mut CompileContext,
) -> Result<usize, TargetError> {
    let Some(caller) = rt.code_cache().find_by_ip(call_site) else {
        crate::fatal!("static trampoline called from unknown code at {call_site:#x}")
    };
    let callee = match caller.call_site_to_callee(call_site) {
        Callee::Method(method) => Arc::clone(method),
        other => crate::fatal!(
            "{}: call at {call_site:#x} reaches the static trampoline but targets {}",
            caller.name(),
            callee_name(other)
        ),
    };
    let tm = valid_code(rt, &callee, ctx)?;
    let entry = tm.get_entry_point(caller.call_entry_point());
    let Some(pos) = caller.pos_for(call_site) else {
        crate::fatal!("{}: {call_site:#x} outside code", caller.name())
    };
    caller.patch_call_site(pos, entry);
    tracing::trace!(
        caller = caller.name(),
        callee = %callee.qualified_name(),
        entry,
        "linked static call"
    );
    Ok(entry)
}

fn callee_name(callee: &Callee) -> String {
    match callee {
        Callee::Method(method) => method.qualified_name(),
        Callee::Adapter(adapter) => adapter.name().to_string(),
        Callee::Routine(routine) => routine.name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::Amd64Assembler;
    use crate::compile::Nature;
    use crate::kind::Kind;
    use crate::method::{MethodActor, Signature};
    use crate::target::method::InvalidationMarker;
    use crate::target::{CallSite, CallTarget, CodegenResult, Site};
    use crate::test_support::{runtime, unique_method};

    fn hub_with(rt: &TargetRuntime, method: MethodRef) -> Hub {
        let mut vtable = vec![None; rt.config().first_valid_vtable_index];
        vtable.push(Some(Arc::clone(&method)));
        let mut itable = vec![None; rt.config().first_valid_itable_index];
        itable.push(Some(method));
        Hub::new(rt, "Receiver", vtable, itable).unwrap()
    }

    fn caller_with_call(rt: &TargetRuntime, callee: &MethodRef, nature: Nature) -> (Arc<TargetMethod>, usize) {
        let mut asm = Amd64Assembler::new();
        asm.nops(8);
        asm.align_patchable_call();
        let call = asm.call();
        asm.ret();
        let result = CodegenResult::new(asm.finish(), nature).with_site(Site::Call(CallSite {
            pc_offset: call,
            size: 5,
            target: CallTarget::Method(Arc::clone(callee)),
            direct: true,
            reference_map: None,
        }));
        let tm = TargetMethod::install_codegen(rt, &unique_method("caller"), result).unwrap();
        (tm, call)
    }

    #[test]
    fn test_resolve_virtual_caches_entry() {
        let rt = runtime();
        let m = unique_method("virtual");
        let hub = hub_with(&rt, Arc::clone(&m));
        let index = rt.config().first_valid_vtable_index;

        let entry = resolve_virtual_call(&rt, &hub, index, 0, &mut CompileContext::new()).unwrap();
        let tm = m.current_target_method().unwrap();
        assert_eq!(entry, tm.get_entry_point(CallEntryPoint::Vtable));
        assert_eq!(hub.entry(DispatchTable::Vtable, index).unwrap().address(), entry);
    }

    #[test]
    fn test_resolve_adjusts_for_baseline_caller() {
        let rt = runtime();
        let m = unique_method("adjusted");
        let hub = hub_with(&rt, Arc::clone(&m));
        let (caller, call) = caller_with_call(&rt, &unique_method("other"), Nature::Baseline);
        let index = rt.config().first_valid_itable_index;

        let ra = caller.code_at(call + 5);
        let entry = resolve_interface_call(&rt, &hub, index, ra, &mut CompileContext::new()).unwrap();
        let tm = m.current_target_method().unwrap();
        assert_eq!(entry, tm.get_entry_point(CallEntryPoint::Baseline));
        assert_eq!(
            hub.entry(DispatchTable::Itable, index).unwrap().address(),
            tm.get_entry_point(CallEntryPoint::Vtable)
        );
    }

    #[test]
    fn test_resolve_abstract_member() {
        let rt = runtime();
        let m = MethodActor::builder("Shape", "area", Signature::new([], Kind::Double))
            .abstract_method()
            .build();
        let hub = hub_with(&rt, m);
        let index = rt.config().first_valid_vtable_index;
        let err = resolve_virtual_call(&rt, &hub, index, 0, &mut CompileContext::new()).unwrap_err();
        assert!(matches!(err, TargetError::AbstractMethod { method } if method == "Shape.area"));
    }

    #[test]
    fn test_resolve_missing_member() {
        let rt = runtime();
        let hub = hub_with(&rt, unique_method("only"));
        let err = resolve_virtual_call(&rt, &hub, 40, 0, &mut CompileContext::new()).unwrap_err();
        assert!(matches!(err, TargetError::IncompatibleClassChange { index: 40, .. }));
    }

    #[test]
    fn test_resolve_skips_invalidated_code() {
        let rt = runtime();
        let m = unique_method("stale");
        let mut ctx = CompileContext::new();
        let stale = rt.compile(&m, Some(Nature::Baseline), &mut ctx).unwrap();
        stale.invalidate(InvalidationMarker::new("class hierarchy changed"));
        let hub = hub_with(&rt, Arc::clone(&m));
        let index = rt.config().first_valid_vtable_index;

        let entry = resolve_virtual_call(&rt, &hub, index, 0, &mut ctx).unwrap();
        assert_ne!(entry, stale.get_entry_point(CallEntryPoint::Vtable));
    }

    #[test]
    fn test_patch_static_call_site() {
        let rt = runtime();
        let callee = unique_method("static_callee");
        let (caller, call) = caller_with_call(&rt, &callee, Nature::Opt);
        let trampoline = rt.stubs().static_trampoline().unwrap();
        assert_eq!(
            caller.call_target_at(call),
            Some(trampoline.get_entry_point(CallEntryPoint::Optimized))
        );

        let entry = patch_static_trampoline_call_site(&rt, caller.code_at(call), &mut CompileContext::new()).unwrap();
        let tm = callee.current_target_method().unwrap();
        assert_eq!(entry, tm.get_entry_point(CallEntryPoint::Optimized));
        assert_eq!(caller.call_target_at(call), Some(entry));
    }

    #[test]
    #[should_panic(expected = "unknown code")]
    fn test_patch_static_call_site_from_unknown_code() {
        let rt = runtime();
        let _ = patch_static_trampoline_call_site(&rt, 0x10, &mut CompileContext::new());
    }
}
