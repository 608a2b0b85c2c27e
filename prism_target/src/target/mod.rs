//! Target methods and everything recorded alongside their code.
//!
//! - `method`: the [`TargetMethod`] record and its two installation paths
//! - `bundle`, `literals`: co-located storage for code and literals
//! - `safepoints`: packed stop tables
//! - `call_target`: entry points, runtime routines and direct callees
//! - `codegen_result`: what a compiler hands back
//! - `adapter`, `stub`: the two kinds of non-compiled code
//! - `frame`: stack walking, reference maps and exception dispatch

pub mod adapter;
pub mod bundle;
pub mod call_target;
pub mod codegen_result;
pub mod frame;
pub mod literals;
pub mod method;
pub mod safepoints;
pub mod stub;

pub use adapter::{AdapterGenerator, AdapterInfo, AdapterType};
pub use bundle::{ArrayField, BundleLayout};
pub use call_target::{CallEntryPoint, Callee, RuntimeRoutine};
pub use codegen_result::{
    CallSite, CallTarget, CodegenResult, Constant, DataPatch, ExceptionHandler, Lifespan, ObjectConstant,
    ReferenceMap, Site,
};
pub use frame::{CatchOutcome, Cursor, FrameLayout, ReferenceMapPreparer, StackFrameWalker};
pub use method::{InvalidationMarker, RawTarget, TargetKind, TargetMethod};
pub use safepoints::Safepoints;
pub use stub::{StubInfo, StubType};
