//! The baseline/optimized pair of a method's current code.

use std::sync::Arc;

use crate::target::TargetMethod;

use super::Nature;

/// Flags for [`Compilations::current_method`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CurrentFlags {
    /// The caller needs code whose frames the interpreter and deoptimizer
    /// understand: always the baseline version.
    pub interpreter_compatible: bool,
}

impl CurrentFlags {
    pub const DEFAULT: CurrentFlags = CurrentFlags {
        interpreter_compatible: false,
    };

    pub const INTERPRETER_COMPATIBLE: CurrentFlags = CurrentFlags {
        interpreter_compatible: true,
    };
}

/// Latest baseline and optimized code of a method.
#[derive(Debug, Clone, Default)]
pub struct Compilations {
    pub baseline: Option<Arc<TargetMethod>>,
    pub optimized: Option<Arc<TargetMethod>>,
}

impl Compilations {
    /// A copy with `tm` in the slot matching its own nature.
    pub fn with(&self, tm: Arc<TargetMethod>) -> Compilations {
        match tm.nature() {
            Some(Nature::Baseline) => Compilations {
                baseline: Some(tm),
                optimized: self.optimized.clone(),
            },
            Some(Nature::Opt) => Compilations {
                baseline: self.baseline.clone(),
                optimized: Some(tm),
            },
            None => crate::fatal!("{} has no nature", tm.name()),
        }
    }

    /// Code to call: optimized unless it is missing or invalidated.
    pub fn current_method(&self, flags: CurrentFlags) -> Option<Arc<TargetMethod>> {
        if flags.interpreter_compatible {
            return self.baseline.clone();
        }
        match &self.optimized {
            Some(opt) if !opt.is_invalidated() => Some(Arc::clone(opt)),
            _ => self.baseline.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.baseline.is_none() && self.optimized.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::CodegenResult;
    use crate::target::method::InvalidationMarker;
    use crate::test_support::{runtime, unique_method};

    #[test]
    fn test_slot_selected_by_result_nature() {
        let rt = runtime();
        let m = unique_method("pair");
        let base = TargetMethod::install_codegen(&rt, &m, CodegenResult::new(vec![0xC3], Nature::Baseline)).unwrap();
        let opt = TargetMethod::install_codegen(&rt, &m, CodegenResult::new(vec![0xC3], Nature::Opt)).unwrap();

        let pair = Compilations::default().with(Arc::clone(&base));
        assert!(pair.optimized.is_none());
        assert!(Arc::ptr_eq(&pair.current_method(CurrentFlags::DEFAULT).unwrap(), &base));

        let pair = pair.with(Arc::clone(&opt));
        assert!(Arc::ptr_eq(&pair.current_method(CurrentFlags::DEFAULT).unwrap(), &opt));
        assert!(Arc::ptr_eq(
            &pair.current_method(CurrentFlags::INTERPRETER_COMPATIBLE).unwrap(),
            &base
        ));

        opt.invalidate(InvalidationMarker::new("deopt"));
        assert!(Arc::ptr_eq(&pair.current_method(CurrentFlags::DEFAULT).unwrap(), &base));
    }
}
