//! The compiled-state slot of a method.

use std::fmt;
use std::sync::Arc;

use crate::error::TargetError;
use crate::target::TargetMethod;

use super::Compilation;

/// Everything a method has been compiled to, or the compilation under way.
///
/// `History` lists the newest method first when each install supersedes
/// the previous one.
#[derive(Clone, Default)]
pub enum CompiledState {
    #[default]
    Empty,
    Single(Arc<TargetMethod>),
    History(Vec<Arc<TargetMethod>>),
    /// A compilation is running; it remembers the state it started from.
    InProgress(Arc<Compilation>),
    /// A finished compilation that failed.
    Failed(TargetError),
}

impl CompiledState {
    /// State after adding `new` to `previous`.
    ///
    /// With `supersede` the new method goes first.
    pub fn add_target_method(new: Arc<TargetMethod>, previous: &CompiledState, supersede: bool) -> CompiledState {
        match previous {
            CompiledState::Empty | CompiledState::Failed(_) => CompiledState::Single(new),
            CompiledState::Single(old) => {
                let history = if supersede {
                    vec![new, Arc::clone(old)]
                } else {
                    vec![Arc::clone(old), new]
                };
                CompiledState::History(history)
            }
            CompiledState::History(history) => {
                let mut history = history.clone();
                if supersede {
                    history.insert(0, new);
                } else {
                    history.push(new);
                }
                CompiledState::History(history)
            }
            CompiledState::InProgress(compilation) => {
                CompiledState::add_target_method(new, compilation.previous(), supersede)
            }
        }
    }

    /// The method callers should use.
    ///
    /// An in-progress compilation never hides the last good method.
    pub fn current_method(&self, ignore_invalidated: bool) -> Option<Arc<TargetMethod>> {
        let current = match self {
            CompiledState::Empty | CompiledState::Failed(_) => None,
            CompiledState::Single(tm) => Some(Arc::clone(tm)),
            CompiledState::History(history) => history.first().cloned(),
            CompiledState::InProgress(compilation) => {
                return compilation.previous().current_method(ignore_invalidated);
            }
        };
        current.filter(|tm| !(ignore_invalidated && tm.is_invalidated()))
    }

    /// Every method in the state, newest first for superseding histories.
    pub fn target_methods(&self) -> Vec<Arc<TargetMethod>> {
        match self {
            CompiledState::Empty | CompiledState::Failed(_) => Vec::new(),
            CompiledState::Single(tm) => vec![Arc::clone(tm)],
            CompiledState::History(history) => history.clone(),
            CompiledState::InProgress(compilation) => compilation.previous().target_methods(),
        }
    }

    #[inline]
    pub fn is_in_progress(&self) -> bool {
        matches!(self, CompiledState::InProgress(_))
    }
}

impl PartialEq for CompiledState {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (CompiledState::Empty, CompiledState::Empty) => true,
            (CompiledState::Single(a), CompiledState::Single(b)) => Arc::ptr_eq(a, b),
            (CompiledState::History(a), CompiledState::History(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(a, b)| Arc::ptr_eq(a, b))
            }
            (CompiledState::InProgress(a), CompiledState::InProgress(b)) => Arc::ptr_eq(a, b),
            (CompiledState::Failed(a), CompiledState::Failed(b)) => a.to_string() == b.to_string(),
            _ => false,
        }
    }
}

impl fmt::Debug for CompiledState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompiledState::Empty => f.write_str("Empty"),
            CompiledState::Single(tm) => write!(f, "Single({})", tm.name()),
            CompiledState::History(history) => f
                .debug_tuple("History")
                .field(&history.iter().map(|tm| tm.name()).collect::<Vec<_>>())
                .finish(),
            CompiledState::InProgress(c) => write!(f, "InProgress({})", c.method().qualified_name()),
            CompiledState::Failed(err) => write!(f, "Failed({err})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::method::{InvalidationMarker, RawTarget, TargetKind};
    use crate::test_support::{FakeCompiler, runtime, unique_method};

    fn tm(rt: &crate::TargetRuntime, name: &str) -> Arc<TargetMethod> {
        TargetMethod::install_raw(rt, RawTarget::new(name, TargetKind::Compiled, vec![0xC3])).unwrap()
    }

    #[test]
    fn test_add_to_empty() {
        let rt = runtime();
        let a = tm(&rt, "a");
        assert_eq!(
            CompiledState::add_target_method(Arc::clone(&a), &CompiledState::Empty, false),
            CompiledState::Single(a)
        );
    }

    #[test]
    fn test_add_to_single_orders_by_supersede() {
        let rt = runtime();
        let (a, b) = (tm(&rt, "a"), tm(&rt, "b"));
        let single = CompiledState::Single(Arc::clone(&a));
        assert_eq!(
            CompiledState::add_target_method(Arc::clone(&b), &single, true),
            CompiledState::History(vec![Arc::clone(&b), Arc::clone(&a)])
        );
        assert_eq!(
            CompiledState::add_target_method(Arc::clone(&b), &single, false),
            CompiledState::History(vec![a, b])
        );
    }

    #[test]
    fn test_add_to_history() {
        let rt = runtime();
        let (a, b, c) = (tm(&rt, "a"), tm(&rt, "b"), tm(&rt, "c"));
        let history = CompiledState::History(vec![Arc::clone(&b), Arc::clone(&a)]);
        let state = CompiledState::add_target_method(Arc::clone(&c), &history, true);
        assert_eq!(state.target_methods().len(), 3);
        assert!(Arc::ptr_eq(&state.current_method(false).unwrap(), &c));
        let state = CompiledState::add_target_method(Arc::clone(&c), &history, false);
        assert!(Arc::ptr_eq(&state.current_method(false).unwrap(), &b));
    }

    #[test]
    fn test_current_method_filters_invalidated() {
        let rt = runtime();
        let a = tm(&rt, "a");
        a.invalidate(InvalidationMarker::new("test"));
        let state = CompiledState::Single(Arc::clone(&a));
        assert!(state.current_method(true).is_none());
        assert!(Arc::ptr_eq(&state.current_method(false).unwrap(), &a));
        assert!(CompiledState::Empty.current_method(false).is_none());
    }

    #[test]
    fn test_in_progress_shows_state_it_started_from() {
        let rt = runtime();
        let a = tm(&rt, "a");
        let compilation = Arc::new(Compilation::new(
            unique_method("in_flight"),
            Arc::new(FakeCompiler::opt()),
            None,
            false,
            CompiledState::Single(Arc::clone(&a)),
            std::time::Duration::from_millis(1),
        ));
        let state = CompiledState::InProgress(compilation);
        assert!(state.is_in_progress());
        assert!(Arc::ptr_eq(&state.current_method(false).unwrap(), &a));
        assert_eq!(state.target_methods().len(), 1);

        let b = tm(&rt, "b");
        assert_eq!(
            CompiledState::add_target_method(Arc::clone(&b), &state, true),
            CompiledState::History(vec![b, a])
        );
    }
}
