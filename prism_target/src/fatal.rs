//! Fatal VM errors.
//!
//! Invariant violations inside the compiled-code machinery (corrupt metadata,
//! recursive compilation, patching a non-patchable site) are not recoverable.
//! They are logged and then raised as a panic; embedders build with
//! `panic = "abort"` to turn them into process termination.

/// Log `message` and terminate the current thread of control.
#[cold]
#[track_caller]
pub fn fatal(message: impl AsRef<str>) -> ! {
    let message = message.as_ref();
    let location = std::panic::Location::caller();
    tracing::error!(%location, "fatal: {message}");
    panic!("fatal: {message}");
}

/// `format!`-style front end for [`fatal`].
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::fatal::fatal(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    #[test]
    #[should_panic(expected = "fatal: broken invariant 7")]
    fn test_fatal_macro_panics_with_message() {
        crate::fatal!("broken invariant {}", 7);
    }
}
