//! Error primitives shared across the Warden crates.
//!
//! Typed, matchable errors are defined with `snafu` close to where they are produced. Anything that only needs to be
//! propagated and reported, such as the reason a worker crashed, travels as a [`GenericError`].
#![deny(warnings)]
#![deny(missing_docs)]

use std::fmt::Display;

/// An opaque, type-erased error.
pub type GenericError = anyhow::Error;

/// Constructs a [`GenericError`].
///
/// Accepts a string literal, a format string with arguments (in the same shape as `std::format!`), or any value that
/// implements `Debug` and `Display`. When given a value implementing `std::error::Error`, its source chain is kept.
#[macro_export]
macro_rules! generic_error {
    ($msg:literal $(,)?) => { $crate::_anyhow!($msg) };
    ($err:expr $(,)?) => { $crate::_anyhow!($err) };
    ($fmt:expr, $($arg:tt)*) => { $crate::_anyhow!($fmt, $($arg)*) };
}

#[doc(hidden)]
pub use anyhow::anyhow as _anyhow;

mod private {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> {}
}

/// Extension methods for attaching context to fallible results.
///
/// `anyhow::Context` is wrapped rather than re-exported so that it does not collide with `snafu::ResultExt` when both
/// are in scope.
pub trait ErrorContext<T, E>: private::Sealed {
    /// Wraps the error value with additional context.
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static;

    /// Wraps the error value with additional context, evaluated only if an error occurred.
    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ErrorContext<T, E> for Result<T, E>
where
    Result<T, E>: anyhow::Context<T, E>,
{
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
    {
        <Self as anyhow::Context<T, E>>::context(self, context)
    }

    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        <Self as anyhow::Context<T, E>>::with_context(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_error_formats_arguments() {
        let child_id = "echo";
        let err = generic_error!("worker '{}' crashed", child_id);
        assert_eq!(err.to_string(), "worker 'echo' crashed");
    }

    #[test]
    fn error_context_keeps_source() {
        let result: Result<(), std::io::Error> = Err(std::io::Error::other("socket closed"));
        let err = result.error_context("failed to initialize server").unwrap_err();

        assert_eq!(err.to_string(), "failed to initialize server");
        assert_eq!(err.root_cause().to_string(), "socket closed");
    }

    #[test]
    fn lazy_context_only_on_error() {
        let result: Result<u32, std::io::Error> = Ok(7);
        let value = result
            .with_error_context(|| -> String { panic!("context must not be evaluated") })
            .unwrap();
        assert_eq!(value, 7);
    }
}
