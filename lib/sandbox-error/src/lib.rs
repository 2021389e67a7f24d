//! Error primitives shared across the sandbox crates.
//!
//! Library code that needs a precise failure taxonomy defines its own error types. Everything above that, such as the
//! binary's orchestration code, funnels failures into [`GenericError`] and attaches context as it propagates.
#![deny(warnings)]
#![deny(missing_docs)]

use std::fmt::Display;

/// A type-erased error with an attached chain of context.
pub type GenericError = anyhow::Error;

/// Builds a [`GenericError`].
///
/// Accepts a string literal, a format string followed by its arguments, or an existing value implementing `Debug` and
/// `Display`. When the value is itself an `std::error::Error`, its source chain is preserved.
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

    impl<T> Sealed for Option<T> {}
}

/// Extension methods for attaching context to fallible values.
///
/// Implemented for `Result` (when the error can be converted into [`GenericError`]) and for `Option`, where `None` is
/// turned into an error carrying only the given context.
pub trait ErrorContext<T, E>: private::Sealed {
    /// Wraps the error with the given context.
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static;

    /// Wraps the error with context that is only built if an error actually occurred.
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

impl<T> ErrorContext<T, std::convert::Infallible> for Option<T> {
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
    {
        <Self as anyhow::Context<T, std::convert::Infallible>>::context(self, context)
    }

    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        <Self as anyhow::Context<T, std::convert::Infallible>>::with_context(self, f)
    }
}
