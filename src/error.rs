//! Error taxonomy for the stream publishing pipeline.
//!
//! Every fallible operation in this crate returns [`Error`], a small
//! `thiserror`-derived enum. Variants mirror the POSIX error codes the
//! library reports across the wire (the transport only understands
//! small negative integers), but callers interact with them as a typed
//! Rust enum rather than raw codes.

use std::fmt;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by context, stream, buffer and sync-bridge operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Backend or context already initialised (EEXIST).
    #[error("already initialised: {0}")]
    AlreadyInitialised(String),

    /// Null handle, unset backend, invalid enum value, or a rule violation
    /// such as enqueuing a buffer whose sync points were never queried (EINVAL).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Pixel format absent from the fourcc table, or an explicit-sync
    /// request against a backend that cannot do explicit sync (ENOTSUP).
    #[error("not supported: {0}")]
    NotSupported(String),

    /// No allocatable modifier exists for the requested format (ENOENT).
    #[error("not present: {0}")]
    NotPresent(String),

    /// A render node could not be resolved (ENODEV).
    #[error("no device: {0}")]
    NoDevice(String),

    /// The transport daemon was unreachable at connect time (ECONNREFUSED).
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// The context's error latch is set, or a sync fence could not be
    /// created/imported (EIO).
    #[error("i/o error: {0}")]
    Io(String),

    /// A one-shot accessor was called twice for the same dequeue (EBUSY).
    #[error("busy: {0}")]
    Busy(String),

    /// Negotiation has not completed yet (EINPROGRESS).
    #[error("in progress: {0}")]
    InProgress(String),

    /// The stream is not active (ESHUTDOWN).
    #[error("shut down: {0}")]
    Shutdown(String),

    /// The buffer was orphaned by renegotiation, or an in-flight
    /// SYNCHRONOUS cycle was aborted (ESTALE).
    #[error("stale: {0}")]
    Stale(String),

    /// The operation would block on a transient non-streaming state;
    /// retry later (EAGAIN).
    #[error("would block: {0}")]
    WouldBlock(String),

    /// The requested sync mode is incompatible with the backend (EOPNOTSUPP).
    #[error("operation not supported: {0}")]
    Unsupported(String),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub(crate) fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported(msg.into())
    }

    pub(crate) fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    pub(crate) fn busy(msg: impl Into<String>) -> Self {
        Self::Busy(msg.into())
    }

    /// Classifies this error for retry/abort decision making, mirroring the
    /// `classify_error` helper already used for portal-facing errors.
    pub fn classify(&self) -> ErrorClass {
        match self {
            Error::WouldBlock(_) | Error::InProgress(_) => ErrorClass::Retryable,
            Error::Busy(_) => ErrorClass::RetryableAfterDelay,
            Error::Stale(_) => ErrorClass::Stale,
            Error::Shutdown(_) | Error::Io(_) => ErrorClass::Fatal,
            Error::AlreadyInitialised(_)
            | Error::InvalidArgument(_)
            | Error::NotSupported(_)
            | Error::NotPresent(_)
            | Error::NoDevice(_)
            | Error::ConnectionRefused(_)
            | Error::Unsupported(_) => ErrorClass::Permanent,
        }
    }

    /// The POSIX-style negative error code this variant corresponds to.
    pub fn errno(&self) -> i32 {
        match self {
            Error::AlreadyInitialised(_) => -libc::EEXIST,
            Error::InvalidArgument(_) => -libc::EINVAL,
            Error::NotSupported(_) => -libc::ENOTSUP,
            Error::NotPresent(_) => -libc::ENOENT,
            Error::NoDevice(_) => -libc::ENODEV,
            Error::ConnectionRefused(_) => -libc::ECONNREFUSED,
            Error::Io(_) => -libc::EIO,
            Error::Busy(_) => -libc::EBUSY,
            Error::InProgress(_) => -libc::EINPROGRESS,
            Error::Shutdown(_) => -libc::ESHUTDOWN,
            Error::Stale(_) => -libc::ESTALE,
            Error::WouldBlock(_) => -libc::EAGAIN,
            Error::Unsupported(_) => -libc::EOPNOTSUPP,
        }
    }
}

/// Coarse classification of an [`Error`], used by callers that want to
/// retry, back off, or treat the stream as dead without matching on every
/// variant individually.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Safe to retry immediately (e.g. transient non-streaming state).
    Retryable,
    /// Safe to retry, but only after the in-flight operation completes.
    RetryableAfterDelay,
    /// The object the caller held is gone; drop it and re-dequeue.
    Stale,
    /// The context or stream is permanently dead.
    Fatal,
    /// A programmer or configuration error; retrying will not help.
    Permanent,
}

/// Adds short, non-allocating context to a [`Result`], matching the
/// `.context("...")` convention used elsewhere in this codebase for
/// `anyhow`-style error construction, but staying on the typed [`Error`].
pub trait ErrorContext<T> {
    fn context(self, msg: impl fmt::Display) -> Result<T>;
}

impl<T> ErrorContext<T> for Result<T> {
    fn context(self, msg: impl fmt::Display) -> Result<T> {
        self.map_err(|err| match err {
            Error::AlreadyInitialised(inner) => Error::AlreadyInitialised(format!("{msg}: {inner}")),
            Error::InvalidArgument(inner) => Error::InvalidArgument(format!("{msg}: {inner}")),
            Error::NotSupported(inner) => Error::NotSupported(format!("{msg}: {inner}")),
            Error::NotPresent(inner) => Error::NotPresent(format!("{msg}: {inner}")),
            Error::NoDevice(inner) => Error::NoDevice(format!("{msg}: {inner}")),
            Error::ConnectionRefused(inner) => Error::ConnectionRefused(format!("{msg}: {inner}")),
            Error::Io(inner) => Error::Io(format!("{msg}: {inner}")),
            Error::Busy(inner) => Error::Busy(format!("{msg}: {inner}")),
            Error::InProgress(inner) => Error::InProgress(format!("{msg}: {inner}")),
            Error::Shutdown(inner) => Error::Shutdown(format!("{msg}: {inner}")),
            Error::Stale(inner) => Error::Stale(format!("{msg}: {inner}")),
            Error::WouldBlock(inner) => Error::WouldBlock(format!("{msg}: {inner}")),
            Error::Unsupported(inner) => Error::Unsupported(format!("{msg}: {inner}")),
        })
    }
}

/// Classifies an arbitrary error for retry bookkeeping at call sites that
/// only have a boxed or foreign error, mirroring [`Error::classify`].
pub fn classify_error(err: &Error) -> ErrorClass {
    err.classify()
}

/// Simple retry policy for operations whose [`ErrorClass`] is retryable.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff: std::time::Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: std::time::Duration::from_millis(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_matches_taxonomy() {
        assert_eq!(Error::InvalidArgument(String::new()).errno(), -libc::EINVAL);
        assert_eq!(Error::Stale(String::new()).errno(), -libc::ESTALE);
        assert_eq!(Error::Unsupported(String::new()).errno(), -libc::EOPNOTSUPP);
    }

    #[test]
    fn classify_groups_transient_errors() {
        assert_eq!(Error::WouldBlock(String::new()).classify(), ErrorClass::Retryable);
        assert_eq!(Error::Shutdown(String::new()).classify(), ErrorClass::Fatal);
        assert_eq!(Error::NotSupported(String::new()).classify(), ErrorClass::Permanent);
    }

    #[test]
    fn context_prefixes_message() {
        let result: Result<()> = Err(Error::invalid("bad width"));
        let with_ctx = result.context("set_size");
        assert_eq!(with_ctx.unwrap_err().to_string(), "invalid argument: set_size: bad width");
    }
}
