//! # Error Taxonomy
//!
//! Every fallible operation in this crate returns `eyre::Result`, and every
//! failure carries one of the [`ErrorKind`] values below at the root of its
//! report chain. Intermediate layers add `wrap_err` context frames on the
//! way up, so a failed operation yields both a machine-checkable kind and a
//! human-readable trace of how it propagated.
//!
//! Callers that only care about *what* went wrong (out of space vs.
//! corruption vs. caller bug) use [`ErrorKind::of`] to recover the kind
//! from any report produced by this crate.

use thiserror::Error;

/// The failure classes surfaced by the page store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    /// A caller-supplied value is out of range (page number past the end of
    /// the file, empty path, zero-sized search).
    #[error("invalid argument")]
    InvalidArgument,

    /// The operation is not valid for the current state (modifying inside a
    /// read transaction, freeing an overflow continuation page, double
    /// free).
    #[error("invalid state")]
    InvalidState,

    /// Path resolution failed.
    #[error("not found")]
    NotFound,

    /// The data file path resolves to something that is not a regular file.
    #[error("not a file")]
    NotAFile,

    /// No free run of the requested size exists, or the filesystem is full.
    #[error("out of space")]
    NoSpace,

    /// The underlying filesystem reported an error.
    #[error("i/o failure")]
    Io,

    /// The on-disk state is inconsistent with this build (bad magic,
    /// version or geometry mismatch, bitmap/metadata disagreement).
    #[error("corrupted page file")]
    Corruption,
}

impl ErrorKind {
    /// Recovers the `ErrorKind` carried by a report raised in this crate.
    pub fn of(report: &eyre::Report) -> Option<ErrorKind> {
        report.downcast_ref::<ErrorKind>().copied()
    }
}

/// Wraps an `std::io::Error` into a report with the matching [`ErrorKind`].
pub(crate) fn io_error(err: std::io::Error) -> eyre::Report {
    let kind = match err.kind() {
        std::io::ErrorKind::NotFound => ErrorKind::NotFound,
        std::io::ErrorKind::IsADirectory => ErrorKind::NotAFile,
        std::io::ErrorKind::StorageFull => ErrorKind::NoSpace,
        _ => ErrorKind::Io,
    };
    eyre::Report::new(err).wrap_err(kind)
}
