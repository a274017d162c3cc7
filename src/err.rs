//! Crate-wide error types.
//!
//! Every fallible operation in the crate surfaces one of the [`FsError`]
//! kinds. Leaf modules return the most specific kind they can; mount and
//! unmount treat any error as unrecoverable, while the operational paths
//! (allocate, truncate, link) retry once across a container request before
//! surfacing [`FsError::NoSpace`].

use thiserror::Error;

/// Return type for operations that produce a value.
pub type IoResult<T> = Result<T, FsError>;

/// Return type for operations that are allowed to fail and don't need to
/// return anything.
pub type CanFail = Result<(), FsError>;

#[derive(Debug, Error)]
pub enum FsError {
    /// Directory lookup miss, inode miss.
    #[error("not found")]
    NotFound,

    /// No free inode or block left, even after a container allocation retry.
    #[error("no space left on device")]
    NoSpace,

    /// Duplicate name in a directory.
    #[error("entry already exists")]
    Exists,

    /// Argument misalignment, bad path syntax, bad signature on mount.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),

    /// Short or failed device I/O.
    #[error("device i/o error: {0}")]
    Io(String),

    /// The control plane refused a request, or the channel claim failed.
    #[error("ipc failure: {0}")]
    Ipc(&'static str),

    /// Invariant violation (double-free of a bitmap bit, orphan buffer
    /// reference, mismatched descriptor id).
    #[error("fatal invariant violation: {0}")]
    Fatal(&'static str),
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        FsError::Io(err.to_string())
    }
}
