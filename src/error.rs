//! error.rs — boot pipeline error taxonomy
//!
//! Every stage returns [`BootResult`]; the orchestrator turns the first
//! error into `BootDecision::Abort` and reports its [`ErrorKind`].

use thiserror::Error;

/// Errors produced by the boot-assembly pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BootError {
    /// Bad magic or broken structure (boot header, FDT, DTBO table, gzip).
    #[error("invalid format: {0}")]
    InvalidFormat(&'static str),

    /// Zero, oversized or mutually inconsistent size fields.
    #[error("malformed sizes: {0}")]
    MalformedSizes(&'static str),

    /// A checked arithmetic step would have wrapped.
    #[error("integer overflow: {0}")]
    IntegerOverflow(&'static str),

    #[error("kernel decompression failed: {0}")]
    DecompressFailed(&'static str),

    /// A region exceeds its reserved window or overlaps another region.
    #[error("layout overflow: {0}")]
    LayoutOverflow(&'static str),

    /// The DTB filter pipeline emptied the candidate set.
    #[error("no device tree matches this hardware")]
    NoDeviceTreeMatch,

    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),

    /// Internal consistency check failed; unreachable in a correct build.
    #[error("build inconsistency: {0}")]
    BuildInconsistency(&'static str),

    /// An external collaborator (I/O, verifier, board info ...) failed.
    #[error("collaborator failure: {0}")]
    Collaborator(&'static str),
}

/// Fieldless view of [`BootError`], for routing on the kind alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidFormat,
    MalformedSizes,
    IntegerOverflow,
    DecompressFailed,
    LayoutOverflow,
    NoDeviceTreeMatch,
    OutOfMemory,
    BuildInconsistency,
    Collaborator,
}

impl BootError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BootError::InvalidFormat(_) => ErrorKind::InvalidFormat,
            BootError::MalformedSizes(_) => ErrorKind::MalformedSizes,
            BootError::IntegerOverflow(_) => ErrorKind::IntegerOverflow,
            BootError::DecompressFailed(_) => ErrorKind::DecompressFailed,
            BootError::LayoutOverflow(_) => ErrorKind::LayoutOverflow,
            BootError::NoDeviceTreeMatch => ErrorKind::NoDeviceTreeMatch,
            BootError::OutOfMemory(_) => ErrorKind::OutOfMemory,
            BootError::BuildInconsistency(_) => ErrorKind::BuildInconsistency,
            BootError::Collaborator(_) => ErrorKind::Collaborator,
        }
    }
}

pub type BootResult<T> = Result<T, BootError>;
