//! Error taxonomy (spec §7 "Error handling design").

use crate::types::{Pba, Vba};
use thiserror::Error;

/// Errors that can be returned from request-facing operations.
///
/// [`CbeError::HashMismatch`] and [`CbeError::ProtocolMisuse`] are fatal: once
/// observed, the engine transitions into [`crate::library::EngineState::Poisoned`]
/// and rejects all further client requests.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CbeError {
    /// A block's hash did not match the value recorded in its parent, or a
    /// superblock's checksum did not verify. Fatal.
    #[error("hash mismatch verifying block at {pba}")]
    HashMismatch { pba: Pba },

    /// The backend reported a read or write failure. Translation and
    /// write-back retry once before surfacing this.
    #[error("backend I/O failure at {pba}")]
    BackendIo { pba: Pba },

    /// The free tree could not find enough reusable PBAs to satisfy a write.
    /// Not fatal: the client may retry after retention changes.
    #[error("free tree exhausted: needed {needed}, found {found}")]
    OutOfFreeBlocks { needed: usize, found: usize },

    /// A VBA outside `[0, max_vba]` was submitted. Rejected at submit time,
    /// not a hard failure.
    #[error("vba {vba} out of range (max {max_vba})")]
    OutOfRange { vba: Vba, max_vba: Vba },

    /// A caller violated the module protocol (submitting when not
    /// acceptable, dropping a primitive that does not match the pending
    /// one). Always a programmer bug; fatal.
    #[error("protocol misuse: {0}")]
    ProtocolMisuse(&'static str),

    /// No superblock slot verified during bootstrap.
    #[error("no valid superblock slot found")]
    NoValidSuperblock,

    /// A client request was submitted for a VBA that already has a primitive
    /// in flight (spec invariant 6).
    #[error("vba {0} already has a request in flight")]
    VbaBusy(Vba),

    /// `execute` was asked to do work while the engine is poisoned.
    #[error("engine is poisoned after a fatal error")]
    Poisoned,
}

pub type CbeResult<T> = Result<T, CbeError>;
