//! The error type shared by every stage of block map generation and copying.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::checksum::Digest;

#[derive(Debug, Error)]
pub enum Error {
    /// The document could not be parsed or uses an unsupported format version.
    #[error("Malformed bmap document: {0}")]
    MalformedDocument(String),
    /// The document parsed, but its values violate a block map invariant.
    #[error("Inconsistent bmap document: {0}")]
    InconsistentDocument(String),
    #[error("Filesystem cannot report extents for {path:?}")]
    UnsupportedFilesystem {
        path: PathBuf,
        #[source]
        source: Option<io::Error>,
    },
    #[error("Checksum mismatch for range #{index} (blocks {first}-{last}): expected {expected}, got {actual}")]
    ChecksumMismatch {
        index: usize,
        first: u64,
        last: u64,
        expected: Digest,
        actual: Digest,
    },
    #[error("Bmap signature verification failed: {0}")]
    SignatureInvalid(String),
    #[error("Destination holds {capacity} bytes, but the image needs {required}")]
    DestinationTooSmall { capacity: u64, required: u64 },
    #[error("{0}")]
    Io(&'static str, #[source] io::Error),
    #[error("Operation cancelled by user")]
    Cancelled,
}

impl Error {
    /// The process exit code a front-end should report for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Io(..) | Self::DestinationTooSmall { .. } => 1,
            Self::MalformedDocument(_) | Self::InconsistentDocument(_) => 2,
            Self::ChecksumMismatch { .. } => 3,
            Self::SignatureInvalid(_) => 4,
            Self::UnsupportedFilesystem { .. } => 5,
            Self::Cancelled => 130,
        }
    }

    /// Wraps an I/O error, turning the `Interrupted` errors produced by a
    /// cancelled operation into [`Error::Cancelled`].
    pub(crate) fn io(context: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |e| {
            if e.kind() == io::ErrorKind::Interrupted {
                Self::Cancelled
            } else {
                Self::Io(context, e)
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A failed copy, along with how far it got.
///
/// Ranges `0..completed_ranges` were written (and verified, when verification
/// is enabled) before the failure. No range past that point is complete.
#[derive(Debug, Error)]
#[error("{error} ({completed_ranges} of {total_ranges} ranges completed)")]
pub struct CopyError {
    #[source]
    pub error: Error,
    pub completed_ranges: usize,
    pub total_ranges: usize,
}

impl CopyError {
    pub fn exit_code(&self) -> u8 {
        self.error.exit_code()
    }
}

/// Failures before the first range is queued.
impl From<Error> for CopyError {
    fn from(error: Error) -> Self {
        Self {
            error,
            completed_ranges: 0,
            total_ranges: 0,
        }
    }
}
