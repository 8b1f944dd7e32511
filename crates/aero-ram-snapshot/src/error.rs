use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RamSnapshotError>;

#[derive(Debug, Error)]
pub enum RamSnapshotError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("out of memory allocating {len} bytes")]
    OutOfMemory { len: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// The header still carries the in-flight placeholder: the save never finished.
    #[error("incomplete RAM save (index offset was never written)")]
    IncompleteSave,

    #[error("unsupported RAM index version {0}")]
    UnsupportedVersion(u32),

    #[error("RAM index checksum mismatch")]
    IndexChecksumMismatch,

    #[error("corrupt RAM save: {0}")]
    Corrupt(&'static str),

    #[error("corrupt page {page} of block {block:?} at file offset {offset}: {reason}")]
    CorruptPage {
        block: String,
        page: u32,
        offset: u64,
        reason: &'static str,
    },

    #[error("unexpected end of file in block {block:?} at file offset {offset}")]
    UnexpectedEof { block: String, offset: u64 },

    #[error("RAM index at offset {index_offset} lies beyond the end of the file ({file_len} bytes)")]
    TruncatedIndex { index_offset: u64, file_len: u64 },

    /// The index exceeds what a loader accepts.
    #[error("RAM index is {len} bytes, more than the {max} bytes a loader accepts")]
    IndexTooLarge { len: u64, max: u64 },

    #[error("RAM block {0:?} not found in save")]
    BlockNotFound(String),

    #[error("RAM block {block:?} size mismatch (expected {expected} bytes, found {found} bytes)")]
    BlockSizeMismatch {
        block: String,
        expected: u64,
        found: u64,
    },

    #[error("RAM block {block:?} page size mismatch (expected {expected}, found {found})")]
    PageSizeMismatch {
        block: String,
        expected: u32,
        found: u32,
    },

    /// An unchanged page of an incremental save does not match the base content it relies on.
    #[error("page {page} of block {block:?} does not match the base image")]
    BaseMismatch { block: String, page: u32 },

    #[error("utf-8 decoding failed: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("page writer stopped: {0}")]
    WriterFailed(String),
}

impl RamSnapshotError {
    /// Whether the save stream ended before the data it promised.
    pub fn is_eof(&self) -> bool {
        match self {
            RamSnapshotError::UnexpectedEof { .. } | RamSnapshotError::TruncatedIndex { .. } => {
                true
            }
            RamSnapshotError::Io(err) => err.kind() == io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }

    /// Whether the error describes a damaged or unusable save file, as opposed to a host I/O
    /// failure or a caller mistake. Callers typically fall back to a cold boot on these.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            RamSnapshotError::IncompleteSave
                | RamSnapshotError::UnsupportedVersion(_)
                | RamSnapshotError::IndexChecksumMismatch
                | RamSnapshotError::Corrupt(_)
                | RamSnapshotError::CorruptPage { .. }
                | RamSnapshotError::UnexpectedEof { .. }
                | RamSnapshotError::TruncatedIndex { .. }
                | RamSnapshotError::IndexTooLarge { .. }
                | RamSnapshotError::BaseMismatch { .. }
                | RamSnapshotError::Utf8(_)
        )
    }
}
