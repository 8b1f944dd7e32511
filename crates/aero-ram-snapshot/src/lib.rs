//! Incremental guest RAM snapshots.
//!
//! A save file is a stream of page payloads followed by an index describing every page of every
//! block. Full saves store each nonzero page; incremental saves additionally skip pages that
//! match a base image and record only their hash.

mod block;
mod compress;
mod diff;
mod error;
mod format;
mod host;
mod io;
mod loader;
mod saver;
mod writer;

pub use crate::block::{RamBlock, RamBlockFlags, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
pub use crate::compress::PageCompressor;
pub use crate::diff::{hash_page, is_zeroed, PageClass, PageDiffer, PageHash, PriorPage};
pub use crate::error::{RamSnapshotError, Result};
pub use crate::format::{
    IndexFlags, PageFlag, PageRecord, SavedBlock, HEADER_LEN, INDEX_CHECKSUM_LEN, MAX_INDEX_LEN,
    RAM_INDEX_VERSION_V1, RAM_INDEX_VERSION_V2, RAM_INDEX_VERSION_V3,
};
pub use crate::host::{
    HostSystem, MemBackend, MemHostSystem, OsHostSystem, SnapshotBackend, StdFileBackend,
};
pub use crate::loader::{list_saves, save_file_status, LoadOptions, RamLoader, SaveFileStatus};
pub use crate::saver::{
    DiffBase, RamSaver, SaveFlags, SaveOptions, SaveStats, DEFAULT_BATCH_PAGES, MAX_BATCH_BYTES,
    MAX_BATCH_PAGES,
};
