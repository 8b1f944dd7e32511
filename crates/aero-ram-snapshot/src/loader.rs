use std::path::{Path, PathBuf};

use crate::block::RamBlock;
use crate::compress::PageCompressor;
use crate::diff::hash_page;
use crate::error::{RamSnapshotError, Result};
use crate::format::{
    check_index_len, decode_header, IndexFlags, PageFlag, PageRecord, SaveIndex, SavedBlock,
    HEADER_LEN, MAX_INDEX_LEN,
};
use crate::host::{HostSystem, SnapshotBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    /// Check every page against the hash recorded in the index.
    pub verify_hashes: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            verify_hashes: true,
        }
    }
}

/// Reads blocks back out of a completed RAM save.
///
/// The index is read and validated when the loader is opened; page payloads are read per block
/// on demand.
pub struct RamLoader<B> {
    backend: B,
    index: SaveIndex,
    index_offset: u64,
    disk_size: u64,
    options: LoadOptions,
    scratch: Vec<u8>,
}

impl<B: SnapshotBackend> RamLoader<B> {
    pub fn open<H>(host: &H, path: impl AsRef<Path>, options: LoadOptions) -> Result<Self>
    where
        H: HostSystem<Backend = B>,
    {
        let path = path.as_ref();
        let loader = host
            .open_file(path)
            .and_then(|backend| Self::from_backend(backend, options))
            .map_err(|err| {
                tracing::warn!(path = %path.display(), error = %err, "rejected RAM save");
                err
            })?;
        tracing::debug!(
            path = %path.display(),
            version = loader.version(),
            blocks = loader.index.blocks.len(),
            disk_size = loader.disk_size,
            "opened RAM save"
        );
        Ok(loader)
    }

    pub fn from_backend(mut backend: B, options: LoadOptions) -> Result<Self> {
        let disk_size = backend.len()?;
        if disk_size < HEADER_LEN {
            return Err(RamSnapshotError::Corrupt("file shorter than its header"));
        }
        let mut header = [0u8; HEADER_LEN as usize];
        backend.read_at(0, &mut header)?;
        let index_offset = decode_header(&header)?;
        if index_offset == 0 {
            return Err(RamSnapshotError::IncompleteSave);
        }
        if index_offset < HEADER_LEN {
            return Err(RamSnapshotError::Corrupt("index offset inside the header"));
        }
        if index_offset >= disk_size {
            return Err(RamSnapshotError::TruncatedIndex {
                index_offset,
                file_len: disk_size,
            });
        }

        let index_len = disk_size - index_offset;
        // Rejected before allocating.
        check_index_len(index_len, MAX_INDEX_LEN)?;
        let index_len = index_len as usize;
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(index_len)
            .map_err(|_| RamSnapshotError::OutOfMemory { len: index_len })?;
        bytes.resize(index_len, 0);
        backend.read_at(index_offset, &mut bytes)?;
        let index = SaveIndex::decode(&bytes, index_offset)?;

        Ok(Self {
            backend,
            index,
            index_offset,
            disk_size,
            options,
            scratch: Vec::new(),
        })
    }

    pub fn version(&self) -> u32 {
        self.index.version
    }

    pub fn is_compressed(&self) -> bool {
        self.index.flags.contains(IndexFlags::COMPRESSED_PAGES)
    }

    pub fn is_incremental(&self) -> bool {
        self.index.flags.contains(IndexFlags::INCREMENTAL)
    }

    pub fn disk_size(&self) -> u64 {
        self.disk_size
    }

    pub fn index_offset(&self) -> u64 {
        self.index_offset
    }

    pub fn total_pages(&self) -> u64 {
        self.index.total_pages()
    }

    /// Blocks in save order.
    pub fn block_structure(&self) -> &[SavedBlock] {
        &self.index.blocks
    }

    pub fn find_block(&self, name: &str) -> Option<&SavedBlock> {
        self.index.find_block(name)
    }

    pub fn page_records(&self, name: &str) -> Result<&[PageRecord]> {
        self.find_block(name)
            .map(SavedBlock::pages)
            .ok_or_else(|| RamSnapshotError::BlockNotFound(name.to_string()))
    }

    pub(crate) fn into_index(self) -> SaveIndex {
        self.index
    }

    /// Restore one block into `buf`, which must be exactly the block's size.
    ///
    /// Pages recorded as unchanged are left as they are, so for an incremental save `buf` must
    /// already hold the base image. Read-only and user-backed blocks are left untouched.
    pub fn load_block(&mut self, name: &str, buf: &mut [u8]) -> Result<()> {
        let span = tracing::info_span!("ram_load_block", block = name);
        let _enter = span.enter();

        let block_idx = self
            .index
            .blocks
            .iter()
            .position(|b| b.name == name)
            .ok_or_else(|| RamSnapshotError::BlockNotFound(name.to_string()))?;
        let block = &self.index.blocks[block_idx];
        if buf.len() as u64 != block.total_size() {
            return Err(RamSnapshotError::BlockSizeMismatch {
                block: name.to_string(),
                expected: block.total_size(),
                found: buf.len() as u64,
            });
        }
        if !block.has_saved_pages() {
            tracing::debug!("block has no saved pages");
            return Ok(());
        }

        let page_size = block.page_size as usize;
        let verify = self.options.verify_hashes;

        // Pages without payload first, then payloads in file order.
        let mut payload: Vec<u32> = Vec::new();
        for (page_idx, record) in block.pages.iter().enumerate() {
            let page = &mut buf[page_idx * page_size..(page_idx + 1) * page_size];
            match record.flag {
                PageFlag::Zero => page.fill(0),
                PageFlag::Unchanged => {
                    if verify && record.hash.is_some_and(|hash| hash != hash_page(page)) {
                        return Err(RamSnapshotError::BaseMismatch {
                            block: name.to_string(),
                            page: page_idx as u32,
                        });
                    }
                }
                PageFlag::Raw | PageFlag::Compressed => payload.push(page_idx as u32),
            }
        }
        payload.sort_by_key(|&page_idx| block.pages[page_idx as usize].file_pos);

        for &page_idx in &payload {
            let record = block.pages[page_idx as usize];
            let start = page_idx as usize * page_size;
            let page = &mut buf[start..start + page_size];
            let eof = |err: RamSnapshotError| {
                if err.is_eof() {
                    RamSnapshotError::UnexpectedEof {
                        block: name.to_string(),
                        offset: record.file_pos,
                    }
                } else {
                    err
                }
            };
            let corrupt = |reason| RamSnapshotError::CorruptPage {
                block: name.to_string(),
                page: page_idx,
                offset: record.file_pos,
                reason,
            };

            match record.flag {
                PageFlag::Raw => self.backend.read_at(record.file_pos, page).map_err(eof)?,
                _ => {
                    let len = record.size_on_disk as usize;
                    if self.scratch.len() < len {
                        self.scratch.resize(len, 0);
                    }
                    self.backend
                        .read_at(record.file_pos, &mut self.scratch[..len])
                        .map_err(eof)?;
                    PageCompressor::decompress_into(&self.scratch[..len], page)
                        .map_err(corrupt)?;
                }
            }

            if verify {
                if let Some(hash) = record.hash {
                    if hash != hash_page(page) {
                        return Err(corrupt("page hash mismatch"));
                    }
                }
            }
        }

        tracing::trace!(
            pages = block.pages.len(),
            payload_pages = payload.len(),
            "loaded RAM block"
        );
        Ok(())
    }

    /// Restore `block` into `buf`, first checking that the saved layout matches the block as the
    /// caller registered it.
    pub fn restore_block(&mut self, block: &RamBlock, buf: &mut [u8]) -> Result<()> {
        let saved = self
            .find_block(&block.name)
            .ok_or_else(|| RamSnapshotError::BlockNotFound(block.name.clone()))?;
        if saved.page_size != block.page_size {
            return Err(RamSnapshotError::PageSizeMismatch {
                block: block.name.clone(),
                expected: block.page_size,
                found: saved.page_size,
            });
        }
        if saved.total_size() != block.total_size {
            return Err(RamSnapshotError::BlockSizeMismatch {
                block: block.name.clone(),
                expected: block.total_size,
                found: saved.total_size(),
            });
        }
        self.load_block(&block.name, buf)
    }

    /// Restore several blocks. Stops at the first failure.
    pub fn load_all(&mut self, targets: &mut [(&str, &mut [u8])]) -> Result<()> {
        for (name, buf) in targets.iter_mut() {
            self.load_block(name, buf)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveFileStatus {
    Missing,
    /// Present, but the save never finished or the file was cut short.
    Incomplete,
    Complete,
}

/// Classify a save file from its header alone, without reading the index.
pub fn save_file_status<H: HostSystem>(host: &H, path: impl AsRef<Path>) -> Result<SaveFileStatus> {
    let path = path.as_ref();
    let Some(size) = host.path_file_size(path) else {
        return Ok(SaveFileStatus::Missing);
    };
    if size <= HEADER_LEN {
        return Ok(SaveFileStatus::Incomplete);
    }
    let mut backend = host.open_file(path)?;
    let mut header = [0u8; HEADER_LEN as usize];
    backend.read_at(0, &mut header)?;
    let index_offset = decode_header(&header)?;
    if index_offset < HEADER_LEN || index_offset >= size {
        return Ok(SaveFileStatus::Incomplete);
    }
    Ok(SaveFileStatus::Complete)
}

/// Files in `dir` with the given extension, sorted by name.
pub fn list_saves<H: HostSystem>(host: &H, dir: impl AsRef<Path>, extension: &str) -> Vec<PathBuf> {
    let dir = dir.as_ref();
    host.scan_dir_entries(dir)
        .into_iter()
        .map(|name| dir.join(name))
        .filter(|path| path.extension().is_some_and(|ext| ext == extension))
        .filter(|path| host.path_file_size(path).is_some())
        .collect()
}
