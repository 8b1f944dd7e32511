use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::block::{RamBlock, DEFAULT_PAGE_SIZE};
use crate::diff::{hash_page, is_zeroed, PageClass, PageDiffer, PageHash, PriorPage};
use crate::error::{RamSnapshotError, Result};
use crate::format::{
    encode_header, IndexFlags, PageFlag, PageRecord, SaveIndex, SavedBlock, MAX_INDEX_LEN,
    RAM_INDEX_VERSION_V2, RAM_INDEX_VERSION_V3,
};
use crate::host::{HostSystem, SnapshotBackend};
use crate::loader::{LoadOptions, RamLoader};
use crate::writer::{PageJob, PageWriter, WriteQueue};

pub const DEFAULT_BATCH_PAGES: usize = 256;
pub const MAX_BATCH_PAGES: usize = 4096;
/// A batch is handed to the writer once it holds this many bytes of page data, whatever
/// `batch_pages` says. Bounds memory in flight for blocks with large pages.
pub const MAX_BATCH_BYTES: usize = DEFAULT_BATCH_PAGES * DEFAULT_PAGE_SIZE as usize;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SaveFlags: u32 {
        /// LZ4-compress changed pages, storing a page raw when compression does not help.
        const COMPRESS = 1 << 0;
        /// Compress and write on a dedicated worker thread.
        const BACKGROUND = 1 << 1;
    }
}

/// What an incremental save diffs against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffBase {
    /// Byte-compare against the reference buffers passed to
    /// [`RamSaver::register_block_with_reference`].
    Reference,
    /// Compare page hashes against the index of a completed earlier save.
    SavedIndex(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOptions {
    pub flags: SaveFlags,
    /// Changed pages handed to the writer at a time. Batches are also cut at
    /// [`MAX_BATCH_BYTES`].
    pub batch_pages: usize,
    /// `None` for a full save.
    pub base: Option<DiffBase>,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            flags: SaveFlags::COMPRESS | SaveFlags::BACKGROUND,
            batch_pages: DEFAULT_BATCH_PAGES,
            base: None,
        }
    }
}

impl SaveOptions {
    pub fn full(flags: SaveFlags) -> Self {
        Self {
            flags,
            ..Self::default()
        }
    }

    pub fn incremental(flags: SaveFlags, base: DiffBase) -> Self {
        Self {
            flags,
            base: Some(base),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_pages == 0 || self.batch_pages > MAX_BATCH_PAGES {
            return Err(RamSnapshotError::InvalidConfig(
                "batch_pages must be between 1 and 4096",
            ));
        }
        Ok(())
    }
}

/// Counters for one finished save.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SaveStats {
    pub total_pages: u64,
    pub zero_pages: u64,
    /// Zero pages whose base page was not known to be zero.
    pub new_zero_pages: u64,
    pub unchanged_pages: u64,
    /// Unchanged pages that are zero in both the base and the current image.
    pub still_zero_pages: u64,
    /// Unchanged pages detected by hash rather than by comparing bytes.
    pub same_hash_pages: u64,
    pub changed_pages: u64,
    pub raw_pages: u64,
    pub compressed_pages: u64,
    /// Pages of read-only or user-backed blocks.
    pub skipped_pages: u64,
    pub payload_bytes: u64,
    pub index_bytes: u64,
    pub disk_size: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageSlot {
    Pending,
    Zero,
    Unchanged(PageHash),
    Queued,
}

struct SaverBlock<'a> {
    block: RamBlock,
    memory: &'a [u8],
    reference: Option<&'a [u8]>,
    prior: Option<Vec<PriorPage>>,
    slots: Vec<PageSlot>,
}

enum Base {
    Reference,
    SavedIndex(SaveIndex),
}

/// Writes guest RAM blocks to a save file.
///
/// Register every block, submit pages with [`RamSaver::save_page`] (or whole blocks with
/// [`RamSaver::save_block`]), then call [`RamSaver::join`]. `join` consumes the saver, so no page
/// can be submitted afterwards. A saver dropped without `join` leaves an incomplete file that no
/// loader accepts.
///
/// Calls must come from a single producer. The borrowed guest memory must not be mutated while a
/// page of it is being submitted.
pub struct RamSaver<'a, B: SnapshotBackend + 'static> {
    path: PathBuf,
    flags: SaveFlags,
    batch_pages: usize,
    base: Option<Base>,
    blocks: Vec<SaverBlock<'a>>,
    queue: WriteQueue<B>,
    pending: Vec<PageJob>,
    pending_bytes: usize,
    max_index_len: u64,
    stats: SaveStats,
    started: Instant,
}

impl<'a, B: SnapshotBackend + 'static> RamSaver<'a, B> {
    pub fn create<H>(host: &H, path: impl AsRef<Path>, options: SaveOptions) -> Result<Self>
    where
        H: HostSystem<Backend = B>,
    {
        options.validate()?;
        let path = path.as_ref().to_path_buf();

        // Read the base before creating the output: they may be the same file.
        let base = match &options.base {
            None => None,
            Some(DiffBase::Reference) => Some(Base::Reference),
            Some(DiffBase::SavedIndex(base_path)) => {
                let loader = RamLoader::open(host, base_path, LoadOptions::default())?;
                tracing::debug!(
                    base = %base_path.display(),
                    version = loader.version(),
                    "diffing RAM save against saved index"
                );
                Some(Base::SavedIndex(loader.into_index()))
            }
        };

        let mut backend = host.create_file(&path)?;
        // Placeholder for the index offset; patched by join().
        backend.write_at(0, &encode_header(0)?)?;

        let writer = PageWriter::new(backend, options.flags.contains(SaveFlags::COMPRESS));
        let queue = if options.flags.contains(SaveFlags::BACKGROUND) {
            WriteQueue::background(writer)?
        } else {
            WriteQueue::inline(writer)
        };

        Ok(Self {
            path,
            flags: options.flags,
            batch_pages: options.batch_pages,
            base,
            blocks: Vec::new(),
            queue,
            pending: Vec::with_capacity(options.batch_pages),
            pending_bytes: 0,
            max_index_len: MAX_INDEX_LEN,
            stats: SaveStats::default(),
            started: Instant::now(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flags(&self) -> SaveFlags {
        self.flags
    }

    pub fn is_incremental(&self) -> bool {
        self.base.is_some()
    }

    /// Register a block for a full save, or for an incremental save diffing against a saved
    /// index.
    ///
    /// # Panics
    ///
    /// On a duplicate name, a misaligned block, or `memory` not matching the block size.
    pub fn register_block(&mut self, block: RamBlock, memory: &'a [u8]) {
        self.register(block, memory, None);
    }

    /// Register a block together with its content as of the base save. Only valid with
    /// [`DiffBase::Reference`].
    ///
    /// # Panics
    ///
    /// As [`RamSaver::register_block`], and when the saver does not diff against references or
    /// `reference` differs in length from `memory`.
    pub fn register_block_with_reference(
        &mut self,
        block: RamBlock,
        memory: &'a [u8],
        reference: &'a [u8],
    ) {
        assert!(
            matches!(self.base, Some(Base::Reference)),
            "reference buffers require DiffBase::Reference"
        );
        assert_eq!(
            reference.len(),
            memory.len(),
            "reference buffer for RAM block {:?} has the wrong length",
            block.name
        );
        self.register(block, memory, Some(reference));
    }

    fn register(&mut self, block: RamBlock, memory: &'a [u8], reference: Option<&'a [u8]>) {
        block.assert_valid();
        assert_eq!(
            memory.len() as u64,
            block.total_size,
            "memory for RAM block {:?} has the wrong length",
            block.name
        );
        assert!(
            self.blocks.iter().all(|b| b.block.name != block.name),
            "RAM block {:?} registered twice",
            block.name
        );

        let page_count = block.page_count() as usize;
        let prior = match &self.base {
            Some(Base::SavedIndex(index)) => prior_pages(index, &block),
            _ => None,
        };
        tracing::debug!(
            block = %block.name,
            pages = page_count,
            page_size = block.page_size,
            has_base = prior.is_some() || reference.is_some(),
            "registered RAM block"
        );
        self.blocks.push(SaverBlock {
            slots: vec![PageSlot::Pending; page_count],
            block,
            memory,
            reference,
            prior,
        });
    }

    /// Save `length` bytes of `block_name` starting at `offset`. Pages submitted again are
    /// ignored.
    ///
    /// # Panics
    ///
    /// When the block is unknown or the range is not page-aligned and inside the block.
    pub fn save_page(&mut self, block_name: &str, offset: u64, length: u64) -> Result<()> {
        let idx = self.block_index(block_name);
        let block = &self.blocks[idx].block;
        let page_size = u64::from(block.page_size);
        assert!(
            length > 0 && offset % page_size == 0 && length % page_size == 0,
            "save_page({block_name:?}, {offset}, {length}) is not aligned to the {page_size}-byte page size"
        );
        assert!(
            offset
                .checked_add(length)
                .is_some_and(|end| end <= block.total_size),
            "save_page({block_name:?}, {offset}, {length}) runs past the end of the block"
        );
        let first = (offset / page_size) as u32;
        let count = (length / page_size) as u32;
        self.save_range(idx, first, count)
    }

    /// Save every page of a block.
    pub fn save_block(&mut self, block_name: &str) -> Result<()> {
        let idx = self.block_index(block_name);
        let count = self.blocks[idx].slots.len() as u32;
        self.save_range(idx, 0, count)
    }

    fn block_index(&self, block_name: &str) -> usize {
        self.blocks
            .iter()
            .position(|b| b.block.name == block_name)
            .unwrap_or_else(|| panic!("RAM block {block_name:?} was never registered"))
    }

    fn save_range(&mut self, idx: usize, first: u32, count: u32) -> Result<()> {
        let block = &self.blocks[idx];
        if !block.block.has_saved_pages() {
            let pending = block
                .slots
                .iter()
                .skip(first as usize)
                .take(count as usize)
                .filter(|s| **s == PageSlot::Pending)
                .count();
            self.stats.skipped_pages += pending as u64;
            for slot in self.blocks[idx]
                .slots
                .iter_mut()
                .skip(first as usize)
                .take(count as usize)
            {
                *slot = PageSlot::Zero;
            }
            return Ok(());
        }

        let page_size = block.block.page_size as usize;
        let memory = block.memory;
        let reference = block.reference;

        for page_idx in first..first + count {
            let slot_idx = page_idx as usize;
            if self.blocks[idx].slots[slot_idx] != PageSlot::Pending {
                tracing::trace!(block = idx, page = page_idx, "page already saved");
                continue;
            }
            let start = slot_idx * page_size;
            let page = &memory[start..start + page_size];

            let prior = self.blocks[idx].prior.as_ref().map(|p| p[slot_idx]);
            let (class, hash) = match (reference, prior) {
                (Some(reference), _) => {
                    let class =
                        PageDiffer::classify(page, Some(&reference[start..start + page_size]));
                    (class, None)
                }
                (None, Some(prior)) => PageDiffer::classify_hashed(page, prior),
                (None, None) => (PageDiffer::classify(page, None), None),
            };
            let has_base = reference.is_some() || prior.is_some();

            self.stats.total_pages += 1;
            let slot = match class {
                PageClass::Zero => {
                    self.stats.zero_pages += 1;
                    if has_base && prior != Some(PriorPage::Zero) {
                        self.stats.new_zero_pages += 1;
                    }
                    PageSlot::Zero
                }
                PageClass::Unchanged => {
                    self.stats.unchanged_pages += 1;
                    match hash {
                        Some(_) => self.stats.same_hash_pages += 1,
                        None if prior.is_some() || is_zeroed(page) => {
                            self.stats.still_zero_pages += 1
                        }
                        None => {}
                    }
                    PageSlot::Unchanged(hash.unwrap_or_else(|| hash_page(page)))
                }
                PageClass::Changed => {
                    self.stats.changed_pages += 1;
                    self.pending_bytes += page.len();
                    self.pending.push(PageJob {
                        block: idx,
                        page: page_idx,
                        hash: hash.unwrap_or_else(|| hash_page(page)),
                        data: page.to_vec(),
                    });
                    PageSlot::Queued
                }
            };
            self.blocks[idx].slots[slot_idx] = slot;

            if self.pending.len() >= self.batch_pages || self.pending_bytes >= MAX_BATCH_BYTES {
                self.flush_pending()?;
            }
        }
        Ok(())
    }

    fn flush_pending(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::replace(&mut self.pending, Vec::with_capacity(self.batch_pages));
        self.pending_bytes = 0;
        self.queue.submit(batch)
    }

    /// Save any page not yet submitted, wait for the writer, then write the index and patch the
    /// header. The file is loadable only after this returns `Ok`.
    pub fn join(mut self) -> Result<SaveStats> {
        let span = tracing::info_span!("ram_save_join", path = %self.path.display());
        let _enter = span.enter();

        for idx in 0..self.blocks.len() {
            let count = self.blocks[idx].slots.len() as u32;
            self.save_range(idx, 0, count)?;
        }
        self.flush_pending()?;

        let RamSaver {
            flags,
            base,
            blocks,
            queue,
            max_index_len,
            mut stats,
            started,
            ..
        } = self;

        let finished = match queue.finish() {
            Ok(writer) => writer.finish(),
            Err(err) => {
                tracing::warn!(error = %err, "RAM save failed");
                return Err(err);
            }
        };

        let mut saved_blocks: Vec<SavedBlock> = blocks
            .iter()
            .map(|b| SavedBlock {
                name: b.block.name.clone(),
                page_size: b.block.page_size,
                page_count: b.slots.len() as u32,
                flags: b.block.flags,
                path: b.block.path.clone(),
                pages: if b.block.has_saved_pages() {
                    b.slots
                        .iter()
                        .map(|slot| match slot {
                            PageSlot::Unchanged(hash) => PageRecord {
                                flag: PageFlag::Unchanged,
                                file_pos: 0,
                                size_on_disk: 0,
                                hash: Some(*hash),
                            },
                            _ => PageRecord::ZERO,
                        })
                        .collect()
                } else {
                    Vec::new()
                },
            })
            .collect();
        for written in &finished.written {
            saved_blocks[written.block].pages[written.page as usize] = written.record;
        }

        let compress = flags.contains(SaveFlags::COMPRESS);
        let mut index_flags = IndexFlags::empty();
        if compress {
            index_flags |= IndexFlags::COMPRESSED_PAGES;
        }
        let mut page_sizes = saved_blocks
            .iter()
            .filter(|b| b.has_saved_pages())
            .map(|b| b.page_size);
        let uniform_page_size = match page_sizes.next() {
            Some(first) => page_sizes.all(|size| size == first),
            None => true,
        };
        let version = if base.is_some() {
            index_flags |= IndexFlags::INCREMENTAL;
            RAM_INDEX_VERSION_V3
        } else if compress || uniform_page_size {
            RAM_INDEX_VERSION_V2
        } else {
            // Uncompressed packed entries store positions in pages of one size.
            RAM_INDEX_VERSION_V3
        };

        let index = SaveIndex {
            version,
            flags: index_flags,
            blocks: saved_blocks,
        };
        // Refused before the header is patched, so the file stays incomplete.
        let index_bytes = index.encode_bounded(max_index_len).map_err(|err| {
            tracing::warn!(error = %err, "RAM save index cannot be written");
            err
        })?;

        let mut backend = finished.backend;
        let index_offset = finished.end_pos;
        let disk_size = index_offset + index_bytes.len() as u64;
        backend.write_at(index_offset, &index_bytes)?;
        backend.set_len(disk_size)?;
        backend.flush()?;
        backend.write_at(0, &encode_header(index_offset)?)?;
        backend.flush()?;

        stats.raw_pages = finished.stats.raw_pages;
        stats.compressed_pages = finished.stats.compressed_pages;
        stats.payload_bytes = finished.stats.payload_bytes;
        stats.index_bytes = index_bytes.len() as u64;
        stats.disk_size = disk_size;
        stats.elapsed = started.elapsed();

        tracing::debug!(
            version,
            total_pages = stats.total_pages,
            zero = stats.zero_pages,
            new_zero = stats.new_zero_pages,
            unchanged = stats.unchanged_pages,
            same_hash = stats.same_hash_pages,
            changed = stats.changed_pages,
            compressed = stats.compressed_pages,
            disk_size,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "RAM save complete"
        );
        Ok(stats)
    }
}

/// What the base index knows about each page of `block`, or `None` when the base has no usable
/// counterpart and the block must be saved in full.
fn prior_pages(index: &SaveIndex, block: &RamBlock) -> Option<Vec<PriorPage>> {
    let Some(saved) = index.find_block(&block.name) else {
        tracing::debug!(block = %block.name, "RAM block missing from base save");
        return None;
    };
    if saved.page_size != block.page_size
        || u64::from(saved.page_count) != block.page_count()
        || !saved.has_saved_pages()
    {
        tracing::debug!(
            block = %block.name,
            "RAM block layout differs from base save, saving it in full"
        );
        return None;
    }
    Some(
        saved
            .pages()
            .iter()
            .map(|record| match (record.flag, record.hash) {
                (PageFlag::Zero, _) => PriorPage::Zero,
                (_, Some(hash)) => PriorPage::Hashed(hash),
                (_, None) => PriorPage::Unknown,
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemHostSystem;

    fn block(name: &str, pages: u64) -> RamBlock {
        RamBlock::new(name, pages * 4096, 4096)
    }

    #[test]
    fn options_validate_batch_size() {
        assert!(SaveOptions::default().validate().is_ok());
        let mut options = SaveOptions::default();
        options.batch_pages = 0;
        assert!(matches!(
            options.validate(),
            Err(RamSnapshotError::InvalidConfig(_))
        ));
        options.batch_pages = MAX_BATCH_PAGES + 1;
        assert!(options.validate().is_err());
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_block_panics() {
        let host = MemHostSystem::new();
        let ram = vec![0u8; 4096];
        let mut saver =
            RamSaver::create(&host, "/ram.bin", SaveOptions::full(SaveFlags::empty())).unwrap();
        saver.register_block(block("a", 1), &ram);
        saver.register_block(block("a", 1), &ram);
    }

    #[test]
    #[should_panic(expected = "not aligned")]
    fn misaligned_save_page_panics() {
        let host = MemHostSystem::new();
        let ram = vec![0u8; 2 * 4096];
        let mut saver =
            RamSaver::create(&host, "/ram.bin", SaveOptions::full(SaveFlags::empty())).unwrap();
        saver.register_block(block("a", 2), &ram);
        let _ = saver.save_page("a", 0, 100);
    }

    #[test]
    #[should_panic(expected = "never registered")]
    fn unknown_block_panics() {
        let host = MemHostSystem::new();
        let mut saver =
            RamSaver::create(&host, "/ram.bin", SaveOptions::full(SaveFlags::empty())).unwrap();
        let _ = saver.save_page("missing", 0, 4096);
    }

    #[test]
    #[should_panic(expected = "DiffBase::Reference")]
    fn reference_without_reference_base_panics() {
        let host = MemHostSystem::new();
        let ram = vec![0u8; 4096];
        let mut saver =
            RamSaver::create(&host, "/ram.bin", SaveOptions::full(SaveFlags::empty())).unwrap();
        saver.register_block_with_reference(block("a", 1), &ram, &ram);
    }

    #[test]
    fn stats_count_page_classes() {
        let host = MemHostSystem::new();
        let mut ram = vec![0u8; 4 * 4096];
        ram[4096] = 1;
        ram[3 * 4096 + 7] = 2;
        let mut saver =
            RamSaver::create(&host, "/ram.bin", SaveOptions::full(SaveFlags::empty())).unwrap();
        saver.register_block(block("a", 4), &ram);
        saver.save_page("a", 4096, 4096).unwrap();
        // The remaining pages are picked up by join.
        let stats = saver.join().unwrap();

        assert_eq!(stats.total_pages, 4);
        assert_eq!(stats.zero_pages, 2);
        assert_eq!(stats.changed_pages, 2);
        assert_eq!(stats.raw_pages, 2);
        assert_eq!(stats.payload_bytes, 2 * 4096);
        assert_eq!(
            stats.disk_size,
            host.path_file_size(Path::new("/ram.bin")).unwrap()
        );
    }

    #[test]
    fn large_pages_cut_batches_by_bytes() {
        let host = MemHostSystem::new();
        let page_size = 512 * 1024;
        let mut ram = vec![0u8; 8 * page_size];
        for (i, page) in ram.chunks_mut(page_size).enumerate() {
            page[i] = 1;
        }
        let mut saver =
            RamSaver::create(&host, "/ram.bin", SaveOptions::full(SaveFlags::empty())).unwrap();
        assert_eq!(saver.batch_pages, DEFAULT_BATCH_PAGES);
        saver.register_block(
            RamBlock::new("big", ram.len() as u64, page_size as u32),
            &ram,
        );
        let per_batch = MAX_BATCH_BYTES / page_size;
        for page in 0..8u64 {
            saver
                .save_page("big", page * page_size as u64, page_size as u64)
                .unwrap();
            assert!(saver.pending.len() < per_batch);
            assert!(saver.pending_bytes < MAX_BATCH_BYTES);
        }
        let stats = saver.join().unwrap();
        assert_eq!(stats.changed_pages, 8);
        assert_eq!(stats.payload_bytes, ram.len() as u64);
    }

    #[test]
    fn index_over_the_load_limit_fails_join() {
        let host = MemHostSystem::new();
        let ram = vec![9u8; 4 * 4096];
        let mut saver =
            RamSaver::create(&host, "/ram.bin", SaveOptions::full(SaveFlags::empty())).unwrap();
        saver.max_index_len = 64;
        saver.register_block(block("a", 4), &ram);
        let err = saver.join().unwrap_err();
        assert!(
            matches!(err, RamSnapshotError::IndexTooLarge { max: 64, .. }),
            "{err}"
        );
        let bytes = host.read("/ram.bin").unwrap();
        assert_eq!(&bytes[..8], &[0u8; 8]);
        assert!(matches!(
            RamLoader::open(&host, "/ram.bin", LoadOptions::default()),
            Err(RamSnapshotError::IncompleteSave)
        ));
    }

    #[test]
    fn unjoined_save_leaves_placeholder_header() {
        let host = MemHostSystem::new();
        let ram = vec![7u8; 4096];
        {
            let mut saver = RamSaver::create(
                &host,
                "/ram.bin",
                SaveOptions::full(SaveFlags::COMPRESS | SaveFlags::BACKGROUND),
            )
            .unwrap();
            saver.register_block(block("a", 1), &ram);
            saver.save_block("a").unwrap();
        }
        let bytes = host.read("/ram.bin").unwrap();
        assert_eq!(&bytes[..8], &[0u8; 8]);
    }
}
