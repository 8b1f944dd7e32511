//! On-disk layout of a RAM save.
//!
//! ```text
//! be64 index offset (0 while the save is in flight)
//! page payloads, appended in write order
//! index: be32 version, be32 flags, be32 total pages, per-block tables, 16-byte checksum
//! ```

use bitflags::bitflags;

use crate::block::{RamBlockFlags, MAX_PAGE_SIZE};
use crate::diff::PageHash;
use crate::error::{RamSnapshotError, Result};
use crate::io::{ReadBeExt, WriteBeExt};

/// Size of the fixed header holding the index offset. Page payloads start right after it.
pub const HEADER_LEN: u64 = 8;

/// Per-page entries carry no hash; every page of a compressed save is compressed.
pub const RAM_INDEX_VERSION_V1: u32 = 1;
/// Packed per-page entries with hashes. Written for full saves.
pub const RAM_INDEX_VERSION_V2: u32 = 2;
/// Tagged per-page entries that can express unchanged pages. Written for incremental saves.
pub const RAM_INDEX_VERSION_V3: u32 = 3;

pub const INDEX_CHECKSUM_LEN: usize = 16;

/// Largest index a loader accepts. A save whose index would be larger is refused at `join`.
pub const MAX_INDEX_LEN: u64 = 256 * 1024 * 1024;

const MAX_PATH_LEN: usize = 4096;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct IndexFlags: u32 {
        const COMPRESSED_PAGES = 1 << 0;
        /// Reserved for saves whose pages live in a separate backing file. Never set by this crate.
        const SEPARATE_BACKING_STORE = 1 << 1;
        /// The save is a delta on top of a base image.
        const INCREMENTAL = 1 << 2;
    }
}

/// How a page is represented in the save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageFlag {
    Zero,
    Raw,
    Compressed,
    Unchanged,
}

impl PageFlag {
    pub fn to_wire(self) -> u8 {
        match self {
            PageFlag::Zero => 0,
            PageFlag::Raw => 1,
            PageFlag::Compressed => 2,
            PageFlag::Unchanged => 3,
        }
    }

    pub fn from_wire(v: u8) -> Result<Self> {
        match v {
            0 => Ok(PageFlag::Zero),
            1 => Ok(PageFlag::Raw),
            2 => Ok(PageFlag::Compressed),
            3 => Ok(PageFlag::Unchanged),
            _ => Err(RamSnapshotError::Corrupt("invalid page flag")),
        }
    }

    pub fn has_payload(self) -> bool {
        matches!(self, PageFlag::Raw | PageFlag::Compressed)
    }
}

/// Index entry for one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRecord {
    pub flag: PageFlag,
    /// Absolute file offset of the payload; 0 when there is none.
    pub file_pos: u64,
    pub size_on_disk: u32,
    pub hash: Option<PageHash>,
}

impl PageRecord {
    pub const ZERO: PageRecord = PageRecord {
        flag: PageFlag::Zero,
        file_pos: 0,
        size_on_disk: 0,
        hash: None,
    };
}

/// A block as recorded in a save index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedBlock {
    pub name: String,
    pub page_size: u32,
    pub page_count: u32,
    pub flags: RamBlockFlags,
    pub path: String,
    pub(crate) pages: Vec<PageRecord>,
}

impl SavedBlock {
    pub fn total_size(&self) -> u64 {
        u64::from(self.page_count) * u64::from(self.page_size)
    }

    /// Per-page records. Empty for blocks whose pages are not saved (read-only, user-backed).
    pub fn pages(&self) -> &[PageRecord] {
        &self.pages
    }

    pub fn has_saved_pages(&self) -> bool {
        !self
            .flags
            .intersects(RamBlockFlags::READONLY | RamBlockFlags::USER_BACKED)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SaveIndex {
    pub version: u32,
    pub flags: IndexFlags,
    pub blocks: Vec<SavedBlock>,
}

impl SaveIndex {
    pub fn total_pages(&self) -> u64 {
        self.blocks
            .iter()
            .map(|b| u64::from(b.page_count))
            .sum()
    }

    pub fn find_block(&self, name: &str) -> Option<&SavedBlock> {
        self.blocks.iter().find(|b| b.name == name)
    }

    /// Serialize the index, checksum included.
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.encode_bounded(MAX_INDEX_LEN)
    }

    pub(crate) fn encode_bounded(&self, max_len: u64) -> Result<Vec<u8>> {
        let total_pages: u32 = self
            .total_pages()
            .try_into()
            .map_err(|_| RamSnapshotError::Corrupt("too many pages"))?;
        let compressed = self.flags.contains(IndexFlags::COMPRESSED_PAGES);

        let mut out = Vec::with_capacity(512 + 20 * total_pages as usize);
        out.write_u32_be(self.version)?;
        out.write_u32_be(self.flags.bits())?;
        out.write_u32_be(total_pages)?;

        let mut cursor = PosCursor::new();
        for block in &self.blocks {
            out.write_short_string(&block.name)?;
            out.write_u32_be(block.page_count)?;
            out.write_u32_be(block.page_size)?;
            out.write_u32_be(block.flags.bits())?;
            out.write_string_u32(&block.path)?;

            if !block.has_saved_pages() {
                continue;
            }
            debug_assert_eq!(block.pages.len(), block.page_count as usize);
            for page in &block.pages {
                match self.version {
                    RAM_INDEX_VERSION_V2 => {
                        encode_packed_page(&mut out, &mut cursor, page, block.page_size, compressed)?
                    }
                    RAM_INDEX_VERSION_V3 => encode_tagged_page(&mut out, &mut cursor, page)?,
                    v => return Err(RamSnapshotError::UnsupportedVersion(v)),
                }
            }
        }

        let checksum = index_checksum(&out);
        out.write_bytes(&checksum)?;
        check_index_len(out.len() as u64, max_len)?;
        Ok(out)
    }

    /// Parse an index, checksum included. `index_offset` bounds payload positions.
    pub fn decode(bytes: &[u8], index_offset: u64) -> Result<Self> {
        let version = {
            let mut r = bytes;
            r.read_u32_be()
                .map_err(|_| RamSnapshotError::Corrupt("index too short"))?
        };
        if !(RAM_INDEX_VERSION_V1..=RAM_INDEX_VERSION_V3).contains(&version) {
            return Err(RamSnapshotError::UnsupportedVersion(version));
        }

        let body = if version == RAM_INDEX_VERSION_V1 {
            bytes
        } else {
            if bytes.len() < 12 + INDEX_CHECKSUM_LEN {
                return Err(RamSnapshotError::Corrupt("index too short"));
            }
            let (body, checksum) = bytes.split_at(bytes.len() - INDEX_CHECKSUM_LEN);
            if index_checksum(body)[..] != checksum[..] {
                return Err(RamSnapshotError::IndexChecksumMismatch);
            }
            body
        };

        decode_body(body, version, index_offset).map_err(|err| {
            if err.is_eof() {
                RamSnapshotError::Corrupt("index ends prematurely")
            } else {
                err
            }
        })
    }
}

pub(crate) fn index_checksum(bytes: &[u8]) -> [u8; INDEX_CHECKSUM_LEN] {
    let hash = blake3::hash(bytes);
    let mut out = [0u8; INDEX_CHECKSUM_LEN];
    out.copy_from_slice(&hash.as_bytes()[..INDEX_CHECKSUM_LEN]);
    out
}

/// Tracks the previous payload so positions can be stored as small deltas.
struct PosCursor {
    prev_pos: u64,
    prev_size: u32,
}

impl PosCursor {
    fn new() -> Self {
        Self {
            prev_pos: HEADER_LEN,
            prev_size: 0,
        }
    }

    fn prev_end(&self) -> u64 {
        self.prev_pos + u64::from(self.prev_size)
    }

    fn advance(&mut self, pos: u64, size: u32) {
        self.prev_pos = pos;
        self.prev_size = size;
    }
}

fn signed_delta(to: u64, from: u64) -> Result<i64> {
    let delta = i128::from(to) - i128::from(from);
    i64::try_from(delta).map_err(|_| RamSnapshotError::Corrupt("page position delta overflow"))
}

fn apply_delta(from: u64, delta: i64) -> Result<u64> {
    from.checked_add_signed(delta)
        .ok_or(RamSnapshotError::Corrupt("page position out of range"))
}

pub(crate) fn check_index_len(len: u64, max: u64) -> Result<()> {
    if len > max {
        return Err(RamSnapshotError::IndexTooLarge { len, max });
    }
    Ok(())
}

/// Write the fixed header: the index offset, or 0 while the save is in flight.
pub(crate) fn encode_header(index_offset: u64) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(HEADER_LEN as usize);
    out.write_u64_be(index_offset)?;
    Ok(out)
}

/// Read the index offset from the fixed header.
pub(crate) fn decode_header(mut header: &[u8]) -> Result<u64> {
    header.read_u64_be()
}

fn encode_packed_page(
    out: &mut Vec<u8>,
    cursor: &mut PosCursor,
    page: &PageRecord,
    page_size: u32,
    compressed: bool,
) -> Result<()> {
    match page.flag {
        PageFlag::Zero => return out.write_packed_u64(0),
        PageFlag::Unchanged => {
            return Err(RamSnapshotError::Corrupt(
                "unchanged pages need a tagged index",
            ))
        }
        PageFlag::Compressed if !compressed => {
            return Err(RamSnapshotError::Corrupt(
                "compressed page in uncompressed index",
            ))
        }
        PageFlag::Raw | PageFlag::Compressed => {}
    }

    let hash = page
        .hash
        .ok_or(RamSnapshotError::Corrupt("saved page is missing its hash"))?;
    if compressed {
        out.write_packed_u64(u64::from(page.size_on_disk))?;
        let delta = signed_delta(page.file_pos, cursor.prev_end())?;
        out.write_packed_i64(delta)?;
    } else {
        if page.size_on_disk != page_size {
            return Err(RamSnapshotError::Corrupt("raw page size mismatch"));
        }
        out.write_packed_u64(1)?;
        let delta = signed_delta(page.file_pos, cursor.prev_pos)?;
        if delta % i64::from(page_size) != 0 {
            return Err(RamSnapshotError::Corrupt(
                "page position is not page-aligned",
            ));
        }
        out.write_packed_i64(delta / i64::from(page_size))?;
    }
    out.write_bytes(&hash)?;
    cursor.advance(page.file_pos, page.size_on_disk);
    Ok(())
}

fn encode_tagged_page(out: &mut Vec<u8>, cursor: &mut PosCursor, page: &PageRecord) -> Result<()> {
    out.write_u8(page.flag.to_wire())?;
    match page.flag {
        PageFlag::Zero => Ok(()),
        PageFlag::Unchanged => {
            let hash = page
                .hash
                .ok_or(RamSnapshotError::Corrupt("unchanged page is missing its hash"))?;
            out.write_bytes(&hash)
        }
        PageFlag::Raw | PageFlag::Compressed => {
            let hash = page
                .hash
                .ok_or(RamSnapshotError::Corrupt("saved page is missing its hash"))?;
            out.write_packed_u64(u64::from(page.size_on_disk))?;
            out.write_packed_i64(signed_delta(page.file_pos, cursor.prev_end())?)?;
            out.write_bytes(&hash)?;
            cursor.advance(page.file_pos, page.size_on_disk);
            Ok(())
        }
    }
}

fn decode_body(body: &[u8], version: u32, index_offset: u64) -> Result<SaveIndex> {
    let mut r = body;
    let _version = r.read_u32_be()?;
    let flags = IndexFlags::from_bits(r.read_u32_be()?)
        .ok_or(RamSnapshotError::Corrupt("unknown index flags"))?;
    let compressed = flags.contains(IndexFlags::COMPRESSED_PAGES);
    if flags.contains(IndexFlags::INCREMENTAL) && version != RAM_INDEX_VERSION_V3 {
        return Err(RamSnapshotError::Corrupt(
            "incremental save without a tagged index",
        ));
    }
    let total_pages = r.read_u32_be()?;

    let mut blocks: Vec<SavedBlock> = Vec::new();
    let mut seen_pages = 0u64;
    let mut cursor = PosCursor::new();
    while !r.is_empty() {
        let name = r.read_short_string()?;
        if name.is_empty() {
            return Err(RamSnapshotError::Corrupt("empty block name"));
        }
        if blocks.iter().any(|b| b.name == name) {
            return Err(RamSnapshotError::Corrupt("duplicate block name"));
        }
        let page_count = r.read_u32_be()?;
        let page_size = r.read_u32_be()?;
        if !page_size.is_power_of_two() || page_size > MAX_PAGE_SIZE {
            return Err(RamSnapshotError::Corrupt("invalid page size"));
        }
        let block_flags = RamBlockFlags::from_bits(r.read_u32_be()?)
            .ok_or(RamSnapshotError::Corrupt("unknown block flags"))?;
        let path = r.read_string_u32(MAX_PATH_LEN)?;

        seen_pages += u64::from(page_count);
        if seen_pages > u64::from(total_pages) {
            return Err(RamSnapshotError::Corrupt("page count exceeds index total"));
        }

        let mut block = SavedBlock {
            name,
            page_size,
            page_count,
            flags: block_flags,
            path,
            pages: Vec::new(),
        };

        if block.has_saved_pages() {
            // Every entry takes at least one byte, which bounds the allocation below.
            if page_count as usize > r.len() {
                return Err(RamSnapshotError::Corrupt("page table longer than index"));
            }
            block.pages.reserve_exact(page_count as usize);
            for _ in 0..page_count {
                let page = match version {
                    RAM_INDEX_VERSION_V3 => decode_tagged_page(&mut r, &mut cursor, page_size)?,
                    _ => decode_packed_page(&mut r, &mut cursor, page_size, compressed, version)?,
                };
                if page.flag == PageFlag::Unchanged && !flags.contains(IndexFlags::INCREMENTAL) {
                    return Err(RamSnapshotError::Corrupt("unchanged page in a full save"));
                }
                if page.flag == PageFlag::Compressed && !compressed {
                    return Err(RamSnapshotError::Corrupt(
                        "compressed page in uncompressed save",
                    ));
                }
                if page.flag.has_payload() {
                    let end = page
                        .file_pos
                        .checked_add(u64::from(page.size_on_disk))
                        .ok_or(RamSnapshotError::Corrupt("page position out of range"))?;
                    if page.file_pos < HEADER_LEN || end > index_offset {
                        return Err(RamSnapshotError::Corrupt(
                            "page payload outside the payload area",
                        ));
                    }
                }
                block.pages.push(page);
            }
        }
        blocks.push(block);
    }

    if seen_pages != u64::from(total_pages) {
        return Err(RamSnapshotError::Corrupt("index page total mismatch"));
    }

    Ok(SaveIndex {
        version,
        flags,
        blocks,
    })
}

fn decode_packed_page(
    r: &mut &[u8],
    cursor: &mut PosCursor,
    page_size: u32,
    compressed: bool,
    version: u32,
) -> Result<PageRecord> {
    let code = r.read_packed_u64()?;
    if code == 0 {
        return Ok(PageRecord::ZERO);
    }

    let (flag, size_on_disk, file_pos) = if compressed {
        if code > u64::from(page_size) {
            return Err(RamSnapshotError::Corrupt("page larger than page size"));
        }
        let size = code as u32;
        let pos = apply_delta(cursor.prev_end(), r.read_packed_i64()?)?;
        let flag = if version == RAM_INDEX_VERSION_V1 || size < page_size {
            PageFlag::Compressed
        } else {
            PageFlag::Raw
        };
        (flag, size, pos)
    } else {
        if code != 1 {
            return Err(RamSnapshotError::Corrupt("invalid uncompressed page size"));
        }
        let delta_pages = r.read_packed_i64()?;
        let delta = delta_pages
            .checked_mul(i64::from(page_size))
            .ok_or(RamSnapshotError::Corrupt("page position out of range"))?;
        (PageFlag::Raw, page_size, apply_delta(cursor.prev_pos, delta)?)
    };

    let hash = if version >= RAM_INDEX_VERSION_V2 {
        Some(r.read_array::<16>()?)
    } else {
        None
    };
    cursor.advance(file_pos, size_on_disk);
    Ok(PageRecord {
        flag,
        file_pos,
        size_on_disk,
        hash,
    })
}

fn decode_tagged_page(r: &mut &[u8], cursor: &mut PosCursor, page_size: u32) -> Result<PageRecord> {
    let flag = PageFlag::from_wire(r.read_u8()?)?;
    match flag {
        PageFlag::Zero => Ok(PageRecord::ZERO),
        PageFlag::Unchanged => Ok(PageRecord {
            flag,
            file_pos: 0,
            size_on_disk: 0,
            hash: Some(r.read_array::<16>()?),
        }),
        PageFlag::Raw | PageFlag::Compressed => {
            let size = r.read_packed_u64()?;
            let valid = match flag {
                PageFlag::Raw => size == u64::from(page_size),
                _ => size > 0 && size < u64::from(page_size),
            };
            if !valid {
                return Err(RamSnapshotError::Corrupt("invalid page size on disk"));
            }
            let size_on_disk = size as u32;
            let file_pos = apply_delta(cursor.prev_end(), r.read_packed_i64()?)?;
            let hash = r.read_array::<16>()?;
            cursor.advance(file_pos, size_on_disk);
            Ok(PageRecord {
                flag,
                file_pos,
                size_on_disk,
                hash: Some(hash),
            })
        }
    }
}
