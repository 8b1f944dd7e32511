use bitflags::bitflags;

pub const DEFAULT_PAGE_SIZE: u32 = 4096;
pub const MAX_PAGE_SIZE: u32 = 2 * 1024 * 1024;

bitflags! {
    /// Host-side properties of a RAM block, stored alongside the block in the save index.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RamBlockFlags: u32 {
        /// Contents are recreated identically by the VM; no pages are saved or restored.
        const READONLY = 1 << 0;
        /// Guest memory is backed by a user-supplied file; no pages are saved or restored.
        const USER_BACKED = 1 << 1;
        /// Memory is a shared file mapping. Recorded for diagnostics only.
        const MAPPED_SHARED = 1 << 2;
    }
}

/// A named, page-aligned region of guest memory.
///
/// This is metadata only. The saver borrows the region's bytes at registration and the loader
/// is handed a mutable buffer per block, so the memory itself stays owned by the VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RamBlock {
    pub name: String,
    /// Guest-physical base of the region (informational; blocks are keyed by name).
    pub start_offset: u64,
    pub total_size: u64,
    pub page_size: u32,
    pub flags: RamBlockFlags,
    /// Backing file of a mapped block, if any.
    pub path: String,
}

impl RamBlock {
    pub fn new(name: impl Into<String>, total_size: u64, page_size: u32) -> Self {
        Self {
            name: name.into(),
            start_offset: 0,
            total_size,
            page_size,
            flags: RamBlockFlags::empty(),
            path: String::new(),
        }
    }

    pub fn with_start_offset(mut self, start_offset: u64) -> Self {
        self.start_offset = start_offset;
        self
    }

    pub fn with_flags(mut self, flags: RamBlockFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn page_count(&self) -> u64 {
        self.total_size / u64::from(self.page_size)
    }

    /// Whether the block's pages are part of the save stream at all.
    pub fn has_saved_pages(&self) -> bool {
        !self
            .flags
            .intersects(RamBlockFlags::READONLY | RamBlockFlags::USER_BACKED)
    }

    /// Panics unless the block satisfies the alignment invariants the engine relies on.
    pub(crate) fn assert_valid(&self) {
        assert!(
            !self.name.is_empty() && self.name.len() <= usize::from(u8::MAX),
            "RAM block name must be 1..=255 bytes (got {:?})",
            self.name
        );
        assert!(
            self.page_size.is_power_of_two() && self.page_size <= MAX_PAGE_SIZE,
            "RAM block {:?} has invalid page size {}",
            self.name,
            self.page_size
        );
        assert!(
            self.total_size % u64::from(self.page_size) == 0,
            "RAM block {:?} size {} is not a multiple of its page size {}",
            self.name,
            self.total_size,
            self.page_size
        );
        assert!(
            self.page_count() <= u64::from(u32::MAX),
            "RAM block {:?} has too many pages",
            self.name
        );
    }
}
