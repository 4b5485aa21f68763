/// Entries per table; every supported format uses 4 KiB tables of 8-byte
/// entries.
pub const ENTRIES: usize = 512;

/// One 4 KiB page-table page of raw 64-bit entries.
///
/// The meaning of an entry depends on the [`PageTableFormat`](crate::PageTableFormat)
/// and the level the table sits at.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [u64; ENTRIES],
}

impl PageTable {
    /// A table with every entry invalid.
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [0; ENTRIES],
        }
    }

    /// Set every entry to zero (invalid on all formats).
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(0);
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, idx: usize) -> u64 {
        self.entries[idx]
    }

    #[inline]
    pub const fn set(&mut self, idx: usize, raw: u64) {
        self.entries[idx] = raw;
    }

    /// Number of non-zero entries.
    #[must_use]
    pub fn populated(&self) -> usize {
        self.entries.iter().filter(|&&e| e != 0).count()
    }
}

const _: () = assert!(size_of::<PageTable>() == 4096);
