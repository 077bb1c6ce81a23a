//! The supplemental page table: how to reconstruct every virtual page a
//! process knows about, whether or not it is resident.

use super::file::File;
use super::frame::FrameId;
use super::mmap::MapId;
use super::swap::SwapSlot;
use super::FaultError;
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::fmt;
use log::{trace, warn};
use nephron_shared::mem::{is_page_aligned, PAGE_FRAME_SIZE};

/// A page-sized window of a file: `read_bytes` from `offset`, then
/// `zero_bytes` of zeroes.
#[derive(Clone)]
pub struct FileExtent {
    pub file: Arc<dyn File>,
    pub offset: u64,
    pub read_bytes: usize,
    pub zero_bytes: usize,
}

impl FileExtent {
    pub fn new(file: Arc<dyn File>, offset: u64, read_bytes: usize, zero_bytes: usize) -> Self {
        assert_eq!(
            read_bytes + zero_bytes,
            PAGE_FRAME_SIZE,
            "extent must cover exactly one page"
        );
        Self {
            file,
            offset,
            read_bytes,
            zero_bytes,
        }
    }

    /// Fill `page` from the file. A short read fails the load.
    pub(crate) fn load(&self, page: &mut [u8]) -> Result<(), FaultError> {
        let (head, tail) = page.split_at_mut(self.read_bytes);
        match self.file.read_at(self.offset, head) {
            Ok(n) if n == self.read_bytes => {}
            Ok(n) => {
                warn!(
                    "short read at offset {}: {} of {} bytes",
                    self.offset, n, self.read_bytes
                );
                return Err(FaultError::LoadFailed);
            }
            Err(err) => {
                warn!("read at offset {} failed: {}", self.offset, err);
                return Err(FaultError::LoadFailed);
            }
        }
        tail.fill(0);
        Ok(())
    }

    /// Write the file-backed part of `page` back to the file. Failures are
    /// logged and otherwise ignored.
    pub(crate) fn write_back(&self, page: &[u8]) {
        match self.file.write_at(self.offset, &page[..self.read_bytes]) {
            Ok(n) if n == self.read_bytes => {
                trace!("wrote back {} bytes at offset {}", n, self.offset);
            }
            Ok(n) => warn!(
                "short write-back at offset {}: {} of {} bytes",
                self.offset, n, self.read_bytes
            ),
            Err(err) => warn!("write-back at offset {} failed: {}", self.offset, err),
        }
    }
}

impl fmt::Debug for FileExtent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FileExtent")
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .field("zero_bytes", &self.zero_bytes)
            .finish_non_exhaustive()
    }
}

/// Where a page's content lives while it is not resident.
#[derive(Debug, Clone)]
pub enum Backing {
    /// Anonymous memory. `None` means the page reads as zeroes.
    Swap { slot: Option<SwapSlot> },
    /// Part of an executable segment.
    File(FileExtent),
    /// Part of a memory-mapped file, written back when modified.
    MemoryMapped { extent: FileExtent, mapping: MapId },
}

impl Backing {
    /// Whether a fresh frame for this page must start out zeroed, because
    /// nothing will overwrite it.
    pub fn needs_zero_fill(&self) -> bool {
        match self {
            Backing::Swap { slot } => slot.is_none(),
            Backing::File(extent) | Backing::MemoryMapped { extent, .. } => extent.read_bytes == 0,
        }
    }
}

impl fmt::Display for Backing {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Backing::Swap { slot: Some(slot) } => write!(f, "swap ({slot})"),
            Backing::Swap { slot: None } => write!(f, "anonymous"),
            Backing::File(extent) => write!(f, "file @ {}", extent.offset),
            Backing::MemoryMapped { extent, mapping } => {
                write!(f, "mapping {} @ {}", mapping, extent.offset)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Absent,
    /// Being loaded by a fault, or written out by eviction or unmap. Anyone
    /// else touching the page waits for it to settle.
    InTransit,
    Resident(FrameId),
}

#[derive(Debug)]
pub struct PageEntry {
    pub upage: usize,
    pub backing: Backing,
    pub writable: bool,
    pub state: PageState,
    /// Content exists only in memory, whatever the hardware dirty bit says.
    pub dirty: bool,
}

impl PageEntry {
    pub fn is_resident(&self) -> bool {
        matches!(self.state, PageState::Resident(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageError {
    /// The page is already registered.
    Collision(usize),
}

impl fmt::Display for PageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PageError::Collision(upage) => write!(f, "page {upage:#x} is already registered"),
        }
    }
}

impl core::error::Error for PageError {}

/// Per-process index from user page to [`PageEntry`].
#[derive(Default)]
pub struct SupplementalPageTable {
    entries: BTreeMap<usize, PageEntry>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a non-resident page.
    pub fn register(
        &mut self,
        upage: usize,
        backing: Backing,
        writable: bool,
    ) -> Result<(), PageError> {
        assert!(is_page_aligned(upage), "{upage:#x} is not page aligned");

        if self.entries.contains_key(&upage) {
            return Err(PageError::Collision(upage));
        }
        trace!("spt: register {:#x} ({})", upage, backing);
        self.entries.insert(
            upage,
            PageEntry {
                upage,
                backing,
                writable,
                state: PageState::Absent,
                dirty: false,
            },
        );
        Ok(())
    }

    /// Remove a page. Its frame, if it had one, must already be released.
    pub fn unregister(&mut self, upage: usize) -> Option<PageEntry> {
        let entry = self.entries.remove(&upage)?;
        assert!(
            !entry.is_resident(),
            "unregistering resident page {upage:#x}"
        );
        trace!("spt: unregister {:#x}", upage);
        Some(entry)
    }

    pub fn get(&self, upage: usize) -> Option<&PageEntry> {
        self.entries.get(&upage)
    }

    pub fn get_mut(&mut self, upage: usize) -> Option<&mut PageEntry> {
        self.entries.get_mut(&upage)
    }

    pub fn contains(&self, upage: usize) -> bool {
        self.entries.contains_key(&upage)
    }

    pub fn state(&self, upage: usize) -> Option<PageState> {
        self.get(upage).map(|entry| entry.state)
    }

    pub fn upages(&self) -> Vec<usize> {
        self.entries.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn resident_count(&self) -> usize {
        self.iter().filter(|entry| entry.is_resident()).count()
    }
}

impl fmt::Display for SupplementalPageTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "spt: {} pages, {} resident",
            self.len(),
            self.resident_count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::file::MemFile;
    use alloc::vec;

    fn anonymous() -> Backing {
        Backing::Swap { slot: None }
    }

    #[test]
    fn register_rejects_collisions() {
        let mut spt = SupplementalPageTable::new();
        assert_eq!(spt.register(0x1000, anonymous(), true), Ok(()));
        assert_eq!(
            spt.register(0x1000, anonymous(), false),
            Err(PageError::Collision(0x1000))
        );
        let entry = spt.get(0x1000).expect("registered");
        assert!(entry.writable);
        assert_eq!(entry.state, PageState::Absent);
        assert_eq!(spt.len(), 1);
    }

    #[test]
    fn unregister_returns_the_entry() {
        let mut spt = SupplementalPageTable::new();
        spt.register(0x2000, anonymous(), true).expect("fresh page");
        assert!(spt.unregister(0x2000).is_some());
        assert!(spt.unregister(0x2000).is_none());
        assert!(spt.is_empty());
    }

    #[test]
    #[should_panic(expected = "unregistering resident page")]
    fn unregister_refuses_resident_pages() {
        let mut spt = SupplementalPageTable::new();
        spt.register(0x2000, anonymous(), true).expect("fresh page");
        spt.get_mut(0x2000).expect("registered").state = PageState::Resident(FrameId::new(0));
        spt.unregister(0x2000);
    }

    #[test]
    fn zero_fill_policy() {
        let file: Arc<dyn File> = Arc::new(MemFile::new(vec![1; 10]));
        assert!(anonymous().needs_zero_fill());
        assert!(!Backing::Swap {
            slot: Some(SwapSlot::new(0))
        }
        .needs_zero_fill());
        assert!(Backing::File(FileExtent::new(file.clone(), 0, 0, PAGE_FRAME_SIZE)).needs_zero_fill());
        assert!(!Backing::File(FileExtent::new(file, 0, 10, PAGE_FRAME_SIZE - 10)).needs_zero_fill());
    }

    #[test]
    fn extent_load_zeroes_the_tail() {
        let file: Arc<dyn File> = Arc::new(MemFile::new((0..=255).collect()));
        let extent = FileExtent::new(file, 16, 32, PAGE_FRAME_SIZE - 32);
        let mut page = vec![0xFF; PAGE_FRAME_SIZE];
        extent.load(&mut page).expect("file is long enough");
        assert_eq!(&page[..32], &(16..48).collect::<Vec<u8>>()[..]);
        assert!(page[32..].iter().all(|&b| b == 0));
    }

    #[test]
    fn extent_load_fails_on_short_read() {
        let file: Arc<dyn File> = Arc::new(MemFile::new(vec![1; 8]));
        let extent = FileExtent::new(file, 0, 100, PAGE_FRAME_SIZE - 100);
        let mut page = vec![0; PAGE_FRAME_SIZE];
        assert_eq!(extent.load(&mut page), Err(FaultError::LoadFailed));
    }

    #[test]
    fn write_back_stops_at_read_bytes() {
        let mem = Arc::new(MemFile::new(vec![0; 6]));
        let extent = FileExtent::new(mem.clone(), 2, 4, PAGE_FRAME_SIZE - 4);
        extent.write_back(&vec![9; PAGE_FRAME_SIZE]);
        assert_eq!(mem.contents(), [0, 0, 9, 9, 9, 9]);
    }

    #[test]
    fn display_summary() {
        let mut spt = SupplementalPageTable::new();
        spt.register(0x1000, anonymous(), true).expect("fresh page");
        spt.register(0x3000, anonymous(), true).expect("fresh page");
        spt.get_mut(0x3000).expect("registered").state = PageState::Resident(FrameId::new(4));
        assert_eq!(spt.to_string(), "spt: 2 pages, 1 resident");
        assert_eq!(spt.resident_count(), 1);
    }
}
