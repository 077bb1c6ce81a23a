//! A software rendition of the x86 two-level page table, built from the same
//! entry layouts the MMU reads.

#![allow(clippy::cast_possible_truncation)]

use alloc::{boxed::Box, vec::Vec};
use arbitrary_int::u20;
use nephron_shared::{
    mem::{is_page_aligned, is_user_vaddr},
    paging::{self, PageDirectoryEntry, PageTable, PageTableEntry, VirtualAddress},
};

/// The result of walking the page table for an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub frame: u20,
    pub writable: bool,
}

/// The per-process hardware page table, as the virtual memory code sees it.
///
/// All addresses are user addresses. Methods taking `upage` expect it to be
/// page aligned.
pub trait HardwarePageTable {
    /// Map `upage` to physical frame `frame`. Returns `false`, changing
    /// nothing, if `upage` is already mapped.
    #[must_use]
    fn install_mapping(&mut self, upage: usize, frame: u20, writable: bool) -> bool;

    /// Remove the mapping for `upage`, if any.
    fn clear_mapping(&mut self, upage: usize);

    fn is_accessed(&self, upage: usize) -> bool;
    fn set_accessed(&mut self, upage: usize, accessed: bool);
    fn is_dirty(&self, upage: usize) -> bool;
    fn set_dirty(&mut self, upage: usize, dirty: bool);

    /// The frame `vaddr` is mapped to, if it is mapped.
    fn translate(&self, vaddr: usize) -> Option<Translation>;
}

/// Page directory plus the page tables it references. The address field of a
/// present directory entry holds the index of its table in `tables`.
pub struct PageDirectory {
    directory: Box<paging::PageDirectory>,
    tables: Vec<Box<PageTable>>,
}

impl Default for PageDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl PageDirectory {
    pub fn new() -> Self {
        Self {
            directory: Box::default(),
            tables: Vec::new(),
        }
    }

    fn entry(&self, vaddr: usize) -> Option<&PageTableEntry> {
        let va = VirtualAddress::from_usize(vaddr);
        let pde = self.directory[va.page_directory_index().value() as usize];
        if !pde.present() {
            return None;
        }
        let table = &self.tables[pde.page_table_address().value() as usize];
        let pte = &table[va.page_table_index().value() as usize];
        pte.present().then_some(pte)
    }

    fn entry_mut(&mut self, vaddr: usize) -> Option<&mut PageTableEntry> {
        let va = VirtualAddress::from_usize(vaddr);
        let pde = self.directory[va.page_directory_index().value() as usize];
        if !pde.present() {
            return None;
        }
        let table = &mut self.tables[pde.page_table_address().value() as usize];
        let pte = &mut table[va.page_table_index().value() as usize];
        pte.present().then_some(pte)
    }

    /// The page table covering `vaddr`, created on first use.
    fn table_for(&mut self, vaddr: usize) -> &mut PageTable {
        let va = VirtualAddress::from_usize(vaddr);
        let pdi = va.page_directory_index().value() as usize;
        if !self.directory[pdi].present() {
            self.tables.push(Box::default());
            self.directory[pdi] = PageDirectoryEntry::DEFAULT
                .with_present(true)
                .with_read_write(true)
                .with_user_supervisor(true)
                .with_page_table_address(u20::new(self.tables.len() as u32 - 1));
        }
        let index = self.directory[pdi].page_table_address().value() as usize;
        &mut self.tables[index]
    }

    /// Number of present mappings.
    pub fn mapped_pages(&self) -> usize {
        self.tables
            .iter()
            .map(|table| table.iter().filter(|pte| pte.present()).count())
            .sum()
    }
}

impl HardwarePageTable for PageDirectory {
    fn install_mapping(&mut self, upage: usize, frame: u20, writable: bool) -> bool {
        debug_assert!(is_page_aligned(upage));
        assert!(is_user_vaddr(upage), "{upage:#x} is not a user address");

        if self.entry(upage).is_some() {
            return false;
        }
        let pti = VirtualAddress::from_usize(upage).page_table_index().value() as usize;
        self.table_for(upage)[pti] = PageTableEntry::user_mapping(frame, writable);
        true
    }

    fn clear_mapping(&mut self, upage: usize) {
        if let Some(pte) = self.entry_mut(upage) {
            *pte = PageTableEntry::DEFAULT;
        }
    }

    fn is_accessed(&self, upage: usize) -> bool {
        self.entry(upage).is_some_and(|pte| pte.accessed())
    }

    fn set_accessed(&mut self, upage: usize, accessed: bool) {
        if let Some(pte) = self.entry_mut(upage) {
            *pte = pte.with_accessed(accessed);
        }
    }

    fn is_dirty(&self, upage: usize) -> bool {
        self.entry(upage).is_some_and(|pte| pte.dirty())
    }

    fn set_dirty(&mut self, upage: usize, dirty: bool) {
        if let Some(pte) = self.entry_mut(upage) {
            *pte = pte.with_dirty(dirty);
        }
    }

    fn translate(&self, vaddr: usize) -> Option<Translation> {
        if !is_user_vaddr(vaddr) {
            return None;
        }
        self.entry(vaddr).map(|pte| Translation {
            frame: pte.page_frame_address(),
            writable: pte.read_write(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nephron_shared::mem::OFFSET;

    #[test]
    fn install_translate_clear() {
        let mut pd = PageDirectory::new();
        assert!(pd.install_mapping(0x0804_8000, u20::new(3), true));
        assert!(!pd.install_mapping(0x0804_8000, u20::new(4), true));

        let expected = Translation {
            frame: u20::new(3),
            writable: true,
        };
        assert_eq!(pd.translate(0x0804_8abc), Some(expected));
        assert_eq!(pd.translate(0x0804_9000), None);
        assert_eq!(pd.mapped_pages(), 1);

        pd.clear_mapping(0x0804_8000);
        assert_eq!(pd.translate(0x0804_8000), None);
        assert_eq!(pd.mapped_pages(), 0);
    }

    #[test]
    fn tables_are_shared_within_a_directory_slot() {
        let mut pd = PageDirectory::new();
        assert!(pd.install_mapping(0x1000, u20::new(1), false));
        assert!(pd.install_mapping(0x2000, u20::new(2), false));
        assert!(pd.install_mapping(OFFSET - 0x1000, u20::new(3), true));
        assert_eq!(pd.tables.len(), 2);
        assert_eq!(pd.translate(0x2000).map(|t| t.frame), Some(u20::new(2)));
    }

    #[test]
    fn accessed_and_dirty_bits() {
        let mut pd = PageDirectory::new();
        assert!(pd.install_mapping(0x5000, u20::new(0), true));
        assert!(!pd.is_accessed(0x5000));
        assert!(!pd.is_dirty(0x5000));

        pd.set_accessed(0x5000, true);
        pd.set_dirty(0x5000, true);
        assert!(pd.is_accessed(0x5000));
        assert!(pd.is_dirty(0x5000));

        pd.set_accessed(0x5000, false);
        assert!(!pd.is_accessed(0x5000));
        assert!(pd.is_dirty(0x5000));

        // Bits of unmapped pages read as clear and cannot be set.
        pd.set_dirty(0x6000, true);
        assert!(!pd.is_dirty(0x6000));
    }

    #[test]
    fn kernel_addresses_never_translate() {
        let pd = PageDirectory::new();
        assert_eq!(pd.translate(OFFSET), None);
    }
}
