//! Demand-paged virtual memory.
//!
//! Every process owns an [`AddressSpace`]; all of them share one
//! [`VmSystem`], which owns the frame table, the swap space and the physical
//! page pool. Pages are registered with a backing and loaded on first touch by
//! [`VmSystem::resolve_fault`].

pub mod file;
pub mod frame;
pub mod mmap;
pub mod page;
pub mod swap;


use crate::block::block_core::{Block, BlockDriver, BlockType};
use crate::drivers::ram_disk::RamDisk;
use crate::mem::frame_allocator::{BestFit, FirstFit, NextFit};
use crate::mem::{PageAllocator, UserPool};
use crate::paging::{HardwarePageTable, PageDirectory};
use crate::sync::{self, mutex::Mutex};
use alloc::{sync::Arc, vec::Vec};
use core::{cmp::min, fmt};
use file::File;
use frame::FrameTable;
use log::{debug, info, trace, warn};
use mmap::{MapId, MmapRegistry};
use nephron_shared::{
    mem::{
        is_page_aligned, is_user_vaddr, page_round_down, DEFAULT_USER_FRAMES, OFFSET,
        PAGE_FRAME_SIZE, STACK_ACCESS_SLACK, USER_STACK_LIMIT,
    },
    sizes::SWAP_SECTORS,
};
use page::{Backing, FileExtent, PageError, PageState, SupplementalPageTable};
use swap::SwapSpace;

pub type Pid = u16;

/// How the user pool picks a free frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    NextFit,
    FirstFit,
    BestFit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Physical frames available to user pages.
    pub user_frames: usize,
    /// Size of the swap device in sectors.
    pub swap_sectors: u32,
    /// How far below [`OFFSET`] the stack may grow.
    pub stack_limit: usize,
    pub placement: Placement,
}

impl VmConfig {
    pub const DEFAULT: Self = Self {
        user_frames: DEFAULT_USER_FRAMES,
        swap_sectors: SWAP_SECTORS,
        stack_limit: USER_STACK_LIMIT,
        placement: Placement::NextFit,
    };

    pub const fn with_user_frames(self, user_frames: usize) -> Self {
        Self {
            user_frames,
            ..self
        }
    }

    pub const fn with_swap_sectors(self, swap_sectors: u32) -> Self {
        Self {
            swap_sectors,
            ..self
        }
    }

    pub const fn with_stack_limit(self, stack_limit: usize) -> Self {
        Self {
            stack_limit,
            ..self
        }
    }

    pub const fn with_placement(self, placement: Placement) -> Self {
        Self { placement, ..self }
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// A page fault as the trap handler reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    pub addr: usize,
    /// The user stack pointer at the time of the fault, if known.
    pub esp: Option<usize>,
    pub write: bool,
}

impl PageFault {
    pub const fn read(addr: usize) -> Self {
        Self {
            addr,
            esp: None,
            write: false,
        }
    }

    pub const fn write(addr: usize) -> Self {
        Self {
            addr,
            esp: None,
            write: true,
        }
    }

    pub const fn with_esp(self, esp: usize) -> Self {
        Self {
            esp: Some(esp),
            ..self
        }
    }
}

/// Why a fault could not be resolved. All of these kill the faulting process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// Nothing is registered at the address and the stack may not grow there.
    Unmapped,
    /// Write to a read-only page, or a fault on a page that is already
    /// resident.
    ProtectionViolation,
    /// The address belongs to the kernel.
    KernelAddress,
    /// The page's contents could not be read.
    LoadFailed,
}

impl fmt::Display for FaultError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Unmapped => write!(f, "unmapped address"),
            Self::ProtectionViolation => write!(f, "protection violation"),
            Self::KernelAddress => write!(f, "kernel address"),
            Self::LoadFailed => write!(f, "page could not be loaded"),
        }
    }
}

impl core::error::Error for FaultError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmapError {
    /// Mapping at address 0.
    NullAddress,
    /// Address not page aligned.
    Misaligned,
    /// Mapping would touch kernel memory.
    KernelAddress,
    /// Nothing to map.
    EmptyFile,
    /// Some page of the range is already in use.
    Overlaps,
}

impl fmt::Display for MmapError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NullAddress => write!(f, "cannot map at address 0"),
            Self::Misaligned => write!(f, "address is not page aligned"),
            Self::KernelAddress => write!(f, "mapping would reach kernel memory"),
            Self::EmptyFile => write!(f, "file is empty"),
            Self::Overlaps => write!(f, "range overlaps existing pages"),
        }
    }
}

impl core::error::Error for MmapError {}

impl From<PageError> for MmapError {
    fn from(_: PageError) -> Self {
        Self::Overlaps
    }
}

/// The virtual memory of one process.
pub struct AddressSpace {
    pid: Pid,
    stack_limit: usize,
    pub(crate) spt: Mutex<SupplementalPageTable>,
    pub(crate) page_dir: Mutex<PageDirectory>,
    pub(crate) mmaps: Mutex<MmapRegistry>,
}

impl AddressSpace {
    fn new(pid: Pid, stack_limit: usize) -> Self {
        Self {
            pid,
            stack_limit,
            spt: Mutex::new(SupplementalPageTable::new()),
            page_dir: Mutex::new(PageDirectory::new()),
            mmaps: Mutex::new(MmapRegistry::new()),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Whether touching `vaddr` should grow the stack: it must lie in the
    /// stack region, and no further below the stack pointer (when known) than
    /// a `PUSHA` reaches.
    pub fn grow_stack_eligible(&self, vaddr: usize, esp: Option<usize>) -> bool {
        let in_region = vaddr < OFFSET && vaddr >= OFFSET.saturating_sub(self.stack_limit);
        in_region && esp.map_or(true, |esp| vaddr >= esp.saturating_sub(STACK_ACCESS_SLACK))
    }

    pub fn supplemental_page_table(&self) -> &Mutex<SupplementalPageTable> {
        &self.spt
    }

    pub fn page_directory(&self) -> &Mutex<PageDirectory> {
        &self.page_dir
    }

    pub fn mappings(&self) -> &Mutex<MmapRegistry> {
        &self.mmaps
    }
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mappings = self.mmaps.lock().len();
        let spt = self.spt.lock();
        write!(f, "pid {}: {}, {} mappings", self.pid, *spt, mappings)
    }
}

/// The virtual memory system shared by all processes.
pub struct VmSystem {
    config: VmConfig,
    pool: Arc<dyn PageAllocator>,
    swap: Arc<SwapSpace>,
    frames: FrameTable,
}

impl VmSystem {
    /// Bring up a system with a RAM disk as swap device.
    pub fn new(config: VmConfig) -> Self {
        let pool: Arc<dyn PageAllocator> = match config.placement {
            Placement::NextFit => Arc::new(UserPool::<NextFit>::new(config.user_frames)),
            Placement::FirstFit => Arc::new(UserPool::<FirstFit>::new(config.user_frames)),
            Placement::BestFit => Arc::new(UserPool::<BestFit>::new(config.user_frames)),
        };
        let swap = Block::new(
            "swap",
            BlockType::Swap,
            BlockDriver::RamDisk(RamDisk::new(config.swap_sectors)),
        );
        Self::with_parts(config, pool, swap)
    }

    pub fn with_parts(config: VmConfig, pool: Arc<dyn PageAllocator>, swap_device: Block) -> Self {
        assert_eq!(
            swap_device.get_type(),
            BlockType::Swap,
            "{swap_device} is not a swap device"
        );
        let swap = Arc::new(SwapSpace::new(swap_device));
        let frames = FrameTable::new(Arc::clone(&pool), Arc::clone(&swap));
        info!("vm: {} user frames, {}", pool.capacity(), swap);

        Self {
            config,
            pool,
            swap,
            frames,
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapSpace {
        &self.swap
    }

    pub fn pool(&self) -> &Arc<dyn PageAllocator> {
        &self.pool
    }

    pub fn create_address_space(&self, pid: Pid) -> Arc<AddressSpace> {
        debug!("vm: new address space for pid {}", pid);
        Arc::new(AddressSpace::new(pid, self.config.stack_limit))
    }

    /// Make the page containing `fault.addr` resident, loading it from its
    /// backing or growing the stack.
    pub fn resolve_fault(
        &self,
        space: &Arc<AddressSpace>,
        fault: &PageFault,
    ) -> Result<(), FaultError> {
        if !is_user_vaddr(fault.addr) {
            return Err(FaultError::KernelAddress);
        }
        let upage = page_round_down(fault.addr);

        let (backing, writable) = loop {
            let mut spt = space.spt.lock();
            if !spt.contains(upage) {
                if !space.grow_stack_eligible(fault.addr, fault.esp) {
                    return Err(FaultError::Unmapped);
                }
                debug!("vm: pid {} grows stack to {:#x}", space.pid, upage);
                spt.register(upage, Backing::Swap { slot: None }, true)
                    .map_err(|_| FaultError::Unmapped)?;
            }
            let Some(entry) = spt.get_mut(upage) else {
                return Err(FaultError::Unmapped);
            };
            if fault.write && !entry.writable {
                return Err(FaultError::ProtectionViolation);
            }
            match entry.state {
                // The page is mapped, so the access itself was refused.
                PageState::Resident(_) => return Err(FaultError::ProtectionViolation),
                PageState::InTransit => {
                    drop(spt);
                    sync::relax();
                }
                PageState::Absent => {
                    entry.state = PageState::InTransit;
                    break (entry.backing.clone(), entry.writable);
                }
            }
        };

        trace!("vm: pid {} loads {:#x} from {}", space.pid, upage, backing);
        let frame = self
            .frames
            .allocate(space, upage, writable, backing.needs_zero_fill());

        let page = frame.page();
        // SAFETY: The frame is pinned and not mapped anywhere yet.
        let contents = unsafe { page.bytes_mut() };
        let loaded = match &backing {
            Backing::Swap { slot: None } => Ok(false),
            Backing::Swap { slot: Some(slot) } => self
                .swap
                .swap_in(*slot, contents)
                .map(|()| true)
                .map_err(|err| {
                    warn!("vm: swap read of {} failed: {}", slot, err);
                    FaultError::LoadFailed
                }),
            Backing::File(extent) | Backing::MemoryMapped { extent, .. } => {
                extent.load(contents).map(|()| false)
            }
        };

        let swapped_in = match loaded {
            Ok(swapped_in) => swapped_in,
            Err(err) => {
                self.frames.free(frame);
                if let Some(entry) = space.spt.lock().get_mut(upage) {
                    entry.state = PageState::Absent;
                }
                return Err(err);
            }
        };

        let frame_number = self.pool.frame_number(frame.page());
        let mut spt = space.spt.lock();
        let Some(entry) = spt.get_mut(upage) else {
            panic!("page {upage:#x} vanished while loading");
        };
        let installed = space
            .page_dir
            .lock()
            .install_mapping(upage, frame_number, writable);
        assert!(installed, "page {upage:#x} mapped twice");
        entry.state = PageState::Resident(frame.id());
        if swapped_in {
            // The slot is gone, so memory holds the only copy.
            entry.backing = Backing::Swap { slot: None };
            entry.dirty = true;
        }
        drop(spt);
        drop(frame);
        Ok(())
    }

    /// Register one page of `file`: `read_len` bytes from `offset`, then
    /// `zero_len` zeroes. Returns `false` if the page is already registered or
    /// the two lengths do not add up to one page.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn register_file_backed(
        &self,
        space: &AddressSpace,
        upage: usize,
        file: Arc<dyn File>,
        offset: u64,
        read_len: usize,
        zero_len: usize,
        writable: bool,
    ) -> bool {
        if !is_page_aligned(upage) || !is_user_vaddr(upage) {
            return false;
        }
        if read_len.checked_add(zero_len) != Some(PAGE_FRAME_SIZE) {
            debug!("vm: extent at {:#x} does not cover one page", upage);
            return false;
        }
        let extent = FileExtent::new(file, offset, read_len, zero_len);
        space
            .spt
            .lock()
            .register(upage, Backing::File(extent), writable)
            .is_ok()
    }

    /// Register a whole executable segment, one page at a time. On failure no
    /// page of the segment stays registered.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn load_segment(
        &self,
        space: &Arc<AddressSpace>,
        file: Arc<dyn File>,
        offset: u64,
        upage: usize,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> bool {
        assert_eq!((read_bytes + zero_bytes) % PAGE_FRAME_SIZE, 0);
        assert!(is_page_aligned(upage));

        let pages = (read_bytes + zero_bytes) / PAGE_FRAME_SIZE;
        let mut registered = Vec::with_capacity(pages);
        let mut remaining = read_bytes;
        for i in 0..pages {
            let page = upage + i * PAGE_FRAME_SIZE;
            let read = min(remaining, PAGE_FRAME_SIZE);
            let page_offset = offset + (i * PAGE_FRAME_SIZE) as u64;
            if !self.register_file_backed(
                space,
                page,
                Arc::clone(&file),
                page_offset,
                read,
                PAGE_FRAME_SIZE - read,
                writable,
            ) {
                debug!("vm: segment page {:#x} collides, unwinding", page);
                for page in registered {
                    self.release_page(space, page);
                }
                return false;
            }
            registered.push(page);
            remaining -= read;
        }
        true
    }

    /// Give a new process its first stack page, resident right away.
    #[must_use]
    pub fn setup_stack(&self, space: &Arc<AddressSpace>) -> bool {
        let upage = OFFSET - PAGE_FRAME_SIZE;
        if space
            .spt
            .lock()
            .register(upage, Backing::Swap { slot: None }, true)
            .is_err()
        {
            return false;
        }
        if self.resolve_fault(space, &PageFault::write(upage)).is_err() {
            self.release_page(space, upage);
            return false;
        }
        true
    }

    /// Map all of `file` at `addr`.
    pub fn register_mapping(
        &self,
        space: &Arc<AddressSpace>,
        file: Arc<dyn File>,
        addr: usize,
    ) -> Result<MapId, MmapError> {
        if addr == 0 {
            return Err(MmapError::NullAddress);
        }
        if !is_page_aligned(addr) {
            return Err(MmapError::Misaligned);
        }
        if !is_user_vaddr(addr) {
            return Err(MmapError::KernelAddress);
        }
        let length = file.length();
        if length == 0 {
            return Err(MmapError::EmptyFile);
        }
        let length = usize::try_from(length).map_err(|_| MmapError::KernelAddress)?;
        let pages = length.div_ceil(PAGE_FRAME_SIZE);
        let end = pages
            .checked_mul(PAGE_FRAME_SIZE)
            .and_then(|size| addr.checked_add(size))
            .filter(|&end| end <= OFFSET)
            .ok_or(MmapError::KernelAddress)?;

        let mut mmaps = space.mmaps.lock();
        let id = mmaps.next_id();
        {
            let mut spt = space.spt.lock();
            for (i, upage) in (addr..end).step_by(PAGE_FRAME_SIZE).enumerate() {
                let read_bytes = min(PAGE_FRAME_SIZE, length - i * PAGE_FRAME_SIZE);
                let extent = FileExtent::new(
                    Arc::clone(&file),
                    (i * PAGE_FRAME_SIZE) as u64,
                    read_bytes,
                    PAGE_FRAME_SIZE - read_bytes,
                );
                let registered =
                    spt.register(upage, Backing::MemoryMapped { extent, mapping: id }, true);
                if let Err(err) = registered {
                    // Nothing registered here can have been touched: we still
                    // hold the table.
                    for upage in (addr..upage).step_by(PAGE_FRAME_SIZE) {
                        spt.unregister(upage);
                    }
                    debug!("vm: mmap at {:#x} failed: {}", addr, err);
                    return Err(err.into());
                }
            }
        }

        let inserted = mmaps.insert(file);
        debug_assert_eq!(inserted, id);
        for upage in (addr..end).step_by(PAGE_FRAME_SIZE) {
            mmaps.add(id, upage);
        }
        debug!(
            "vm: pid {} mapped {} pages at {:#x} as {}",
            space.pid, pages, addr, id
        );
        Ok(id)
    }

    /// Remove mapping `id`, writing back its modified pages. Unknown ids are
    /// ignored.
    pub fn unmap(&self, space: &Arc<AddressSpace>, id: MapId) {
        let Some(mapping) = space.mmaps.lock().remove_all(id) else {
            debug!("vm: pid {} has no mapping {}", space.pid, id);
            return;
        };
        for upage in mapping.pages {
            self.release_page(space, upage);
        }
    }

    /// Release everything a process holds: write back modified mapped pages,
    /// free every frame and swap slot, and empty its tables.
    pub fn teardown(&self, space: &Arc<AddressSpace>) {
        let mappings = space.mmaps.lock().drain();
        for (_, mapping) in mappings {
            for upage in mapping.pages {
                self.release_page(space, upage);
            }
        }

        let upages = space.spt.lock().upages();
        for upage in upages {
            self.release_page(space, upage);
        }
        debug!("vm: pid {} torn down", space.pid);
    }

    /// Evict one frame from anywhere in the system.
    pub fn evict_one(&self) -> bool {
        self.frames.evict_one()
    }

    /// Drop `upage` from `space`, whatever its state: write it back if it is
    /// a modified mapped page, free its frame or swap slot, unregister it.
    fn release_page(&self, space: &Arc<AddressSpace>, upage: usize) {
        loop {
            let state = space.spt.lock().state(upage);
            match state {
                None => return,
                Some(PageState::InTransit) => sync::relax(),
                Some(PageState::Absent) => {
                    let mut spt = space.spt.lock();
                    if spt.state(upage) != Some(PageState::Absent) {
                        continue;
                    }
                    let entry = spt.unregister(upage);
                    drop(spt);
                    if let Some(Backing::Swap { slot: Some(slot) }) = entry.map(|entry| entry.backing) {
                        self.swap.free(slot);
                    }
                    return;
                }
                Some(PageState::Resident(id)) => {
                    // Gone means the clock took it; wait for the entry to settle.
                    let Some(frame) = self.frames.lock(id) else {
                        sync::relax();
                        continue;
                    };

                    let (backing, dirty) = {
                        let mut spt = space.spt.lock();
                        let Some(entry) = spt.get_mut(upage) else {
                            continue;
                        };
                        if entry.state != PageState::Resident(id) {
                            continue;
                        }
                        entry.state = PageState::InTransit;
                        let mut page_dir = space.page_dir.lock();
                        let dirty = page_dir.is_dirty(upage) || entry.dirty;
                        page_dir.clear_mapping(upage);
                        (entry.backing.clone(), dirty)
                    };

                    if let Backing::MemoryMapped { extent, .. } = &backing {
                        if dirty {
                            // SAFETY: The frame is locked and no longer mapped.
                            extent.write_back(unsafe { frame.page().bytes() });
                        }
                    }
                    self.frames.free(frame);
                    space.spt.lock().unregister(upage);
                    return;
                }
            }
        }
    }
}

impl fmt::Display for VmSystem {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}; {}", self.frames, self.swap)
    }
}
