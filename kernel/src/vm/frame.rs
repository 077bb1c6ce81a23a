//! The global frame table: every physical frame holding a user page, and the
//! clock (second chance) replacement that reclaims them under pressure.
//!
//! Locks are taken in the order frame table, frame, supplemental page table,
//! page directory. The clock only ever `try_lock`s frames, so a thread holding
//! a frame may still take the table lock to release it.

use super::page::{Backing, PageState};
use super::swap::SwapSpace;
use super::AddressSpace;
use crate::mem::{KernelPage, PageAllocator};
use crate::paging::HardwarePageTable;
use crate::sync::mutex::{ArcMutexGuard, Mutex};
use alloc::{collections::BTreeMap, sync::Arc};
use core::ops::{Bound, Deref};
use core::fmt;
use log::{debug, trace, warn};

/// Handle of a live frame. Ids are never reused, and order frames by age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(u64);

impl FrameId {
    #[cfg(test)]
    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "frame {}", self.0)
    }
}

pub struct Frame {
    page: KernelPage,
    owner: Arc<AddressSpace>,
    upage: usize,
    writable: bool,
}

impl Frame {
    pub fn page(&self) -> KernelPage {
        self.page
    }

    pub fn owner(&self) -> &Arc<AddressSpace> {
        &self.owner
    }

    pub fn upage(&self) -> usize {
        self.upage
    }

    pub fn writable(&self) -> bool {
        self.writable
    }
}

/// A frame locked by its user. The clock passes over it until it is dropped.
pub struct PinnedFrame {
    id: FrameId,
    frame: ArcMutexGuard<Frame>,
}

impl PinnedFrame {
    pub fn id(&self) -> FrameId {
        self.id
    }
}

impl Deref for PinnedFrame {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        &self.frame
    }
}

struct Clock {
    /// Live frames. Ids increase with age, so this is also the FIFO ring.
    frames: BTreeMap<FrameId, Arc<Mutex<Frame>>>,
    /// The frame looked at last. May have been removed since.
    hand: Option<FrameId>,
    next_id: u64,
    evictions: u64,
}

impl Clock {
    /// Move the hand to the next frame in the ring.
    fn advance(&mut self) -> Option<FrameId> {
        let after_hand = self.hand.and_then(|hand| {
            self.frames
                .range((Bound::Excluded(hand), Bound::Unbounded))
                .next()
                .map(|(id, _)| *id)
        });
        let next = after_hand.or_else(|| self.frames.keys().next().copied())?;
        self.hand = Some(next);
        Some(next)
    }

    /// Sweep for a frame that is neither pinned nor recently accessed,
    /// clearing accessed bits on the way. Two full sweeps always suffice
    /// unless every frame is pinned.
    fn select_victim(&mut self) -> Option<(FrameId, ArcMutexGuard<Frame>)> {
        for _ in 0..2 * self.frames.len() {
            let id = self.advance()?;
            let Some(frame) = Mutex::try_lock_arc(&self.frames[&id]) else {
                trace!("clock: {} is pinned", id);
                continue;
            };

            let mut page_dir = frame.owner.page_dir.lock();
            if page_dir.is_accessed(frame.upage) {
                page_dir.set_accessed(frame.upage, false);
                continue;
            }
            drop(page_dir);
            return Some((id, frame));
        }
        None
    }
}

pub struct FrameTable {
    clock: Mutex<Clock>,
    pool: Arc<dyn PageAllocator>,
    swap: Arc<SwapSpace>,
}

impl FrameTable {
    pub fn new(pool: Arc<dyn PageAllocator>, swap: Arc<SwapSpace>) -> Self {
        Self {
            clock: Mutex::new(Clock {
                frames: BTreeMap::new(),
                hand: None,
                next_id: 0,
                evictions: 0,
            }),
            pool,
            swap,
        }
    }

    /// Get a frame for `upage` of `owner`, evicting another one if the pool
    /// is empty. The frame comes back pinned.
    ///
    /// # Panics
    ///
    /// Panics if the pool is empty and every frame is pinned.
    pub fn allocate(
        &self,
        owner: &Arc<AddressSpace>,
        upage: usize,
        writable: bool,
        zero_fill: bool,
    ) -> PinnedFrame {
        let page = match self.pool.alloc_page(zero_fill) {
            Some(page) => page,
            None => {
                let Some(page) = self.reclaim() else {
                    panic!("out of frames: every frame is pinned");
                };
                if zero_fill {
                    // SAFETY: Reclaimed pages are unmapped and unowned.
                    unsafe { page.bytes_mut().fill(0) };
                }
                page
            }
        };

        let frame = Arc::new(Mutex::new(Frame {
            page,
            owner: Arc::clone(owner),
            upage,
            writable,
        }));
        // Nobody else can see the frame yet, so this cannot block.
        let guard = Mutex::lock_arc(&frame);

        let mut clock = self.clock.lock();
        let id = FrameId(clock.next_id);
        clock.next_id += 1;
        clock.frames.insert(id, frame);
        trace!("frames: {} for {:#x} (pid {})", id, upage, owner.pid());

        PinnedFrame { id, frame: guard }
    }

    /// Evict one frame and return its page to the pool. Returns `false` if
    /// every frame is pinned.
    pub fn evict_one(&self) -> bool {
        match self.reclaim() {
            Some(page) => {
                self.pool.free_page(page);
                true
            }
            None => false,
        }
    }

    /// Release a frame without looking at its contents. The caller has
    /// already cleared its mapping and written back whatever needed it.
    pub fn free(&self, frame: PinnedFrame) {
        let removed = self.clock.lock().frames.remove(&frame.id);
        assert!(removed.is_some(), "freeing unknown {}", frame.id);
        trace!("frames: freed {}", frame.id);
        self.pool.free_page(frame.page);
    }

    /// Lock a live frame, waiting for whoever holds it. `None` if the frame
    /// is gone.
    pub fn lock(&self, id: FrameId) -> Option<PinnedFrame> {
        let frame = self.get(id)?;
        Some(PinnedFrame {
            id,
            frame: Mutex::lock_arc(&frame),
        })
    }

    pub(crate) fn get(&self, id: FrameId) -> Option<Arc<Mutex<Frame>>> {
        self.clock.lock().frames.get(&id).cloned()
    }

    /// Number of live frames.
    pub fn len(&self) -> usize {
        self.clock.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of frames evicted so far.
    pub fn evictions(&self) -> u64 {
        self.clock.lock().evictions
    }

    /// Pick a victim, save its contents where its page entry says, and hand
    /// back its physical page.
    fn reclaim(&self) -> Option<KernelPage> {
        let mut clock = self.clock.lock();
        let (id, victim) = clock.select_victim()?;
        clock.frames.remove(&id);
        clock.evictions += 1;

        let owner = Arc::clone(&victim.owner);
        let upage = victim.upage;
        let (backing, dirty) = {
            let mut spt = owner.spt.lock();
            let Some(entry) = spt.get_mut(upage) else {
                panic!("{id} backs unknown page {upage:#x}");
            };
            assert_eq!(entry.state, PageState::Resident(id));
            entry.state = PageState::InTransit;

            let mut page_dir = owner.page_dir.lock();
            let dirty = page_dir.is_dirty(upage) || entry.dirty;
            page_dir.clear_mapping(upage);
            (entry.backing.clone(), dirty)
        };
        drop(clock);

        debug!(
            "evict: {} ({:#x} pid {}, {}{})",
            id,
            upage,
            owner.pid(),
            backing,
            if dirty { ", dirty" } else { "" }
        );
        let backing = self.write_out(&victim, backing, dirty);

        let mut spt = owner.spt.lock();
        let Some(entry) = spt.get_mut(upage) else {
            panic!("page {upage:#x} vanished during eviction");
        };
        entry.state = PageState::Absent;
        entry.backing = backing;
        entry.dirty = false;

        Some(victim.page)
    }

    /// Save the victim's contents if they would otherwise be lost. Returns
    /// the page's new backing.
    fn write_out(&self, victim: &Frame, backing: Backing, dirty: bool) -> Backing {
        if !dirty {
            return backing;
        }
        // SAFETY: The frame is locked and no longer mapped.
        let contents = unsafe { victim.page.bytes() };

        match backing {
            Backing::Swap { .. } | Backing::File(_) => match self.swap.swap_out(contents) {
                Ok(slot) => Backing::Swap { slot: Some(slot) },
                Err(err) => {
                    warn!("evict: swap write failed, page {:#x} lost: {}", victim.upage, err);
                    Backing::Swap { slot: None }
                }
            },
            Backing::MemoryMapped { extent, mapping } => {
                extent.write_back(contents);
                Backing::MemoryMapped { extent, mapping }
            }
        }
    }
}

impl fmt::Display for FrameTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let clock = self.clock.lock();
        write!(
            f,
            "frames: {} live, {} evicted, {} free",
            clock.frames.len(),
            clock.evictions,
            self.pool.free_pages()
        )
    }
}
