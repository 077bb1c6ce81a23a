pub mod frame_allocator;
pub mod user;

use crate::sync::mutex::Mutex;
use alloc::boxed::Box;
use arbitrary_int::u20;
use core::{fmt, ptr::NonNull};
use frame_allocator::{FrameAllocatorSolution, NextFit, PlacementAlgorithm};
use log::info;
use nephron_shared::mem::PAGE_FRAME_SIZE;
use zerocopy::FromZeroes;

/// A physical page, addressed through the kernel's view of memory.
///
/// This is a plain handle: it carries no ownership, and whoever dereferences
/// it must hold the lock of the frame it belongs to.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct KernelPage(NonNull<u8>);

// SAFETY: Access to the page contents is synchronized by the frame lock.
unsafe impl Send for KernelPage {}
unsafe impl Sync for KernelPage {}

impl KernelPage {
    pub fn as_ptr(&self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// # Safety
    ///
    /// Nobody may write to the page while the returned slice is alive.
    pub unsafe fn bytes(&self) -> &[u8] {
        core::slice::from_raw_parts(self.0.as_ptr(), PAGE_FRAME_SIZE)
    }

    /// # Safety
    ///
    /// Nobody else may access the page while the returned slice is alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut(&self) -> &mut [u8] {
        core::slice::from_raw_parts_mut(self.0.as_ptr(), PAGE_FRAME_SIZE)
    }
}

impl fmt::Debug for KernelPage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "KernelPage({:p})", self.0)
    }
}

/// Source of the physical pages user memory lives in.
pub trait PageAllocator: Send + Sync {
    /// Take a page from the pool, zeroing it if `zero` is set. Returns `None`
    /// when the pool is empty.
    fn alloc_page(&self, zero: bool) -> Option<KernelPage>;

    /// Return a page to the pool. Panics if the page is not allocated.
    fn free_page(&self, page: KernelPage);

    /// The physical frame number of `page`, as stored in a page table entry.
    fn frame_number(&self, page: KernelPage) -> u20;

    /// The page with physical frame number `frame_number`.
    fn page(&self, frame_number: u20) -> KernelPage;

    /// Number of pages that can still be allocated.
    fn free_pages(&self) -> usize;

    /// Total number of pages managed.
    fn capacity(&self) -> usize;
}

/// The user page pool: a page arena whose frames are handed out through a
/// core map with a configurable placement algorithm.
pub struct UserPool<P: PlacementAlgorithm = NextFit> {
    base: NonNull<u8>,
    frames: usize,
    allocator: Mutex<FrameAllocatorSolution<P>>,
}

// SAFETY: The arena is only reached through `KernelPage` handles, and the core
// map is behind a lock.
unsafe impl<P: PlacementAlgorithm> Send for UserPool<P> {}
unsafe impl<P: PlacementAlgorithm> Sync for UserPool<P> {}

impl<P: PlacementAlgorithm> UserPool<P> {
    pub fn new(frames: usize) -> Self {
        assert!(frames > 0, "user pool needs at least one frame");
        assert!(
            frames <= 1 << 20,
            "frame numbers must fit in a page table entry"
        );

        let arena = u8::new_box_slice_zeroed(frames * PAGE_FRAME_SIZE);
        let base = NonNull::from(Box::leak(arena)).cast::<u8>();
        info!("user pool: {frames} frames");

        Self {
            base,
            frames,
            allocator: Mutex::new(FrameAllocatorSolution::new(frames)),
        }
    }

    fn index_of(&self, page: KernelPage) -> usize {
        let offset = (page.as_ptr() as usize).wrapping_sub(self.base.as_ptr() as usize);
        assert!(
            offset < self.frames * PAGE_FRAME_SIZE && offset % PAGE_FRAME_SIZE == 0,
            "{page:?} does not belong to this pool"
        );
        offset / PAGE_FRAME_SIZE
    }

    fn page_at(&self, index: usize) -> KernelPage {
        assert!(index < self.frames, "frame {index} out of range");
        // SAFETY: In bounds of the arena, which is never null.
        KernelPage(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(index * PAGE_FRAME_SIZE)) })
    }
}

impl<P: PlacementAlgorithm> PageAllocator for UserPool<P> {
    fn alloc_page(&self, zero: bool) -> Option<KernelPage> {
        let frame = self.allocator.lock().alloc().ok()?;
        let page = self.page_at(frame);
        if zero {
            // SAFETY: The page was just allocated, so nobody else holds it.
            unsafe { page.bytes_mut().fill(0) };
        }
        Some(page)
    }

    fn free_page(&self, page: KernelPage) {
        let index = self.index_of(page);
        self.allocator.lock().dealloc(index);
    }

    #[allow(clippy::cast_possible_truncation)]
    fn frame_number(&self, page: KernelPage) -> u20 {
        u20::new(self.index_of(page) as u32)
    }

    fn page(&self, frame_number: u20) -> KernelPage {
        self.page_at(frame_number.value() as usize)
    }

    fn free_pages(&self) -> usize {
        self.allocator.lock().frames_free()
    }

    fn capacity(&self) -> usize {
        self.frames
    }
}

impl<P: PlacementAlgorithm> Drop for UserPool<P> {
    fn drop(&mut self) {
        let arena = core::ptr::slice_from_raw_parts_mut(
            self.base.as_ptr(),
            self.frames * PAGE_FRAME_SIZE,
        );
        // SAFETY: Created by `Box::leak` in `new` with the same length.
        drop(unsafe { Box::from_raw(arena) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frame_allocator::FirstFit;

    #[test]
    fn pages_round_trip_through_frame_numbers() {
        let pool = UserPool::<NextFit>::new(4);
        let page = pool.alloc_page(false).expect("pool has room");
        let number = pool.frame_number(page);
        assert_eq!(pool.page(number), page);
        assert_eq!(pool.free_pages(), 3);
        pool.free_page(page);
        assert_eq!(pool.free_pages(), 4);
    }

    #[test]
    fn exhausts_and_refills() {
        let pool = UserPool::<FirstFit>::new(2);
        let a = pool.alloc_page(false).expect("first page");
        let b = pool.alloc_page(false).expect("second page");
        assert_ne!(a, b);
        assert!(pool.alloc_page(false).is_none());
        pool.free_page(a);
        assert_eq!(pool.alloc_page(false), Some(a));
    }

    #[test]
    fn zeroes_on_request() {
        let pool = UserPool::<FirstFit>::new(1);
        let page = pool.alloc_page(false).expect("pool has room");
        unsafe { page.bytes_mut().fill(0xEE) };
        pool.free_page(page);

        let page = pool.alloc_page(false).expect("pool has room");
        assert!(unsafe { page.bytes() }.iter().all(|&b| b == 0xEE));
        pool.free_page(page);

        let page = pool.alloc_page(true).expect("pool has room");
        assert!(unsafe { page.bytes() }.iter().all(|&b| b == 0));
    }

    #[test]
    #[should_panic(expected = "does not belong to this pool")]
    fn rejects_foreign_pages() {
        let a = UserPool::<FirstFit>::new(1);
        let b = UserPool::<FirstFit>::new(1);
        let page = b.alloc_page(false).expect("pool has room");
        a.free_page(page);
    }
}
