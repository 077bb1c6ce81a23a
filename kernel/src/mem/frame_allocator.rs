mod placement_algorithms;

pub use placement_algorithms::{BestFit, FirstFit, NextFit, PlacementAlgorithm};

use alloc::{boxed::Box, vec};
use bitbybit::bitfield;
use core::fmt;

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
}

/// Every frame is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("out of physical frames")
    }
}

impl core::error::Error for AllocError {}

/// Tracks which frames of a region are in use, one [`CoreMapEntry`] per frame.
pub struct FrameAllocatorSolution<P> {
    core_map: Box<[CoreMapEntry]>,
    placement: P,
    frames_allocated: usize,
}

impl<P: PlacementAlgorithm> FrameAllocatorSolution<P> {
    pub fn new(num_frames: usize) -> Self {
        Self {
            core_map: vec![CoreMapEntry::DEFAULT; num_frames].into_boxed_slice(),
            placement: P::default(),
            frames_allocated: 0,
        }
    }

    /// Allocate one frame, returning its frame number.
    pub fn alloc(&mut self) -> Result<usize, AllocError> {
        if self.frames_allocated == self.core_map.len() {
            return Err(AllocError);
        }

        let frame = self.placement.place(&self.core_map)?;
        assert!(!self.core_map[frame].allocated(), "frame {frame} allocated twice");
        self.core_map[frame] = CoreMapEntry::DEFAULT.with_allocated(true);
        self.frames_allocated += 1;
        Ok(frame)
    }

    pub fn dealloc(&mut self, frame: usize) {
        assert!(
            self.core_map[frame].allocated(),
            "freeing unallocated frame {frame}"
        );
        self.core_map[frame] = CoreMapEntry::DEFAULT;
        self.frames_allocated -= 1;
    }

    pub fn is_allocated(&self, frame: usize) -> bool {
        self.core_map.get(frame).is_some_and(|entry| entry.allocated())
    }

    pub fn frames_free(&self) -> usize {
        self.core_map.len() - self.frames_allocated
    }

    pub fn len(&self) -> usize {
        self.core_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.core_map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_allocated_frames() {
        let mut allocator = FrameAllocatorSolution::<FirstFit>::new(4);
        assert_eq!(allocator.alloc(), Ok(0));
        assert_eq!(allocator.alloc(), Ok(1));
        assert_eq!(allocator.frames_free(), 2);

        allocator.dealloc(0);
        assert!(!allocator.is_allocated(0));
        assert!(allocator.is_allocated(1));
        assert!(!allocator.is_allocated(9));
        assert_eq!(allocator.frames_free(), 3);

        assert_eq!(allocator.alloc(), Ok(0));
    }

    #[test]
    fn refuses_when_full() {
        let mut allocator = FrameAllocatorSolution::<NextFit>::new(2);
        assert_eq!(allocator.alloc(), Ok(0));
        assert_eq!(allocator.alloc(), Ok(1));
        assert_eq!(allocator.alloc(), Err(AllocError));
        allocator.dealloc(0);
        assert_eq!(allocator.alloc(), Ok(0));
    }

    #[test]
    #[should_panic(expected = "freeing unallocated frame")]
    fn double_free_panics() {
        let mut allocator = FrameAllocatorSolution::<FirstFit>::new(2);
        let frame = allocator.alloc().expect("room for one frame");
        allocator.dealloc(frame);
        allocator.dealloc(frame);
    }
}
