//! Frame placement policies for the core map.

use super::{AllocError, CoreMapEntry};

/// A placement algorithm for allocating frames.
pub trait PlacementAlgorithm: Default + Send {
    /// Returns [`Ok`] containing the number of a free frame.
    ///
    /// # Errors
    ///
    /// If every frame is allocated, the function returns an error.
    fn place(&mut self, core_map: &[CoreMapEntry]) -> Result<usize, AllocError>;
}

/// Continues searching where the previous allocation ended.
#[derive(Default)]
pub struct NextFit {
    position: usize,
}

/// Takes the lowest-numbered free frame.
#[derive(Default)]
pub struct FirstFit;

/// Takes a frame from the smallest run of free frames, leaving long runs whole.
#[derive(Default)]
pub struct BestFit;

/// Length of the run of free frames starting at `start`.
fn free_run(core_map: &[CoreMapEntry], start: usize) -> usize {
    core_map[start..]
        .iter()
        .take_while(|entry| !entry.allocated())
        .count()
}

impl PlacementAlgorithm for NextFit {
    fn place(&mut self, core_map: &[CoreMapEntry]) -> Result<usize, AllocError> {
        let total_frames = core_map.len();
        let frame = (0..total_frames)
            .map(|step| (self.position + step) % total_frames)
            .find(|&frame| !core_map[frame].allocated())
            .ok_or(AllocError)?;
        self.position = (frame + 1) % total_frames;
        Ok(frame)
    }
}

impl PlacementAlgorithm for FirstFit {
    fn place(&mut self, core_map: &[CoreMapEntry]) -> Result<usize, AllocError> {
        core_map
            .iter()
            .position(|entry| !entry.allocated())
            .ok_or(AllocError)
    }
}

impl PlacementAlgorithm for BestFit {
    fn place(&mut self, core_map: &[CoreMapEntry]) -> Result<usize, AllocError> {
        let mut best: Option<(usize, usize)> = None;
        let mut start = 0;
        while start < core_map.len() {
            let run = free_run(core_map, start);
            if run == 1 {
                return Ok(start);
            }
            if run > 0 && best.map_or(true, |(_, size)| run < size) {
                best = Some((start, run));
            }
            // Skip past the allocated frame that ended the run.
            start += run + 1;
        }

        best.map(|(start, _)| start).ok_or(AllocError)
    }
}
