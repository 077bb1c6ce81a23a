use crate::block::block_core::{BlockOp, BlockSector, BLOCK_SECTOR_SIZE};
use crate::block::block_error::BlockError;
use alloc::boxed::Box;
use zerocopy::FromZeroes;

/// A block device driver backed by kernel memory. Its contents are lost when
/// it is dropped, which is all a swap device needs.
pub struct RamDisk {
    sectors: Box<[u8]>,
}

impl RamDisk {
    /// A zeroed disk of `sectors` sectors.
    pub fn new(sectors: BlockSector) -> Self {
        Self {
            sectors: u8::new_box_slice_zeroed(sectors as usize * BLOCK_SECTOR_SIZE),
        }
    }

    fn sector_range(&self, sector: BlockSector) -> Result<core::ops::Range<usize>, BlockError> {
        let start = sector as usize * BLOCK_SECTOR_SIZE;
        let end = start + BLOCK_SECTOR_SIZE;
        if end > self.sectors.len() {
            return Err(BlockError::SectorOutOfBounds);
        }
        Ok(start..end)
    }
}

impl BlockOp for RamDisk {
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        let range = self.sector_range(sector)?;
        buf.copy_from_slice(&self.sectors[range]);
        Ok(())
    }

    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        let range = self.sector_range(sector)?;
        self.sectors[range].copy_from_slice(buf);
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn size(&self) -> BlockSector {
        (self.sectors.len() / BLOCK_SECTOR_SIZE) as BlockSector
    }
}
