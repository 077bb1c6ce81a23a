use crate::block::block_error::BlockError;
use crate::drivers::ram_disk::RamDisk;
use alloc::string::String;
use core::fmt;
use log::trace;
use nephron_shared::sizes::SECTOR_SIZE;

/// Size of a block device sector in bytes.
///
/// All IDE disks use this sector size, as do most USB and SCSI disks.
pub const BLOCK_SECTOR_SIZE: usize = SECTOR_SIZE as usize;

/// Index of a block device sector.
///
/// Good enough for devices up to 2 TB.
pub type BlockSector = u32;

/// Types of blocks
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum BlockType {
    /// Scratch
    Scratch,
    /// Swap
    Swap,
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BlockType::Scratch => write!(f, "Scratch"),
            BlockType::Swap => write!(f, "Swap"),
        }
    }
}

/// Lower-level interface to block device drivers
pub trait BlockOp {
    /// Read a block sector
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError>;
    /// Write a block sector
    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError>;
    /// Number of sectors on the device
    fn size(&self) -> BlockSector;
}

/// Supported block drivers
pub enum BlockDriver {
    RamDisk(RamDisk),
}

impl BlockDriver {
    fn op(&mut self) -> &mut dyn BlockOp {
        match self {
            BlockDriver::RamDisk(driver) => driver,
        }
    }

    fn size(&self) -> BlockSector {
        match self {
            BlockDriver::RamDisk(driver) => driver.size(),
        }
    }
}

/// A block device
pub struct Block {
    /// The name of the block device
    block_name: String,

    /// The type of block
    block_type: BlockType,
    /// The block driver
    driver: BlockDriver,

    /// The size of the block device in sectors
    block_size: BlockSector,

    /// The read count
    read_count: u32,
    /// The write count
    write_count: u32,
}

impl Block {
    pub fn new(block_name: &str, block_type: BlockType, driver: BlockDriver) -> Self {
        let block_size = driver.size();
        Self {
            block_name: block_name.into(),
            block_type,
            driver,
            block_size,
            read_count: 0,
            write_count: 0,
        }
    }

    /// Verifies that `buf` is a valid buffer for reading or writing a block sector.
    fn verify_buffer(buf: &[u8]) -> Result<(), BlockError> {
        if buf.len() != BLOCK_SECTOR_SIZE {
            return Err(BlockError::BufferInvalid);
        }
        Ok(())
    }

    /// Verifies that `sector` is a valid offset within the block device.
    fn check_sector(&self, sector: BlockSector) -> Result<(), BlockError> {
        if sector >= self.block_size {
            return Err(BlockError::SectorOutOfBounds);
        }
        Ok(())
    }

    /// Reads sector `sector` from the block device into `buf`, which must have room for
    /// `BLOCK_SECTOR_SIZE` bytes.
    pub fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        self.check_sector(sector)?;
        Self::verify_buffer(buf)?;

        trace!("{}: read sector {}", self.block_name, sector);
        self.driver.op().read(sector, buf)?;
        self.read_count += 1;
        Ok(())
    }

    /// Writes sector `sector` from `buf`, which must contain `BLOCK_SECTOR_SIZE` bytes. Returns
    /// after the block device has acknowledged receiving the data.
    pub fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        self.check_sector(sector)?;
        Self::verify_buffer(buf)?;

        trace!("{}: write sector {}", self.block_name, sector);
        self.driver.op().write(sector, buf)?;
        self.write_count += 1;
        Ok(())
    }

    // Block getters -----------------------------------------------------------

    pub fn get_type(&self) -> BlockType {
        self.block_type
    }
    pub fn get_size(&self) -> BlockSector {
        self.block_size
    }
    pub fn get_name(&self) -> &str {
        &self.block_name
    }
    pub fn read_count(&self) -> u32 {
        self.read_count
    }
    pub fn write_count(&self) -> u32 {
        self.write_count
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "\"{}\" ({}): {:04} sectors, {:04} read, {:04} write",
            self.block_name, self.block_type, self.block_size, self.read_count, self.write_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn scratch(sectors: BlockSector) -> Block {
        Block::new(
            "scratch",
            BlockType::Scratch,
            BlockDriver::RamDisk(RamDisk::new(sectors)),
        )
    }

    #[test]
    fn read_back_written_sector() {
        let mut block = scratch(4);
        let data = vec![0xA5; BLOCK_SECTOR_SIZE];
        block.write(2, &data).expect("write failed");

        let mut buf = vec![0; BLOCK_SECTOR_SIZE];
        block.read(2, &mut buf).expect("read failed");
        assert_eq!(buf, data);

        block.read(1, &mut buf).expect("read failed");
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!((block.read_count(), block.write_count()), (2, 1));
    }

    #[test]
    fn rejects_bad_requests() {
        let mut block = scratch(4);
        let mut buf = vec![0; BLOCK_SECTOR_SIZE];
        assert_eq!(block.read(4, &mut buf), Err(BlockError::SectorOutOfBounds));
        assert_eq!(block.write(0, &buf[1..]), Err(BlockError::BufferInvalid));
        assert_eq!((block.read_count(), block.write_count()), (0, 0));
    }

    #[test]
    fn display_summarizes_the_device() {
        let mut block = scratch(4);
        let buf = vec![0; BLOCK_SECTOR_SIZE];
        block.write(0, &buf).expect("write failed");
        assert_eq!(
            block.to_string(),
            "\"scratch\" (Scratch): 0004 sectors, 0000 read, 0001 write"
        );
    }
}
