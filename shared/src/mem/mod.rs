use crate::sizes::{KB, MB, SECTOR_SIZE};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

/// Number of block sectors backing one page.
pub const SECTORS_PER_PAGE: u32 = PAGE_FRAME_SIZE as u32 / SECTOR_SIZE;

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0x80000000;

/// How far below `OFFSET` the user stack may grow.
pub const USER_STACK_LIMIT: usize = 8 * MB;

/// Bytes below the stack pointer a faulting access may reach and still count
/// as a stack access. `PUSHA` writes 32 bytes before updating `esp`.
pub const STACK_ACCESS_SLACK: usize = 32;

/// Number of physical frames handed to user processes unless configured
/// otherwise.
pub const DEFAULT_USER_FRAMES: usize = 64;

#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn is_page_aligned(addr: usize) -> bool {
    page_offset(addr) == 0
}

#[inline]
pub const fn is_user_vaddr(addr: usize) -> bool {
    addr < OFFSET
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(page_round_down(0x1234_5678), 0x1234_5000);
        assert_eq!(page_offset(0x1234_5678), 0x678);
        assert!(is_page_aligned(0x4000));
        assert!(!is_page_aligned(0x4001));
        assert!(is_user_vaddr(OFFSET - 1));
        assert!(!is_user_vaddr(OFFSET));
    }

    #[test]
    fn sectors_cover_a_page() {
        assert_eq!(SECTORS_PER_PAGE as usize * SECTOR_SIZE as usize, PAGE_FRAME_SIZE);
    }
}
