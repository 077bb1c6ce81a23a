//! Kernel access to user memory. Each access walks the process's page table
//! the way the MMU would: it faults in missing pages, refuses writes to
//! read-only pages, and sets the accessed and dirty bits.

use crate::paging::HardwarePageTable;
use crate::vm::{AddressSpace, FaultError, PageFault, VmSystem};
use alloc::{sync::Arc, vec, vec::Vec};
use core::cmp::min;
use nephron_shared::mem::{page_offset, page_round_down, OFFSET, PAGE_FRAME_SIZE};

/// Run `copy` on the bytes of the page holding `addr`, starting at `addr`,
/// with the page pinned in place by the page directory lock.
fn with_user_page<F>(
    vm: &VmSystem,
    space: &Arc<AddressSpace>,
    addr: usize,
    write: bool,
    mut copy: F,
) -> Result<(), FaultError>
where
    F: FnMut(&mut [u8]),
{
    let upage = page_round_down(addr);
    loop {
        {
            let mut page_dir = space.page_directory().lock();
            if let Some(translation) = page_dir.translate(addr) {
                if write && !translation.writable {
                    return Err(FaultError::ProtectionViolation);
                }
                page_dir.set_accessed(upage, true);
                if write {
                    page_dir.set_dirty(upage, true);
                }
                let page = vm.pool().page(translation.frame);
                // SAFETY: The page stays mapped while we hold the page
                // directory, and eviction unmaps before touching it.
                let bytes = unsafe { page.bytes_mut() };
                copy(&mut bytes[page_offset(addr)..]);
                return Ok(());
            }
        }
        vm.resolve_fault(space, &PageFault { addr, esp: None, write })?;
    }
}

fn check_range(pointer: usize, count: usize) -> Result<(), FaultError> {
    match pointer.checked_add(count) {
        Some(end) if end <= OFFSET => Ok(()),
        // Trying to reach kernel memory.
        _ => Err(FaultError::KernelAddress),
    }
}

/// Copy `buf.len()` bytes of user memory at `pointer` into `buf`.
pub fn copy_from_user(
    vm: &VmSystem,
    space: &Arc<AddressSpace>,
    pointer: usize,
    buf: &mut [u8],
) -> Result<(), FaultError> {
    check_range(pointer, buf.len())?;

    let mut done = 0;
    while done < buf.len() {
        let addr = pointer + done;
        let len = min(PAGE_FRAME_SIZE - page_offset(addr), buf.len() - done);
        with_user_page(vm, space, addr, false, |bytes| {
            buf[done..done + len].copy_from_slice(&bytes[..len]);
        })?;
        done += len;
    }
    Ok(())
}

/// Copy `data` into user memory at `pointer`.
pub fn copy_to_user(
    vm: &VmSystem,
    space: &Arc<AddressSpace>,
    pointer: usize,
    data: &[u8],
) -> Result<(), FaultError> {
    check_range(pointer, data.len())?;

    let mut done = 0;
    while done < data.len() {
        let addr = pointer + done;
        let len = min(PAGE_FRAME_SIZE - page_offset(addr), data.len() - done);
        with_user_page(vm, space, addr, true, |bytes| {
            bytes[..len].copy_from_slice(&data[done..done + len]);
        })?;
        done += len;
    }
    Ok(())
}

/// Copy `count` bytes of user memory at `pointer` into a new buffer.
pub fn check_and_copy_user_memory(
    vm: &VmSystem,
    space: &Arc<AddressSpace>,
    pointer: usize,
    count: usize,
) -> Result<Vec<u8>, FaultError> {
    // We sometimes want to transfer information from one thread to another.
    // To avoid having to map this memory across threads, we copy it to kernel memory first.
    let mut bytes = vec![0; count];
    copy_from_user(vm, space, pointer, &mut bytes)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{file::MemFile, VmConfig};
    use nephron_shared::mem::OFFSET;

    fn small_vm() -> VmSystem {
        VmSystem::new(VmConfig::DEFAULT.with_user_frames(4).with_swap_sectors(64))
    }

    #[test]
    fn copies_across_page_boundaries() {
        let vm = small_vm();
        let space = vm.create_address_space(1);
        let addr = OFFSET - PAGE_FRAME_SIZE - 10;
        let data: Vec<u8> = (0..20).collect();

        copy_to_user(&vm, &space, addr, &data).expect("stack pages grow on demand");
        assert_eq!(
            check_and_copy_user_memory(&vm, &space, addr, 20),
            Ok(data)
        );
        assert_eq!(space.supplemental_page_table().lock().resident_count(), 2);
    }

    #[test]
    fn rejects_kernel_ranges() {
        let vm = small_vm();
        let space = vm.create_address_space(1);
        let mut buf = [0; 8];
        assert_eq!(
            copy_from_user(&vm, &space, OFFSET - 4, &mut buf),
            Err(FaultError::KernelAddress)
        );
        assert_eq!(
            copy_to_user(&vm, &space, usize::MAX - 2, &buf),
            Err(FaultError::KernelAddress)
        );
    }

    #[test]
    fn writes_to_read_only_pages_fault() {
        let vm = small_vm();
        let space = vm.create_address_space(1);
        let file = Arc::new(MemFile::new(vec![5; 64]));
        assert!(vm.register_file_backed(&space, 0x1000, file, 0, 64, PAGE_FRAME_SIZE - 64, false));

        let mut buf = [0; 4];
        copy_from_user(&vm, &space, 0x1000, &mut buf).expect("readable");
        assert_eq!(buf, [5; 4]);
        assert_eq!(
            copy_to_user(&vm, &space, 0x1000, &buf),
            Err(FaultError::ProtectionViolation)
        );
    }

    #[test]
    fn unmapped_addresses_fault() {
        let vm = small_vm();
        let space = vm.create_address_space(1);
        let mut buf = [0; 1];
        assert_eq!(
            copy_from_user(&vm, &space, 0x1000, &mut buf),
            Err(FaultError::Unmapped)
        );
    }

    #[test]
    fn sets_accessed_and_dirty_bits() {
        let vm = small_vm();
        let space = vm.create_address_space(1);
        let upage = OFFSET - PAGE_FRAME_SIZE;
        let mut buf = [0; 1];

        copy_from_user(&vm, &space, upage, &mut buf).expect("stack page");
        {
            let page_dir = space.page_directory().lock();
            assert!(page_dir.is_accessed(upage));
            assert!(!page_dir.is_dirty(upage));
        }

        copy_to_user(&vm, &space, upage, &buf).expect("stack page");
        assert!(space.page_directory().lock().is_dirty(upage));
    }
}
