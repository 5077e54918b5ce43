//! The 4-level (really: 3-level-walk-to-a-2MiB-leaf) paging engine.
//!
//! PML4 → PDPT → PD, with the PD entry itself the leaf (page-size bit set).
//! Every intermediate access dereferences a physical address through the
//! kernel identity window, exactly as the reference `paging.c` does via its
//! `pa_to_va` macro — here that's [`PhysicalMemory`] instead of a raw cast so
//! the walker is exercised in tests without real page tables.

use crate::arch::amd64::addr::{PhysAddr, VirtAddr};
use crate::mm::phys::PhysAllocator;
use crate::mm::{pte_flags, KernelError, PhysicalMemory, Result, MAX_MAPPED_VA_EXCL, PAGE_SIZE};

const BYTES_PER_PTE: u64 = 8;
const ENTRIES_PER_TABLE: u64 = 512;

fn truncate_to_page(va: u64) -> u64 {
    va / PAGE_SIZE * PAGE_SIZE
}

fn align_to_page(va: u64) -> u64 {
    (va + PAGE_SIZE - 1) / PAGE_SIZE * PAGE_SIZE
}

/// Walks (allocating missing interior tables as needed) from `root_pa` down
/// to the PD, writing a 2 MiB leaf at each step. Widens `[va_start,
/// va_end_excl)` out to page boundaries first.
///
/// Any child-table allocation failure leaves whatever was already built in
/// place; the caller is expected to tear the whole tree down with
/// [`free_tree`] rather than attempt a partial unwind.
pub fn map_range<M: PhysicalMemory>(
    mem: &mut M,
    alloc: &mut PhysAllocator,
    root_pa: PhysAddr,
    va_start: VirtAddr,
    va_end_excl: VirtAddr,
    pa_start: PhysAddr,
    attrs: u64,
) -> Result<()> {
    let start_page = truncate_to_page(va_start.as_u64());
    let end_page_excl = align_to_page(va_end_excl.as_u64());

    if start_page >= end_page_excl {
        return Err(KernelError::AddressSpaceRangeExceeded);
    }
    if end_page_excl > MAX_MAPPED_VA_EXCL {
        return Err(KernelError::AddressSpaceRangeExceeded);
    }

    let mut pa_cursor = pa_start.as_u64();
    let mut v = start_page;

    while v < end_page_excl {
        let va = VirtAddr::new(v);

        let pml4e_pa = root_pa + (va.pml4_index() as u64) * BYTES_PER_PTE;
        let pdpt_pa = ensure_child_table(mem, alloc, pml4e_pa, attrs)?;

        let pdpte_pa = pdpt_pa + (va.pdpt_index() as u64) * BYTES_PER_PTE;
        let pd_pa = ensure_child_table(mem, alloc, pdpte_pa, attrs)?;

        let pde_pa = pd_pa + (va.pd_index() as u64) * BYTES_PER_PTE;
        let leaf = pa_cursor | pte_flags::PAGE_SIZE | attrs | pte_flags::PRESENT;
        unsafe { mem.write_u64(pde_pa, leaf) };

        pa_cursor += PAGE_SIZE;
        v += PAGE_SIZE;
    }

    Ok(())
}

/// Reads `entry_pa`; if not present, allocates a fresh child table page,
/// zeroes it (implicit in `allocate_page`), and stamps the parent entry.
/// Returns the (possibly just-created) child table's physical address.
fn ensure_child_table<M: PhysicalMemory>(
    mem: &mut M,
    alloc: &mut PhysAllocator,
    entry_pa: PhysAddr,
    attrs: u64,
) -> Result<PhysAddr> {
    let mut content = unsafe { mem.read_u64(entry_pa) };

    if content & pte_flags::PRESENT == 0 {
        let child = alloc.try_allocate_page(mem)?;
        unsafe { mem.write_u64(entry_pa, child.as_u64() | attrs | pte_flags::PRESENT) };
        content = unsafe { mem.read_u64(entry_pa) };
    }

    Ok(PhysAddr::new(clear_low_12(content)))
}

fn clear_low_12(pte: u64) -> u64 {
    pte >> 12 << 12
}

fn clear_low_21(pte: u64) -> u64 {
    pte >> 21 << 21
}

/// Walks present PML4→PDPT→PD entries in `[va_start, va_end_excl)` and frees
/// every leaf that carries *both* Present and User (kernel leaves have
/// Present but not User, and must never be freed as user data).
pub fn free_user_data_range<M: PhysicalMemory>(
    mem: &mut M,
    alloc: &mut PhysAllocator,
    root_pa: PhysAddr,
    va_start: VirtAddr,
    va_end_excl: VirtAddr,
) -> Result<()> {
    let start_page = truncate_to_page(va_start.as_u64());
    let end_page_excl = align_to_page(va_end_excl.as_u64());

    if start_page >= end_page_excl {
        return Err(KernelError::AddressSpaceRangeExceeded);
    }
    if end_page_excl > MAX_MAPPED_VA_EXCL {
        return Err(KernelError::AddressSpaceRangeExceeded);
    }

    let mut v = start_page;
    while v < end_page_excl {
        let va = VirtAddr::new(v);

        let pml4e_pa = root_pa + (va.pml4_index() as u64) * BYTES_PER_PTE;
        let pml4e = unsafe { mem.read_u64(pml4e_pa) };
        if pml4e & pte_flags::PRESENT != 0 {
            let pdpte_pa = PhysAddr::new(clear_low_12(pml4e)) + (va.pdpt_index() as u64) * BYTES_PER_PTE;
            let pdpte = unsafe { mem.read_u64(pdpte_pa) };
            if pdpte & pte_flags::PRESENT != 0 {
                let pde_pa = PhysAddr::new(clear_low_12(pdpte)) + (va.pd_index() as u64) * BYTES_PER_PTE;
                let pde = unsafe { mem.read_u64(pde_pa) };
                if pde & pte_flags::PRESENT != 0 && pde & pte_flags::USER != 0 {
                    let frame = PhysAddr::new(clear_low_21(pde));
                    alloc.free_page(mem, frame);
                    unsafe { mem.write_u64(pde_pa, 0) };
                }
            }
        }

        v += PAGE_SIZE;
    }

    Ok(())
}

/// Tears down the page-table structure itself (PD pages, PDPT pages, the
/// PML4). Assumes data pages were already released by
/// [`free_user_data_range`]. Leaf PD entries are never individually freed
/// here: they either pointed at already-released user data or at
/// identity-mapped kernel RAM the tree never owned.
pub fn free_tree<M: PhysicalMemory>(mem: &mut M, alloc: &mut PhysAllocator, root_pa: PhysAddr) {
    for i in 0..ENTRIES_PER_TABLE {
        let pml4e_pa = root_pa + i * BYTES_PER_PTE;
        let pml4e = unsafe { mem.read_u64(pml4e_pa) };
        if pml4e & pte_flags::PRESENT == 0 {
            continue;
        }

        let pdpt_pa = PhysAddr::new(clear_low_12(pml4e));
        for j in 0..ENTRIES_PER_TABLE {
            let pdpte_pa = pdpt_pa + j * BYTES_PER_PTE;
            let pdpte = unsafe { mem.read_u64(pdpte_pa) };
            if pdpte & pte_flags::PRESENT != 0 {
                let pd_pa = PhysAddr::new(clear_low_12(pdpte));
                alloc.free_page(mem, pd_pa);
            }
        }
        alloc.free_page(mem, pdpt_pa);
    }
    alloc.free_page(mem, root_pa);
}

/// Allocates a PML4 and maps `[KERNEL_SPACE_VA, KERNEL_SPACE_VA +
/// max_pa_exclusive)` to physical `[0, max_pa_exclusive)`, read/write,
/// kernel-only. Each address space gets its own independent copy of this
/// map so its lifecycle is fully self-contained.
pub fn create_kernel_address_space<M: PhysicalMemory>(
    mem: &mut M,
    alloc: &mut PhysAllocator,
    max_pa_exclusive: PhysAddr,
) -> Option<PhysAddr> {
    let pml4_pa = alloc.allocate_page(mem)?;

    let kernel_space_va = VirtAddr::new(crate::mm::KERNEL_SPACE_VA);
    let kernel_space_end = kernel_space_va + max_pa_exclusive.as_u64();

    let result = map_range(
        mem,
        alloc,
        pml4_pa,
        kernel_space_va,
        kernel_space_end,
        PhysAddr::new(0),
        pte_flags::READ_WRITE,
    );

    match result {
        Ok(()) => Some(pml4_pa),
        Err(_) => {
            free_tree(mem, alloc, pml4_pa);
            None
        }
    }
}

/// Starts from a fresh kernel address space, then copies `image` in 2 MiB
/// chunks to freshly-allocated pages mapped at `USER_EXEC_START_VA`, plus one
/// extra page mapped as the user stack just below `USER_STACK_VA`.
pub fn create_user_address_space<M: PhysicalMemory>(
    mem: &mut M,
    alloc: &mut PhysAllocator,
    max_pa_exclusive: PhysAddr,
    image_src: PhysAddr,
    image_size: u64,
) -> Option<PhysAddr> {
    let pml4_pa = create_kernel_address_space(mem, alloc, max_pa_exclusive)?;

    if map_user_image(mem, alloc, pml4_pa, image_src, image_size).is_err() {
        teardown_user_space(mem, alloc, pml4_pa, image_size);
        return None;
    }

    if map_user_stack(mem, alloc, pml4_pa).is_err() {
        teardown_user_space(mem, alloc, pml4_pa, image_size);
        return None;
    }

    Some(pml4_pa)
}

fn teardown_user_space<M: PhysicalMemory>(mem: &mut M, alloc: &mut PhysAllocator, pml4_pa: PhysAddr, image_size: u64) {
    let _ = free_user_data_range(
        mem,
        alloc,
        pml4_pa,
        VirtAddr::new(crate::mm::USER_EXEC_START_VA),
        VirtAddr::new(crate::mm::USER_EXEC_START_VA + image_size),
    );
    free_tree(mem, alloc, pml4_pa);
}

fn map_user_image<M: PhysicalMemory>(
    mem: &mut M,
    alloc: &mut PhysAllocator,
    pml4_pa: PhysAddr,
    image_src: PhysAddr,
    image_size: u64,
) -> Result<()> {
    let mut src = image_src;
    let mut remaining = image_size;
    let mut dest_va = crate::mm::USER_EXEC_START_VA;

    while remaining > 0 {
        let chunk = remaining.min(PAGE_SIZE);
        let page = alloc.try_allocate_page(mem)?;

        unsafe {
            // image_src is outside the identity-window abstraction's normal
            // "owned physical RAM" bookkeeping (it's a read-only source
            // blob), so this copies raw identity-window bytes directly.
            copy_identity_bytes(mem, src, page, chunk);
        }

        let mapped = map_range(
            mem,
            alloc,
            pml4_pa,
            VirtAddr::new(dest_va),
            VirtAddr::new(dest_va + PAGE_SIZE),
            page,
            pte_flags::READ_WRITE | pte_flags::USER,
        );
        if let Err(e) = mapped {
            // `page` was allocated but never linked into the tree as a
            // present leaf, so free_user_data_range won't find it either.
            alloc.free_page(mem, page);
            return Err(e);
        }

        src = src + chunk;
        remaining -= chunk;
        dest_va += PAGE_SIZE;
    }

    Ok(())
}

unsafe fn copy_identity_bytes<M: PhysicalMemory>(mem: &mut M, src: PhysAddr, dst: PhysAddr, len: u64) {
    let mut buf = [0u8; PAGE_SIZE as usize];
    mem.copy_to(src, buf.as_mut_ptr(), len as usize);
    mem.copy_from(dst, buf.as_ptr(), len as usize);
}

fn map_user_stack<M: PhysicalMemory>(mem: &mut M, alloc: &mut PhysAllocator, pml4_pa: PhysAddr) -> Result<()> {
    let page = alloc.try_allocate_page(mem)?;
    let stack_top = crate::mm::USER_STACK_VA;

    let mapped = map_range(
        mem,
        alloc,
        pml4_pa,
        VirtAddr::new(stack_top - PAGE_SIZE),
        VirtAddr::new(stack_top),
        page,
        pte_flags::READ_WRITE | pte_flags::USER,
    );
    if let Err(e) = mapped {
        // Same reasoning as map_user_image: an allocated-but-unlinked page
        // would otherwise be invisible to free_user_data_range's present+User
        // walk and leak past teardown_user_space.
        alloc.free_page(mem, page);
        return Err(e);
    }
    Ok(())
}

/// Walks present entries only (never allocates) to inspect the leaf PTE for
/// a given virtual address. Used by tests and the consistency-checking
/// paths; the hot map/unmap paths above don't need a generic read-only
/// walker.
pub fn walk_leaf<M: PhysicalMemory>(mem: &M, root_pa: PhysAddr, va: VirtAddr) -> Option<u64> {
    let pml4e = unsafe { mem.read_u64(root_pa + (va.pml4_index() as u64) * BYTES_PER_PTE) };
    if pml4e & pte_flags::PRESENT == 0 {
        return None;
    }
    let pdpte = unsafe {
        mem.read_u64(PhysAddr::new(clear_low_12(pml4e)) + (va.pdpt_index() as u64) * BYTES_PER_PTE)
    };
    if pdpte & pte_flags::PRESENT == 0 {
        return None;
    }
    let pde = unsafe {
        mem.read_u64(PhysAddr::new(clear_low_12(pdpte)) + (va.pd_index() as u64) * BYTES_PER_PTE)
    };
    if pde & pte_flags::PRESENT == 0 {
        return None;
    }
    Some(pde)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::testutil::FakeMemory;

    fn fresh(size: usize) -> (FakeMemory, PhysAllocator) {
        let mut mem = FakeMemory::new(size);
        let mut alloc = PhysAllocator::new();
        // Give the allocator a generous pool of pages above the tables.
        alloc.free_range(&mut mem, PhysAddr::new(0x40_0000), PhysAddr::new(size as u64));
        (mem, alloc)
    }

    #[test]
    fn map_user_stack_frees_its_data_page_when_map_range_fails() {
        let (mut mem, mut alloc) = fresh(0x1000_0000);
        let root = create_kernel_address_space(&mut mem, &mut alloc, PhysAddr::new(0x40_0000)).unwrap();

        // The user stack's PML4 index (255) is distinct from the kernel
        // map's (256, see addr.rs), so mapping it needs two fresh child
        // tables plus the data page. Starve the allocator down to exactly
        // the data page so `ensure_child_table` fails building the PDPT.
        while alloc.num_free() > 1 {
            alloc.allocate_page(&mut mem).unwrap();
        }
        let before = alloc.num_free();
        assert_eq!(before, 1);

        let result = map_user_stack(&mut mem, &mut alloc, root);

        assert!(result.is_err());
        assert_eq!(alloc.num_free(), before, "the data page must be freed back, not leaked");
    }

    #[test]
    fn map_user_image_frees_its_chunk_page_when_map_range_fails() {
        let (mut mem, mut alloc) = fresh(0x1000_0000);
        let root = create_kernel_address_space(&mut mem, &mut alloc, PhysAddr::new(0x40_0000)).unwrap();
        let image_pa = PhysAddr::new(0x10_0000);

        // USER_EXEC_START_VA's PML4 index is fresh too, so the first chunk
        // needs a PDPT and a PD built in addition to the chunk's own page.
        while alloc.num_free() > 1 {
            alloc.allocate_page(&mut mem).unwrap();
        }
        let before = alloc.num_free();
        assert_eq!(before, 1);

        let result = map_user_image(&mut mem, &mut alloc, root, image_pa, PAGE_SIZE);

        assert!(result.is_err());
        assert_eq!(alloc.num_free(), before, "the chunk page must be freed back, not leaked");
    }

    #[test]
    fn scenario_mapping_closure() {
        let (mut mem, mut alloc) = fresh(0x400_0000);
        let root = alloc.allocate_page(&mut mem).unwrap();

        map_range(
            &mut mem,
            &mut alloc,
            root,
            VirtAddr::new(0xffff_8000_0020_0000),
            VirtAddr::new(0xffff_8000_0040_0000),
            PhysAddr::new(0x20_0000),
            pte_flags::READ_WRITE,
        )
        .unwrap();

        let leaf = walk_leaf(&mem, root, VirtAddr::new(0xffff_8000_0020_0000)).unwrap();
        assert_eq!(
            leaf,
            0x20_0000 | pte_flags::PAGE_SIZE | pte_flags::READ_WRITE | pte_flags::PRESENT
        );
    }

    #[test]
    fn kernel_tree_teardown_preserves_free_count() {
        let (mut mem, mut alloc) = fresh(0x800_0000);
        let before = alloc.num_free();

        let root = create_kernel_address_space(&mut mem, &mut alloc, PhysAddr::new(0x40_0000)).unwrap();
        free_tree(&mut mem, &mut alloc, root);

        assert_eq!(alloc.num_free(), before);
        assert!(alloc.check(&mem).is_ok());
    }

    #[test]
    fn user_space_teardown_preserves_free_count() {
        let (mut mem, mut alloc) = fresh(0x1000_0000);
        let before = alloc.num_free();

        // A tiny "image" living in the fake arena's low, already-reserved
        // region (below where free_range started handing out pages).
        let image_pa = PhysAddr::new(0x10_0000);
        unsafe { mem.write_u64(image_pa, 0xDEAD_BEEF_DEAD_BEEF) };
        let image_size = 8u64;

        let root = create_user_address_space(&mut mem, &mut alloc, PhysAddr::new(0x40_0000), image_pa, image_size)
            .unwrap();

        free_user_data_range(
            &mut mem,
            &mut alloc,
            root,
            VirtAddr::new(crate::mm::USER_EXEC_START_VA),
            VirtAddr::new(crate::mm::USER_EXEC_START_VA + image_size),
        )
        .unwrap();
        // The stack page also carries User+Present and must be released the
        // same way before the tree itself comes down.
        free_user_data_range(
            &mut mem,
            &mut alloc,
            root,
            VirtAddr::new(crate::mm::USER_STACK_VA - PAGE_SIZE),
            VirtAddr::new(crate::mm::USER_STACK_VA),
        )
        .unwrap();
        free_tree(&mut mem, &mut alloc, root);

        assert_eq!(alloc.num_free(), before);
        assert!(alloc.check(&mem).is_ok());
    }
}
