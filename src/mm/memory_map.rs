//! Firmware memory-map parsing: the read-only collaborator input that seeds
//! the physical allocator.
//!
//! Layout (reference: `defs.h`'s `MEMORY_MAP_ENTRY_COUNT_PA`/`MEMORY_MAP_PA`):
//! a `u32` entry count at a fixed physical address, followed immediately by
//! that many packed `{pa: u64, size: u64, type: u32}` records. `type == 1`
//! means usable; anything else (reserved, ACPI reclaimable, etc.) is ignored.

use crate::arch::amd64::addr::PhysAddr;
use crate::mm::phys::PhysAllocator;
use crate::mm::PhysicalMemory;

pub const MEMORY_MAP_ENTRY_COUNT_PA: u64 = 0x9000;
pub const MEMORY_MAP_PA: u64 = MEMORY_MAP_ENTRY_COUNT_PA + 4;

const MEMORY_TYPE_USABLE: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct MemoryMapEntry {
    pub pa: u64,
    pub size: u64,
    pub ty: u32,
}

impl MemoryMapEntry {
    pub fn is_usable(&self) -> bool {
        self.ty == MEMORY_TYPE_USABLE
    }
}

/// Reads the firmware-supplied memory map through the identity window and
/// frees every 2 MiB-aligned page of every usable entry that lies strictly
/// within `[kernel_image_end, max_mapped_pa_excl)`.
///
/// `kernel_image_end` is the linker-provided `&end` symbol: the allocator
/// must never hand out a page that overlaps the loaded kernel image or sits
/// below it.
pub fn init_from_memory_map<M: PhysicalMemory>(
    mem: &mut M,
    alloc: &mut PhysAllocator,
    kernel_image_end: PhysAddr,
    max_mapped_pa_excl: PhysAddr,
) {
    let count = unsafe { read_entry_count(mem) };
    let mut entry_pa = PhysAddr::new(MEMORY_MAP_PA);

    for _ in 0..count {
        let entry = unsafe { read_entry(mem, entry_pa) };
        if entry.is_usable() {
            let start = if entry.pa < kernel_image_end.as_u64() {
                kernel_image_end.as_u64()
            } else {
                entry.pa
            };
            let end_excl = entry.pa.saturating_add(entry.size).min(max_mapped_pa_excl.as_u64());

            if end_excl > start {
                alloc.free_range(mem, PhysAddr::new(start), PhysAddr::new(end_excl));
            }
        }
        entry_pa = entry_pa + core::mem::size_of::<MemoryMapEntry>() as u64;
    }
}

/// # Safety
/// `MEMORY_MAP_ENTRY_COUNT_PA` must be backed by mapped memory containing a
/// firmware-supplied entry count. `MEMORY_MAP_ENTRY_COUNT_PA` is 8-byte
/// aligned by construction (`0x9000`), so the count is the low 32 bits of
/// the aligned word that precedes the first memory-map entry.
unsafe fn read_entry_count<M: PhysicalMemory>(mem: &M) -> u32 {
    mem.read_u64(PhysAddr::new(MEMORY_MAP_ENTRY_COUNT_PA)) as u32
}

/// # Safety
/// `pa` must be backed by mapped memory holding a packed
/// `{pa, size, type}` record.
unsafe fn read_entry<M: PhysicalMemory>(mem: &M, pa: PhysAddr) -> MemoryMapEntry {
    let addr = mem.read_u64(pa);
    let size = mem.read_u64(pa + 8);
    let ty_word = mem.read_u64(pa + 16);
    MemoryMapEntry { pa: addr, size, ty: ty_word as u32 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::testutil::FakeMemory;

    fn write_entry<M: PhysicalMemory>(mem: &mut M, pa: PhysAddr, e: MemoryMapEntry) {
        unsafe {
            mem.write_u64(pa, e.pa);
            mem.write_u64(pa + 8, e.size);
            mem.write_u64(pa + 16, e.ty as u64);
        }
    }

    #[test]
    fn scenario_one_usable_entry() {
        let mut mem = FakeMemory::new(0x100_0000);
        unsafe { mem.write_u64(PhysAddr::new(MEMORY_MAP_ENTRY_COUNT_PA), 1) };
        write_entry(
            &mut mem,
            PhysAddr::new(MEMORY_MAP_PA),
            MemoryMapEntry { pa: 0x20_0000, size: 0x80_0000, ty: 1 },
        );

        let mut alloc = PhysAllocator::new();
        init_from_memory_map(
            &mut mem,
            &mut alloc,
            PhysAddr::new(0x40_0000),
            PhysAddr::new(0x1000_0000),
        );

        assert_eq!(alloc.num_free(), 2);
        assert_eq!(alloc.max_pa_exclusive(), PhysAddr::new(0x80_0000));
    }

    #[test]
    fn reserved_entries_are_ignored() {
        let mut mem = FakeMemory::new(0x100_0000);
        unsafe { mem.write_u64(PhysAddr::new(MEMORY_MAP_ENTRY_COUNT_PA), 1) };
        write_entry(
            &mut mem,
            PhysAddr::new(MEMORY_MAP_PA),
            MemoryMapEntry { pa: 0x20_0000, size: 0x80_0000, ty: 2 },
        );

        let mut alloc = PhysAllocator::new();
        init_from_memory_map(&mut mem, &mut alloc, PhysAddr::new(0), PhysAddr::new(0x1000_0000));
        assert_eq!(alloc.num_free(), 0);
    }
}
