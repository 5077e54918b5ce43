//! Global Descriptor Table and Task State Segment.
//!
//! Index layout (fixed, not the teacher's own numbering): null (0), kernel
//! code (1), user code (2), user data (3), TSS (4-5). Long mode only
//! consults the present/DPL/type bits and the L-bit on code segments — base
//! and limit are ignored by the CPU for everything but the TSS descriptor,
//! which genuinely needs its base to point at the `TaskStateSegment`.

use core::mem::size_of;

pub const NULL_SEGMENT: usize = 0;
pub const CODE_SEGMENT_INDEX: usize = 1;
pub const USER_CODE_SEGMENT_INDEX: usize = 2;
pub const USER_DATA_SEGMENT_INDEX: usize = 3;
pub const TSS_SEGMENT_INDEX: usize = 4;

pub const GDT_ENTRIES: usize = 6;

pub const USER_RING: u16 = 3;

pub const CODE_SELECTOR: u16 = (CODE_SEGMENT_INDEX as u16) << 3;
pub const USER_CODE_SELECTOR: u16 = (USER_CODE_SEGMENT_INDEX as u16) << 3 | USER_RING;
pub const USER_DATA_SELECTOR: u16 = (USER_DATA_SEGMENT_INDEX as u16) << 3 | USER_RING;

const PRESENT_BIT_SET: u8 = 1 << 7;
const DESCRIPTOR_PRIVILEGE_LEVEL_USER: u8 = (USER_RING as u8) << 5;
const CODE_OR_DATA_SEGMENT_TYPE: u8 = 1 << 4;
const EXEC: u8 = 1 << 3;
const CODE_READ_OR_DATA_WRITE_ACCESS: u8 = 1 << 1;

const CODE_ACCESS_BYTE: u8 = PRESENT_BIT_SET | CODE_OR_DATA_SEGMENT_TYPE | EXEC | CODE_READ_OR_DATA_WRITE_ACCESS;
const DATA_ACCESS_BYTE: u8 = PRESENT_BIT_SET | CODE_OR_DATA_SEGMENT_TYPE | CODE_READ_OR_DATA_WRITE_ACCESS;

const GRANULARITY_4_KIB: u8 = 1 << 3;
const SIZE_32_BIT_SEGMENT: u8 = 1 << 2;
const LONG_MODE_CODE: u8 = 1 << 1;

const TSS_ACCESS_BYTE: u8 = PRESENT_BIT_SET | 0x09;

#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
struct GdtEntry {
    limit_low: u16,
    base_low: u16,
    base_mid: u8,
    access: u8,
    flags_limit_high: u8,
    base_high: u8,
}

impl GdtEntry {
    const fn null() -> Self {
        GdtEntry { limit_low: 0, base_low: 0, base_mid: 0, access: 0, flags_limit_high: 0, base_high: 0 }
    }

    fn code_or_data(access: u8, flags: u8) -> Self {
        GdtEntry { limit_low: 0xffff, base_low: 0, base_mid: 0, access, flags_limit_high: flags, base_high: 0 }
    }

    fn tss_low(base: u64, limit: u32) -> Self {
        GdtEntry {
            limit_low: limit as u16,
            base_low: (base & 0xffff) as u16,
            base_mid: ((base >> 16) & 0xff) as u8,
            access: TSS_ACCESS_BYTE,
            flags_limit_high: ((limit >> 16) & 0x0f) as u8,
            base_high: ((base >> 24) & 0xff) as u8,
        }
    }

    fn tss_high(base: u64) -> Self {
        GdtEntry {
            limit_low: ((base >> 32) & 0xffff) as u16,
            base_low: 0,
            base_mid: 0,
            access: 0,
            flags_limit_high: ((base >> 48) & 0xff) as u8,
            base_high: ((base >> 56) & 0xff) as u8,
        }
    }
}

#[repr(C, packed)]
struct GdtPointer {
    limit: u16,
    base: u64,
}

pub const TSS_SIZE: usize = 104;

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct TaskStateSegment {
    reserved: u32,
    pub rsp0: u64,
    unused: [u8; TSS_SIZE - size_of::<u32>() - size_of::<u64>()],
}

impl TaskStateSegment {
    pub const fn new() -> Self {
        TaskStateSegment { reserved: 0, rsp0: 0, unused: [0; TSS_SIZE - size_of::<u32>() - size_of::<u64>()] }
    }
}

static mut GDT: [GdtEntry; GDT_ENTRIES] = [GdtEntry::null(); GDT_ENTRIES];
static mut GDT_POINTER: GdtPointer = GdtPointer { limit: 0, base: 0 };
static mut TSS: TaskStateSegment = TaskStateSegment::new();

/// # Safety
/// Must be called exactly once during boot, before any `ltr`/`lgdt` reload
/// elsewhere, and before interrupts are enabled.
pub unsafe fn init() {
    GDT[NULL_SEGMENT] = GdtEntry::null();

    GDT[CODE_SEGMENT_INDEX] = GdtEntry::code_or_data(CODE_ACCESS_BYTE, LONG_MODE_CODE);

    GDT[USER_CODE_SEGMENT_INDEX] =
        GdtEntry::code_or_data(CODE_ACCESS_BYTE | DESCRIPTOR_PRIVILEGE_LEVEL_USER, LONG_MODE_CODE);

    GDT[USER_DATA_SEGMENT_INDEX] = GdtEntry::code_or_data(
        DATA_ACCESS_BYTE | DESCRIPTOR_PRIVILEGE_LEVEL_USER,
        GRANULARITY_4_KIB | SIZE_32_BIT_SEGMENT,
    );

    let tss_base = core::ptr::addr_of!(TSS) as u64;
    let tss_limit = size_of::<TaskStateSegment>() as u32 - 1;
    GDT[TSS_SEGMENT_INDEX] = GdtEntry::tss_low(tss_base, tss_limit);
    GDT[TSS_SEGMENT_INDEX + 1] = GdtEntry::tss_high(tss_base);

    GDT_POINTER.limit = (size_of::<GdtEntry>() * GDT_ENTRIES - 1) as u16;
    GDT_POINTER.base = core::ptr::addr_of!(GDT) as u64;

    load_gdt(core::ptr::addr_of!(GDT_POINTER));
    load_tss((TSS_SEGMENT_INDEX as u16) << 3);
}

/// Sets the ring-0 stack the CPU switches to on a privilege-level change
/// into the kernel (e.g. a user task re-entering via `int 0x80`).
///
/// # Safety
/// `top_of_stack` must be the top of a valid, mapped kernel stack.
pub unsafe fn set_kernel_stack(top_of_stack: u64) {
    core::ptr::addr_of_mut!(TSS.rsp0).write_volatile(top_of_stack);
}

unsafe fn load_gdt(ptr: *const GdtPointer) {
    core::arch::asm!("lgdt [{0}]", in(reg) ptr, options(nostack, readonly));
}

unsafe fn load_tss(selector: u16) {
    core::arch::asm!("ltr {0:x}", in(reg) selector, options(nostack));
}
