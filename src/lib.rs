//! `vesper`: the core of a small single-CPU x86-64 kernel — physical page
//! allocation, 4-level paging, interrupt/syscall dispatch, and a
//! round-robin process scheduler.
//!
//! This library carries no `#[panic_handler]` so that `cargo test`'s
//! host-linked harness can supply its own; the `no_std`/`no_main` binary
//! crate owns that, along with the bootloader entry convention.

#![no_std]

pub mod arch;
pub mod drivers;
pub mod mm;
pub mod process;
pub mod syscall;

use arch::amd64::addr::PhysAddr;
use arch::amd64::{gdt, idt, pic};
use mm::paging;
use mm::IdentityWindow;
use process::Ring0;

/// The linker-provided end of the loaded kernel image; pages at or below
/// this address are never handed to the physical allocator.
extern "C" {
    static end: u8;
}

/// Formats onto the VGA screen collaborator — the kernel's only logging
/// sink. Mirrors the reference's `k_printf`.
#[macro_export]
macro_rules! klog {
    ($($arg:tt)*) => {
        $crate::drivers::vga::_print(format_args!($($arg)*));
        $crate::drivers::vga::_print(format_args!("\n"));
    };
}

/// Same sink as [`klog!`]; kept as a distinct name so call sites read as
/// intentionally noting a recoverable condition rather than routine status.
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {
        $crate::klog!("warning: {}", format_args!($($arg)*));
    };
}

/// Runs the full boot sequence and hands off to the first user process.
/// Never returns.
///
/// # Safety
/// Must be called exactly once, immediately after the bootloader transfers
/// control, with the 1 GiB identity-mapped kernel window already active and
/// interrupts still disabled.
pub unsafe fn kernel_main() -> ! {
    gdt::init();
    idt::init();
    pic::init();
    drivers::vga::init();

    klog!("vesper: booting");

    let ring0 = Ring0::assume_current();
    let state = process::state(&ring0);
    let mut mem = IdentityWindow;

    let kernel_image_end = PhysAddr::new(core::ptr::addr_of!(end) as u64);
    let max_mapped_pa_excl = PhysAddr::new(mm::MAX_MAPPED_VA_EXCL - mm::KERNEL_SPACE_VA);

    mm::memory_map::init_from_memory_map(&mut mem, &mut state.alloc, kernel_image_end, max_mapped_pa_excl);
    klog!("vesper: {} free pages ({} max ever)", state.alloc.num_free(), state.alloc.max_free_ever());

    if state.alloc.check(&mem).is_err() {
        kwarn!("freelist consistency check failed after init_from_memory_map");
    }

    let kernel_pml4_pa = paging::create_kernel_address_space(&mut mem, &mut state.alloc, state.alloc.max_pa_exclusive())
        .expect("failed to build the kernel's own address space");
    arch::amd64::context::switch_address_space(kernel_pml4_pa.as_u64());

    if state.alloc.check(&mem).is_err() {
        kwarn!("freelist consistency check failed after switching to the kernel address space");
    }

    klog!("vesper: starting init");
    process::start_init(&mut mem)
}
