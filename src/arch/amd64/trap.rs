//! The trap frame laid down by the common interrupt stub, and the single
//! dispatch function every vector trampoline in [`context`](super::context)
//! calls into.
//!
//! Field order matches the stub's push order exactly (see `context.rs`):
//! general-purpose registers (most-recently-pushed first), then the vector
//! number and error code the stub itself pushes, then the five words the
//! CPU pushes automatically on any privilege-changing interrupt.

use crate::mm::KernelError;
use crate::process;
use crate::syscall;

use super::pic;

pub const SOFTWARE_INT: u8 = 0x80;

const CPL_MASK: u64 = 3;

#[repr(C)]
#[derive(Debug)]
pub struct TrapFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub vector_number: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    pub fn ring(&self) -> u64 {
        self.cs & CPL_MASK
    }
}

/// Called by every vector trampoline with a pointer to the in-place
/// [`TrapFrame`]. Mirrors the reference `interrupt_handler`'s vector
/// switch: timer, spurious-check, syscall, everything else is fatal.
///
/// # Safety
/// `frame` must point at a `TrapFrame` freshly built by the common stub,
/// still live on the interrupted stack.
pub unsafe extern "C" fn interrupt_handler(frame: *mut TrapFrame) {
    let frame = &mut *frame;

    match frame.vector_number as u8 {
        pic::TIMER_VECTOR => {
            crate::drivers::vga::bump_timer_tick_cell();
            pic::acknowledge_interrupt(pic::TIMER_VECTOR);
            process::on_timer_tick();
        }
        pic::SPURIOUS_VECTOR => {
            if !pic::is_spurious_interrupt() {
                pic::acknowledge_interrupt(pic::SPURIOUS_VECTOR);
            }
        }
        SOFTWARE_INT => {
            syscall::dispatch(frame);
        }
        other => fatal(frame, other),
    }
}

fn fatal(frame: &TrapFrame, vector: u8) -> ! {
    crate::klog!(
        "trap: vector={} error_code={:#x} ring={} rip={:#x} cr2={:#x}",
        vector,
        frame.error_code,
        frame.ring(),
        frame.rip,
        unsafe { super::context::get_cr2() }
    );
    loop {
        unsafe { core::arch::asm!("hlt", options(nomem, nostack)) };
    }
}

pub use super::context::get_cr2;

/// Not a real error path; `KernelError` values surfaced from syscalls are
/// translated to `SYS_ERROR` (-1) at the ABI boundary in [`syscall::dispatch`].
pub const fn to_sys_error(_e: KernelError) -> i64 {
    -1
}
