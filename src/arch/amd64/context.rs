//! The low-level trampolines: one per IDT vector, the common register-save
//! stub they all fall into, and the two context-switch primitives
//! (`switch_process`, `enter_process`) that hand control to a task's saved
//! state.
//!
//! # The switch-frame trick
//!
//! [`process::prepare`](crate::process::prepare) lays a brand-new task's
//! kernel stack out as two adjacent frames:
//!
//! ```text
//!   kernel_stack_base_va + PAGE_SIZE            (top of stack)
//!   ┌──────────────────────────────────┐
//!   │ TrapFrame (r15..rax, vector_number,│  <- saved_trap_frame_va
//!   │ error_code, rip, cs, rflags,       │
//!   │ rsp, ss)                           │
//!   ├──────────────────────────────────┤
//!   │ switch frame (r15,r14,r13,r12,rbx, │  <- saved_rsp
//!   │ rbp, return_address=interrupt_return)
//!   └──────────────────────────────────┘
//! ```
//!
//! `switch_process` is an ordinary callee-saved-register swap ending in
//! `ret`; for a freshly prepared task that `ret` pops `interrupt_return` as
//! its return address and falls straight into the same register-restore
//! tail a real interrupt return would use, which then `iretq`s into ring 3
//! using the `TrapFrame` sitting directly above. The trap frame and the
//! switch frame are the only place this layout is hard-coded; nothing else
//! in the crate is allowed to assume it.

use core::arch::global_asm;

use super::trap::SOFTWARE_INT;

/// Builds a trampoline for a vector the CPU does *not* push an error code
/// for: push a dummy zero, then fall into `common_interrupt_stub`.
macro_rules! vector_stub_no_error_code {
    ($name:ident, $vector:expr) => {
        global_asm!(
            concat!(".global ", stringify!($name)),
            concat!(stringify!($name), ":"),
            "push 0",
            concat!("push ", stringify!($vector)),
            "jmp common_interrupt_stub",
        );
    };
}

/// Builds a trampoline for a vector the CPU pushes a real error code for:
/// the error code is already on the stack, so only the vector number needs
/// pushing before falling into the common stub.
macro_rules! vector_stub_with_error_code {
    ($name:ident, $vector:expr) => {
        global_asm!(
            concat!(".global ", stringify!($name)),
            concat!(stringify!($name), ":"),
            concat!("push ", stringify!($vector)),
            "jmp common_interrupt_stub",
        );
    };
}

global_asm!(
    ".global common_interrupt_stub",
    "common_interrupt_stub:",
    "push rax",
    "push rbx",
    "push rcx",
    "push rdx",
    "push rsi",
    "push rdi",
    "push rbp",
    "push r8",
    "push r9",
    "push r10",
    "push r11",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov rdi, rsp",
    "call {handler}",
    ".global interrupt_return",
    "interrupt_return:",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop r11",
    "pop r10",
    "pop r9",
    "pop r8",
    "pop rbp",
    "pop rdi",
    "pop rsi",
    "pop rdx",
    "pop rcx",
    "pop rbx",
    "pop rax",
    "add rsp, 16", // drop vector_number and error_code
    "iretq",
    handler = sym super::trap::interrupt_handler,
);

vector_stub_no_error_code!(vector_0, 0);
vector_stub_no_error_code!(vector_1, 1);
vector_stub_no_error_code!(vector_2, 2);
vector_stub_no_error_code!(vector_3, 3);
vector_stub_no_error_code!(vector_4, 4);
vector_stub_no_error_code!(vector_5, 5);
vector_stub_no_error_code!(vector_6, 6);
vector_stub_no_error_code!(vector_7, 7);
vector_stub_with_error_code!(vector_8, 8);
vector_stub_with_error_code!(vector_10, 10);
vector_stub_with_error_code!(vector_11, 11);
vector_stub_with_error_code!(vector_12, 12);
vector_stub_with_error_code!(vector_13, 13);
vector_stub_with_error_code!(vector_14, 14);
vector_stub_no_error_code!(vector_16, 16);
vector_stub_with_error_code!(vector_17, 17);
vector_stub_no_error_code!(vector_18, 18);
vector_stub_no_error_code!(vector_19, 19);
vector_stub_no_error_code!(vector_32, 32);
vector_stub_no_error_code!(vector_39, 39);
vector_stub_no_error_code!(system_software_interrupt, SOFTWARE_INT);

global_asm!(
    ".global switch_process",
    "switch_process:",
    // rdi = &mut old.saved_rsp, rsi = new.saved_rsp
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, rsi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
);

global_asm!(
    ".global enter_process",
    "enter_process:",
    // rdi = trap_frame_va; never returns.
    "mov rsp, rdi",
    "jmp interrupt_return",
);

extern "C" {
    /// Swaps the current callee-saved register set and stack pointer for
    /// another task's. `old_rsp_save` receives the outgoing task's `rsp`;
    /// `new_rsp` is the incoming task's previously-saved `rsp` (or, for a
    /// never-yet-run task, the switch frame [`process::prepare`] built).
    ///
    /// # Safety
    /// Both stacks must be valid, mapped kernel stacks laid out per the
    /// switch-frame contract documented on this module.
    pub fn switch_process(old_rsp_save: *mut u64, new_rsp: u64);

    /// Enters a task for the very first time, bypassing `switch_process`
    /// entirely: sets `rsp` to `trap_frame_va` and jumps straight into the
    /// register-restore tail that ends in `iretq`. Never returns.
    ///
    /// # Safety
    /// `trap_frame_va` must point at a fully initialised [`super::trap::TrapFrame`].
    pub fn enter_process(trap_frame_va: u64) -> !;

    /// The shared tail of every interrupt trampoline and the landing pad for
    /// a freshly prepared task's first [`switch_process`]/[`enter_process`].
    pub fn interrupt_return();

    pub fn vector_0();
    pub fn vector_1();
    pub fn vector_2();
    pub fn vector_3();
    pub fn vector_4();
    pub fn vector_5();
    pub fn vector_6();
    pub fn vector_7();
    pub fn vector_8();
    pub fn vector_10();
    pub fn vector_11();
    pub fn vector_12();
    pub fn vector_13();
    pub fn vector_14();
    pub fn vector_16();
    pub fn vector_17();
    pub fn vector_18();
    pub fn vector_19();
    pub fn vector_32();
    pub fn vector_39();
    pub fn system_software_interrupt();
}

/// # Safety
/// `desc` must point at a live, correctly sized [`super::idt::IdtPointer`].
#[inline]
pub unsafe fn load_idt(desc: *const super::idt::IdtPointer) {
    core::arch::asm!("lidt [{0}]", in(reg) desc, options(nostack, readonly));
}

/// Reads the faulting linear address left by the last page fault.
#[inline]
pub fn get_cr2() -> u64 {
    let value: u64;
    unsafe {
        core::arch::asm!("mov {0}, cr2", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    value
}

/// Writes the MMU address-space-root register, flushing the entire TLB.
///
/// # Safety
/// `pml4_pa` must be the physical address of a valid, fully-populated PML4.
#[inline]
pub unsafe fn switch_address_space(pml4_pa: u64) {
    core::arch::asm!("mov cr3, {0}", in(reg) pml4_pa, options(nostack));
}
