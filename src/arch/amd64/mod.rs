//! x86-64 architecture support: addresses, descriptor tables, the legacy
//! PIC/PIT, I/O ports, the trap frame, and the low-level context-switch and
//! interrupt-entry trampolines.

pub mod addr;
pub mod context;
pub mod gdt;
pub mod idt;
pub mod pic;
pub mod port;
pub mod trap;
