//! Device drivers. A single-CPU kernel core only needs the one screen it
//! prints diagnostics to; a second driver would live alongside `vga` here.

pub mod vga;
