//! Host-backed [`PhysicalMemory`] fake for unit tests. `vesper` is
//! `#![no_std]`, but `cargo test` links the host's `std` into the test
//! harness regardless, so this module borrows `std::vec::Vec` explicitly
//! rather than relying on any prelude.
extern crate std;

use std::vec;
use std::vec::Vec;

use crate::arch::amd64::addr::PhysAddr;
use crate::mm::PhysicalMemory;

/// A flat byte array standing in for physical RAM, indexed directly by
/// physical address. Big enough for the scenarios in the testable-properties
/// section without needing a sparse representation.
pub struct FakeMemory {
    bytes: Vec<u8>,
}

impl FakeMemory {
    pub fn new(size: usize) -> Self {
        FakeMemory { bytes: vec![0u8; size] }
    }

    fn idx(&self, pa: PhysAddr) -> usize {
        let i = pa.as_u64() as usize;
        assert!(i < self.bytes.len(), "fake physical memory out of range: {i:#x}");
        i
    }
}

impl PhysicalMemory for FakeMemory {
    unsafe fn read_u64(&self, pa: PhysAddr) -> u64 {
        let i = self.idx(pa);
        u64::from_ne_bytes(self.bytes[i..i + 8].try_into().unwrap())
    }

    unsafe fn write_u64(&mut self, pa: PhysAddr, value: u64) {
        let i = self.idx(pa);
        self.bytes[i..i + 8].copy_from_slice(&value.to_ne_bytes());
    }

    unsafe fn zero(&mut self, pa: PhysAddr, len: usize) {
        let i = self.idx(pa);
        self.bytes[i..i + len].fill(0);
    }

    unsafe fn copy_from(&mut self, pa: PhysAddr, src: *const u8, len: usize) {
        let i = self.idx(pa);
        let src_slice = core::slice::from_raw_parts(src, len);
        self.bytes[i..i + len].copy_from_slice(src_slice);
    }

    unsafe fn copy_to(&self, pa: PhysAddr, dst: *mut u8, len: usize) {
        let i = self.idx(pa);
        core::ptr::copy_nonoverlapping(self.bytes[i..i + len].as_ptr(), dst, len);
    }
}
