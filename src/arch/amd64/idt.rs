//! Interrupt Descriptor Table: 256 gates, built once at boot and never
//! touched again. Every vector this kernel uses points at the matching
//! trampoline in [`context`](super::context); every other gate is left
//! absent so an unexpected vector takes a general protection fault instead
//! of jumping through garbage.

use core::mem::size_of_val;

use bitflags::bitflags;

use super::context;
use super::gdt::CODE_SELECTOR;
use super::trap::SOFTWARE_INT;

bitflags! {
    /// The type/attribute byte of an IDT gate descriptor: present bit,
    /// descriptor privilege level, and gate type packed the way the CPU
    /// expects them, bit for bit.
    #[derive(Clone, Copy)]
    struct GateAttributes: u8 {
        const PRESENT = 1 << 7;
        const DPL_RING_3 = 0b011 << 5;
        const INTERRUPT_GATE_64 = 0b1110;
    }
}

const RING0_GATE: GateAttributes =
    GateAttributes::from_bits_truncate(GateAttributes::PRESENT.bits() | GateAttributes::INTERRUPT_GATE_64.bits());

const RING3_CALLABLE_GATE: GateAttributes = GateAttributes::from_bits_truncate(
    GateAttributes::PRESENT.bits() | GateAttributes::DPL_RING_3.bits() | GateAttributes::INTERRUPT_GATE_64.bits(),
);

const IDT_ENTRIES: usize = 256;

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    ist: u8,
    type_attributes: u8,
    offset_mid: u16,
    offset_high: u32,
    reserved: u32,
}

impl IdtEntry {
    const fn missing() -> Self {
        IdtEntry { offset_low: 0, selector: 0, ist: 0, type_attributes: 0, offset_mid: 0, offset_high: 0, reserved: 0 }
    }

    fn gate(handler: usize, attributes: GateAttributes) -> Self {
        IdtEntry {
            offset_low: (handler & 0xffff) as u16,
            selector: CODE_SELECTOR,
            ist: 0,
            type_attributes: attributes.bits(),
            offset_mid: ((handler >> 16) & 0xffff) as u16,
            offset_high: ((handler >> 32) & 0xffff_ffff) as u32,
            reserved: 0,
        }
    }
}

#[repr(C, packed)]
pub struct IdtPointer {
    limit: u16,
    base: u64,
}

static mut IDT: [IdtEntry; IDT_ENTRIES] = [IdtEntry::missing(); IDT_ENTRIES];
static mut IDT_POINTER: IdtPointer = IdtPointer { limit: 0, base: 0 };

/// Every CPU exception vector this kernel installs a ring-0 gate for, paired
/// with its trampoline. 9 (legacy coprocessor segment overrun) and 15
/// (reserved) are deliberately absent, matching the reference vector list.
macro_rules! ring0_vectors {
    ($install:ident) => {
        $install(0, context::vector_0 as usize);
        $install(1, context::vector_1 as usize);
        $install(2, context::vector_2 as usize);
        $install(3, context::vector_3 as usize);
        $install(4, context::vector_4 as usize);
        $install(5, context::vector_5 as usize);
        $install(6, context::vector_6 as usize);
        $install(7, context::vector_7 as usize);
        $install(8, context::vector_8 as usize);
        $install(10, context::vector_10 as usize);
        $install(11, context::vector_11 as usize);
        $install(12, context::vector_12 as usize);
        $install(13, context::vector_13 as usize);
        $install(14, context::vector_14 as usize);
        $install(16, context::vector_16 as usize);
        $install(17, context::vector_17 as usize);
        $install(18, context::vector_18 as usize);
        $install(19, context::vector_19 as usize);
    };
}

/// Builds and loads the IDT.
///
/// # Safety
/// Must run once during boot, after the GDT is loaded (gates reference
/// [`CODE_SELECTOR`]) and before interrupts are enabled.
pub unsafe fn init() {
    let install_ring0 = |vector: usize, handler: usize| {
        IDT[vector] = IdtEntry::gate(handler, RING0_GATE);
    };
    ring0_vectors!(install_ring0);

    IDT[super::pic::TIMER_VECTOR as usize] = IdtEntry::gate(context::vector_32 as usize, RING0_GATE);
    IDT[super::pic::SPURIOUS_VECTOR as usize] = IdtEntry::gate(context::vector_39 as usize, RING0_GATE);

    IDT[SOFTWARE_INT as usize] =
        IdtEntry::gate(context::system_software_interrupt as usize, RING3_CALLABLE_GATE);

    IDT_POINTER.limit = (size_of_val(&IDT) - 1) as u16;
    IDT_POINTER.base = core::ptr::addr_of!(IDT) as u64;

    context::load_idt(core::ptr::addr_of!(IDT_POINTER));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring0_gate_has_expected_bits() {
        assert_eq!(RING0_GATE.bits(), 0b1000_1110);
    }

    #[test]
    fn ring3_callable_gate_sets_dpl_three() {
        assert_eq!(RING3_CALLABLE_GATE.bits(), 0b1110_1110);
    }

    #[test]
    fn gate_encodes_handler_address_across_all_three_fields() {
        let handler: usize = 0x1234_5678_9abc;
        let entry = IdtEntry::gate(handler, RING0_GATE);
        let low = entry.offset_low;
        let mid = entry.offset_mid;
        let high = entry.offset_high;
        let reassembled = (low as u64) | ((mid as u64) << 16) | ((high as u64) << 32);
        assert_eq!(reassembled, handler as u64);
    }
}
