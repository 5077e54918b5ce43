//! Legacy 8259 PIC remap and the PIT channel-0 timer programming.
//!
//! The reference kernel assumes its IRQ0/IRQ7 land on fixed vectors 32 and
//! 39; the `pic8259` crate's `ChainedPics::new(32, 40)` gives exactly that
//! remap (master at 32-39, slave at 40-47) without hand-rolling ICW1-4.

use pic8259::ChainedPics;
use spin::Mutex;

use super::port::outb;

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = 40;

pub const TIMER_VECTOR: u8 = PIC_1_OFFSET;
pub const SPURIOUS_VECTOR: u8 = PIC_1_OFFSET + 7;

/// Matches the reference `EVENTS_PER_SECOND`: the PIT's base frequency is
/// ~1.193182 MHz, so this divisor lands close to 100 Hz.
pub(crate) const EVENTS_PER_SECOND: u32 = 100;
const PIT_BASE_HZ: u32 = 1_193_182;
const PIT_CHANNEL0: u16 = 0x40;
const PIT_MODE_COMMAND: u16 = 0x43;
const PIT_CHANNEL0_MODE2_ACCESS_LOHI: u8 = 0b0011_0100;

pub static PICS: Mutex<ChainedPics> = Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// # Safety
/// Must run once, early in boot, before interrupts are enabled.
pub unsafe fn init() {
    PICS.lock().initialize();
    program_pit();
}

fn program_pit() {
    let divisor = (PIT_BASE_HZ / EVENTS_PER_SECOND) as u16;
    unsafe {
        outb(PIT_MODE_COMMAND, PIT_CHANNEL0_MODE2_ACCESS_LOHI);
        outb(PIT_CHANNEL0, (divisor & 0xff) as u8);
        outb(PIT_CHANNEL0, (divisor >> 8) as u8);
    }
}

/// Sends end-of-interrupt for the given vector.
///
/// # Safety
/// Must be called from within the interrupt it is acknowledging.
pub unsafe fn acknowledge_interrupt(vector: u8) {
    PICS.lock().notify_end_of_interrupt(vector);
}

/// Probes the master PIC's in-service register to determine whether the
/// IRQ7 that produced vector 39 was a genuine hardware interrupt or a
/// spurious line glitch: a real IRQ7 leaves bit 7 of the ISR set, a
/// spurious one does not.
pub fn is_spurious_interrupt() -> bool {
    const READ_ISR: u8 = 0x0b;
    const PIC_1_COMMAND: u16 = 0x20;

    let _held = PICS.lock();
    unsafe {
        outb(PIC_1_COMMAND, READ_ISR);
        let isr = super::port::inb(PIC_1_COMMAND);
        isr & (1 << 7) == 0
    }
}
