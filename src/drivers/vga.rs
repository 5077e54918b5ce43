//! The VGA text-mode screen: the kernel's only output device, and the sink
//! [`klog!`](crate::klog!)/[`kwarn!`](crate::kwarn!) write through.
//!
//! The cursor position survives across the bootloader-to-kernel handoff as
//! two `u32` cells at fixed physical addresses immediately after the MBR's
//! print-stage sector, so a message printed before paging was even set up
//! continues on the same line rather than restarting at (0, 0).
//!
//! The cursor/wrap/scroll bookkeeping in [`Screen`] is generic over
//! [`ScreenSurface`] for the same reason [`PhysicalMemory`](crate::mm::PhysicalMemory)
//! is a trait rather than a hard-coded pointer cast: it lets the wrap and
//! scroll logic run against a host-backed fake under `cargo test` instead of
//! real video RAM.

use core::fmt;

use spin::Mutex;

use crate::arch::amd64::addr::PhysAddr;

const MBR_PA: u64 = 0x7c00;
const BYTES_PER_SECTOR: u64 = 512;

/// Where the firmware/bootloader left the last-used cursor row, as a `u32`.
const ROW_PA: u64 = MBR_PA + BYTES_PER_SECTOR;
/// Immediately after `ROW_PA`: the last-used cursor column, as a `u32`.
const COL_PA: u64 = ROW_PA + 4;

pub const VIDEO_PA: u64 = 0xb8000;

pub const SCREEN_WIDTH: usize = 80;
pub const SCREEN_HEIGHT: usize = 25;
const BYTES_PER_CHAR: usize = 2;

/// Light green on black, matching the reference kernel's `GREEN`.
const DEFAULT_COLOUR: u8 = 0xa;

/// Blue, matching the reference kernel's `BLUE` — the attribute byte the
/// timer handler stamps onto its visible tick counter.
const TIMER_TICK_COLOUR: u8 = 1;

/// A flat grid of `(char, attribute)` cells a [`Screen`] can write through.
/// The real kernel's only implementor, [`VideoMemory`], is a zero-sized
/// handle onto the identity-mapped VGA buffer.
pub trait ScreenSurface {
    /// # Safety
    /// `row < SCREEN_HEIGHT`, `col < SCREEN_WIDTH`.
    unsafe fn put(&mut self, row: usize, col: usize, ch: u8, colour: u8);

    /// Shifts every row up by one, blanking the last row.
    fn scroll_up_one_line(&mut self);
}

pub struct VideoMemory;

impl VideoMemory {
    fn base(&self) -> *mut u8 {
        PhysAddr::new(VIDEO_PA).to_identity_virt().as_mut_ptr::<u8>()
    }
}

impl ScreenSurface for VideoMemory {
    unsafe fn put(&mut self, row: usize, col: usize, ch: u8, colour: u8) {
        let cell = self.base().add(row * SCREEN_WIDTH * BYTES_PER_CHAR + col * BYTES_PER_CHAR);
        core::ptr::write_volatile(cell, ch);
        core::ptr::write_volatile(cell.add(1), colour);
    }

    fn scroll_up_one_line(&mut self) {
        let bytes_per_line = SCREEN_WIDTH * BYTES_PER_CHAR;
        unsafe {
            let base = self.base();
            core::ptr::copy(base.add(bytes_per_line), base, (SCREEN_HEIGHT - 1) * bytes_per_line);
            core::ptr::write_bytes(base.add((SCREEN_HEIGHT - 1) * bytes_per_line), 0, bytes_per_line);
        }
    }
}

pub static SCREEN: Mutex<Screen<VideoMemory>> = Mutex::new(Screen::new(VideoMemory));

pub struct Screen<S: ScreenSurface> {
    row: usize,
    col: usize,
    surface: S,
}

impl<S: ScreenSurface> Screen<S> {
    pub const fn new(surface: S) -> Self {
        Screen { row: 0, col: 0, surface }
    }

    fn write_byte(&mut self, ch: u8) {
        if self.col == SCREEN_WIDTH {
            self.row += 1;
            self.col = 0;
        }
        if self.row == SCREEN_HEIGHT {
            self.surface.scroll_up_one_line();
            self.row -= 1;
        }
        if ch == b'\n' {
            self.row += 1;
            self.col = 0;
        } else {
            unsafe { self.surface.put(self.row, self.col, ch, DEFAULT_COLOUR) };
            self.col += 1;
        }
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.write_byte(b);
        }
    }
}

impl<S: ScreenSurface> fmt::Write for Screen<S> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_bytes(s.as_bytes());
        Ok(())
    }
}

/// Picks up the cursor position the bootloader's own print stage left
/// behind, so kernel diagnostics continue on the same line.
///
/// # Safety
/// Must run once during boot, before any other `SCREEN` use, with
/// `ROW_PA`/`COL_PA` backed by mapped memory.
pub unsafe fn init() {
    let row = core::ptr::read_volatile(PhysAddr::new(ROW_PA).to_identity_virt().as_ptr::<u32>()) as usize;
    let col = core::ptr::read_volatile(PhysAddr::new(COL_PA).to_identity_virt().as_ptr::<u32>()) as usize;
    let mut screen = SCREEN.lock();
    screen.row = row.min(SCREEN_HEIGHT.saturating_sub(1));
    screen.col = col.min(SCREEN_WIDTH);
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    let _ = SCREEN.lock().write_fmt(args);
}

/// Writes raw bytes to the screen, honouring the same wrap/scroll/newline
/// rules as [`_print`]. Used directly by `SYS_CALL_WRITE`, which hands over
/// a user buffer rather than a `fmt::Arguments`.
pub fn write_bytes(bytes: &[u8]) {
    SCREEN.lock().write_bytes(bytes);
}

/// Bumps the character cell at `VIDEO_PA` (top-left of the screen) and
/// stamps it blue, independent of the cursor-tracking [`Screen`] above —
/// a visible per-tick heartbeat, mirroring the reference timer handler's
/// raw `++*v` on `VIDEO_VA`.
///
/// # Safety
/// Must run with `VIDEO_PA` backed by mapped video memory, i.e. any time
/// after the identity window is in force.
pub unsafe fn bump_timer_tick_cell() {
    let cell = PhysAddr::new(VIDEO_PA).to_identity_virt().as_mut_ptr::<u8>();
    let ch = core::ptr::read_volatile(cell);
    core::ptr::write_volatile(cell, ch.wrapping_add(1));
    core::ptr::write_volatile(cell.add(1), TIMER_TICK_COLOUR);
}

#[cfg(test)]
mod tests {
    use super::*;

    extern crate std;
    use std::vec;
    use std::vec::Vec;

    struct FakeSurface {
        cells: Vec<(u8, u8)>,
        scrolls: usize,
    }

    impl FakeSurface {
        fn new() -> Self {
            FakeSurface { cells: vec![(0, 0); SCREEN_WIDTH * SCREEN_HEIGHT], scrolls: 0 }
        }
    }

    impl ScreenSurface for FakeSurface {
        unsafe fn put(&mut self, row: usize, col: usize, ch: u8, colour: u8) {
            self.cells[row * SCREEN_WIDTH + col] = (ch, colour);
        }

        fn scroll_up_one_line(&mut self) {
            self.scrolls += 1;
        }
    }

    #[test]
    fn write_byte_wraps_at_screen_width() {
        let mut screen = Screen::new(FakeSurface::new());
        screen.col = SCREEN_WIDTH;
        screen.write_byte(b'x');
        assert_eq!(screen.row, 1);
        assert_eq!(screen.col, 1);
        assert_eq!(screen.surface.cells[SCREEN_WIDTH], (b'x', DEFAULT_COLOUR));
    }

    #[test]
    fn newline_resets_column_without_writing_a_cell() {
        let mut screen = Screen::new(FakeSurface::new());
        screen.col = 5;
        screen.write_byte(b'\n');
        assert_eq!(screen.row, 1);
        assert_eq!(screen.col, 0);
        assert_eq!(screen.surface.cells[5], (0, 0));
    }

    #[test]
    fn overflowing_last_row_scrolls_once_and_keeps_writing() {
        let mut screen = Screen::new(FakeSurface::new());
        screen.row = SCREEN_HEIGHT - 1;
        screen.col = SCREEN_WIDTH - 1;
        screen.write_byte(b'a');
        screen.write_byte(b'b');
        assert_eq!(screen.surface.scrolls, 1);
        assert_eq!(screen.row, SCREEN_HEIGHT - 1);
        assert_eq!(screen.col, 1);
    }

    #[test]
    fn write_str_renders_plain_text_left_to_right() {
        let mut screen = Screen::new(FakeSurface::new());
        use fmt::Write;
        screen.write_str("hi").unwrap();
        assert_eq!(screen.surface.cells[0], (b'h', DEFAULT_COLOUR));
        assert_eq!(screen.surface.cells[1], (b'i', DEFAULT_COLOUR));
    }
}
