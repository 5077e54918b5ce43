//! `int 0x80` syscall dispatch.
//!
//! Calling convention carried in the trap frame: `rax` = call number, `rdi`
//! = argument count (a sanity check, not trusted blindly), `rsi` = pointer
//! to a contiguous `u64` argument array in the caller's own address space.
//! Because a syscall trap doesn't switch `cr3`, that pointer is directly
//! dereferenceable here exactly as the caller sees it.

use crate::arch::amd64::trap::{to_sys_error, TrapFrame};
use crate::mm::{KernelError, Result};
use crate::{drivers, process};

pub const SYS_CALL_WRITE: u64 = 0;
pub const SYS_CALL_SLEEP: u64 = 1;

pub const SYS_ERROR: i64 = -1;
const STDOUT_FILENO: u64 = 1;

/// Routes a trapped `int 0x80` to the matching handler and writes the
/// result back into `frame.rax`, exactly where `iretq` delivers it to the
/// caller.
pub fn dispatch(frame: &mut TrapFrame) {
    let result = match frame.rax {
        SYS_CALL_WRITE => handle_write(frame),
        SYS_CALL_SLEEP => handle_sleep(frame),
        _ => Err(KernelError::UnknownSyscall),
    };

    frame.rax = match result {
        Ok(value) => value as u64,
        Err(e) => to_sys_error(e) as u64,
    };
}

/// Reads `N` packed `u64` arguments out of the user array `frame.rsi`
/// points at, after checking `frame.rdi` actually claims `N` of them.
///
/// # Safety
/// Relies on `frame.rsi` being a valid pointer into the caller's currently
/// active address space — true for any trap reached via `int 0x80`, since
/// entering the trap does not switch `cr3`.
fn read_args<const N: usize>(frame: &TrapFrame) -> Result<[u64; N]> {
    if frame.rdi != N as u64 {
        return Err(KernelError::InvalidSyscallArgs);
    }

    let ptr = frame.rsi as *const u64;
    let mut out = [0u64; N];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = unsafe { core::ptr::read_unaligned(ptr.add(i)) };
    }
    Ok(out)
}

fn handle_write(frame: &TrapFrame) -> Result<i64> {
    let [fd, buf_ptr, length] = read_args::<3>(frame)?;

    if fd != STDOUT_FILENO {
        return Err(KernelError::InvalidSyscallArgs);
    }

    let bytes = unsafe { core::slice::from_raw_parts(buf_ptr as *const u8, length as usize) };
    drivers::vga::write_bytes(bytes);
    Ok(length as i64)
}

fn handle_sleep(frame: &TrapFrame) -> Result<i64> {
    let [seconds] = read_args::<1>(frame)?;
    let events = seconds.checked_mul(process::EVENTS_PER_SECOND).ok_or(KernelError::InvalidSyscallArgs)?;

    let deadline = process::timer_counter().wrapping_add(events);
    // Wrapping subtraction reinterpreted as signed handles one wrap of
    // `timer_counter` past `u64::MAX` transparently: the difference stays
    // "as far ahead" as it was before the wrap.
    while (deadline.wrapping_sub(process::timer_counter()) as i64) > 0 {
        unsafe { process::sleep(process::TIMER_WAIT) };
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_frame() -> TrapFrame {
        TrapFrame {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rbp: 0,
            rdi: 0,
            rsi: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
            vector_number: 0,
            error_code: 0,
            rip: 0,
            cs: 0,
            rflags: 0,
            rsp: 0,
            ss: 0,
        }
    }

    #[test]
    fn unknown_call_number_returns_sys_error() {
        let mut frame = blank_frame();
        frame.rax = 99;
        dispatch(&mut frame);
        assert_eq!(frame.rax as i64, SYS_ERROR);
    }

    #[test]
    fn argument_count_mismatch_returns_sys_error() {
        let mut frame = blank_frame();
        frame.rax = SYS_CALL_WRITE;
        frame.rdi = 2; // write wants 3
        dispatch(&mut frame);
        assert_eq!(frame.rax as i64, SYS_ERROR);
    }

    #[test]
    fn write_to_non_stdout_fd_returns_sys_error() {
        let args: [u64; 3] = [7, 0, 0];
        let mut frame = blank_frame();
        frame.rax = SYS_CALL_WRITE;
        frame.rdi = 3;
        frame.rsi = args.as_ptr() as u64;
        dispatch(&mut frame);
        assert_eq!(frame.rax as i64, SYS_ERROR);
    }

    #[test]
    fn sleep_overflowing_event_count_returns_sys_error() {
        let args: [u64; 1] = [u64::MAX];
        let mut frame = blank_frame();
        frame.rax = SYS_CALL_SLEEP;
        frame.rdi = 1;
        frame.rsi = args.as_ptr() as u64;
        dispatch(&mut frame);
        assert_eq!(frame.rax as i64, SYS_ERROR);
    }
}
