//! Process control blocks and the round-robin scheduler.
//!
//! Everything here runs with interrupts disabled (ring 0 is never
//! preempted), so the PCB array and the ready/wait lists need no lock — only
//! the [`Ring0`] witness, obtainable solely from the boot path or from
//! inside an interrupt/syscall handler, proving that precondition to the
//! type system instead of a spinlock nothing in this single-CPU design
//! needs.

use crate::arch::amd64::addr::{PhysAddr, VirtAddr};
use crate::arch::amd64::gdt::{USER_CODE_SELECTOR, USER_DATA_SELECTOR};
use crate::arch::amd64::{context, gdt};
use crate::mm::paging;
use crate::mm::phys::PhysAllocator;
use crate::mm::{KernelError, PhysicalMemory, Result, PAGE_SIZE};

pub const MAX_PROCESSES: usize = 1024;
pub const KERNEL_PID: u32 = 0;

/// Distinct from `TIMER_WAIT` (0): a PCB not on the wait list always carries
/// this sentinel, never a stale `0` left over from the last wake (see
/// DESIGN.md for why the reference's own convention is unsafe here).
pub const NO_WAIT_REASON: i64 = -1;
pub const TIMER_WAIT: i64 = 0;

pub const EVENTS_PER_SECOND: u64 = crate::arch::amd64::pic::EVENTS_PER_SECOND as u64;

const END: isize = -1;

const RFLAGS_INTERRUPT_ENABLE: u64 = 1 << 9;
const RFLAGS_RESERVED_BIT_1: u64 = 1 << 1;

/// Field count of `TrapFrame`: r15..rax (15) + vector_number, error_code (2)
/// + rip, cs, rflags, rsp, ss (5).
const TRAP_FRAME_WORDS: u64 = 22;
const TRAP_FRAME_SIZE: u64 = TRAP_FRAME_WORDS * 8;
/// r15, r14, r13, r12, rbx, rbp, return_address.
const SWITCH_FRAME_SIZE: u64 = 7 * 8;

/// The kernel's bundled user images: fixed `(physical address, size)` pairs
/// the bootloader has already placed before handing off. No executable
/// format is parsed; each blob is copied byte-for-byte as flat,
/// position-dependent machine code.
pub const BUILTIN_IMAGES: &[(PhysAddr, u64)] =
    &[(PhysAddr::new(0x2_0000), 6 * 512), (PhysAddr::new(0x3_0000), 6 * 512)];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Unused,
    Ready,
    Running,
    Sleeping,
}

#[derive(Debug, Clone, Copy)]
pub struct Pcb {
    pub state: ProcessState,
    pub pid: u32,
    pub ppid: u32,
    pub address_space_root_pa: PhysAddr,
    pub kernel_stack_base_va: VirtAddr,
    pub saved_trap_frame_va: VirtAddr,
    pub saved_rsp: u64,
    pub wait_reason: i64,
    pub ready_next: isize,
    pub wait_next: isize,
}

impl Pcb {
    const fn unused() -> Self {
        Pcb {
            state: ProcessState::Unused,
            pid: 0,
            ppid: 0,
            address_space_root_pa: PhysAddr::NULL,
            kernel_stack_base_va: VirtAddr::new(0),
            saved_trap_frame_va: VirtAddr::new(0),
            saved_rsp: 0,
            wait_reason: NO_WAIT_REASON,
            ready_next: END,
            wait_next: END,
        }
    }
}

/// Zero-sized proof that interrupts are disabled and we are executing in
/// ring 0 with exclusive access to [`KernelState`]. Constructible only from
/// the boot path (before interrupts are enabled) or from inside an
/// interrupt/syscall handler.
pub struct Ring0(());

impl Ring0 {
    /// # Safety
    /// The caller must actually be executing with interrupts disabled in
    /// ring 0 — i.e. during boot before `sti`, or inside the common
    /// interrupt stub's call into a handler.
    pub unsafe fn assume_current() -> Self {
        Ring0(())
    }
}

pub struct KernelState {
    pub alloc: PhysAllocator,
    pcbs: [Pcb; MAX_PROCESSES],
    generations: [u32; MAX_PROCESSES],
    ready_head: isize,
    ready_tail: isize,
    wait_head: isize,
    current_index: isize,
    timer_counter: u64,
}

impl KernelState {
    const fn new() -> Self {
        KernelState {
            alloc: PhysAllocator::new(),
            pcbs: [Pcb::unused(); MAX_PROCESSES],
            generations: [0; MAX_PROCESSES],
            ready_head: END,
            ready_tail: END,
            wait_head: END,
            current_index: END,
            timer_counter: 0,
        }
    }

    pub fn timer_counter(&self) -> u64 {
        self.timer_counter
    }

    pub fn current_index(&self) -> isize {
        self.current_index
    }

    pub fn pcb(&self, idx: usize) -> &Pcb {
        &self.pcbs[idx]
    }

    fn first_unused_slot(&self) -> Option<usize> {
        // Slot 0 is reserved for the kernel pseudo-pid and never handed out.
        (1..MAX_PROCESSES).find(|&i| self.pcbs[i].state == ProcessState::Unused)
    }

    fn push_ready_tail(&mut self, idx: usize) {
        self.pcbs[idx].ready_next = END;
        if self.ready_head == END {
            self.ready_head = idx as isize;
        } else {
            self.pcbs[self.ready_tail as usize].ready_next = idx as isize;
        }
        self.ready_tail = idx as isize;
    }

    /// Prepends onto the ready list: `idx` becomes `ready_head`. Used by
    /// [`KernelState::wake`] so a just-signalled task gets first crack at the
    /// CPU ahead of tasks that have been ready longer (favours latency over
    /// fairness for wakeups, per the scheduler's policy).
    fn push_ready_head(&mut self, idx: usize) {
        self.pcbs[idx].ready_next = self.ready_head;
        if self.ready_head == END {
            self.ready_tail = idx as isize;
        }
        self.ready_head = idx as isize;
    }

    fn pop_ready_head(&mut self) -> Option<usize> {
        if self.ready_head == END {
            return None;
        }
        let idx = self.ready_head as usize;
        self.ready_head = self.pcbs[idx].ready_next;
        if self.ready_head == END {
            self.ready_tail = END;
        }
        self.pcbs[idx].ready_next = END;
        Some(idx)
    }

    fn enqueue_wait(&mut self, idx: usize, reason: i64) {
        self.pcbs[idx].state = ProcessState::Sleeping;
        self.pcbs[idx].wait_reason = reason;
        self.pcbs[idx].wait_next = self.wait_head;
        self.wait_head = idx as isize;
    }

    /// Unblocks every sleeper tagged with `reason` in one forward pass that
    /// rebuilds the wait list's surviving links, rather than patching
    /// predecessor pointers mid-traversal — the latter can skip a node when
    /// consecutive entries both match (see DESIGN.md).
    pub fn wake(&mut self, reason: i64) {
        let mut new_wait_head = END;
        let mut new_wait_tail = END;
        let mut cursor = self.wait_head;

        while cursor != END {
            let idx = cursor as usize;
            let next = self.pcbs[idx].wait_next;

            if self.pcbs[idx].wait_reason == reason {
                self.pcbs[idx].wait_reason = NO_WAIT_REASON;
                self.pcbs[idx].state = ProcessState::Ready;
                self.push_ready_head(idx);
            } else {
                self.pcbs[idx].wait_next = END;
                if new_wait_head == END {
                    new_wait_head = cursor;
                } else {
                    self.pcbs[new_wait_tail as usize].wait_next = cursor;
                }
                new_wait_tail = cursor;
            }

            cursor = next;
        }

        self.wait_head = new_wait_head;
    }

    /// The outgoing process is always moved onto exactly one list by the
    /// caller (ready, by [`reschedule`]; wait, by [`sleep`]) before this
    /// runs — it only ever picks the next Running process and performs the
    /// actual stack/address-space swap.
    unsafe fn switch_to_next(&mut self, outgoing: usize) {
        let Some(new_index) = self.pop_ready_head() else {
            // No other task is runnable. Matches the reference's "a
            // single-process system keeps running" policy; a sleeper with
            // nothing else ready would otherwise have nothing to resume it.
            return;
        };

        self.pcbs[new_index].state = ProcessState::Running;
        self.current_index = new_index as isize;
        let new_pcb = self.pcbs[new_index];

        gdt::set_kernel_stack(new_pcb.kernel_stack_base_va.as_u64() + PAGE_SIZE);
        context::switch_address_space(new_pcb.address_space_root_pa.as_u64());
        let old_rsp_ptr = core::ptr::addr_of_mut!(self.pcbs[outgoing].saved_rsp);
        context::switch_process(old_rsp_ptr, new_pcb.saved_rsp);
    }
}

static mut KERNEL_STATE: KernelState = KernelState::new();

/// # Safety
/// The `Ring0` witness already proves exclusive, non-reentrant access.
pub unsafe fn state(_ring0: &Ring0) -> &'static mut KernelState {
    &mut *core::ptr::addr_of_mut!(KERNEL_STATE)
}

/// Writes every field of a fresh [`TrapFrame`] at `trap_frame_pa`, set up so
/// the first `iretq` delivers control to ring 3 at the user image's entry
/// point with its own stack and interrupts enabled.
fn write_initial_trap_frame<M: PhysicalMemory>(mem: &mut M, trap_frame_pa: PhysAddr) {
    for word in 0..TRAP_FRAME_WORDS {
        unsafe { mem.write_u64(trap_frame_pa + word * 8, 0) };
    }

    let rip_offset = 17 * 8;
    let cs_offset = 18 * 8;
    let rflags_offset = 19 * 8;
    let rsp_offset = 20 * 8;
    let ss_offset = 21 * 8;

    unsafe {
        mem.write_u64(trap_frame_pa + rip_offset, crate::mm::USER_EXEC_START_VA);
        mem.write_u64(trap_frame_pa + cs_offset, USER_CODE_SELECTOR as u64);
        mem.write_u64(trap_frame_pa + rflags_offset, RFLAGS_INTERRUPT_ENABLE | RFLAGS_RESERVED_BIT_1);
        mem.write_u64(trap_frame_pa + rsp_offset, crate::mm::USER_STACK_VA);
        mem.write_u64(trap_frame_pa + ss_offset, USER_DATA_SELECTOR as u64);
    }
}

/// Lays the synthetic switch frame immediately below the trap frame: six
/// zeroed callee-saved register slots and a "return address" of
/// `interrupt_return`, so the first [`context::switch_process`] into this
/// task pops straight into the normal interrupt-return path.
fn write_initial_switch_frame<M: PhysicalMemory>(mem: &mut M, switch_frame_pa: PhysAddr) {
    for word in 0..6 {
        unsafe { mem.write_u64(switch_frame_pa + word * 8, 0) };
    }
    let return_address = context::interrupt_return as usize as u64;
    unsafe { mem.write_u64(switch_frame_pa + 6 * 8, return_address) };
}

/// Finds the first Unused PCB slot, builds a user address space for
/// `image_pa`/`image_size`, and lays down the trap frame and switch frame
/// that let this task be entered for the first time. Appends the new PCB to
/// the ready-tail.
pub fn prepare<M: PhysicalMemory>(
    state: &mut KernelState,
    mem: &mut M,
    image_pa: PhysAddr,
    image_size: u64,
) -> Result<usize> {
    let slot = state.first_unused_slot().ok_or(KernelError::OutOfPhysicalMemory)?;

    let stack_page_pa = state.alloc.try_allocate_page(mem)?;
    let max_pa_exclusive = state.alloc.max_pa_exclusive();

    let root_pa = paging::create_user_address_space(mem, &mut state.alloc, max_pa_exclusive, image_pa, image_size)
        .ok_or(KernelError::OutOfPhysicalMemory)?;

    let trap_frame_pa = stack_page_pa + (PAGE_SIZE - TRAP_FRAME_SIZE);
    write_initial_trap_frame(mem, trap_frame_pa);

    let switch_frame_pa = PhysAddr::new(trap_frame_pa.as_u64() - SWITCH_FRAME_SIZE);
    write_initial_switch_frame(mem, switch_frame_pa);

    let generation = state.generations[slot];
    state.generations[slot] = generation.wrapping_add(1);
    let pid = slot as u32 + generation * MAX_PROCESSES as u32;

    let pcb = &mut state.pcbs[slot];
    *pcb = Pcb {
        state: ProcessState::Ready,
        pid,
        ppid: KERNEL_PID,
        address_space_root_pa: root_pa,
        kernel_stack_base_va: stack_page_pa.to_identity_virt(),
        saved_trap_frame_va: trap_frame_pa.to_identity_virt(),
        saved_rsp: switch_frame_pa.to_identity_virt().as_u64(),
        wait_reason: NO_WAIT_REASON,
        ready_next: END,
        wait_next: END,
    };

    state.push_ready_tail(slot);
    Ok(slot)
}

/// Prepares every built-in image, then enters the first ready task and
/// never returns. Must be called exactly once, at the end of boot.
///
/// # Safety
/// The GDT, IDT, and PIC must already be initialised and interrupts must
/// still be disabled; `mem` must be the real identity window.
pub unsafe fn start_init<M: PhysicalMemory>(mem: &mut M) -> ! {
    let ring0 = Ring0::assume_current();
    let state = state(&ring0);

    for &(image_pa, image_size) in BUILTIN_IMAGES {
        prepare(state, mem, image_pa, image_size).expect("failed to prepare a built-in image");
    }

    let first = state.pop_ready_head().expect("no built-in images prepared");
    state.pcbs[first].state = ProcessState::Running;
    state.current_index = first as isize;

    let pcb = state.pcbs[first];
    gdt::set_kernel_stack(pcb.kernel_stack_base_va.as_u64() + PAGE_SIZE);
    context::switch_address_space(pcb.address_space_root_pa.as_u64());
    context::enter_process(pcb.saved_trap_frame_va.as_u64())
}

/// Involuntary suspension point: requeues the running task onto the
/// ready-tail and switches to the next ready task. A no-op if the ready
/// list is empty (the running task simply keeps running).
///
/// # Safety
/// Must be called with interrupts disabled, in ring 0.
pub unsafe fn reschedule(ring0: &Ring0) {
    let state = state(ring0);
    let Some(current) = non_negative(state.current_index) else { return };
    if state.ready_head == END {
        return;
    }
    state.pcbs[current].state = ProcessState::Ready;
    state.push_ready_tail(current);
    state.switch_to_next(current);
}

/// Voluntary suspension: tags the running task with `reason` and moves it
/// onto the wait list, then switches to the next ready task. Returns (much
/// later, on the caller's kernel stack) once `wake(reason)` and a
/// subsequent schedule have brought this task back to Running.
///
/// # Safety
/// Must be called with interrupts disabled, in ring 0.
pub unsafe fn sleep(reason: i64) {
    let ring0 = Ring0::assume_current();
    let state = state(&ring0);
    let Some(current) = non_negative(state.current_index) else { return };
    state.enqueue_wait(current, reason);
    state.switch_to_next(current);
}

fn non_negative(index: isize) -> Option<usize> {
    if index < 0 {
        None
    } else {
        Some(index as usize)
    }
}

/// Reads the current timer tick count. Used by the syscall layer to compute
/// a sleep deadline without holding a `KernelState` borrow across the
/// sleep/wake loop.
pub fn timer_counter() -> u64 {
    unsafe {
        let ring0 = Ring0::assume_current();
        state(&ring0).timer_counter()
    }
}

/// Called from the vector-32 arm of [`crate::arch::amd64::trap::interrupt_handler`]
/// after the PIC has already been acknowledged.
pub fn on_timer_tick() {
    unsafe {
        let ring0 = Ring0::assume_current();
        let state = state(&ring0);
        state.timer_counter = state.timer_counter.wrapping_add(1);
        state.wake(TIMER_WAIT);
        reschedule(&ring0);
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    fn fresh_state() -> KernelState {
        KernelState::new()
    }

    /// Seeds `count` PCBs as Ready (bypassing `prepare`'s address-space and
    /// trap-frame machinery, which this module's pure list-surgery logic
    /// does not touch) so the scheduler's rotation can be exercised on the
    /// host.
    fn seed_ready(state: &mut KernelState, count: usize) -> std::vec::Vec<usize> {
        let mut slots = std::vec::Vec::new();
        for i in 1..=count {
            state.pcbs[i].state = ProcessState::Ready;
            state.push_ready_tail(i);
            slots.push(i);
        }
        slots
    }

    #[test]
    fn scheduler_fairness_cycles_all_ready_tasks_in_fifo_order() {
        let mut state = fresh_state();
        let slots = seed_ready(&mut state, 3);

        // Slot 1 (the first prepared) becomes current without a reschedule,
        // matching start_init's own pop-and-run.
        let first = state.pop_ready_head().unwrap();
        state.pcbs[first].state = ProcessState::Running;
        state.current_index = first as isize;
        assert_eq!(first, slots[0]);

        let mut seen = std::vec::Vec::new();
        seen.push(first);
        for _ in 0..slots.len() - 1 {
            let current = state.current_index as usize;
            state.pcbs[current].state = ProcessState::Ready;
            state.push_ready_tail(current);
            let next = state.pop_ready_head().unwrap();
            state.pcbs[next].state = ProcessState::Running;
            state.current_index = next as isize;
            seen.push(next);
        }

        assert_eq!(seen, slots);
    }

    #[test]
    fn wake_all_moves_every_matching_sleeper_to_ready_and_clears_wait_list() {
        let mut state = fresh_state();
        let reason = 7;
        state.enqueue_wait(1, reason);
        state.enqueue_wait(2, reason);
        state.enqueue_wait(3, reason);

        state.wake(reason);

        assert_eq!(state.wait_head, END);
        for slot in [1, 2, 3] {
            assert_eq!(state.pcbs[slot].state, ProcessState::Ready);
            assert_eq!(state.pcbs[slot].wait_reason, NO_WAIT_REASON);
        }
    }

    #[test]
    fn wake_prepends_onto_ready_head_ahead_of_already_ready_tasks() {
        // Slot 1 has been ready for a while; slot 2 just woke up and should
        // jump ahead of it per the scheduler's latency-favouring wake policy.
        let mut state = fresh_state();
        state.pcbs[1].state = ProcessState::Ready;
        state.push_ready_tail(1);
        state.enqueue_wait(2, 9);

        state.wake(9);

        assert_eq!(state.ready_head, 2, "just-woken task must be prepended onto ready_head");
        assert_eq!(state.pcbs[2].ready_next, 1);
        assert_eq!(state.ready_tail, 1, "tail must still point at the longest-ready task");
    }

    #[test]
    fn wake_onto_empty_ready_list_sets_both_head_and_tail() {
        let mut state = fresh_state();
        state.enqueue_wait(1, 9);

        state.wake(9);

        assert_eq!(state.ready_head, 1);
        assert_eq!(state.ready_tail, 1);
    }

    #[test]
    fn wake_does_not_skip_the_middle_of_three_consecutive_matching_sleepers() {
        // A, B, C sleep in that order, so the wait list head-first is C, B, A.
        let mut state = fresh_state();
        let reason = 3;
        state.enqueue_wait(1, reason); // A
        state.enqueue_wait(2, reason); // B
        state.enqueue_wait(3, reason); // C

        state.wake(reason);

        assert_eq!(state.pcbs[2].state, ProcessState::Ready, "B must not be skipped");
        assert_eq!(state.wait_head, END);
    }

    #[test]
    fn wake_leaves_non_matching_sleepers_on_the_wait_list() {
        let mut state = fresh_state();
        state.enqueue_wait(1, 1);
        state.enqueue_wait(2, 2);
        state.enqueue_wait(3, 1);

        state.wake(1);

        assert_eq!(state.pcbs[1].state, ProcessState::Ready);
        assert_eq!(state.pcbs[3].state, ProcessState::Ready);
        assert_eq!(state.pcbs[2].state, ProcessState::Sleeping);
        assert_eq!(state.pcbs[2].wait_reason, 2);

        // Only PCB 2 remains linked on the wait list.
        assert_eq!(state.wait_head, 2);
        assert_eq!(state.pcbs[2].wait_next, END);
    }

    #[test]
    fn pid_advances_by_max_processes_on_each_slot_reuse() {
        let mut state = fresh_state();
        state.generations[5] = 0;
        let gen0 = state.generations[5];
        state.generations[5] = gen0.wrapping_add(1);
        let pid_first = 5u32 + gen0 * MAX_PROCESSES as u32;
        let pid_second = 5u32 + state.generations[5] * MAX_PROCESSES as u32;
        assert_eq!(pid_second - pid_first, MAX_PROCESSES as u32);
    }
}
