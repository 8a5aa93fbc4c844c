//! The scheduling core: strict-FIFO round robin with a 10-tick slice.
//!
//! All state lives in one [`SchedulerState`] behind a mutex. Every path
//! that can switch contexts runs with interrupts disabled: the timer hook
//! is entered with IF already clear, and `yield_now`/`exit_current`/
//! `block_current` clear it themselves. The scheduling *decision*
//! ([`SchedulerState::pick_next`]) is a pure state transition over the
//! table and queue -- the actual switch happens afterwards, with the lock
//! already released, through raw pointers into the (static) table.

use spin::Mutex;

use crate::arch::x86_64::context::{context_switch, CpuContext};
use crate::arch::x86_64::timer;
use crate::error::{KernelResult, SchedError};

use super::queue::ReadyQueue;
use super::task::{ProcessState, ProcessTable};
use super::{Pid, KERNEL_STACK_SIZE, TIME_SLICE_TICKS};

/// Index of the idle task's slot.
const IDLE_SLOT: usize = 0;

/// Complete scheduler state.
pub struct SchedulerState {
    pub table: ProcessTable,
    pub ready: ReadyQueue,
    /// Slot index of the Running task.
    pub current: usize,
    initialized: bool,
}

impl SchedulerState {
    pub const fn new() -> Self {
        Self {
            table: ProcessTable::new(),
            ready: ReadyQueue::new(),
            current: IDLE_SLOT,
            initialized: false,
        }
    }

    /// Turn the calling execution into the idle task (PID 0, Running).
    pub fn init_idle(&mut self) {
        let idle = self.table.alloc_slot().expect("empty table");
        debug_assert_eq!(idle, IDLE_SLOT);
        let p = &mut self.table.slots[idle];
        p.set_name("idle");
        p.state = ProcessState::Running;
        p.time_slice = TIME_SLICE_TICKS;
        self.current = idle;
        self.initialized = true;
    }

    /// Admit a Created task to the ready queue.
    pub fn make_ready(&mut self, idx: usize) {
        let p = &mut self.table.slots[idx];
        debug_assert!(matches!(
            p.state,
            ProcessState::Created | ProcessState::Blocked
        ));
        p.state = ProcessState::Ready;
        self.ready.enqueue(&mut self.table, idx);
    }

    /// The round-robin decision. Returns `(old, new)` slot indices when a
    /// switch should happen, `None` when the current task keeps the CPU.
    ///
    /// 1. Pop the queue head; idle when empty.
    /// 2. Same task: nothing to do.
    /// 3. A still-Running outgoing task goes back to the tail (idle is
    ///    never queued; it is the implicit fallback).
    /// 4. A Zombie outgoing task's slot is reclaimed.
    /// 5. The incoming task becomes Running with a fresh slice.
    pub fn pick_next(&mut self) -> Option<(usize, usize)> {
        let next = self
            .ready
            .dequeue(&mut self.table)
            .unwrap_or(IDLE_SLOT);
        let old = self.current;
        if next == old {
            return None;
        }

        match self.table.slots[old].state {
            ProcessState::Running => {
                self.table.slots[old].state = ProcessState::Ready;
                if old != IDLE_SLOT {
                    self.ready.enqueue(&mut self.table, old);
                }
            }
            ProcessState::Zombie => {
                // Stack was already reclaimed in exit_current.
                self.table.slots[old].state = ProcessState::Free;
            }
            // Blocked tasks stay off the queue until unblocked.
            _ => {}
        }

        let incoming = &mut self.table.slots[next];
        incoming.state = ProcessState::Running;
        incoming.time_slice = TIME_SLICE_TICKS;
        incoming.context_switches += 1;
        self.current = next;
        Some((old, next))
    }

    /// Timer-tick accounting. Returns true when `schedule()` must run:
    /// the slice expired, or work appeared while idle held the CPU.
    pub fn tick(&mut self) -> bool {
        if !self.initialized {
            return false;
        }
        let current = self.current;
        if current != IDLE_SLOT {
            let p = &mut self.table.slots[current];
            p.total_ticks += 1;
            p.time_slice = p.time_slice.saturating_sub(1);
            p.time_slice == 0
        } else {
            !self.ready.is_empty()
        }
    }
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self::new()
    }
}

static SCHEDULER: Mutex<SchedulerState> = Mutex::new(SchedulerState::new());

/// Adopt the boot flow as the idle task and install the timer hook.
pub fn init() {
    SCHEDULER.lock().init_idle();
    timer::set_scheduler_tick_hook(scheduler_tick);
    println!("[SCHED] Scheduler online; idle task is PID 0");
}

/// Create a kernel task and enqueue it.
///
/// The stack comes from the kernel heap; the forged context makes the
/// first switch land in the entry trampoline with interrupts enabled.
pub fn create(name: &str, entry: extern "C" fn(usize), arg: usize) -> KernelResult<Pid> {
    let layout = core::alloc::Layout::from_size_align(KERNEL_STACK_SIZE, 16)
        .expect("stack layout");
    // SAFETY: Well-formed non-zero layout.
    let stack_base = unsafe { alloc::alloc::alloc(layout) };
    if stack_base.is_null() {
        return Err(crate::error::KernelError::OutOfMemory {
            requested: KERNEL_STACK_SIZE,
            available: 0,
        });
    }
    let stack_top = stack_base as usize + KERNEL_STACK_SIZE;

    let _guard = crate::arch::x86_64::disable_interrupts();
    let mut sched = SCHEDULER.lock();
    let Some(idx) = sched.table.alloc_slot() else {
        drop(sched);
        // SAFETY: Same layout the block was allocated with.
        unsafe { alloc::alloc::dealloc(stack_base, layout) };
        return Err(SchedError::TableFull.into());
    };

    let parent = sched.table.slots[sched.current].pid;
    let p = &mut sched.table.slots[idx];
    p.set_name(name);
    p.parent_pid = parent;
    p.stack_base = stack_base as usize;
    p.stack_top = stack_top;
    p.context = CpuContext::new_task(entry, arg, stack_top as u64);
    p.created_tick = timer::ticks();
    let pid = p.pid;

    sched.make_ready(idx);
    Ok(pid)
}

/// Run the scheduling decision and, when it picks a different task,
/// perform the context switch. Interrupts must be disabled.
fn schedule() {
    let (old_ctx, new_ctx) = {
        let mut sched = SCHEDULER.lock();
        match sched.pick_next() {
            Some((old, new)) => {
                let old_ctx = &mut sched.table.slots[old].context as *mut CpuContext;
                let new_ctx = &sched.table.slots[new].context as *const CpuContext;
                (old_ctx, new_ctx)
            }
            None => return,
        }
    };

    // SAFETY: The pointers reference slots of the static table; the slots
    // stay pinned (the table is never moved or freed) and interrupts are
    // disabled, so nothing else touches them until the switch completes.
    // A Zombie's context slot outlives the switch even though its state
    // became Free: only a later create() reuses it, and create() cannot
    // run until some task is scheduled again.
    unsafe {
        context_switch(old_ctx, new_ctx);
    }
}

/// Timer hook: entered from the IRQ0 handler with interrupts disabled.
pub fn scheduler_tick() {
    let should_switch = SCHEDULER.lock().tick();
    if should_switch {
        schedule();
    }
}

/// Voluntarily give up the CPU.
pub fn yield_now() {
    let _guard = crate::arch::x86_64::disable_interrupts();
    schedule();
    // Guard drop restores the interrupt flag.
}

/// Block the calling task until `unblock(pid)`.
pub fn block_current() {
    let _guard = crate::arch::x86_64::disable_interrupts();
    {
        let mut sched = SCHEDULER.lock();
        let current = sched.current;
        if current == IDLE_SLOT {
            // Idle must always be runnable.
            return;
        }
        sched.table.slots[current].state = ProcessState::Blocked;
    }
    schedule();
}

/// Make a blocked task runnable again.
pub fn unblock(pid: Pid) -> KernelResult<()> {
    let _guard = crate::arch::x86_64::disable_interrupts();
    let mut sched = SCHEDULER.lock();
    let idx = sched
        .table
        .find_by_pid(pid)
        .ok_or(SchedError::TaskNotFound { pid })?;
    if sched.table.slots[idx].state != ProcessState::Blocked {
        return Err(SchedError::BadTransition.into());
    }
    sched.make_ready(idx);
    Ok(())
}

/// Terminate the calling task.
///
/// The stack is reclaimed here (kernel memory is freed, whatever
/// application-layer mottos say); the slot itself is reclaimed by the next
/// scheduling decision. Interrupts stay disabled from this point on, so
/// running a few more instructions on the freed stack is safe: nothing can
/// allocate before the switch.
pub fn exit_current(code: i32) -> ! {
    x86_64::instructions::interrupts::disable();
    let stack = {
        let mut sched = SCHEDULER.lock();
        let current = sched.current;
        if current == IDLE_SLOT {
            panic!("[SCHED] Idle task attempted to exit");
        }
        let p = &mut sched.table.slots[current];
        p.state = ProcessState::Zombie;
        p.exit_code = code;
        let stack = p.stack_base;
        p.stack_base = 0;
        p.stack_top = 0;
        stack
    };

    if stack != 0 {
        let layout = core::alloc::Layout::from_size_align(KERNEL_STACK_SIZE, 16)
            .expect("stack layout");
        // SAFETY: The stack was allocated in create() with this layout and
        // ownership returns here exactly once (stack_base was nulled).
        unsafe { alloc::alloc::dealloc(stack as *mut u8, layout) };
    }

    schedule();
    panic!("[SCHED] Context switch returned to a zombie");
}

/// Idle loop: the tail of `kmain` becomes the idle task body.
pub fn run() -> ! {
    loop {
        crate::arch::x86_64::enable_interrupts();
        crate::arch::x86_64::idle();
    }
}

/// Log a one-line-per-task table snapshot. Interrupts are disabled while
/// the lock is held; the timer hook takes the same lock.
pub fn dump_tasks() {
    crate::arch::x86_64::without_interrupts(|| {
        let sched = SCHEDULER.lock();
        println!("[SCHED] pid state    slice ticks  switches name");
        for p in sched.table.slots.iter() {
            if p.state == ProcessState::Free {
                continue;
            }
            println!(
                "[SCHED] {:3} {:8?} {:5} {:6} {:8} {}",
                p.pid, p.state, p.time_slice, p.total_ticks, p.context_switches, p.name()
            );
        }
    });
}

/// PID of the currently running task.
pub fn current_pid() -> Pid {
    crate::arch::x86_64::without_interrupts(|| {
        let sched = SCHEDULER.lock();
        sched.table.slots[sched.current].pid
    })
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn state_with_tasks(n: usize) -> SchedulerState {
        let mut s = SchedulerState::new();
        s.init_idle();
        for i in 0..n {
            let idx = s.table.alloc_slot().unwrap();
            s.table.slots[idx].set_name("task");
            s.table.slots[idx].priority = i as u8;
            s.make_ready(idx);
        }
        s
    }

    /// Walk the ready queue and check the §8 queue invariants.
    fn assert_queue_invariants(s: &SchedulerState) {
        let running: alloc::vec::Vec<usize> = s
            .table
            .slots
            .iter()
            .enumerate()
            .filter(|(_, p)| p.state == ProcessState::Running)
            .map(|(i, _)| i)
            .collect();
        assert!(running.len() <= 1, "more than one Running task");
        if let Some(&r) = running.first() {
            assert!(!s.ready.contains(&s.table, r), "Running task is queued");
        }
        let mut cursor_count = 0;
        for (i, p) in s.table.slots.iter().enumerate() {
            if s.ready.contains(&s.table, i) {
                assert_eq!(p.state, ProcessState::Ready, "queued task not Ready");
                cursor_count += 1;
            }
        }
        assert_eq!(cursor_count, s.ready.len());
    }

    #[test]
    fn test_pick_rotates_fifo() {
        let mut s = state_with_tasks(2);
        // idle -> task1 -> task2 -> task1 -> ...
        let (old, a) = s.pick_next().unwrap();
        assert_eq!(old, 0);
        assert_eq!(a, 1);
        assert_queue_invariants(&s);

        let (_, b) = s.pick_next().unwrap();
        assert_eq!(b, 2);
        let (_, c) = s.pick_next().unwrap();
        assert_eq!(c, 1);
        assert_queue_invariants(&s);
    }

    #[test]
    fn test_empty_queue_keeps_current() {
        let mut s = state_with_tasks(0);
        assert!(s.pick_next().is_none());
        assert_eq!(s.current, 0);
    }

    #[test]
    fn test_idle_is_never_enqueued() {
        let mut s = state_with_tasks(1);
        s.pick_next().unwrap(); // idle -> task
        assert!(!s.ready.contains(&s.table, 0));
        assert_eq!(s.table.slots[0].state, ProcessState::Ready);
    }

    #[test]
    fn test_zombie_slot_reclaimed_on_switch() {
        let mut s = state_with_tasks(2);
        s.pick_next().unwrap(); // running task at slot 1
        s.table.slots[1].state = ProcessState::Zombie;
        s.pick_next().unwrap();
        assert_eq!(s.table.slots[1].state, ProcessState::Free);
    }

    #[test]
    fn test_blocked_task_stays_off_queue() {
        let mut s = state_with_tasks(2);
        s.pick_next().unwrap(); // slot 1 running
        s.table.slots[1].state = ProcessState::Blocked;
        s.pick_next().unwrap(); // slot 2 running
        assert!(!s.ready.contains(&s.table, 1));
        // Unblock re-admits at the tail.
        s.make_ready(1);
        assert_queue_invariants(&s);
    }

    #[test]
    fn test_tick_preempts_on_slice_expiry() {
        let mut s = state_with_tasks(2);
        s.pick_next().unwrap();
        for _ in 0..TIME_SLICE_TICKS - 1 {
            assert!(!s.tick(), "premature preemption");
        }
        assert!(s.tick(), "slice expiry must request a switch");
    }

    #[test]
    fn test_tick_wakes_idle_when_work_arrives() {
        let mut s = state_with_tasks(0);
        assert!(!s.tick(), "idle with no work");
        let idx = s.table.alloc_slot().unwrap();
        s.make_ready(idx);
        assert!(s.tick(), "idle with queued work must switch");
    }

    /// §8 scenario 4: two tasks sharing the CPU run equally often.
    #[test]
    fn test_fairness_over_1000_ticks() {
        let mut s = state_with_tasks(2);
        s.pick_next().unwrap();
        let mut runs = [0u64; 3];
        for _ in 0..1000 {
            runs[s.current] += 1;
            if s.tick() {
                s.pick_next();
            }
        }
        let diff = runs[1].abs_diff(runs[2]);
        assert!(
            diff <= TIME_SLICE_TICKS as u64,
            "unfair split: {:?}",
            runs
        );
        assert_eq!(runs[0], 0, "idle ran while tasks were ready");
    }
}
