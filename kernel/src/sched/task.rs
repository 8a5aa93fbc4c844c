//! Process table and task control blocks.
//!
//! A fixed table of [`PROCESS_MAX`] slots; slot indices double as the
//! ready-queue links, so the queue needs no allocation and no raw
//! pointers. Slot 0 belongs to the idle task for the kernel's lifetime.

use crate::arch::x86_64::context::CpuContext;

use super::Pid;

/// Capacity of the process table.
pub const PROCESS_MAX: usize = 32;

/// Maximum stored name length.
pub const PROCESS_NAME_LEN: usize = 24;

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Slot unoccupied.
    Free,
    /// Allocated, not yet runnable.
    Created,
    /// On the ready queue, waiting for CPU.
    Ready,
    /// Currently executing. At most one task at a time.
    Running,
    /// Waiting for an explicit unblock.
    Blocked,
    /// Exited; slot reclaimed on the next scheduling decision.
    Zombie,
}

/// One task's control block.
#[derive(Clone)]
pub struct Process {
    pub pid: Pid,
    name: [u8; PROCESS_NAME_LEN],
    name_len: u8,
    pub state: ProcessState,
    /// Reserved: present in the table and reported by diagnostics, never
    /// consulted by the scheduling decision (strict FIFO round-robin).
    pub priority: u8,
    pub parent_pid: Pid,
    pub context: CpuContext,
    pub stack_base: usize,
    pub stack_top: usize,
    pub time_slice: u32,
    pub total_ticks: u64,
    pub context_switches: u64,
    pub exit_code: i32,
    /// Ready-queue link: index of the next queued task.
    pub next_ready: Option<usize>,
    pub created_tick: u64,
}

impl Process {
    pub const fn empty() -> Self {
        Self {
            pid: 0,
            name: [0; PROCESS_NAME_LEN],
            name_len: 0,
            state: ProcessState::Free,
            priority: 0,
            parent_pid: 0,
            context: CpuContext::zeroed(),
            stack_base: 0,
            stack_top: 0,
            time_slice: 0,
            total_ticks: 0,
            context_switches: 0,
            exit_code: 0,
            next_ready: None,
            created_tick: 0,
        }
    }

    pub fn set_name(&mut self, name: &str) {
        let n = name.len().min(PROCESS_NAME_LEN);
        self.name[..n].copy_from_slice(&name.as_bytes()[..n]);
        self.name_len = n as u8;
    }

    pub fn name(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len as usize]).unwrap_or("?")
    }
}

/// The fixed process table.
pub struct ProcessTable {
    pub slots: [Process; PROCESS_MAX],
    next_pid: Pid,
}

impl ProcessTable {
    pub const fn new() -> Self {
        Self {
            slots: [const { Process::empty() }; PROCESS_MAX],
            next_pid: 0,
        }
    }

    /// Claim the first free slot, assign a fresh PID, mark it Created.
    pub fn alloc_slot(&mut self) -> Option<usize> {
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if slot.state == ProcessState::Free {
                *slot = Process::empty();
                slot.pid = self.next_pid;
                slot.state = ProcessState::Created;
                self.next_pid += 1;
                return Some(idx);
            }
        }
        None
    }

    pub fn find_by_pid(&self, pid: Pid) -> Option<usize> {
        self.slots
            .iter()
            .position(|p| p.state != ProcessState::Free && p.pid == pid)
    }

    /// Number of occupied slots.
    pub fn live_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|p| p.state != ProcessState::Free)
            .count()
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_slot_allocation_assigns_increasing_pids() {
        let mut table = ProcessTable::new();
        let a = table.alloc_slot().unwrap();
        let b = table.alloc_slot().unwrap();
        assert_eq!(table.slots[a].pid, 0);
        assert_eq!(table.slots[b].pid, 1);
        assert_eq!(table.slots[a].state, ProcessState::Created);
    }

    #[test]
    fn test_table_capacity() {
        let mut table = ProcessTable::new();
        for _ in 0..PROCESS_MAX {
            assert!(table.alloc_slot().is_some());
        }
        assert!(table.alloc_slot().is_none());

        // Freeing a slot makes it allocatable again.
        table.slots[5].state = ProcessState::Free;
        assert_eq!(table.alloc_slot(), Some(5));
    }

    #[test]
    fn test_name_truncation() {
        let mut p = Process::empty();
        p.set_name("a-name-much-longer-than-the-field-allows");
        assert_eq!(p.name().len(), PROCESS_NAME_LEN);
        p.set_name("short");
        assert_eq!(p.name(), "short");
    }

    #[test]
    fn test_find_by_pid_skips_free_slots() {
        let mut table = ProcessTable::new();
        let a = table.alloc_slot().unwrap();
        assert_eq!(table.find_by_pid(0), Some(a));
        table.slots[a].state = ProcessState::Free;
        assert_eq!(table.find_by_pid(0), None);
    }
}
