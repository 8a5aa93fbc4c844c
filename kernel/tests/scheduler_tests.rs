//! Scheduler scenarios through the public state machine: lifecycle
//! transitions, queue discipline, and long-run fairness.

use borealis_kernel::sched::scheduler::SchedulerState;
use borealis_kernel::sched::{ProcessState, TIME_SLICE_TICKS};

fn state_with_tasks(n: usize) -> SchedulerState {
    let mut s = SchedulerState::new();
    s.init_idle();
    for _ in 0..n {
        let idx = s.table.alloc_slot().expect("slot");
        s.table.slots[idx].set_name("worker");
        s.make_ready(idx);
    }
    s
}

/// Lifecycle walk: Created -> Ready -> Running -> Ready (preempted) ->
/// Blocked -> Ready -> Running -> Zombie -> Free.
#[test]
fn task_lifecycle_transitions() {
    let mut s = state_with_tasks(1);
    assert_eq!(s.table.slots[1].state, ProcessState::Ready);

    s.pick_next().expect("switch to the worker");
    assert_eq!(s.table.slots[1].state, ProcessState::Running);
    assert_eq!(s.current, 1);

    // Preemption: the worker goes back to Ready; idle takes over.
    let mut s2 = state_with_tasks(2);
    s2.pick_next().unwrap(); // slot 1 running
    s2.pick_next().unwrap(); // preempt: slot 2 running, slot 1 re-queued
    assert_eq!(s2.table.slots[1].state, ProcessState::Ready);

    // Block: the task leaves the queue until made ready again.
    s2.table.slots[2].state = ProcessState::Blocked;
    s2.pick_next().unwrap();
    assert!(!s2.ready.contains(&s2.table, 2));
    s2.make_ready(2);
    assert_eq!(s2.table.slots[2].state, ProcessState::Ready);

    // Exit: zombie slot is reclaimed by the next decision.
    let running = s2.current;
    s2.table.slots[running].state = ProcessState::Zombie;
    s2.pick_next().unwrap();
    assert_eq!(s2.table.slots[running].state, ProcessState::Free);
}

/// The queue invariants hold at every step of a mixed workload: at most
/// one Running task, never queued, and only Ready tasks in the queue.
#[test]
fn queue_invariants_under_mixed_workload() {
    let mut s = state_with_tasks(4);

    let check = |s: &SchedulerState| {
        let running: Vec<usize> = (0..borealis_kernel::sched::PROCESS_MAX)
            .filter(|&i| s.table.slots[i].state == ProcessState::Running)
            .collect();
        assert!(running.len() <= 1);
        for &r in &running {
            assert!(!s.ready.contains(&s.table, r));
        }
        for i in 0..borealis_kernel::sched::PROCESS_MAX {
            if s.ready.contains(&s.table, i) {
                assert_eq!(s.table.slots[i].state, ProcessState::Ready);
            }
        }
    };

    for step in 0..100 {
        match step % 5 {
            0..=2 => {
                s.pick_next();
            }
            3 => {
                let victim = s.current;
                if victim != 0 {
                    s.table.slots[victim].state = ProcessState::Blocked;
                    s.pick_next();
                    s.make_ready(victim);
                }
            }
            _ => {
                for _ in 0..TIME_SLICE_TICKS {
                    if s.tick() {
                        s.pick_next();
                    }
                }
            }
        }
        check(&s);
    }
}

/// Two equally hungry tasks split 10 000 ticks evenly; idle never runs
/// while work is ready.
#[test]
fn long_run_fairness() {
    let mut s = state_with_tasks(2);
    s.pick_next().unwrap();

    let mut runs = [0u64; 3];
    for _ in 0..10_000 {
        runs[s.current] += 1;
        if s.tick() {
            s.pick_next();
        }
    }
    assert_eq!(runs[0], 0, "idle must not run with tasks ready");
    assert!(
        runs[1].abs_diff(runs[2]) <= TIME_SLICE_TICKS as u64,
        "uneven split: {:?}",
        runs
    );
}
