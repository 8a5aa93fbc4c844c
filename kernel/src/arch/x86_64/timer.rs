//! PIT timer: the kernel's tick source.
//!
//! Channel 0 is programmed for a 100 Hz rate; every interrupt advances the
//! global tick counter and invokes the scheduler hook (a registration slot
//! defaulting to no-op, installed by `sched::init`). Nanosecond time
//! prefers the KVM pvclock when available and falls back to ticks.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::pvclock;

/// Timer interrupt rate.
pub const TIMER_HZ: u32 = 100;

/// Milliseconds per tick.
pub const TICK_MS: u64 = 1000 / TIMER_HZ as u64;

/// PIT input clock in Hz.
const PIT_FREQUENCY: u32 = 1_193_182;

const PIT_CHANNEL0_DATA: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;

/// IRQ line of the PIT.
pub const TIMER_IRQ: u8 = 0;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Scheduler tick hook slot. Stored as a raw fn address; 0 means no hook.
/// An atomic slot (not a mutex) because the reader runs in interrupt
/// context.
static SCHEDULER_TICK_HOOK: AtomicUsize = AtomicUsize::new(0);

/// Install the function called on every timer interrupt.
pub fn set_scheduler_tick_hook(hook: fn()) {
    SCHEDULER_TICK_HOOK.store(hook as usize, Ordering::Release);
}

/// Get current timer ticks.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Timer IRQ handler: advance the tick count, then give the scheduler a
/// chance to preempt. Runs with interrupts disabled; the EOI is sent by
/// `irq::dispatch` after this returns.
fn timer_interrupt(_irq: u8) {
    TICKS.fetch_add(1, Ordering::Relaxed);

    let hook = SCHEDULER_TICK_HOOK.load(Ordering::Acquire);
    if hook != 0 {
        // SAFETY: The slot only ever holds addresses of `fn()` items stored
        // by set_scheduler_tick_hook.
        let hook: fn() = unsafe { core::mem::transmute(hook) };
        hook();
    }
}

/// Program the PIT for periodic interrupts and register the IRQ0 handler.
/// The line is unmasked here; preemption starts once the scheduler installs
/// its hook and interrupts are globally enabled.
pub fn init() {
    let divisor = PIT_FREQUENCY / TIMER_HZ;

    // SAFETY: Standard PIT programming sequence: mode command, then the
    // divisor low byte / high byte on channel 0.
    unsafe {
        // Channel 0, lobyte/hibyte access, rate generator (mode 2)
        super::outb(PIT_COMMAND, 0x36);
        super::outb(PIT_CHANNEL0_DATA, (divisor & 0xFF) as u8);
        super::outb(PIT_CHANNEL0_DATA, (divisor >> 8) as u8);
    }

    if let Err(e) = crate::irq::register_handler(TIMER_IRQ, timer_interrupt) {
        println!("[TIMER] Failed to register IRQ0 handler: {}", e);
        return;
    }
    super::pic::enable_irq(TIMER_IRQ);

    println!(
        "[TIMER] PIT configured for {} Hz (divisor {})",
        TIMER_HZ, divisor
    );
}

/// Nanoseconds since an arbitrary boot-time epoch.
///
/// Prefers the pvclock; without it, resolution degrades to one tick.
pub fn ns() -> u64 {
    match pvclock::now_ns() {
        Some(ns) => ns,
        None => ticks() * TICK_MS * 1_000_000,
    }
}

/// Milliseconds since the boot-time epoch.
pub fn ms() -> u64 {
    ns() / 1_000_000
}

/// Sleep for at least `duration_ms`, halting the CPU between ticks.
pub fn sleep_ms(duration_ms: u64) {
    let target = ticks() + duration_ms.div_ceil(TICK_MS).max(1);
    while ticks() < target {
        #[cfg(target_os = "none")]
        super::idle();
        #[cfg(not(target_os = "none"))]
        core::hint::spin_loop();
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_tick_fallback_resolution() {
        // Without pvclock, ns() advances in 10ms steps of the tick counter.
        let before = ticks();
        TICKS.fetch_add(3, Ordering::Relaxed);
        assert_eq!((ticks() - before), 3);
        assert_eq!(TICK_MS, 10);
    }

    #[test]
    fn test_hook_slot_roundtrip() {
        fn probe() {}
        set_scheduler_tick_hook(probe);
        assert_eq!(
            SCHEDULER_TICK_HOOK.load(Ordering::Acquire),
            probe as usize
        );
        SCHEDULER_TICK_HOOK.store(0, Ordering::Release);
    }
}
