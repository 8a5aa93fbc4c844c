//! IRQ handler registration and dispatch.
//!
//! One handler slot per legacy IRQ line. The IDT stubs for vectors 32-47
//! funnel into [`dispatch`], which invokes the registered handler and then
//! sends the EOI -- so every handler observes the contract "do brief work,
//! EOI is sent before the CPU returns from the vector".
//!
//! The slots are atomics rather than a mutex: [`dispatch`] runs in
//! interrupt context, where spinning on a lock held by the interrupted
//! code would hang the CPU. Handlers must not allocate (heap and PMM are
//! not interrupt-safe by design; see the memory manager's contract).

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::error::{KernelError, KernelResult};

/// Number of legacy IRQ lines.
pub const IRQ_COUNT: usize = 16;

/// An IRQ handler: receives the line number that fired.
pub type IrqHandler = fn(u8);

/// Handler slots; 0 = empty, otherwise the address of a `fn(u8)`.
static HANDLERS: [AtomicUsize; IRQ_COUNT] = [const { AtomicUsize::new(0) }; IRQ_COUNT];

/// Per-line dispatch counters.
static DISPATCH_COUNTS: [AtomicU64; IRQ_COUNT] = [const { AtomicU64::new(0) }; IRQ_COUNT];

/// Count of interrupts that arrived with no handler registered.
static SPURIOUS: AtomicU64 = AtomicU64::new(0);

/// Register a handler for an IRQ line.
///
/// One handler per line; re-registration is an error (drivers own their
/// lines for the kernel's lifetime).
pub fn register_handler(irq: u8, handler: IrqHandler) -> KernelResult<()> {
    if irq as usize >= IRQ_COUNT {
        return Err(KernelError::InvalidArgument {
            name: "irq",
            value: "line number exceeds 15",
        });
    }
    let slot = &HANDLERS[irq as usize];
    if slot
        .compare_exchange(0, handler as usize, Ordering::Release, Ordering::Relaxed)
        .is_err()
    {
        return Err(KernelError::AlreadyExists {
            resource: "IRQ handler",
            id: irq as u64,
        });
    }
    Ok(())
}

/// Remove the handler for an IRQ line.
pub fn unregister_handler(irq: u8) -> KernelResult<()> {
    if irq as usize >= IRQ_COUNT {
        return Err(KernelError::InvalidArgument {
            name: "irq",
            value: "line number exceeds 15",
        });
    }
    if HANDLERS[irq as usize].swap(0, Ordering::AcqRel) == 0 {
        return Err(KernelError::NotFound {
            resource: "IRQ handler",
            id: irq as u64,
        });
    }
    Ok(())
}

/// Entry point from the IDT stubs.
///
/// The EOI goes to the PIC before the handler runs: the interrupt flag
/// stays clear until the interrupted frame is resumed, so no re-entry is
/// possible, and a handler that switches contexts (the timer's scheduler
/// hook) must not leave the line blocked while another task runs. The
/// handler itself does brief work only (spurious interrupts are counted
/// and otherwise ignored).
pub fn dispatch(irq: u8) {
    debug_assert!((irq as usize) < IRQ_COUNT);
    DISPATCH_COUNTS[irq as usize].fetch_add(1, Ordering::Relaxed);

    crate::arch::x86_64::pic::send_eoi(irq);

    let slot = HANDLERS[irq as usize].load(Ordering::Acquire);
    if slot != 0 {
        // SAFETY: Non-zero slots only ever hold `fn(u8)` addresses stored
        // by register_handler.
        let handler: IrqHandler = unsafe { core::mem::transmute(slot) };
        handler(irq);
    } else {
        SPURIOUS.fetch_add(1, Ordering::Relaxed);
    }
}

/// Times `irq` has been dispatched.
pub fn dispatch_count(irq: u8) -> u64 {
    DISPATCH_COUNTS
        .get(irq as usize)
        .map(|c| c.load(Ordering::Relaxed))
        .unwrap_or(0)
}

/// Interrupts that arrived on lines without a handler.
pub fn spurious_count() -> u64 {
    SPURIOUS.load(Ordering::Relaxed)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_register_rejects_bad_line() {
        fn h(_: u8) {}
        assert!(register_handler(16, h).is_err());
    }

    #[test]
    fn test_register_is_exclusive_then_freed() {
        fn h(_: u8) {}
        fn h2(_: u8) {}
        // Line 7 is unused by the kernel's own drivers.
        register_handler(7, h).unwrap();
        assert!(matches!(
            register_handler(7, h2),
            Err(KernelError::AlreadyExists { .. })
        ));
        unregister_handler(7).unwrap();
        assert!(matches!(
            unregister_handler(7),
            Err(KernelError::NotFound { .. })
        ));
        register_handler(7, h2).unwrap();
        unregister_handler(7).unwrap();
    }
}
