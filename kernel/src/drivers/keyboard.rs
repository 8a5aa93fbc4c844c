//! PS/2 keyboard driver.
//!
//! IRQ1 pushes raw set-1 scancodes into a lock-free ring; task context
//! drains the ring and decodes through `pc-keyboard`. The 8042 controller
//! is shared with the mouse driver, which owns the controller-level
//! configuration.

use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use pc_keyboard::{layouts::Us104Key, DecodedKey, HandleControl, Keyboard, ScancodeSet1};

use crate::error::KernelResult;

/// Keyboard IRQ line.
pub const KEYBOARD_IRQ: u8 = 1;

const PS2_DATA_PORT: u16 = 0x60;

/// Scancode ring buffer (single producer: the IRQ handler; single
/// consumer: whatever task polls input).
const QUEUE_SIZE: usize = 128;

struct ScancodeQueue {
    buf: [u8; QUEUE_SIZE],
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl ScancodeQueue {
    const fn new() -> Self {
        Self {
            buf: [0; QUEUE_SIZE],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    fn push(&mut self, code: u8) {
        let head = self.head.load(Ordering::Relaxed);
        let next = (head + 1) & (QUEUE_SIZE - 1);
        if next == self.tail.load(Ordering::Acquire) {
            return; // full; drop the scancode
        }
        self.buf[head] = code;
        self.head.store(next, Ordering::Release);
    }

    fn pop(&mut self) -> Option<u8> {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }
        let code = self.buf[tail];
        self.tail.store((tail + 1) & (QUEUE_SIZE - 1), Ordering::Release);
        Some(code)
    }
}

static mut SCANCODES: ScancodeQueue = ScancodeQueue::new();

static DECODER: Mutex<Option<Keyboard<Us104Key, ScancodeSet1>>> = Mutex::new(None);

/// IRQ1 handler: grab the byte, queue it, done (EOI comes from dispatch).
fn keyboard_interrupt(_irq: u8) {
    // SAFETY: Reading the 8042 data port acknowledges the byte.
    let code = unsafe { crate::arch::x86_64::inb(PS2_DATA_PORT) };
    // SAFETY: Single producer: only this handler writes, and IRQ1 cannot
    // nest (interrupts stay disabled in handlers).
    #[allow(static_mut_refs)]
    unsafe {
        SCANCODES.push(code);
    }
}

/// Register the handler and unmask IRQ1.
pub fn init() -> KernelResult<()> {
    *DECODER.lock() = Some(Keyboard::new(
        ScancodeSet1::new(),
        Us104Key,
        HandleControl::Ignore,
    ));
    crate::irq::register_handler(KEYBOARD_IRQ, keyboard_interrupt)?;
    crate::arch::x86_64::pic::enable_irq(KEYBOARD_IRQ);
    println!("[KBD] PS/2 keyboard online (IRQ1)");
    Ok(())
}

/// Pop one raw scancode.
pub fn read_scancode() -> Option<u8> {
    // SAFETY: Single consumer (task context).
    #[allow(static_mut_refs)]
    unsafe {
        SCANCODES.pop()
    }
}

/// Drain and decode: next decoded key press, if any.
pub fn poll_key() -> Option<DecodedKey> {
    let mut decoder = DECODER.lock();
    let keyboard = decoder.as_mut()?;
    while let Some(code) = read_scancode() {
        if let Ok(Some(event)) = keyboard.add_byte(code) {
            if let Some(key) = keyboard.process_keyevent(event) {
                return Some(key);
            }
        }
    }
    None
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_queue_fifo_and_overflow() {
        let mut q = ScancodeQueue::new();
        assert_eq!(q.pop(), None);
        for i in 0..(QUEUE_SIZE as u8 - 1) {
            q.push(i);
        }
        // One slot stays empty to distinguish full from empty.
        q.push(0xFF); // dropped
        assert_eq!(q.pop(), Some(0));
        assert_eq!(q.pop(), Some(1));
    }
}
