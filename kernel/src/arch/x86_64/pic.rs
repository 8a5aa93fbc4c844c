//! Legacy 8259 PIC pair.
//!
//! The two cascaded controllers are remapped so IRQ 0-7 land on vectors
//! 32-39 and IRQ 8-15 on vectors 40-47, clear of the CPU exception range.
//! All lines start masked; each driver unmasks its own line after
//! registering a handler. Unmasking any slave line also unmasks the
//! cascade line (IRQ 2) on the master, or the slave can never deliver.

use spin::Mutex;

use pic8259::ChainedPics;

/// Vector base for the master PIC (IRQ 0-7).
pub const PIC_1_OFFSET: u8 = 32;
/// Vector base for the slave PIC (IRQ 8-15).
pub const PIC_2_OFFSET: u8 = 40;

const PIC_1_COMMAND: u16 = 0x20;
const PIC_1_DATA: u16 = 0x21;
const PIC_2_COMMAND: u16 = 0xA0;
const PIC_2_DATA: u16 = 0xA1;

/// End-of-interrupt command byte.
const PIC_EOI: u8 = 0x20;

/// Cascade input on the master (slave PIC hangs off IRQ 2).
const CASCADE_IRQ: u8 = 2;

// SAFETY: The offsets do not overlap the CPU exception vectors (0-31).
static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// Remap both controllers and mask every line.
pub fn init() {
    // SAFETY: The ICW1-ICW4 initialization sequence the crate performs is
    // the one defined by the 8259 datasheet; interrupts are still disabled
    // at this point of boot so no vector can fire mid-sequence.
    unsafe {
        PICS.lock().initialize();
    }
    // Mask everything; drivers unmask their own lines later.
    // SAFETY: Writing the full mask to both PIC data ports.
    unsafe {
        super::outb(PIC_1_DATA, 0xFF);
        super::io_wait();
        super::outb(PIC_2_DATA, 0xFF);
        super::io_wait();
    }
}

/// New (master, slave) mask pair after enabling `irq`.
///
/// Clearing a bit unmasks the line. Enabling any slave IRQ also clears the
/// cascade bit on the master. Idempotent: enabling an already-enabled line
/// returns the same masks.
pub fn masks_after_enable(master: u8, slave: u8, irq: u8) -> (u8, u8) {
    debug_assert!(irq < 16);
    if irq < 8 {
        (master & !(1 << irq), slave)
    } else {
        (master & !(1 << CASCADE_IRQ), slave & !(1 << (irq - 8)))
    }
}

/// New (master, slave) mask pair after disabling `irq`.
///
/// The cascade line is left alone: other slave IRQs may still be enabled.
pub fn masks_after_disable(master: u8, slave: u8, irq: u8) -> (u8, u8) {
    debug_assert!(irq < 16);
    if irq < 8 {
        (master | (1 << irq), slave)
    } else {
        (master, slave | (1 << (irq - 8)))
    }
}

fn read_masks() -> (u8, u8) {
    // SAFETY: Reading the PIC data ports returns the current masks.
    unsafe { (super::inb(PIC_1_DATA), super::inb(PIC_2_DATA)) }
}

fn write_masks(master: u8, slave: u8) {
    // SAFETY: Writing the interrupt mask registers of both PICs.
    unsafe {
        super::outb(PIC_1_DATA, master);
        super::outb(PIC_2_DATA, slave);
    }
}

/// Unmask an IRQ line (0-15).
pub fn enable_irq(irq: u8) {
    super::without_interrupts(|| {
        let (master, slave) = read_masks();
        let (master, slave) = masks_after_enable(master, slave, irq);
        write_masks(master, slave);
    });
}

/// Mask an IRQ line (0-15).
pub fn disable_irq(irq: u8) {
    super::without_interrupts(|| {
        let (master, slave) = read_masks();
        let (master, slave) = masks_after_disable(master, slave, irq);
        write_masks(master, slave);
    });
}

/// Signal end-of-interrupt for `irq`.
///
/// Slave interrupts need the EOI on both controllers, slave first; master
/// interrupts only on the master. Raw port writes, not the shared
/// `ChainedPics` handle: this runs inside interrupt handlers, where taking
/// the mutex could spin against the interrupted context.
pub fn send_eoi(irq: u8) {
    debug_assert!(irq < 16);
    // SAFETY: Writing the EOI command to the PIC command ports; required
    // before the controller will deliver further interrupts on the line.
    unsafe {
        if irq >= 8 {
            super::outb(PIC_2_COMMAND, PIC_EOI);
        }
        super::outb(PIC_1_COMMAND, PIC_EOI);
    }
}
