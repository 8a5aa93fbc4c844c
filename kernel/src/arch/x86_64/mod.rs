//! x86_64 architecture support.
//!
//! Provides hardware initialization (GDT, IDT, PIC), interrupt control and
//! the I/O port primitives every driver goes through. Inline assembly is
//! confined to this subtree; the rest of the core calls only these wrappers.

pub mod boot;
pub mod context;
pub mod gdt;
pub mod idt;
pub mod msr;
pub mod multiboot;
pub mod pic;
pub mod pvclock;
pub mod timer;

/// Initialize descriptor tables and the interrupt controller.
///
/// Interrupts stay disabled and every IRQ line stays masked on return;
/// subsystems unmask their own lines once their handlers are registered.
pub fn init() {
    // SAFETY: cli disables hardware interrupts. Required so no handler can
    // fire before the IDT and PIC are configured. nomem/nostack: no memory
    // access.
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack));
    }

    gdt::init();
    println!("[ARCH] GDT loaded");

    idt::init();
    println!("[ARCH] IDT loaded");

    pic::init();
    println!("[ARCH] PIC remapped to vectors {}..{}, all lines masked",
        pic::PIC_1_OFFSET, pic::PIC_2_OFFSET + 8);
}

/// Halt the CPU permanently. Used by panic/shutdown paths.
pub fn halt() -> ! {
    x86_64::instructions::interrupts::disable();
    loop {
        x86_64::instructions::hlt();
    }
}

/// Halt until the next interrupt.
#[inline]
pub fn idle() {
    x86_64::instructions::hlt();
}

/// Enable hardware interrupts.
pub fn enable_interrupts() {
    x86_64::instructions::interrupts::enable();
}

/// Disable hardware interrupts until the returned guard is dropped.
pub fn disable_interrupts() -> impl Drop {
    struct InterruptGuard {
        was_enabled: bool,
    }

    impl Drop for InterruptGuard {
        fn drop(&mut self) {
            if self.was_enabled {
                x86_64::instructions::interrupts::enable();
            }
        }
    }

    let was_enabled = x86_64::instructions::interrupts::are_enabled();
    x86_64::instructions::interrupts::disable();
    InterruptGuard { was_enabled }
}

/// Run `f` with interrupts disabled, restoring the previous state after.
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    x86_64::instructions::interrupts::without_interrupts(f)
}

/// Basic I/O port functions -- used by the PIC, PIT, PCI, VGA and PS/2 code.
///
/// # Safety
///
/// Port I/O has device-defined side effects; callers must pass a port the
/// current driver owns and a value valid for that device register.
pub unsafe fn outb(port: u16, value: u8) {
    // SAFETY: Forwarded caller contract.
    unsafe { x86_64::instructions::port::Port::new(port).write(value) }
}

/// Read a byte from an I/O port. See [`outb`] for the safety contract.
///
/// # Safety
///
/// Same contract as [`outb`].
pub unsafe fn inb(port: u16) -> u8 {
    // SAFETY: Forwarded caller contract.
    unsafe { x86_64::instructions::port::Port::new(port).read() }
}

/// # Safety
///
/// Same contract as [`outb`].
pub unsafe fn outw(port: u16, value: u16) {
    // SAFETY: Forwarded caller contract.
    unsafe { x86_64::instructions::port::Port::new(port).write(value) }
}

/// # Safety
///
/// Same contract as [`outb`].
pub unsafe fn inw(port: u16) -> u16 {
    // SAFETY: Forwarded caller contract.
    unsafe { x86_64::instructions::port::Port::new(port).read() }
}

/// # Safety
///
/// Same contract as [`outb`].
pub unsafe fn outl(port: u16, value: u32) {
    // SAFETY: Forwarded caller contract.
    unsafe { x86_64::instructions::port::Port::new(port).write(value) }
}

/// # Safety
///
/// Same contract as [`outb`].
pub unsafe fn inl(port: u16) -> u32 {
    // SAFETY: Forwarded caller contract.
    unsafe { x86_64::instructions::port::Port::new(port).read() }
}

/// Short, device-safe delay: a write to the unused POST port 0x80.
///
/// Needed between PIC/PIT programming steps on hardware where the
/// controller is slower than the CPU's port accesses.
pub fn io_wait() {
    // SAFETY: Port 0x80 is the POST diagnostic port; writes have no device
    // effect and are the conventional ~1us I/O delay.
    unsafe {
        outb(0x80, 0);
    }
}

/// Flush the TLB entry for one virtual address.
pub fn tlb_flush_address(addr: u64) {
    // SAFETY: invlpg invalidates the TLB entry covering the given address.
    // Privileged, no side effects beyond the TLB.
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) addr);
    }
}

/// Flush the entire (non-global) TLB by reloading CR3.
pub fn tlb_flush_all() {
    // SAFETY: Reloading CR3 with its current value flushes all non-global
    // TLB entries. Privileged, no memory side effects.
    unsafe {
        let cr3: u64;
        core::arch::asm!("mov {}, cr3", out(reg) cr3);
        core::arch::asm!("mov cr3, {}", in(reg) cr3);
    }
}

/// Read the physical address of the active top-level page table from CR3.
pub fn read_cr3() -> u64 {
    let cr3: u64;
    // SAFETY: Reading CR3 is side-effect free in kernel mode.
    unsafe {
        core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack));
    }
    cr3 & 0x000F_FFFF_FFFF_F000
}
