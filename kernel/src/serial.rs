//! Serial console (COM1 at 0x3F8).
//!
//! All kernel logging goes to the serial port; the framebuffer is owned by
//! the compositor and never used for text output by the core. On the host
//! target the same entry point writes to stdout so tests see kernel logs.

use core::fmt;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod uart {
    use lazy_static::lazy_static;
    use spin::Mutex;
    use uart_16550::SerialPort;

    lazy_static! {
        pub static ref SERIAL1: Mutex<SerialPort> = {
            // SAFETY: 0x3F8 is the standard COM1 base; the port is
            // initialized immediately after construction.
            let mut serial_port = unsafe { SerialPort::new(0x3F8) };
            serial_port.init();
            Mutex::new(serial_port)
        };
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    use x86_64::instructions::interrupts;

    // Interrupt handlers also log; disable interrupts while the port lock
    // is held so a handler cannot deadlock against its own CPU.
    interrupts::without_interrupts(|| {
        uart::SERIAL1
            .lock()
            .write_fmt(args)
            .expect("serial write failed");
    });
}

#[cfg(not(target_os = "none"))]
pub fn _print(args: fmt::Arguments) {
    extern crate std;
    use std::io::Write;

    let _ = std::io::stdout().write_fmt(args);
}
