//! Borealis kernel library.
//!
//! Everything the kernel is made of lives here; `main.rs` only carries the
//! bare-metal entry point and task wiring. The library builds for two
//! targets:
//!
//! - `x86_64-unknown-none`: the real kernel. Rust's `alloc` is backed by
//!   the kernel heap; the custom test framework targets QEMU.
//! - the host (for `cargo test`): `std` is linked, the system allocator
//!   backs `alloc`, and the hardware-free logic (allocators, page-table
//!   walker, virtqueue accounting, protocol code, the compositor) runs
//!   under the standard test harness.

#![no_std]
#![cfg_attr(all(test, target_os = "none"), no_main)]
#![feature(custom_test_frameworks)]
#![feature(abi_x86_interrupt)]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]
#![cfg_attr(target_os = "none", test_runner(crate::test_framework::test_runner))]
#![cfg_attr(target_os = "none", reexport_test_harness_main = "test_main")]

extern crate alloc;

// Host target: link std and use the system allocator so test code using
// Vec/String allocates normally.
#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod drivers;
pub mod error;
pub mod graphics;
pub mod irq;
pub mod klog;
pub mod mm;
pub mod net;
pub mod sched;
pub mod serial;
pub mod sync;
pub mod test_framework;

// Re-exports for tests and the binary.
pub use error::{KernelError, KernelResult};
pub use mm::{MemoryRegion, PhysicalAddress, VirtualAddress, PAGE_SIZE};
pub use sched::{Pid, ProcessState};
pub use test_framework::{exit_qemu, test_panic_handler, QemuExitCode, Testable};

/// Heap allocation error handler.
///
/// Panic is intentional: allocation failure inside Rust's `alloc` machinery
/// is unrecoverable in a no_std kernel (fallible paths use the allocator's
/// null-returning API instead). The alloc_error_handler ABI requires `-> !`.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("Allocation error: {:?}", layout);
}

#[cfg(all(test, target_os = "none"))]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    test_main();
    loop {
        core::hint::spin_loop();
    }
}

#[cfg(all(test, target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    test_framework::test_panic_handler(info)
}
