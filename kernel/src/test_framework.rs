//! Bare-metal test harness support.
//!
//! Test binaries run under QEMU with `-device isa-debug-exit`; the runner
//! reports per-test status over serial and exits the VM with a distinct
//! code so the harness can tell success from failure.

/// Exit codes understood by the QEMU isa-debug-exit device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

/// Terminate the VM through the isa-debug-exit device at port 0xF4.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn exit_qemu(exit_code: QemuExitCode) -> ! {
    use x86_64::instructions::port::Port;

    // SAFETY: Writing the exit code to the isa-debug-exit device port.
    // QEMU terminates the VM on this write; nothing executes afterwards.
    unsafe {
        let mut port = Port::new(0xF4);
        port.write(exit_code as u32);
    }
    unreachable!();
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn exit_qemu(exit_code: QemuExitCode) -> ! {
    panic!("exit_qemu({:?}) outside QEMU", exit_code);
}

/// Anything runnable by the custom test runner.
pub trait Testable {
    fn run(&self);
}

impl<T> Testable for T
where
    T: Fn(),
{
    fn run(&self) {
        serial_print!("{}...\t", core::any::type_name::<T>());
        self();
        serial_println!("[ok]");
    }
}

/// Custom test runner for `#[test_case]` functions in bare-metal builds.
pub fn test_runner(tests: &[&dyn Testable]) {
    serial_println!("Running {} tests", tests.len());
    for test in tests {
        test.run();
    }
    exit_qemu(QemuExitCode::Success);
}

/// Panic handler body for bare-metal test binaries.
pub fn test_panic_handler(info: &core::panic::PanicInfo) -> ! {
    serial_println!("[failed]");
    serial_println!("Error: {}", info);
    exit_qemu(QemuExitCode::Failed);
}
