//! GPU backend HAL.
//!
//! Display hardware varies (virtio-gpu, VMware SVGA II, or nothing but
//! the multiboot framebuffer), so the compositor talks to an abstract
//! [`GpuBackend`]. Drivers register their backend at init with a
//! priority; the highest-priority registration is the active one, and a
//! machine with none simply uses the software flip path.

use alloc::{boxed::Box, vec::Vec};

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::sync::GlobalState;

use super::Rect;

/// One display backend.
pub trait GpuBackend: Send {
    fn name(&self) -> &'static str;

    /// Higher wins when several backends register.
    fn priority(&self) -> u8;

    /// Bind the current backbuffer (physical `(addr, len)` page runs) and
    /// mode to the device. Called at compositor init and after a resize.
    fn configure(&mut self, width: u32, height: u32, backing: &[(u64, u32)]) -> KernelResult<()>;

    /// Push a backbuffer rectangle to the display.
    fn present(&mut self, rect: Rect) -> KernelResult<()>;

    /// Complete any accelerated operations still in flight.
    fn sync(&mut self) -> KernelResult<()> {
        Ok(())
    }
}

static BACKENDS: GlobalState<Mutex<Vec<Box<dyn GpuBackend>>>> = GlobalState::new();

/// Prepare the (empty) registry.
pub fn init() {
    if BACKENDS.init(Mutex::new(Vec::new())).is_err() {
        println!("[GPU] Backend registry already initialized");
    }
}

/// Register a backend; the list stays sorted by descending priority.
pub fn register_backend(backend: Box<dyn GpuBackend>) -> KernelResult<()> {
    BACKENDS
        .with(|backends| {
            let mut backends = backends.lock();
            println!(
                "[GPU] Registered backend '{}' (priority {})",
                backend.name(),
                backend.priority()
            );
            backends.push(backend);
            backends.sort_by(|a, b| b.priority().cmp(&a.priority()));
        })
        .ok_or(KernelError::NotInitialized { subsystem: "GPU HAL" })
}

/// Run `f` against the active (highest-priority) backend, if any.
pub fn with_active<R>(f: impl FnOnce(&mut dyn GpuBackend) -> R) -> Option<R> {
    BACKENDS.with(|backends| {
        let mut backends = backends.lock();
        backends.first_mut().map(|b| f(&mut **b))
    })?
}

/// Name of the active backend.
pub fn active_name() -> Option<&'static str> {
    with_active(|b| b.name())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    struct DummyBackend {
        name: &'static str,
        priority: u8,
        presents: u32,
    }

    impl GpuBackend for DummyBackend {
        fn name(&self) -> &'static str {
            self.name
        }

        fn priority(&self) -> u8 {
            self.priority
        }

        fn configure(&mut self, _w: u32, _h: u32, _backing: &[(u64, u32)]) -> KernelResult<()> {
            Ok(())
        }

        fn present(&mut self, _rect: Rect) -> KernelResult<()> {
            self.presents += 1;
            Ok(())
        }
    }

    #[test]
    fn test_highest_priority_wins() {
        init();
        register_backend(Box::new(DummyBackend {
            name: "low",
            priority: 1,
            presents: 0,
        }))
        .unwrap();
        register_backend(Box::new(DummyBackend {
            name: "high",
            priority: 9,
            presents: 0,
        }))
        .unwrap();

        assert_eq!(active_name(), Some("high"));
        let r = with_active(|b| b.present(Rect::new(0, 0, 1, 1))).unwrap();
        assert!(r.is_ok());
    }
}
