//! Safe one-shot global initialization.
//!
//! Kernel subsystems follow a two-phase lifecycle: constructed once during
//! boot, never torn down. [`OnceLock`] is the storage primitive for that
//! pattern (a no_std `std::sync::OnceLock` lookalike), and [`GlobalState`]
//! is the convenience wrapper subsystems actually declare.

use core::sync::atomic::{AtomicPtr, Ordering};

extern crate alloc;

/// A cell that can be written to only once.
pub struct OnceLock<T> {
    inner: AtomicPtr<T>,
}

impl<T> Default for OnceLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OnceLock<T> {
    /// Create a new empty OnceLock
    pub const fn new() -> Self {
        Self {
            inner: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Get the value if initialized
    pub fn get(&self) -> Option<&T> {
        let ptr = self.inner.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: A non-null pointer was stored by `set()` via
            // Box::into_raw, so it points to a live, fully initialized T.
            // The Acquire load synchronizes-with the Release in `set()`.
            // The allocation is leaked, so the reference never dangles.
            Some(unsafe { &*ptr })
        }
    }

    /// Initialize the cell with a value.
    ///
    /// Returns `Err(value)` if the cell was already initialized.
    pub fn set(&self, value: T) -> Result<(), T> {
        let boxed = alloc::boxed::Box::new(value);
        let ptr = alloc::boxed::Box::into_raw(boxed);

        match self.inner.compare_exchange(
            core::ptr::null_mut(),
            ptr,
            Ordering::Release,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(_) => {
                // SAFETY: ptr came from Box::into_raw above and was never
                // published; reconstituting the Box frees it exactly once.
                let boxed = unsafe { alloc::boxed::Box::from_raw(ptr) };
                Err(*boxed)
            }
        }
    }
}

// SAFETY: OnceLock hands out only shared references to T after a
// synchronized one-time initialization; T: Send + Sync makes that safe to
// share across contexts.
unsafe impl<T: Send + Sync> Sync for OnceLock<T> {}
unsafe impl<T: Send> Send for OnceLock<T> {}

/// Subsystem-wide state with init-once semantics.
///
/// Declared `static`, initialized from `kmain` (or a driver init path), and
/// read through `with()` afterwards. Interior mutability, where needed, is
/// the stored type's business (typically a `spin::Mutex`).
pub struct GlobalState<T> {
    cell: OnceLock<T>,
}

impl<T> GlobalState<T> {
    pub const fn new() -> Self {
        Self {
            cell: OnceLock::new(),
        }
    }

    /// Initialize the global. Returns `Err(value)` if already initialized.
    pub fn init(&self, value: T) -> Result<(), T> {
        self.cell.set(value)
    }

    /// Whether init has run.
    pub fn is_initialized(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Run `f` against the state, or return `None` when uninitialized.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.cell.get().map(f)
    }
}

impl<T> Default for GlobalState<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_once_lock_single_init() {
        let cell: OnceLock<u32> = OnceLock::new();
        assert!(cell.get().is_none());
        assert_eq!(cell.set(7), Ok(()));
        assert_eq!(cell.set(9), Err(9));
        assert_eq!(cell.get(), Some(&7));
    }

    #[test]
    fn test_global_state_with() {
        let state: GlobalState<spin::Mutex<u32>> = GlobalState::new();
        assert_eq!(state.with(|_| ()), None);
        state.init(spin::Mutex::new(1)).ok().unwrap();
        let got = state.with(|m| {
            let mut v = m.lock();
            *v += 1;
            *v
        });
        assert_eq!(got, Some(2));
    }
}
