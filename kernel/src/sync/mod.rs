//! Synchronization primitives beyond what `spin` provides.

pub mod once_lock;

pub use once_lock::{GlobalState, OnceLock};
