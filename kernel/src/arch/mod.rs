//! Architecture support.
//!
//! Borealis targets x86_64 only; everything hardware-specific lives under
//! [`x86_64`] so the rest of the kernel calls a small, well-defined surface
//! of primitives instead of scattering inline assembly.

pub mod x86_64;
