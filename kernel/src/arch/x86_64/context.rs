//! x86_64 context switching.
//!
//! A context switch saves the outgoing task's callee-saved registers and
//! stack pointer into its [`CpuContext`], loads the incoming task's, and
//! jumps to its saved instruction pointer. The System V ABI makes the
//! caller-saved registers dead across the `context_switch` call, so only
//! callee-saved state is stored.
//!
//! A freshly created task has never been switched away from; its context is
//! forged so the first switch "returns" into [`task_entry_trampoline`],
//! which calls `entry(arg)` with interrupts enabled and routes the return
//! into `sched::exit_current`.

use core::arch::global_asm;

/// Saved CPU state of a suspended task.
///
/// The assembly in this file addresses the first nine fields by fixed
/// offsets; their order is ABI.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct CpuContext {
    pub r15: u64,    // 0x00
    pub r14: u64,    // 0x08
    pub r13: u64,    // 0x10
    pub r12: u64,    // 0x18
    pub rbx: u64,    // 0x20
    pub rbp: u64,    // 0x28
    pub rsp: u64,    // 0x30
    pub rip: u64,    // 0x38
    pub rflags: u64, // 0x40

    /// Segment selectors, recorded for diagnostics; every task runs with
    /// the kernel selectors and the switch path never reloads them.
    pub cs: u16,
    pub ss: u16,
}

/// RFLAGS for a new task: IF set, reserved bit 1 set.
pub const INITIAL_RFLAGS: u64 = 0x202;

impl CpuContext {
    /// An empty context (used for the slot that receives the boot CPU's
    /// state on the first switch).
    pub const fn zeroed() -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            rbx: 0,
            rbp: 0,
            rsp: 0,
            rip: 0,
            rflags: 0,
            cs: 0x08,
            ss: 0x10,
        }
    }

    /// Forge the initial context of a new task.
    ///
    /// The first switch into this context lands at the trampoline with
    /// `entry` in r12 and `arg` in r13 (both callee-saved, so the switch
    /// path restores them), interrupts enabled via RFLAGS.
    pub fn new_task(entry: extern "C" fn(usize), arg: usize, stack_top: u64) -> Self {
        let mut ctx = Self::zeroed();
        // 16-byte alignment at the trampoline keeps the ABI contract for
        // the `call` it performs.
        ctx.rsp = stack_top & !0xF;
        ctx.rip = task_entry_trampoline as usize as u64;
        ctx.rflags = INITIAL_RFLAGS;
        ctx.r12 = entry as usize as u64;
        ctx.r13 = arg as u64;
        ctx
    }
}

global_asm!(
    r#"
.section .text
.global context_switch
// context_switch(old: *mut CpuContext (rdi), new: *const CpuContext (rsi))
//
// Saves callee-saved registers, RSP (as it will be after our return), the
// return address as RIP, and RFLAGS into *old; then installs *new and
// jumps to its RIP. Returns (eventually) when something switches back.
context_switch:
    mov [rdi + 0x00], r15
    mov [rdi + 0x08], r14
    mov [rdi + 0x10], r13
    mov [rdi + 0x18], r12
    mov [rdi + 0x20], rbx
    mov [rdi + 0x28], rbp
    mov rax, [rsp]
    mov [rdi + 0x38], rax       // rip = our return address
    lea rax, [rsp + 8]
    mov [rdi + 0x30], rax       // rsp = caller frame after return
    pushfq
    pop rax
    mov [rdi + 0x40], rax       // rflags

    mov r15, [rsi + 0x00]
    mov r14, [rsi + 0x08]
    mov r13, [rsi + 0x10]
    mov r12, [rsi + 0x18]
    mov rbx, [rsi + 0x20]
    mov rbp, [rsi + 0x28]
    mov rsp, [rsi + 0x30]
    mov rax, [rsi + 0x40]
    push rax
    popfq
    mov rax, [rsi + 0x38]
    jmp rax

.global task_entry_trampoline
// First instructions a new task ever executes. r12 = entry, r13 = arg,
// both placed there by CpuContext::new_task and restored by the switch.
task_entry_trampoline:
    mov rdi, r13
    call r12
    xor edi, edi
    call task_exit_from_trampoline
1:
    cli
    hlt
    jmp 1b
"#
);

extern "C" {
    /// Perform the switch. See the assembly above.
    ///
    /// # Safety
    ///
    /// Both pointers must reference valid `CpuContext` values; `new` must
    /// describe either a live suspended task or a freshly forged task
    /// context whose stack is owned by that task. Must be called with
    /// interrupts disabled.
    pub fn context_switch(old: *mut CpuContext, new: *const CpuContext);

    /// Entry shim for new tasks; never called directly from Rust.
    pub fn task_entry_trampoline();
}

/// Landing point when a task's entry function returns.
#[no_mangle]
extern "C" fn task_exit_from_trampoline(code: i32) -> ! {
    crate::sched::exit_current(code);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_context_field_offsets_match_asm() {
        assert_eq!(core::mem::offset_of!(CpuContext, r15), 0x00);
        assert_eq!(core::mem::offset_of!(CpuContext, r14), 0x08);
        assert_eq!(core::mem::offset_of!(CpuContext, r13), 0x10);
        assert_eq!(core::mem::offset_of!(CpuContext, r12), 0x18);
        assert_eq!(core::mem::offset_of!(CpuContext, rbx), 0x20);
        assert_eq!(core::mem::offset_of!(CpuContext, rbp), 0x28);
        assert_eq!(core::mem::offset_of!(CpuContext, rsp), 0x30);
        assert_eq!(core::mem::offset_of!(CpuContext, rip), 0x38);
        assert_eq!(core::mem::offset_of!(CpuContext, rflags), 0x40);
    }

    #[test]
    fn test_new_task_context_shape() {
        extern "C" fn entry(_arg: usize) {}
        let ctx = CpuContext::new_task(entry, 0xAB, 0x8000_000F);
        assert_eq!(ctx.rsp % 16, 0);
        assert_eq!(ctx.rflags, INITIAL_RFLAGS);
        assert_eq!(ctx.r12, entry as usize as u64);
        assert_eq!(ctx.r13, 0xAB);
        assert_eq!(ctx.rip, task_entry_trampoline as usize as u64);
    }
}
