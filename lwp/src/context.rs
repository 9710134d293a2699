//! Saved execution state and the swap primitive.
//!
//! A [`Context`] holds the callee-saved registers of a suspended thread. The
//! runtime never looks inside it: it is filled and consumed only by [`swap`].
//! A fresh context is built by [`Context::prepare`] so that the first swap onto
//! it lands at the top of a new stack in a given entry function.

use std::arch::global_asm;

#[cfg(not(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
compile_error!("lwp only supports Linux on x86_64 and aarch64");

/// Default MXCSR: all SSE exceptions masked, round to nearest.
#[cfg(target_arch = "x86_64")]
const MXCSR_DEFAULT: u32 = 0x1f80;
/// Default x87 control word: all exceptions masked, extended precision.
#[cfg(target_arch = "x86_64")]
const FPUCW_DEFAULT: u32 = 0x037f;

#[cfg(target_arch = "x86_64")]
#[derive(Debug, Default)]
#[repr(C)]
pub struct Context {
    rsp: u64,
    r15: u64,
    r14: u64,
    r13: u64,
    r12: u64,
    rbx: u64,
    rbp: u64,
    mxcsr: u32,
    // only the low 16 bits are used
    fpucw: u32,
}

#[cfg(target_arch = "aarch64")]
#[derive(Debug, Default)]
#[repr(C)]
pub struct Context {
    x19_x28: [u64; 10],
    fp: u64,
    lr: u64,
    sp: u64,
    d8_d15: [u64; 8],
}

impl Context {
    /// Builds a context that enters `entry` on the stack ending at `stack_top`
    /// the first time it is swapped onto.
    ///
    /// # Safety
    /// `stack_top` must be the exclusive upper end of a writable region of at
    /// least a few pages that stays mapped for as long as the context may run.
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn prepare(stack_top: *mut u8, entry: extern "C" fn() -> !) -> Context {
        let top = stack_top as usize & !15;
        // `ret` in the swap pops the entry address, leaving rsp at top - 8 as
        // if `entry` had been called: (rsp + 8) stays 16-byte aligned.
        let slot = top - 16;
        std::ptr::write(slot as *mut u64, entry as usize as u64);
        std::ptr::write((top - 8) as *mut u64, 0);
        Context {
            rsp: slot as u64,
            mxcsr: MXCSR_DEFAULT,
            fpucw: FPUCW_DEFAULT,
            ..Context::default()
        }
    }

    /// Builds a context that enters `entry` on the stack ending at `stack_top`
    /// the first time it is swapped onto.
    ///
    /// # Safety
    /// `stack_top` must be the exclusive upper end of a writable region of at
    /// least a few pages that stays mapped for as long as the context may run.
    #[cfg(target_arch = "aarch64")]
    pub unsafe fn prepare(stack_top: *mut u8, entry: extern "C" fn() -> !) -> Context {
        let top = stack_top as usize & !15;
        Context {
            lr: entry as usize as u64,
            sp: top as u64,
            ..Context::default()
        }
    }
}

extern "C" {
    fn lwp_swap_context(save: *mut Context, load: *const Context);
}

/// Saves the running state into `save` and resumes whatever `load` holds.
///
/// Returns when some other thread swaps back onto `save`.
///
/// # Safety
/// `save` must be valid for writes and `load` must hold either a context
/// produced by an earlier swap or one built by [`Context::prepare`] whose stack
/// is still mapped. Neither may move while the owning thread is suspended.
pub unsafe fn swap(save: *mut Context, load: *const Context) {
    lwp_swap_context(save, load)
}

#[cfg(target_arch = "x86_64")]
global_asm!(
    ".text",
    ".global lwp_swap_context",
    ".type lwp_swap_context, @function",
    ".p2align 4",
    "lwp_swap_context:",
    "mov [rdi + 0x00], rsp",
    "mov [rdi + 0x08], r15",
    "mov [rdi + 0x10], r14",
    "mov [rdi + 0x18], r13",
    "mov [rdi + 0x20], r12",
    "mov [rdi + 0x28], rbx",
    "mov [rdi + 0x30], rbp",
    "stmxcsr dword ptr [rdi + 0x38]",
    "fnstcw word ptr [rdi + 0x3c]",
    "mov rsp, [rsi + 0x00]",
    "mov r15, [rsi + 0x08]",
    "mov r14, [rsi + 0x10]",
    "mov r13, [rsi + 0x18]",
    "mov r12, [rsi + 0x20]",
    "mov rbx, [rsi + 0x28]",
    "mov rbp, [rsi + 0x30]",
    "ldmxcsr dword ptr [rsi + 0x38]",
    "fldcw word ptr [rsi + 0x3c]",
    "ret",
    ".size lwp_swap_context, . - lwp_swap_context",
);

#[cfg(target_arch = "aarch64")]
global_asm!(
    ".text",
    ".global lwp_swap_context",
    ".type lwp_swap_context, %function",
    ".p2align 2",
    "lwp_swap_context:",
    "stp x19, x20, [x0, #0]",
    "stp x21, x22, [x0, #16]",
    "stp x23, x24, [x0, #32]",
    "stp x25, x26, [x0, #48]",
    "stp x27, x28, [x0, #64]",
    "stp x29, x30, [x0, #80]",
    "mov x9, sp",
    "str x9, [x0, #96]",
    "stp d8, d9, [x0, #104]",
    "stp d10, d11, [x0, #120]",
    "stp d12, d13, [x0, #136]",
    "stp d14, d15, [x0, #152]",
    "ldp x19, x20, [x1, #0]",
    "ldp x21, x22, [x1, #16]",
    "ldp x23, x24, [x1, #32]",
    "ldp x25, x26, [x1, #48]",
    "ldp x27, x28, [x1, #64]",
    "ldp x29, x30, [x1, #80]",
    "ldr x9, [x1, #96]",
    "mov sp, x9",
    "ldp d8, d9, [x1, #104]",
    "ldp d10, d11, [x1, #120]",
    "ldp d12, d13, [x1, #136]",
    "ldp d14, d15, [x1, #152]",
    "ret",
    ".size lwp_swap_context, . - lwp_swap_context",
);
