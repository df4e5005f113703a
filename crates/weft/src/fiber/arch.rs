//! Architecture-specific fiber context switching.
//!
//! A [`Context`] is the saved machine state of a suspended fiber: the stack
//! pointer, the callee-saved integer registers, and the callee-saved floating
//! point state of the platform ABI. `context_switch` stores the current state
//! into one context and resumes another; it is the single suspension point of
//! the whole job system and involves no kernel.
//!
//! A fresh context is arranged so that the first switch into it lands in a
//! small naked trampoline with the entry function and its argument parked in
//! callee-saved registers. The entry function must never return (a fiber
//! terminates by switching away for the last time) and the trampoline traps
//! if it ever does.

use core::arch::naked_asm;

/// Entry signature for a fresh context. Receives the opaque argument given to
/// [`Context::fresh`] and must never return.
pub(crate) type EntryFn = extern "C" fn(*mut ()) -> !;

// =============================================================================
// x86_64 System V
// =============================================================================
//
// Callee-saved: rbx, rbp, r12-r15, rsp. No xmm register survives a call, but
// the mxcsr and x87 control words do and are saved alongside. The saved rsp
// points at a return address, so restoring is `mov rsp, ...` followed by
// `ret`, the same mechanism first-entry uses to reach the trampoline.
//
// Field offsets are fixed by the assembly below; keep both in sync.

#[cfg(target_arch = "x86_64")]
#[repr(C)]
#[allow(dead_code)] // fields are read by the switch assembly only
pub(crate) struct Context {
    rsp: u64,   // 0x00
    rbx: u64,   // 0x08
    rbp: u64,   // 0x10
    r12: u64,   // 0x18  trampoline: entry argument
    r13: u64,   // 0x20  trampoline: entry function
    r14: u64,   // 0x28
    r15: u64,   // 0x30
    mxcsr: u32, // 0x38
    fcw: u16,   // 0x3c
    _pad: u16,
}

#[cfg(target_arch = "x86_64")]
impl Context {
    /// x86 default MXCSR: all exceptions masked, round to nearest.
    const MXCSR_DEFAULT: u32 = 0x1f80;
    /// x87 default control word: all exceptions masked, 64-bit precision.
    const FCW_DEFAULT: u16 = 0x037f;

    /// A context that is only ever written by a `context_switch` save.
    pub(crate) const fn idle() -> Self {
        Self {
            rsp: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            mxcsr: Self::MXCSR_DEFAULT,
            fcw: Self::FCW_DEFAULT,
            _pad: 0,
        }
    }

    /// Arranges a context so the first switch into it calls
    /// `entry(argument)` on the stack topped by `stack_top`.
    ///
    /// # Safety
    ///
    /// `stack_top` must be the top of a live, writable stack that stays valid
    /// until the fiber terminates.
    pub(crate) unsafe fn fresh(stack_top: *mut u8, entry: EntryFn, argument: *mut ()) -> Self {
        // Align down, then push the trampoline address. `ret` pops it,
        // leaving rsp 16-aligned at the trampoline, whose `call` then
        // re-establishes the ABI's entry alignment.
        let top = (stack_top as usize) & !15;
        let slot = (top - 8) as *mut usize;
        // SAFETY: `slot` is in the live stack per the caller contract.
        unsafe { slot.write(trampoline as usize) };

        Self {
            rsp: slot as u64,
            rbx: 0,
            rbp: 0,
            r12: argument as u64,
            r13: entry as usize as u64,
            r14: 0,
            r15: 0,
            mxcsr: Self::MXCSR_DEFAULT,
            fcw: Self::FCW_DEFAULT,
            _pad: 0,
        }
    }
}

/// Saves the current machine state into `*from` and resumes `*to`.
///
/// # Safety
///
/// `from` must be writable; `to` must hold a state produced by
/// [`Context::fresh`] or a previous save, whose stack is still live and not
/// currently executing anywhere else.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn context_switch(from: *mut Context, to: *const Context) {
    naked_asm!(
        // Save: rsp points at our return address, so a later restore's `ret`
        // resumes right after this call site.
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbx",
        "mov [rdi + 0x10], rbp",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "stmxcsr [rdi + 0x38]",
        "fnstcw [rdi + 0x3c]",
        // Restore.
        "mov rsp, [rsi + 0x00]",
        "mov rbx, [rsi + 0x08]",
        "mov rbp, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        "ldmxcsr [rsi + 0x38]",
        "fldcw [rsi + 0x3c]",
        "ret",
    )
}

/// First-entry shim: forwards the argument and function parked in r12/r13 by
/// [`Context::fresh`]. The entry never returns; trap if it does.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
unsafe extern "C" fn trampoline() {
    naked_asm!("mov rdi, r12", "call r13", "ud2")
}

// =============================================================================
// aarch64 AAPCS64
// =============================================================================
//
// Callee-saved: x19-x28, the frame pointer x29, the link register x30, sp,
// and the low halves of v8-v15 (d8-d15). Restoring ends in `ret`, which jumps
// to the restored x30; for a fresh context that is the trampoline itself.

#[cfg(target_arch = "aarch64")]
#[repr(C)]
#[allow(dead_code)] // fields are read by the switch assembly only
pub(crate) struct Context {
    sp: u64,        // 0x00
    x19: u64,       // 0x08  trampoline: entry argument
    x20: u64,       // 0x10  trampoline: entry function
    x21: u64,       // 0x18
    x22: u64,       // 0x20
    x23: u64,       // 0x28
    x24: u64,       // 0x30
    x25: u64,       // 0x38
    x26: u64,       // 0x40
    x27: u64,       // 0x48
    x28: u64,       // 0x50
    x29: u64,       // 0x58
    x30: u64,       // 0x60
    d: [u64; 8],    // 0x68..0xa8: d8-d15
}

#[cfg(target_arch = "aarch64")]
impl Context {
    /// A context that is only ever written by a `context_switch` save.
    pub(crate) const fn idle() -> Self {
        Self {
            sp: 0,
            x19: 0,
            x20: 0,
            x21: 0,
            x22: 0,
            x23: 0,
            x24: 0,
            x25: 0,
            x26: 0,
            x27: 0,
            x28: 0,
            x29: 0,
            x30: 0,
            d: [0; 8],
        }
    }

    /// Arranges a context so the first switch into it calls
    /// `entry(argument)` on the stack topped by `stack_top`.
    ///
    /// # Safety
    ///
    /// `stack_top` must be the top of a live, writable stack that stays valid
    /// until the fiber terminates.
    pub(crate) unsafe fn fresh(stack_top: *mut u8, entry: EntryFn, argument: *mut ()) -> Self {
        let mut ctx = Self::idle();
        ctx.sp = (stack_top as usize & !15) as u64;
        ctx.x19 = argument as u64;
        ctx.x20 = entry as usize as u64;
        ctx.x30 = trampoline as usize as u64;
        ctx
    }
}

/// Saves the current machine state into `*from` and resumes `*to`.
///
/// # Safety
///
/// `from` must be writable; `to` must hold a state produced by
/// [`Context::fresh`] or a previous save, whose stack is still live and not
/// currently executing anywhere else.
#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn context_switch(from: *mut Context, to: *const Context) {
    naked_asm!(
        // Save.
        "mov x2, sp",
        "str x2, [x0, #0x00]",
        "stp x19, x20, [x0, #0x08]",
        "stp x21, x22, [x0, #0x18]",
        "stp x23, x24, [x0, #0x28]",
        "stp x25, x26, [x0, #0x38]",
        "stp x27, x28, [x0, #0x48]",
        "stp x29, x30, [x0, #0x58]",
        "stp d8, d9, [x0, #0x68]",
        "stp d10, d11, [x0, #0x78]",
        "stp d12, d13, [x0, #0x88]",
        "stp d14, d15, [x0, #0x98]",
        // Restore.
        "ldr x2, [x1, #0x00]",
        "mov sp, x2",
        "ldp x19, x20, [x1, #0x08]",
        "ldp x21, x22, [x1, #0x18]",
        "ldp x23, x24, [x1, #0x28]",
        "ldp x25, x26, [x1, #0x38]",
        "ldp x27, x28, [x1, #0x48]",
        "ldp x29, x30, [x1, #0x58]",
        "ldp d8, d9, [x1, #0x68]",
        "ldp d10, d11, [x1, #0x78]",
        "ldp d12, d13, [x1, #0x88]",
        "ldp d14, d15, [x1, #0x98]",
        "ret",
    )
}

/// First-entry shim: forwards the argument and function parked in x19/x20 by
/// [`Context::fresh`]. The entry never returns; trap if it does.
#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
unsafe extern "C" fn trampoline() {
    naked_asm!("mov x0, x19", "blr x20", "brk #0")
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("fiber context switching is not implemented for this architecture");
