//! aarch64 context switching implementation (AAPCS64)

use std::arch::naked_asm;

/// Callee-saved registers of a suspended context
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SavedRegs {
    pub sp: u64,        // 0x00
    pub lr: u64,        // 0x08
    pub x19: [u64; 10], // 0x10..0x60 (x19-x28)
    pub fp: u64,        // 0x60
    pub d8: [u64; 8],   // 0x68..0xa8 (d8-d15)
}

/// Initialize a fresh context
///
/// Switching to `regs` afterwards runs `entry_fn(entry_arg)` on the stack
/// ending at `stack_top`. `entry_fn` must never return.
///
/// # Safety
///
/// `stack_top` must be the upper end of a writable stack region.
#[inline]
pub unsafe fn init_context(
    regs: &mut SavedRegs,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    let sp = (stack_top as usize) & !0xF;

    *regs = SavedRegs {
        sp: sp as u64,
        lr: entry_trampoline as usize as u64,
        ..SavedRegs::default()
    };
    regs.x19[0] = entry_fn as u64;
    regs.x19[1] = entry_arg as u64;
}

/// First code run on a fresh stack
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov x0, x20",
        "blr x19",
        // entry functions never return
        "brk #0",
    );
}

/// Save the current context into `old` and continue at `new`
///
/// Returns when something switches back to `old`.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_old: *mut SavedRegs, _new: *const SavedRegs) {
    naked_asm!(
        // Save callee-saved registers to old (x0)
        "mov x9, sp",
        "str x9, [x0, #0x00]",
        "str x30, [x0, #0x08]",
        "stp x19, x20, [x0, #0x10]",
        "stp x21, x22, [x0, #0x20]",
        "stp x23, x24, [x0, #0x30]",
        "stp x25, x26, [x0, #0x40]",
        "stp x27, x28, [x0, #0x50]",
        "str x29, [x0, #0x60]",
        "stp d8, d9, [x0, #0x68]",
        "stp d10, d11, [x0, #0x78]",
        "stp d12, d13, [x0, #0x88]",
        "stp d14, d15, [x0, #0x98]",
        // Load callee-saved registers from new (x1)
        "ldr x9, [x1, #0x00]",
        "mov sp, x9",
        "ldr x30, [x1, #0x08]",
        "ldp x19, x20, [x1, #0x10]",
        "ldp x21, x22, [x1, #0x20]",
        "ldp x23, x24, [x1, #0x30]",
        "ldp x25, x26, [x1, #0x40]",
        "ldp x27, x28, [x1, #0x50]",
        "ldr x29, [x1, #0x60]",
        "ldp d8, d9, [x1, #0x68]",
        "ldp d10, d11, [x1, #0x78]",
        "ldp d12, d13, [x1, #0x88]",
        "ldp d14, d15, [x1, #0x98]",
        // Continue at the saved link register
        "ret",
    );
}
