//! x86_64 context switching implementation
//!
//! Uses naked functions for the switch itself.
//! Stable in Rust 1.88+

use std::arch::naked_asm;

/// Callee-saved registers of a suspended context (System V AMD64)
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SavedRegs {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
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
    // 16-byte aligned at the trampoline; its `call` leaves the entry
    // function with rsp % 16 == 8 as the ABI requires.
    let sp = (stack_top as usize) & !0xF;

    *regs = SavedRegs {
        rsp: sp as u64,
        rip: entry_trampoline as usize as u64,
        r12: entry_fn as u64,
        r13: entry_arg as u64,
        ..SavedRegs::default()
    };
}

/// First code run on a fresh stack
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        // entry functions never return
        "ud2",
    );
}

/// Save the current context into `old` and continue at `new`
///
/// Returns when something switches back to `old`.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_old: *mut SavedRegs, _new: *const SavedRegs) {
    naked_asm!(
        // Save callee-saved registers to old (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from new (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Jump to new RIP
        "jmp rax",
        // Return point for saved context
        "1:",
        "ret",
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saved_regs_layout() {
        assert_eq!(std::mem::size_of::<SavedRegs>(), 0x40);
        assert_eq!(std::mem::offset_of!(SavedRegs, r12), 0x20);
    }

    #[test]
    fn test_init_context_aligns_stack() {
        let mut regs = SavedRegs::default();
        let top = 0x1000_0009usize as *mut u8;
        unsafe { init_context(&mut regs, top, 0x10, 0x20) };
        assert_eq!(regs.rsp % 16, 0);
        assert!(regs.rsp <= top as u64);
        assert_eq!(regs.r12, 0x10);
        assert_eq!(regs.r13, 0x20);
    }
}
