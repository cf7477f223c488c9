use core::arch::global_asm;
use core::cell::Cell;

/// The number of bytes the swap primitive pushes for the callee-saved
/// registers defined by the System V x86-64 calling convention
/// (`rbp, rbx, r12, r13, r14, r15`).
pub const SPACE_FOR_SAVED_REGISTERS: usize = 48;

global_asm!(include_str!("context_switch.s"), options(att_syntax));

extern "C" {
    fn arachne_swap_context(save: *mut *mut u8, load: *const *mut u8);
}

/// Saves the current register state and stack pointer through `save`, then
/// resumes execution on the stack whose pointer is stored in `load`.
///
/// Does not return to its caller until some other thread on the same core
/// swaps back with the pointer published through `save`.
///
/// # Safety
///
/// `load` must hold a stack pointer previously published by this function, or
/// one prepared by [`lay_trampoline`], and both cells must outlive the swap.
pub unsafe fn swap_context(save: &Cell<*mut u8>, load: &Cell<*mut u8>) {
    // SAFETY: Delegated to the caller; the cells give us stable addresses to
    // store and load the stack pointers through.
    unsafe { arachne_swap_context(save.as_ptr(), load.as_ptr()) }
}

/// Prepares a fresh stack so that the first [`swap_context`] into it
/// "returns" into `entry`, and returns the stack pointer to publish.
///
/// The resulting layout, from high addresses down, is the contract the swap
/// primitive expects:
///
/// ```text
/// high addr →  [ entry return address ]
///              [ register band: rbp, rbx, r12, r13, r14, r15 ] (48 B, zeroed)
/// low addr  →  returned stack pointer
/// ```
///
/// # Safety
///
/// `stack_top` must point one past a writable region of at least
/// `SPACE_FOR_SAVED_REGISTERS + 16` bytes, aligned to 16 bytes.
pub unsafe fn lay_trampoline(stack_top: *mut u8, entry: extern "C" fn() -> !) -> *mut u8 {
    // SAFETY: By assumption `stack_top` is one past a writable, 16-byte
    // aligned region large enough for the return slot and register band.
    // Leaving one word above the return slot keeps the entry function's
    // stack pointer congruent to a call-entry frame (rsp % 16 == 8).
    unsafe {
        let return_slot = stack_top.sub(16);
        #[allow(clippy::fn_to_numeric_cast_any)]
        return_slot.cast::<u64>().write(entry as usize as u64);
        let sp = return_slot.sub(SPACE_FOR_SAVED_REGISTERS);
        sp.write_bytes(0, SPACE_FOR_SAVED_REGISTERS);
        sp
    }
}
