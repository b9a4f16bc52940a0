//! Program break restoration.
//!
//! Split into a pre-relocation half (safe to run while `rinfo` still lives
//! at its original address) and a post-relocation half (run from the
//! copied stack, after `rinfo` has followed along). Whether the deferred
//! half is needed at all is decided once, before self-relocation, and
//! recorded so the relocated restore routine doesn't have to re-derive it.

use mtcp_sys::mem;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrkError {
    #[error("reserved range [{restore_addr:#x}, {restore_end:#x}) would be bracketed by the current ({current:#x}) and saved ({saved:#x}) program breaks")]
    ReservedRangeBracketed {
        current: u64,
        saved: u64,
        restore_addr: u64,
        restore_end: u64,
    },
    #[error("brk(2) syscall failed")]
    Syscall,
}

/// What the caller must do about the program break, decided before
/// self-relocation.
pub enum BrkPlan {
    /// Break already matches (or is below) the saved value; nothing to do
    /// post-relocation — the call already happened, if needed.
    Done,
    /// Break is currently above the saved value; calling `brk` now would
    /// munmap memory that still holds `rinfo`. Defer to the relocated
    /// routine, which runs on the copied stack with `rinfo` already safe.
    Deferred { saved_brk: u64 },
}

/// Current program break, as reported by the kernel.
pub fn current_brk() -> u64 {
    unsafe { mem::brk(None) as u64 }
}

/// Decide what to do about the break and, if safe, do it immediately.
///
/// If the current break is at or below `saved_brk`, call `brk(saved_brk)`
/// now (any memory anonymously mapped above the old break is reclaimed
/// immediately, before it can collide with the snapshot's layout). If the
/// current break is above `saved_brk`, calling `brk` now would munmap
/// memory that may still contain `rinfo` — defer to [`restore_deferred`],
/// called after self-relocation.
pub fn plan_and_maybe_restore(
    saved_brk: u64,
    restore_addr: u64,
    restore_size: u64,
) -> Result<BrkPlan, BrkError> {
    let current = current_brk();
    let restore_end = restore_addr + restore_size;

    if current > restore_end && saved_brk < restore_addr {
        return Err(BrkError::ReservedRangeBracketed {
            current,
            saved: saved_brk,
            restore_addr,
            restore_end,
        });
    }

    if current <= saved_brk {
        let got = unsafe { mem::brk(Some(saved_brk as *mut std::ffi::c_void)) } as u64;
        if got != saved_brk {
            return Err(BrkError::Syscall);
        }
        Ok(BrkPlan::Done)
    } else {
        Ok(BrkPlan::Deferred { saved_brk })
    }
}

/// The post-relocation half: called from the relocated restore routine
/// once `rinfo` is safe on the new stack.
///
/// # Safety
/// Must only be called after self-relocation has completed and the
/// caller's stack is the copied one.
pub unsafe fn restore_deferred(saved_brk: u64) -> Result<(), BrkError> {
    let got = mem::brk(Some(saved_brk as *mut std::ffi::c_void)) as u64;
    if got != saved_brk {
        return Err(BrkError::Syscall);
    }
    Ok(())
}
