//! `RestoreInfo`: the one piece of process-wide mutable state allowed past
//! self-relocation.
//!
//! Everything else a routine needs after the stack switch must either be
//! passed by value in a register/argument, or live here. No other global
//! is permitted: any other global would live in a data segment that
//! [`crate::sweep`] unmaps like everything else not on the keep-list.

use mtcp_image::MtcpHeader;
use static_assertions::assert_impl_all;
use std::cell::UnsafeCell;

/// Runtime flags threaded through from the CLI/environment plus the
/// signature-search result.
#[derive(Debug, Clone, Copy, Default)]
pub struct RestoreFlags {
    pub skip_mremap: bool,
    pub restart_pause: u8,
    pub use_gdb: bool,
    /// Set once, before self-relocation, from the [`crate::brk::BrkPlan`]
    /// the pre-relocation `brk` check produced. The relocated routine reads
    /// this instead of re-deriving the decision, since by the time it runs
    /// the live `current_brk()` no longer reflects the pre-relocation state.
    pub brk_deferred: bool,
    /// `MTCP_RESTART_VERBOSE` at startup. Consulted post-relocation to
    /// gate extra `mtcp_sys::fmt::eprintf` diagnostics during region
    /// restoration.
    pub verbose: bool,
}

/// Process-wide restoration state. Populated in two passes: the header
/// fields and image file descriptor before self-relocation, then the
/// relocation-derived fields (`stack_offset`, `relocated_entry`,
/// discovered vDSO/vvar bounds) as self-relocation, the sweep, and the
/// vDSO/vvar move run in turn.
#[derive(Debug, Clone, Copy)]
pub struct RestoreInfo {
    pub header: MtcpHeader,
    pub flags: RestoreFlags,

    /// Discovered *current* vDSO/vvar bounds (as opposed to the
    /// checkpoint-time bounds recorded in `header`), filled in by the
    /// sweeper before the vDSO/vvar relocation step reads them.
    pub current_vdso_start: u64,
    pub current_vdso_end: u64,
    pub current_vvar_start: u64,
    pub current_vvar_end: u64,

    pub image_fd: i32,

    pub old_stack_start: u64,
    pub old_stack_end: u64,
    pub new_stack_start: u64,
    pub new_stack_end: u64,
    /// `old_stack_addr - new_stack_addr`, subtracted from `sp`/`fp` at the
    /// moment of the stack switch.
    pub stack_offset: i64,

    /// Address of the restore routine, already adjusted by
    /// `restore_offset`, as it will be seen from the relocated copy.
    pub relocated_entry: u64,
}

// `switch_to_relocated_copy` mirrors this struct by bitwise copy into the
// relocated data segment along with the rest of the binary; it must stay
// a plain, self-contained value type with no indirection that would
// dangle across the jump.
assert_impl_all!(RestoreInfo: Copy);

/// Wrapper making the single global slot `Sync`. Safe because the
/// restorer is single-threaded throughout: there is never a second thread
/// that could race a read against a write here.
struct GlobalSlot(UnsafeCell<Option<RestoreInfo>>);
unsafe impl Sync for GlobalSlot {}

static RESTORE_INFO: GlobalSlot = GlobalSlot(UnsafeCell::new(None));

/// Seed the global with header/flags/fd before self-relocation begins.
/// Must be called exactly once, before any call to [`get`]/[`get_mut`].
pub fn init(header: MtcpHeader, flags: RestoreFlags, image_fd: i32) {
    unsafe {
        *RESTORE_INFO.0.get() = Some(RestoreInfo {
            header,
            flags,
            current_vdso_start: 0,
            current_vdso_end: 0,
            current_vvar_start: 0,
            current_vvar_end: 0,
            image_fd,
            old_stack_start: 0,
            old_stack_end: 0,
            new_stack_start: 0,
            new_stack_end: 0,
            stack_offset: 0,
            relocated_entry: 0,
        });
    }
}

/// Borrow the global `RestoreInfo`.
///
/// # Safety
/// [`init`] must already have run, and the caller must ensure no
/// concurrent mutable borrow exists — trivially true under the
/// single-threaded execution model this restorer assumes.
pub unsafe fn get() -> &'static RestoreInfo {
    (*RESTORE_INFO.0.get()).as_ref().expect("restore_info::init was not called")
}

/// Mutably borrow the global `RestoreInfo`.
///
/// # Safety
/// Same contract as [`get`].
pub unsafe fn get_mut() -> &'static mut RestoreInfo {
    (*RESTORE_INFO.0.get()).as_mut().expect("restore_info::init was not called")
}

/// Raw address of the global slot, computed once before the stack switch
/// so the relocated copy of this crate's code can be reached at the
/// *relocated* address of this same static (since the whole data segment,
/// including this static, is copied verbatim into the reserved range).
pub fn addr() -> usize {
    RESTORE_INFO.0.get() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_then_get_round_trips_header() {
        let mut header: MtcpHeader = unsafe { std::mem::zeroed() };
        header.restore_addr = 0x500000;
        init(header, RestoreFlags::default(), 7);
        unsafe {
            assert_eq!(get().header.restore_addr, 0x500000);
            assert_eq!(get().image_fd, 7);
        }
    }
}
