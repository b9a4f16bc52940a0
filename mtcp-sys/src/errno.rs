//! A thread-local `errno` substitute.
//!
//! Every freestanding primitive in this crate is a thin wrapper around a raw
//! syscall; none of them can rely on the C library's `errno` variable (its
//! storage lives in a TLS block belonging to libc, which the restorer may
//! have already unmapped). Instead each wrapper stashes the kernel's
//! `-errno` result here immediately after the syscall returns, and the
//! caller reads it back with [`last_errno`].

use std::cell::Cell;

thread_local! {
    static LAST_ERRNO: Cell<i32> = const { Cell::new(0) };
}

/// Record the errno implied by a raw syscall return value. `rc` must
/// already be known to be an error (negative, `-errno`).
pub(crate) fn set_from_syscall_rc(rc: isize) {
    LAST_ERRNO.with(|e| e.set((-rc) as i32));
}

/// The errno recorded by the most recent failing call into this crate, or 0
/// if no call has failed yet (or the last one succeeded).
pub fn last_errno() -> i32 {
    LAST_ERRNO.with(|e| e.get())
}
