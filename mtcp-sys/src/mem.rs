//! Memory-mapping primitives and byte-wise copy/fill routines.

use crate::errno::set_from_syscall_rc;
use crate::raw::{self, is_err, SYS};
use std::ffi::c_void;

const PAGE_SIZE: usize = 4096;

/// Byte-wise copy, non-overlapping. Provided so that code running after
/// self-relocation never needs to call into a (possibly-unmapped) libc
/// `memcpy`; the compiler lowers this to the same code a hand-written loop
/// would produce, without an external call.
///
/// # Safety
/// `dst` and `src` must each be valid for `len` bytes and must not overlap.
pub unsafe fn memcpy(dst: *mut u8, src: *const u8, len: usize) {
    std::ptr::copy_nonoverlapping(src, dst, len);
}

/// Byte-wise fill. See [`memcpy`] for why this exists instead of calling
/// libc's `memset`.
///
/// # Safety
/// `dst` must be valid for `len` bytes.
pub unsafe fn memset(dst: *mut u8, val: u8, len: usize) {
    std::ptr::write_bytes(dst, val, len);
}

/// Result of a raw `mmap`. `MAP_FAILED` (`-1` as a pointer) is reported as
/// `None`; callers check [`crate::errno::last_errno`] for the reason.
pub type MapResult = Option<*mut c_void>;

/// # Safety
/// Same contract as the underlying `mmap(2)` syscall.
#[allow(clippy::too_many_arguments)]
pub unsafe fn mmap(
    addr: *mut c_void,
    len: usize,
    prot: i32,
    flags: i32,
    fd: i32,
    offset: i64,
) -> MapResult {
    #[cfg(any(target_arch = "x86", target_arch = "arm"))]
    let rc = {
        // mmap2's offset argument is in page units, not bytes.
        debug_assert_eq!(offset as usize % PAGE_SIZE, 0);
        raw::syscall6(
            SYS::MMAP,
            addr as i64,
            len as i64,
            prot as i64,
            flags as i64,
            fd as i64,
            offset / PAGE_SIZE as i64,
        )
    };
    #[cfg(not(any(target_arch = "x86", target_arch = "arm")))]
    let rc = raw::syscall6(
        SYS::MMAP,
        addr as i64,
        len as i64,
        prot as i64,
        flags as i64,
        fd as i64,
        offset,
    );

    if is_err(rc) {
        set_from_syscall_rc(rc);
        None
    } else {
        Some(rc as *mut c_void)
    }
}

/// Emulates `MAP_FIXED_NOREPLACE` (Linux >= 4.17): maps at exactly `addr`,
/// unmapping and reporting failure if the kernel placed it elsewhere
/// instead (older kernels silently honour `MAP_FIXED` by clobbering
/// whatever was there, which is why the caller must guarantee the target
/// range is already unmapped).
///
/// # Safety
/// Same contract as [`mmap`]; additionally the caller must ensure
/// `[addr, addr+len)` is unoccupied, or accept that a pre-4.17 kernel may
/// silently destroy whatever was mapped there.
pub unsafe fn mmap_fixed_noreplace(
    addr: *mut c_void,
    len: usize,
    prot: i32,
    flags: i32,
    fd: i32,
    offset: i64,
) -> MapResult {
    let flags = (flags & !libc::MAP_FIXED) | map_fixed_noreplace_flag();
    match mmap(addr, len, prot, flags, fd, offset) {
        Some(got) if got == addr => Some(got),
        Some(got) => {
            // Kernel ignored the hint (pre-4.17, no MAP_FIXED_NOREPLACE support);
            // undo and report failure rather than silently running at the wrong address.
            let _ = munmap(got, len);
            None
        }
        None => None,
    }
}

#[cfg(target_os = "linux")]
fn map_fixed_noreplace_flag() -> i32 {
    // 0x100000; not yet in every libc constant table this workspace targets.
    0x0010_0000
}

/// # Safety
/// Same contract as `munmap(2)`.
pub unsafe fn munmap(addr: *mut c_void, len: usize) -> Result<(), ()> {
    let rc = raw::syscall2(SYS::MUNMAP, addr as i64, len as i64);
    if is_err(rc) {
        set_from_syscall_rc(rc);
        Err(())
    } else {
        Ok(())
    }
}

/// # Safety
/// Same contract as `mprotect(2)`.
pub unsafe fn mprotect(addr: *mut c_void, len: usize, prot: i32) -> Result<(), ()> {
    let rc = raw::syscall3(SYS::MPROTECT, addr as i64, len as i64, prot as i64);
    if is_err(rc) {
        set_from_syscall_rc(rc);
        Err(())
    } else {
        Ok(())
    }
}

/// `mremap(2)` with `MREMAP_MAYMOVE`, fixed destination only if `fixed` is
/// set.
///
/// # Safety
/// Same contract as `mremap(2)`.
pub unsafe fn mremap(
    old_addr: *mut c_void,
    old_len: usize,
    new_len: usize,
    flags: i32,
    new_addr: *mut c_void,
) -> MapResult {
    let rc = raw::syscall5(
        SYS::MREMAP,
        old_addr as i64,
        old_len as i64,
        new_len as i64,
        flags as i64,
        new_addr as i64,
    );
    if is_err(rc) {
        set_from_syscall_rc(rc);
        None
    } else {
        Some(rc as *mut c_void)
    }
}

/// `brk(2)`. A `None` argument queries the current break. Returns the
/// resulting break (which, on failure, is the break unchanged — the raw
/// `brk` syscall reports failure this way rather than returning `-1`).
///
/// # Safety
/// Same contract as `brk(2)`.
pub unsafe fn brk(addr: Option<*mut c_void>) -> *mut c_void {
    let rc = raw::syscall1(SYS::BRK, addr.map(|a| a as i64).unwrap_or(0));
    rc as *mut c_void
}

pub const MTCP_PAGE_SIZE: usize = PAGE_SIZE;
