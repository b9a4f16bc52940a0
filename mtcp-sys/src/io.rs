//! Raw file I/O: `open`/`close`/`read`/`write`/`lseek`, plus the retrying
//! loops (`read_all`/`write_all`, `readfile`) that absorb `EINTR`/`EAGAIN`
//! without pulling in a libc buffered-I/O layer.

use crate::errno::set_from_syscall_rc;
use crate::raw::{self, is_err, SYS};
use std::ffi::CStr;

/// Bounded retry budget for `EINTR`/`EAGAIN` on `read`/`write`; exhausting it
/// means the kernel is handing back the same transient error indefinitely,
/// which this code treats as fatal rather than spinning forever.
const MAX_RETRIES: u32 = 10;

/// # Safety
/// `path` must be a valid NUL-terminated C string.
pub unsafe fn open(path: &CStr, flags: i32, mode: u32) -> Result<i32, ()> {
    #[cfg(target_arch = "aarch64")]
    let rc = raw::syscall4(
        SYS::OPENAT,
        libc::AT_FDCWD as i64,
        path.as_ptr() as i64,
        flags as i64,
        mode as i64,
    );
    #[cfg(not(target_arch = "aarch64"))]
    let rc = raw::syscall3(SYS::OPEN, path.as_ptr() as i64, flags as i64, mode as i64);

    if is_err(rc) {
        set_from_syscall_rc(rc);
        Err(())
    } else {
        Ok(rc as i32)
    }
}

/// # Safety
/// `fd` must be a valid, still-open file descriptor (or this is a no-op
/// failure).
pub unsafe fn close(fd: i32) -> Result<(), ()> {
    let rc = raw::syscall1(SYS::CLOSE, fd as i64);
    if is_err(rc) {
        set_from_syscall_rc(rc);
        Err(())
    } else {
        Ok(())
    }
}

/// Make `newfd` a copy of `oldfd`, closing `newfd` first if already open.
/// Implemented via `dup3` (flags 0) rather than `dup2`, since aarch64 has
/// no `dup2` syscall at all.
///
/// # Safety
/// `oldfd` must be a valid, open file descriptor.
pub unsafe fn dup2(oldfd: i32, newfd: i32) -> Result<(), ()> {
    let rc = raw::syscall3(SYS::DUP3, oldfd as i64, newfd as i64, 0);
    if is_err(rc) {
        set_from_syscall_rc(rc);
        Err(())
    } else {
        Ok(())
    }
}

/// One raw `read(2)` call, no retry. Returns bytes read (0 = EOF) or `Err`.
///
/// # Safety
/// `buf` must be valid for `len` bytes.
pub unsafe fn read(fd: i32, buf: *mut u8, len: usize) -> Result<usize, ()> {
    let rc = raw::syscall3(SYS::READ, fd as i64, buf as i64, len as i64);
    if is_err(rc) {
        set_from_syscall_rc(rc);
        Err(())
    } else {
        Ok(rc as usize)
    }
}

/// One raw `write(2)` call, no retry.
///
/// # Safety
/// `buf` must be valid for `len` bytes.
pub unsafe fn write(fd: i32, buf: *const u8, len: usize) -> Result<usize, ()> {
    let rc = raw::syscall3(SYS::WRITE, fd as i64, buf as i64, len as i64);
    if is_err(rc) {
        set_from_syscall_rc(rc);
        Err(())
    } else {
        Ok(rc as usize)
    }
}

/// # Safety
/// Same contract as `lseek(2)`.
pub unsafe fn lseek(fd: i32, offset: i64, whence: i32) -> Result<i64, ()> {
    let rc = raw::syscall3(SYS::LSEEK, fd as i64, offset, whence as i64);
    if is_err(rc) {
        set_from_syscall_rc(rc);
        Err(())
    } else {
        Ok(rc as i64)
    }
}

/// Read exactly `buf.len()` bytes, retrying `EINTR`/`EAGAIN` up to
/// [`MAX_RETRIES`] times in a row. Returns bytes actually read (less than
/// `buf.len()` only at EOF).
///
/// # Safety
/// `buf` must be a valid, writable slice.
pub unsafe fn read_all(fd: i32, buf: &mut [u8]) -> Result<usize, ()> {
    let mut done = 0usize;
    let mut retries = 0u32;
    while done < buf.len() {
        match read(fd, buf[done..].as_mut_ptr(), buf.len() - done) {
            Ok(0) => break,
            Ok(n) => {
                done += n;
                retries = 0;
            }
            Err(()) => {
                let errno = crate::errno::last_errno();
                if errno == libc::EINTR || errno == libc::EAGAIN {
                    retries += 1;
                    if retries >= MAX_RETRIES {
                        return Err(());
                    }
                    continue;
                }
                return Err(());
            }
        }
    }
    Ok(done)
}

/// Write exactly `buf.len()` bytes, retrying `EINTR`/`EAGAIN`.
///
/// # Safety
/// `buf` must be a valid, readable slice.
pub unsafe fn write_all(fd: i32, buf: &[u8]) -> Result<usize, ()> {
    let mut done = 0usize;
    loop {
        if done >= buf.len() {
            return Ok(done);
        }
        match write(fd, buf[done..].as_ptr(), buf.len() - done) {
            Ok(0) => return Ok(done),
            Ok(n) => done += n,
            Err(()) => {
                let errno = crate::errno::last_errno();
                if errno == libc::EINTR || errno == libc::EAGAIN {
                    continue;
                }
                return Err(());
            }
        }
    }
}

/// The outcome of [`readfile`]. EOF and a short read are reported
/// distinctly: EOF is a legitimate terminal condition for the signature
/// search in the image reader, while a short read mid-record is always
/// fatal — there is no way to resume a torn record.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadFileOutcome {
    /// `buf.len()` bytes were read successfully.
    Full,
    /// Zero bytes were available; nothing was read.
    Eof,
}

/// Read exactly `buf.len()` bytes or hit EOF with nothing read yet. A
/// *partial* read followed by EOF is a fatal, not a distinct outcome —
/// there is no way to resume a torn record.
///
/// # Safety
/// `buf` must be a valid, writable slice.
pub unsafe fn readfile(fd: i32, buf: &mut [u8]) -> Result<ReadFileOutcome, ()> {
    let n = read_all(fd, buf)?;
    if n == 0 {
        Ok(ReadFileOutcome::Eof)
    } else if n == buf.len() {
        Ok(ReadFileOutcome::Full)
    } else {
        Err(())
    }
}
