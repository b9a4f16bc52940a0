//! A freestanding, non-allocating `printf`-alike.
//!
//! Supports `%c %d %o %p %s %u %x/X`. Everything is written directly to a
//! file descriptor via [`crate::io`]; there is no intermediate heap buffer,
//! only a fixed-size stack scratch area for number-to-ASCII conversion (64
//! bits needs at most 22 octal digits, so 32 bytes is ample headroom).

use crate::io;

/// One formatted argument. There is no variadic machinery in Rust, so
/// callers build a slice of these instead of using `...`.
#[derive(Clone, Copy)]
pub enum Arg<'a> {
    Char(u8),
    Dec(i64),
    Oct(u64),
    Ptr(usize),
    Str(&'a [u8]),
    Unsigned(u64),
    Hex(u64),
    HexUpper(u64),
}

const SCRATCH_LEN: usize = 32;

/// Write `n` in the given `radix` (8, 10, or 16) into `buf`, right-aligned
/// at the end, returning the used sub-slice. `upper` controls hex digit
/// case.
fn write_uint(buf: &mut [u8; SCRATCH_LEN], mut n: u64, radix: u64, upper: bool) -> &[u8] {
    let digits = if upper {
        b"0123456789ABCDEF"
    } else {
        b"0123456789abcdef"
    };
    let mut i = SCRATCH_LEN;
    if n == 0 {
        i -= 1;
        buf[i] = b'0';
    } else {
        while n > 0 {
            i -= 1;
            buf[i] = digits[(n % radix) as usize];
            n /= radix;
        }
    }
    &buf[i..]
}

fn write_int(buf: &mut [u8; SCRATCH_LEN], n: i64) -> &[u8] {
    if n >= 0 {
        write_uint(buf, n as u64, 10, false)
    } else {
        // Write the magnitude into the tail, then back up one byte for the sign.
        let mag = (n as i128).unsigned_abs() as u64;
        let used_len = write_uint(buf, mag, 10, false).len();
        let start = SCRATCH_LEN - used_len - 1;
        buf[start] = b'-';
        &buf[start..]
    }
}

/// Format `fmt` with `args` and write the result to `fd`, unbuffered.
/// Unknown conversions and an arity mismatch between `%` specifiers and
/// `args` are reported as `Err(())` rather than silently truncating —
/// diagnostics that lie are worse than no diagnostics.
///
/// # Safety
/// `fd` must be a valid, writable file descriptor (on the post-relocation
/// path, typically `2`, stderr, possibly redirected by `--stderr-fd`).
pub unsafe fn fprintf(fd: i32, fmt: &str, args: &[Arg]) -> Result<(), ()> {
    let mut arg_idx = 0usize;
    let bytes = fmt.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i] != b'%' {
            let start = i;
            while i < bytes.len() && bytes[i] != b'%' {
                i += 1;
            }
            io::write_all(fd, &bytes[start..i])?;
            continue;
        }
        i += 1;
        if i >= bytes.len() {
            return Err(());
        }
        if bytes[i] == b'%' {
            io::write_all(fd, b"%")?;
            i += 1;
            continue;
        }
        let arg = *args.get(arg_idx).ok_or(())?;
        arg_idx += 1;
        let mut scratch = [0u8; SCRATCH_LEN];
        match (bytes[i], arg) {
            (b'c', Arg::Char(c)) => io::write_all(fd, &[c])?,
            (b'd', Arg::Dec(n)) => io::write_all(fd, write_int(&mut scratch, n))?,
            (b'o', Arg::Oct(n)) => io::write_all(fd, write_uint(&mut scratch, n, 8, false))?,
            (b'p', Arg::Ptr(p)) => {
                io::write_all(fd, b"0x")?;
                io::write_all(fd, write_uint(&mut scratch, p as u64, 16, false))?;
            }
            (b's', Arg::Str(s)) => io::write_all(fd, s)?,
            (b'u', Arg::Unsigned(n)) => io::write_all(fd, write_uint(&mut scratch, n, 10, false))?,
            (b'x', Arg::Hex(n)) => io::write_all(fd, write_uint(&mut scratch, n, 16, false))?,
            (b'X', Arg::HexUpper(n)) => io::write_all(fd, write_uint(&mut scratch, n, 16, true))?,
            _ => return Err(()),
        };
        i += 1;
    }
    Ok(())
}

/// Convenience wrapper: `fprintf` to stderr (fd 2), ignoring write errors
/// (there is nowhere left to report a failed diagnostic write to).
pub fn eprintf(fmt: &str, args: &[Arg]) {
    unsafe {
        let _ = fprintf(2, fmt, args);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    fn capture(f: impl FnOnce(i32)) -> String {
        let file = tempfile::tempfile().unwrap();
        let fd = file.as_raw_fd();
        f(fd);
        use std::io::{Read, Seek, SeekFrom};
        let mut file = file;
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut s = String::new();
        file.read_to_string(&mut s).unwrap();
        s
    }

    #[test]
    fn formats_each_conversion() {
        let out = capture(|fd| unsafe {
            fprintf(
                fd,
                "%c %d %o %p %s %u %x %X",
                &[
                    Arg::Char(b'z'),
                    Arg::Dec(-42),
                    Arg::Oct(8),
                    Arg::Ptr(0xdead),
                    Arg::Str(b"hi"),
                    Arg::Unsigned(7),
                    Arg::Hex(255),
                    Arg::HexUpper(255),
                ],
            )
            .unwrap();
        });
        assert_eq!(out, "z -42 10 0xdead hi 7 ff FF");
    }

    #[test]
    fn literal_percent() {
        let out = capture(|fd| unsafe {
            fprintf(fd, "100%%", &[]).unwrap();
        });
        assert_eq!(out, "100%");
    }

    #[test]
    fn mismatched_arity_is_err() {
        unsafe {
            assert!(fprintf(2, "%d", &[]).is_err());
        }
    }
}
