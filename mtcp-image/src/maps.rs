//! A one-line-at-a-time `/proc/self/maps` scanner.
//!
//! The kernel's maps format is treated as contractual: any deviation is a
//! fatal, not a recoverable, condition. The scanner never buffers across
//! calls, so a caller who has just unmapped something and rewound the
//! descriptor to offset 0 sees the post-mutation listing on its very next
//! call.

use crate::types::{Area, Properties, AREA_NAME_MAX};
use mtcp_sys::io;

/// Longest line this scanner accepts. `/proc/self/maps` lines are bounded
/// by `PATH_MAX` plus a fixed-width numeric prefix; this is generous
/// headroom over that without reaching for an allocator.
const LINE_MAX: usize = 512;

#[derive(Debug)]
pub enum MapsError {
    /// The kernel's `<hex>-<hex> rwxp ...` grammar wasn't matched. The rest
    /// of the offending line has already been consumed from `fd`.
    FormatViolation,
    /// The underlying `read(2)` failed.
    Io,
}

/// Read and parse exactly one line from `fd` at its current position.
///
/// Returns `Ok(None)` at EOF (no bytes read at all — the maps file ends
/// cleanly between lines, never mid-line). Returns `Ok(Some(area))` on a
/// successfully parsed line. A malformed line is fatal: the kernel's
/// format is contractual, so any other shape indicates either a kernel
/// this code doesn't understand or file corruption, and both are
/// unrecoverable for the caller.
///
/// # Safety
/// `fd` must be a valid, open, readable file descriptor positioned at the
/// start of a maps line.
pub unsafe fn read_maps_line(fd: i32) -> Result<Option<Area>, MapsError> {
    let mut line = [0u8; LINE_MAX];
    let mut len = 0usize;
    let mut saw_newline = false;
    loop {
        let mut byte = [0u8; 1];
        match io::read(fd, byte.as_mut_ptr(), 1) {
            Ok(0) => break,
            Ok(_) => {
                if byte[0] == b'\n' {
                    saw_newline = true;
                    break;
                }
                if len >= LINE_MAX {
                    consume_rest_of_line(fd);
                    return Err(MapsError::FormatViolation);
                }
                line[len] = byte[0];
                len += 1;
            }
            Err(()) => return Err(MapsError::Io),
        }
    }
    if len == 0 && !saw_newline {
        return Ok(None);
    }
    match parse_line(&line[..len]) {
        Some(area) => Ok(Some(area)),
        None => Err(MapsError::FormatViolation),
    }
}

/// Drain bytes up to and including the next newline (or EOF), used to put
/// the descriptor into a known state after a format violation so a caller
/// that logs and then aborts does so with clean diagnostics rather than
/// mid-line garbage.
fn consume_rest_of_line(fd: i32) {
    loop {
        let mut byte = [0u8; 1];
        match unsafe { io::read(fd, byte.as_mut_ptr(), 1) } {
            Ok(0) => return,
            Ok(_) if byte[0] == b'\n' => return,
            Ok(_) => continue,
            Err(()) => return,
        }
    }
}

/// `<hex_start>-<hex_end> rwxp <hex_offset> <hex_maj>:<hex_min> <dec_inode>[ +<name>]`
fn parse_line(line: &[u8]) -> Option<Area> {
    let s = std::str::from_utf8(line).ok()?;
    let mut rest = s;

    let (range, tail) = split_field(rest)?;
    rest = tail;
    let (start_s, end_s) = range.split_once('-')?;
    let addr = mtcp_sys::strutil::parse_hex(start_s)?;
    let end_addr = mtcp_sys::strutil::parse_hex(end_s)?;
    if end_addr < addr {
        return None;
    }

    let (perms, tail) = split_field(rest)?;
    rest = tail;
    let (prot, flags) = parse_perms(perms)?;

    let (offset_s, tail) = split_field(rest)?;
    rest = tail;
    let offset = mtcp_sys::strutil::parse_hex(offset_s)?;

    let (dev, tail) = split_field(rest)?;
    rest = tail;
    let (maj_s, min_s) = dev.split_once(':')?;
    let dev_major = mtcp_sys::strutil::parse_hex(maj_s)? as u32;
    let dev_minor = mtcp_sys::strutil::parse_hex(min_s)? as u32;

    let (inode_s, tail) = split_field(rest)?;
    let inode = mtcp_sys::strutil::parse_decimal(inode_s)?;
    let name_part = tail.trim();

    let mut name = [0u8; AREA_NAME_MAX];
    let mut name_len = 0u32;
    if !name_part.is_empty() {
        let bytes = name_part.as_bytes();
        let n = bytes.len().min(AREA_NAME_MAX);
        name[..n].copy_from_slice(&bytes[..n]);
        name_len = n as u32;
    }

    Some(Area {
        addr,
        end_addr,
        prot,
        flags,
        offset,
        dev_major,
        dev_minor,
        inode,
        mmap_file_size: 0,
        properties: Properties::empty(),
        name_len,
        name,
    })
}

/// Split off the next whitespace-delimited field, skipping any run of
/// leading spaces in `s` first (the kernel pads the inode/name gap with a
/// variable number of spaces for column alignment).
fn split_field(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start_matches(' ');
    if s.is_empty() {
        return None;
    }
    match s.find(' ') {
        Some(i) => Some((&s[..i], &s[i..])),
        None => Some((s, "")),
    }
}

/// Decode the 4-character `rwxp`/`rwxs` permission field into `PROT_*` and
/// the shared/private `MAP_*` flag.
fn parse_perms(s: &str) -> Option<(i32, i32)> {
    let b = s.as_bytes();
    if b.len() != 4 {
        return None;
    }
    let mut prot = 0i32;
    match b[0] {
        b'r' => prot |= libc::PROT_READ,
        b'-' => {}
        _ => return None,
    }
    match b[1] {
        b'w' => prot |= libc::PROT_WRITE,
        b'-' => {}
        _ => return None,
    }
    match b[2] {
        b'x' => prot |= libc::PROT_EXEC,
        b'-' => {}
        _ => return None,
    }
    let flags = match b[3] {
        b's' => libc::MAP_SHARED,
        b'p' => libc::MAP_PRIVATE,
        _ => return None,
    };
    Some((prot, flags))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_anonymous_line() {
        let a = parse_line(b"7f1234560000-7f1234580000 rw-p 00000000 00:00 0").unwrap();
        assert_eq!(a.addr, 0x7f1234560000);
        assert_eq!(a.end_addr, 0x7f1234580000);
        assert_eq!(a.prot, libc::PROT_READ | libc::PROT_WRITE);
        assert_eq!(a.flags, libc::MAP_PRIVATE);
        assert!(a.is_anonymous());
    }

    #[test]
    fn parses_named_line() {
        let a = parse_line(b"00400000-00401000 r-xp 00000000 08:01 131073 /bin/cat").unwrap();
        assert_eq!(a.name_bytes(), b"/bin/cat");
        assert_eq!(a.prot, libc::PROT_READ | libc::PROT_EXEC);
    }

    #[test]
    fn parses_bracketed_name() {
        let a = parse_line(b"7ffd12340000-7ffd12361000 rw-p 00000000 00:00 0 [stack]").unwrap();
        assert_eq!(a.name_bytes(), b"[stack]");
    }

    #[test]
    fn rejects_malformed_permissions() {
        assert!(parse_line(b"1000-2000 rwzp 0 00:00 0").is_none());
    }

    #[test]
    fn rejects_inverted_range() {
        assert!(parse_line(b"2000-1000 rw-p 0 00:00 0").is_none());
    }
}
