//! Region restorer: recreates one saved memory region at its original
//! address with its original protection, contents, and backing.
//!
//! Per-area dispatch covers the shared-to-private rewrite, the
//! zero-page-family skip rules, the file-shorter-than-checkpoint anonymous
//! fallback, and the final protection re-apply.

use mtcp_image::{Area, Properties};
use mtcp_sys::mem;
use std::ffi::{c_void, CString};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegionError {
    #[error("mmap for region {addr:#x}..{end:#x} did not land at the requested address")]
    MisplacedMmap { addr: u64, end: u64 },
    #[error("failed to read payload for region {addr:#x}")]
    PayloadRead { addr: u64 },
    #[error("failed to open backing file")]
    OpenBacking,
    #[error("mprotect failed while restoring final protection")]
    Mprotect,
}

/// How a single area's payload bytes get into the new mapping, decided
/// purely from its properties/flags/backing — factored out from the
/// actual syscalls so the dispatch logic is unit-testable.
#[derive(Debug, PartialEq, Eq)]
pub enum RestoreStrategy {
    /// Already mapped by an ancestor zero-page header; at most a
    /// protection change is needed.
    ZeroPage { needs_write_reapply: bool },
    /// Ancestor header of a zero-page family: perform the mmap, no
    /// payload here.
    ZeroPageParent,
    /// Descendant of a zero-page family: skip the mmap entirely.
    ZeroPageChild,
    /// Anonymous region (or a file-backed one whose file is now too
    /// short): mmap anonymously, then read bytes from the image.
    Anonymous,
    /// File-backed: mmap the named file at `offset`, then read the
    /// remaining payload bytes from the image.
    FileBacked,
}

/// Decide the strategy for `area`, given whether its backing file (if
/// any) still exists and is at least `area.offset + area.size()` long.
pub fn classify(area: &Area, backing_file_len: Option<u64>) -> RestoreStrategy {
    if area.properties.contains(Properties::ZERO_PAGE) {
        return RestoreStrategy::ZeroPage {
            needs_write_reapply: area.prot & libc::PROT_WRITE == 0,
        };
    }
    if area.properties.contains(Properties::ZERO_PAGE_PARENT_HEADER) {
        return RestoreStrategy::ZeroPageParent;
    }
    if area.properties.contains(Properties::ZERO_PAGE_CHILD_HEADER) {
        return RestoreStrategy::ZeroPageChild;
    }
    if area.is_anonymous() || area.flags & libc::MAP_ANONYMOUS != 0 {
        return RestoreStrategy::Anonymous;
    }
    match backing_file_len {
        Some(len) if len < area.offset + area.size() && area.prot & libc::PROT_WRITE != 0 => {
            RestoreStrategy::Anonymous
        }
        Some(_) => RestoreStrategy::FileBacked,
        None => RestoreStrategy::Anonymous,
    }
}

/// Rewrite `MAP_SHARED` to `MAP_PRIVATE | MAP_ANONYMOUS` — shared memory is
/// never restored as shared, since a restarted process should not silently
/// resume sharing pages with whatever else mapped the same file.
pub fn effective_flags(area: &Area) -> i32 {
    if area.flags & libc::MAP_SHARED != 0 {
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS
    } else {
        area.flags
    }
}

/// `true` if this area should be tagged grows-down on restore: named
/// "stack" (and not a pathname), or its end matches the checkpoint's
/// recorded top of stack.
pub fn is_growsdown(area: &Area, recorded_end_of_stack: u64) -> bool {
    let name = area.name_bytes();
    let looks_like_stack_label = mtcp_sys::strutil::find(name, b"stack").is_some() && !name.contains(&b'/');
    looks_like_stack_label || area.end_addr == recorded_end_of_stack
}

/// `true` if `area` is the heap and its recorded bounds disagree with the
/// live program break. Restoration continues either way; the caller only
/// uses this to decide whether to log a warning.
pub fn heap_break_mismatch(area: &Area, current_brk: u64) -> bool {
    area.name_bytes() == b"[heap]" && area.addr + area.size() != current_brk
}

/// Restore one region from the image, given its payload bytes (already
/// read by the decoder) and whether a backing file is usable.
///
/// # Safety
/// Must run after the sweep and (if applicable) vDSO/vvar reconciliation,
/// with `area.addr..area.end_addr` currently unmapped.
pub unsafe fn restore_region(
    area: &Area,
    payload: &[u8],
    backing_path: Option<&CString>,
    backing_file_len: Option<u64>,
    verbose: bool,
) -> Result<(), RegionError> {
    let strategy = classify(area, backing_file_len);
    let flags = effective_flags(area);
    let write_added_prot = area.prot | libc::PROT_WRITE;

    if verbose && area.flags & libc::MAP_SHARED != 0 && area.flags & libc::MAP_ANONYMOUS != 0 {
        mtcp_sys::fmt::eprintf(
            "mtcp-restart: warning: shared anonymous region %p restored as private, best-effort\n",
            &[mtcp_sys::fmt::Arg::Ptr(area.addr as usize)],
        );
    }

    if heap_break_mismatch(area, mem::brk(None) as u64) {
        mtcp_sys::fmt::eprintf(
            "mtcp-restart: warning: heap region %p..%p disagrees with current program break %p\n",
            &[
                mtcp_sys::fmt::Arg::Ptr(area.addr as usize),
                mtcp_sys::fmt::Arg::Ptr(area.end_addr as usize),
                mtcp_sys::fmt::Arg::Ptr(mem::brk(None) as usize),
            ],
        );
    }

    match strategy {
        RestoreStrategy::ZeroPageChild => {}
        RestoreStrategy::ZeroPage { needs_write_reapply } => {
            if needs_write_reapply {
                mem::mprotect(area.addr as *mut c_void, area.size() as usize, write_added_prot)
                    .map_err(|_| RegionError::Mprotect)?;
            }
        }
        RestoreStrategy::ZeroPageParent => {
            mmap_region(area, write_added_prot, flags | libc::MAP_ANONYMOUS, -1, 0)?;
        }
        RestoreStrategy::Anonymous => {
            mmap_region(area, write_added_prot, flags | libc::MAP_ANONYMOUS, -1, 0)?;
            write_payload(area.addr, payload)?;
        }
        RestoreStrategy::FileBacked => {
            let path = backing_path.expect("file-backed region without a path");
            let fd = mtcp_sys::io::open(path, libc::O_RDONLY, 0).map_err(|_| RegionError::OpenBacking)?;
            mmap_region(area, write_added_prot, flags, fd, area.offset as i64)?;
            let _ = mtcp_sys::io::close(fd);
            write_payload(area.addr, payload)?;
        }
    }

    if area.prot & libc::PROT_WRITE == 0
        && !matches!(strategy, RestoreStrategy::ZeroPageChild | RestoreStrategy::ZeroPage { .. })
    {
        mem::mprotect(area.addr as *mut c_void, area.size() as usize, area.prot).map_err(|_| RegionError::Mprotect)?;
    }

    Ok(())
}

unsafe fn mmap_region(area: &Area, prot: i32, flags: i32, fd: i32, offset: i64) -> Result<(), RegionError> {
    let got = mem::mmap_fixed_noreplace(area.addr as *mut c_void, area.size() as usize, prot, flags, fd, offset);
    match got {
        Some(addr) if addr as u64 == area.addr => Ok(()),
        _ => Err(RegionError::MisplacedMmap { addr: area.addr, end: area.end_addr }),
    }
}

unsafe fn write_payload(addr: u64, payload: &[u8]) -> Result<(), RegionError> {
    if payload.is_empty() {
        return Ok(());
    }
    mem::memcpy(addr as *mut u8, payload.as_ptr(), payload.len());
    Ok(())
}
