//! Address-space sweeper: unmaps every live region except the reserved
//! range, the kernel-supplied pages, and anything a plugin asks to keep.
//!
//! Walks `/proc/self/maps` and rewinds the descriptor to offset 0 after
//! every `munmap`, since the listing shifts under an in-progress walk
//! whenever a mapping disappears mid-scan.

use crate::plugin::PluginHooks;
use crate::restore_info::RestoreInfo;
use mtcp_image::{read_maps_line, Area, MapsError};
use mtcp_sys::mem;
use std::ffi::c_void;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("malformed /proc/self/maps line")]
    MapsFormat,
    #[error("failed to open /proc/self/maps")]
    OpenMaps,
    #[error("munmap of a non-whitelisted region failed")]
    Munmap,
}

/// The sweeper's verdict for one region. Kept as a pure, testable
/// function of `(Area, reserved range, binary name)` so the
/// classification policy can be unit-tested without actually mutating any
/// address space.
#[derive(Debug, PartialEq, Eq)]
pub enum SweepAction {
    Keep,
    /// Unmap unconditionally: the restorer's own (non-relocated) binary
    /// or the heap, neither of which a plugin is consulted about.
    UnmapForced,
    /// Unmap by the catch-all rule. A plugin gets a chance to veto this
    /// one, and only this one.
    UnmapDefault,
}

/// Decide the fate of one region. `restorer_binary_name` is the
/// non-relocated restorer's own path, as recorded before self-relocation
/// (the relocated copy is inside `reserved_start..reserved_end` and so
/// already matches the first arm).
pub fn classify_region(
    area: &Area,
    reserved_start: u64,
    reserved_end: u64,
    restorer_binary_name: &[u8],
) -> SweepAction {
    if area.addr >= reserved_start && area.end_addr <= reserved_end {
        return SweepAction::Keep;
    }
    let name = area.name_bytes();
    if name == b"[vdso]" || name == b"[vvar]" || name == b"[vsyscall]" || name == b"[vectors]" {
        return SweepAction::Keep;
    }
    if !restorer_binary_name.is_empty() && mtcp_sys::strutil::ends_with(name, restorer_binary_name) {
        return SweepAction::UnmapForced;
    }
    if name == b"[heap]" {
        return SweepAction::UnmapForced;
    }
    if area.size() == 0 {
        return SweepAction::Keep;
    }
    SweepAction::UnmapDefault
}

/// Run the sweep to completion. Records discovered current vDSO/vvar
/// bounds into `rinfo` as it goes, needed by the vDSO/vvar relocation
/// that runs right after.
///
/// # Safety
/// Must be called from the relocated stack, after the reserved range
/// genuinely contains everything this process needs to keep running.
pub unsafe fn sweep(
    rinfo: &mut RestoreInfo,
    restorer_binary_name: &[u8],
    plugin: &mut dyn PluginHooks,
) -> Result<(), SweepError> {
    let (reserved_start, reserved_end) = (
        rinfo.header.restore_addr,
        rinfo.header.restore_addr + rinfo.header.restore_size,
    );

    let path = c"/proc/self/maps";
    let fd = mtcp_sys::io::open(path, libc::O_RDONLY, 0).map_err(|_| SweepError::OpenMaps)?;

    loop {
        match read_maps_line(fd) {
            Ok(None) => break,
            Err(MapsError::FormatViolation) => return Err(SweepError::MapsFormat),
            Err(MapsError::Io) => return Err(SweepError::OpenMaps),
            Ok(Some(area)) => {
                let name = area.name_bytes();
                if name == b"[vdso]" {
                    rinfo.current_vdso_start = area.addr;
                    rinfo.current_vdso_end = area.end_addr;
                } else if name == b"[vvar]" {
                    rinfo.current_vvar_start = area.addr;
                    rinfo.current_vvar_end = area.end_addr;
                }

                let action = classify_region(&area, reserved_start, reserved_end, restorer_binary_name);
                let unmap = match action {
                    SweepAction::Keep => false,
                    SweepAction::UnmapForced => true,
                    SweepAction::UnmapDefault => !plugin.skip_region(&area, rinfo),
                };

                if unmap {
                    let _ = mem::munmap(area.addr as *mut c_void, area.size() as usize);
                    let _ = mtcp_sys::io::lseek(fd, 0, libc::SEEK_SET);
                }
            }
        }
    }

    let _ = mtcp_sys::io::close(fd);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn area(addr: u64, end: u64, name: &str) -> Area {
        let mut a = Area::terminator();
        a.addr = addr;
        a.end_addr = end;
        let bytes = name.as_bytes();
        a.name[..bytes.len()].copy_from_slice(bytes);
        a.name_len = bytes.len() as u32;
        a
    }

    #[test]
    fn keeps_reserved_range() {
        let a = area(0x500000, 0x510000, "");
        assert_eq!(classify_region(&a, 0x500000, 0x600000, b"mtcp-restart"), SweepAction::Keep);
    }

    #[test]
    fn keeps_vdso_and_vvar() {
        assert_eq!(
            classify_region(&area(0x1000, 0x2000, "[vdso]"), 0x500000, 0x600000, b"mtcp-restart"),
            SweepAction::Keep
        );
        assert_eq!(
            classify_region(&area(0x2000, 0x3000, "[vvar]"), 0x500000, 0x600000, b"mtcp-restart"),
            SweepAction::Keep
        );
    }

    #[test]
    fn unmaps_heap_and_original_binary_unconditionally() {
        assert_eq!(
            classify_region(&area(0x10000, 0x20000, "[heap]"), 0x500000, 0x600000, b"mtcp-restart"),
            SweepAction::UnmapForced
        );
        assert_eq!(
            classify_region(
                &area(0x400000, 0x401000, "/usr/bin/mtcp-restart"),
                0x500000,
                0x600000,
                b"mtcp-restart"
            ),
            SweepAction::UnmapForced
        );
    }

    #[test]
    fn unmaps_everything_else_by_default() {
        assert_eq!(
            classify_region(&area(0x700000, 0x710000, "/lib/libfoo.so"), 0x500000, 0x600000, b"mtcp-restart"),
            SweepAction::UnmapDefault
        );
    }
}
