//! Self-relocator: copies the restorer's own mappings and stack into the
//! checkpointer-reserved range, then switches execution onto the copy.
//!
//! Enumerates regions backed by the restorer's own binary, reproduces them
//! via `/proc/self/exe`, copies the live stack, and jumps through a
//! relocated function pointer. The collection of discovered regions is a
//! fixed-size stack array, not a `Vec` — this runs right before the
//! allocator becomes unreachable, and the array shape carries over cleanly
//! into the post-relocation code that reuses the same struct shape.

use crate::restore_info::RestoreInfo;
use mtcp_image::{read_maps_line, Area, MapsError};
use mtcp_sys::mem;
use std::ffi::c_void;
use thiserror::Error;

/// Upper bound on how many mappings the restorer's own binary can be
/// split into (text, rodata, data, bss, ...). 16 is generous headroom
/// over what any real ELF's program headers produce.
pub const MAX_RESTORER_REGIONS: usize = 16;

#[derive(Debug, Error)]
pub enum RelocateError {
    #[error("failed to open /proc/self/maps")]
    OpenMaps,
    #[error("malformed /proc/self/maps line")]
    MapsFormat,
    #[error("more than {MAX_RESTORER_REGIONS} restorer regions found")]
    TooManyRegions,
    #[error("could not locate the current stack in /proc/self/maps")]
    StackNotFound,
    #[error("collected regions, guard page, and stack do not fit in the reserved range ({needed} > {available})")]
    ReservedRangeTooSmall { needed: u64, available: u64 },
    #[error("failed to open /proc/self/exe")]
    OpenExe,
    #[error("a mapping did not land at its requested relocated address")]
    MisplacedMapping,
}

#[derive(Clone, Copy)]
pub struct RestorerRegion {
    pub addr: u64,
    pub end_addr: u64,
    pub prot: i32,
    pub offset: u64,
}

/// Fixed-size collection of the restorer's own mappings, discovered by
/// name match against `/proc/self/maps`.
pub struct RestorerRegions {
    pub regions: [RestorerRegion; MAX_RESTORER_REGIONS],
    pub len: usize,
}

impl RestorerRegions {
    pub fn as_slice(&self) -> &[RestorerRegion] {
        &self.regions[..self.len]
    }
}

/// Scan `/proc/self/maps`, collecting every region whose name ends with
/// `binary_name`, and separately identifying the stack region (the one
/// containing `stack_probe_addr`, typically the address of a local
/// variable in the caller's frame).
///
/// # Safety
/// Must be called with a valid, readable `/proc/self/maps`.
pub unsafe fn discover(binary_name: &[u8], stack_probe_addr: u64) -> Result<(RestorerRegions, Area), RelocateError> {
    let path = c"/proc/self/maps";
    let fd = mtcp_sys::io::open(path, libc::O_RDONLY, 0).map_err(|_| RelocateError::OpenMaps)?;

    let mut regions = RestorerRegions {
        regions: [RestorerRegion { addr: 0, end_addr: 0, prot: 0, offset: 0 }; MAX_RESTORER_REGIONS],
        len: 0,
    };
    let mut stack_area: Option<Area> = None;

    loop {
        match read_maps_line(fd) {
            Ok(None) => break,
            Err(MapsError::FormatViolation) => {
                let _ = mtcp_sys::io::close(fd);
                return Err(RelocateError::MapsFormat);
            }
            Err(MapsError::Io) => {
                let _ = mtcp_sys::io::close(fd);
                return Err(RelocateError::OpenMaps);
            }
            Ok(Some(area)) => {
                if mtcp_sys::strutil::ends_with(area.name_bytes(), binary_name) {
                    if regions.len >= MAX_RESTORER_REGIONS {
                        let _ = mtcp_sys::io::close(fd);
                        return Err(RelocateError::TooManyRegions);
                    }
                    regions.regions[regions.len] = RestorerRegion {
                        addr: area.addr,
                        end_addr: area.end_addr,
                        prot: area.prot,
                        offset: area.offset,
                    };
                    regions.len += 1;
                }
                if area.addr <= stack_probe_addr && stack_probe_addr < area.end_addr {
                    stack_area = Some(area);
                }
            }
        }
    }
    let _ = mtcp_sys::io::close(fd);

    regions.regions[..regions.len].sort_by_key(|r| r.addr);
    let stack_area = stack_area.ok_or(RelocateError::StackNotFound)?;
    Ok((regions, stack_area))
}

/// Everything [`discover`] plus the arithmetic needed to place the
/// relocated copy, guard page, and new stack derives, before any mapping
/// is actually created. Split out so the "does it fit" check is a pure
/// function over sizes, independent of any real mmap call.
pub struct RelocationPlan {
    pub restore_offset: i64,
    pub stack_offset: i64,
    pub new_stack_start: u64,
    pub new_stack_end: u64,
    pub guard_page_start: u64,
}

/// Compute the relocation plan. `restore_addr`/`restore_size` come from
/// the checkpoint header; `regions` and `stack_area` come from
/// [`discover`].
pub fn plan(
    restore_addr: u64,
    restore_size: u64,
    regions: &RestorerRegions,
    stack_area: &Area,
) -> Result<RelocationPlan, RelocateError> {
    let first = regions.as_slice().first().ok_or(RelocateError::StackNotFound)?;
    let last = regions.as_slice().last().unwrap();
    let restore_offset = restore_addr as i64 - first.addr as i64;

    let page = mtcp_sys::MTCP_PAGE_SIZE as u64;
    let regions_span = last.end_addr - first.addr;
    let stack_size = stack_area.size();
    let needed = regions_span + page + stack_size;

    if needed > restore_size {
        return Err(RelocateError::ReservedRangeTooSmall { needed, available: restore_size });
    }

    let guard_page_start = restore_addr + regions_span;
    let new_stack_start = guard_page_start + page;
    let new_stack_end = new_stack_start + stack_size;
    let stack_offset = stack_area.addr as i64 - new_stack_start as i64;

    Ok(RelocationPlan {
        restore_offset,
        stack_offset,
        new_stack_start,
        new_stack_end,
        guard_page_start,
    })
}

/// Create the relocated copies: one mapping per restorer region backed by
/// `/proc/self/exe`, a guard page, and a fresh read/write stack mapping —
/// then copy live bytes for writable regions and the entire current stack.
///
/// # Safety
/// Must run with `[restore_addr, restore_addr+restore_size)` entirely
/// free, as guaranteed by the checkpointer's reserved-range contract.
pub unsafe fn build_relocated_copy(
    regions: &RestorerRegions,
    stack_area: &Area,
    rp: &RelocationPlan,
) -> Result<(), RelocateError> {
    let exe_path = c"/proc/self/exe";
    let exe_fd = mtcp_sys::io::open(exe_path, libc::O_RDONLY, 0).map_err(|_| RelocateError::OpenExe)?;

    for r in regions.as_slice() {
        let dst = (r.addr as i64 + rp.restore_offset) as u64;
        let len = (r.end_addr - r.addr) as usize;
        let got = mem::mmap_fixed_noreplace(
            dst as *mut c_void,
            len,
            r.prot | libc::PROT_WRITE,
            libc::MAP_PRIVATE,
            exe_fd,
            r.offset as i64,
        );
        match got {
            Some(addr) if addr as u64 == dst => {}
            _ => {
                let _ = mtcp_sys::io::close(exe_fd);
                return Err(RelocateError::MisplacedMapping);
            }
        }
        if r.prot & libc::PROT_WRITE != 0 {
            mem::memcpy(dst as *mut u8, r.addr as *const u8, len);
        }
        if r.prot & libc::PROT_WRITE == 0 {
            let _ = mem::mprotect(dst as *mut c_void, len, r.prot);
        }
    }
    let _ = mtcp_sys::io::close(exe_fd);

    let guard = mem::mmap_fixed_noreplace(
        rp.guard_page_start as *mut c_void,
        mtcp_sys::MTCP_PAGE_SIZE,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if guard.map(|a| a as u64) != Some(rp.guard_page_start) {
        return Err(RelocateError::MisplacedMapping);
    }

    let stack_len = stack_area.size() as usize;
    let new_stack = mem::mmap_fixed_noreplace(
        rp.new_stack_start as *mut c_void,
        stack_len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if new_stack.map(|a| a as u64) != Some(rp.new_stack_start) {
        return Err(RelocateError::MisplacedMapping);
    }

    mem::memcpy(rp.new_stack_start as *mut u8, stack_area.addr as *const u8, stack_len);

    Ok(())
}

/// Fill in the relocation-derived fields of `rinfo`, emit the barrier
/// that makes the copied code fetchable, and jump. Does not return.
///
/// # Safety
/// `entry_fn` must be the address of the restore routine *before*
/// relocation offset is applied; this function applies `rp.restore_offset`
/// itself. Must be the very last thing the pre-relocation call chain does.
pub unsafe fn switch_to_relocated_copy(rinfo: &mut RestoreInfo, rp: &RelocationPlan, entry_fn: usize) -> ! {
    // rinfo.old_stack_{start,end} are set by the caller from the
    // `discover`-returned stack_area before this function runs.
    rinfo.new_stack_start = rp.new_stack_start;
    rinfo.new_stack_end = rp.new_stack_end;
    rinfo.stack_offset = rp.stack_offset;
    rinfo.relocated_entry = (entry_fn as i64 + rp.restore_offset) as u64;

    mtcp_sys::barrier::memory_barrier();
    #[cfg(any(target_arch = "aarch64", target_arch = "arm"))]
    mtcp_sys::barrier::clear_icache(
        (entry_fn as i64 + rp.restore_offset) as *const u8,
        mtcp_sys::MTCP_PAGE_SIZE,
    );

    let rinfo_ptr = crate::restore_info::addr();
    crate::arch::switch_stack_and_call(rp.stack_offset, rinfo.relocated_entry as usize, rinfo_ptr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(addr: u64, end: u64, prot: i32) -> RestorerRegion {
        RestorerRegion { addr, end_addr: end, prot, offset: 0 }
    }

    fn regions(rs: &[RestorerRegion]) -> RestorerRegions {
        let mut out = RestorerRegions {
            regions: [RestorerRegion { addr: 0, end_addr: 0, prot: 0, offset: 0 }; MAX_RESTORER_REGIONS],
            len: rs.len(),
        };
        out.regions[..rs.len()].copy_from_slice(rs);
        out
    }

    fn stack_area(addr: u64, end: u64) -> Area {
        let mut a = Area::terminator();
        a.addr = addr;
        a.end_addr = end;
        a
    }

    #[test]
    fn plan_computes_offsets() {
        let rs = regions(&[region(0x400000, 0x401000, libc::PROT_READ | libc::PROT_EXEC)]);
        let stack = stack_area(0x7ffd_1000_0000, 0x7ffd_1002_0000);
        let rp = plan(0x500000, 0x100000, &rs, &stack).unwrap();
        assert_eq!(rp.restore_offset, 0x500000 - 0x400000);
        assert_eq!(rp.guard_page_start, 0x500000 + 0x1000);
        let page = mtcp_sys::MTCP_PAGE_SIZE as u64;
        assert_eq!(rp.new_stack_start, 0x500000 + 0x1000 + page);
        assert_eq!(rp.new_stack_end - rp.new_stack_start, 0x2_0000);
    }

    #[test]
    fn plan_rejects_undersized_reserved_range() {
        let rs = regions(&[region(0x400000, 0x401000, libc::PROT_READ)]);
        let stack = stack_area(0x7ffd_1000_0000, 0x7ffd_1002_0000);
        assert!(matches!(
            plan(0x500000, 0x1000, &rs, &stack),
            Err(RelocateError::ReservedRangeTooSmall { .. })
        ));
    }
}
