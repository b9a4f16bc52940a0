//! vDSO/vvar relocator: moves the kernel-placed vDSO and vvar pages back
//! to the addresses the checkpointed program remembers.
//!
//! Uses a "stage at 3x, take the middle third" trick to guarantee a
//! non-overlapping scratch range to bounce the move through.

use mtcp_sys::mem;
use std::ffi::c_void;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VdsoError {
    #[error("current vdso/vvar size does not match the checkpoint's recorded size")]
    SizeMismatch,
    #[error("vdso/vvar relative ordering differs from the checkpoint's (kernel version mismatch)")]
    OrderingMismatch,
    #[error("could not find a staging area disjoint from both the current and recorded ranges after 3 attempts")]
    NoDisjointStaging,
    #[error("mremap landed at the wrong address")]
    MisplacedRemap,
    #[error("mmap/munmap failed while staging")]
    Mmap,
}

/// The checkpoint-recorded and currently-observed bounds needed to plan
/// the move. Both ranges are `[start, end)`.
#[derive(Debug, Clone, Copy)]
pub struct VdsoPlan {
    pub recorded_vdso: (u64, u64),
    pub recorded_vvar: (u64, u64),
    pub current_vdso: (u64, u64),
    pub current_vvar: (u64, u64),
}

fn len(range: (u64, u64)) -> u64 {
    range.1 - range.0
}

fn overlaps(a: (u64, u64), b: (u64, u64)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

impl VdsoPlan {
    /// Check the two preconditions that must hold before any mapping is
    /// touched: size equality and matching relative order.
    pub fn validate(&self) -> Result<(), VdsoError> {
        if len(self.recorded_vdso) != len(self.current_vdso) || len(self.recorded_vvar) != len(self.current_vvar) {
            return Err(VdsoError::SizeMismatch);
        }
        let recorded_vdso_above_vvar = self.recorded_vdso.0 > self.recorded_vvar.0;
        let current_vdso_above_vvar = self.current_vdso.0 > self.current_vvar.0;
        if recorded_vdso_above_vvar != current_vdso_above_vvar {
            return Err(VdsoError::OrderingMismatch);
        }
        Ok(())
    }

    /// Pick the middle third of a candidate `3 * total_len`-byte staging
    /// region such that it overlaps neither `current_vdso`/`current_vvar`
    /// nor `recorded_vdso`/`recorded_vvar`. Pure arithmetic over a
    /// caller-supplied list of candidate base addresses, so the
    /// three-attempt retry policy can be tested without any real mmap.
    pub fn pick_staging(&self, candidates: &[u64]) -> Result<(u64, u64), VdsoError> {
        let total = len(self.current_vdso) + len(self.current_vvar);
        let third = total;
        for &base in candidates.iter().take(3) {
            let middle = (base + third, base + 2 * third);
            let avoid = [self.current_vdso, self.current_vvar, self.recorded_vdso, self.recorded_vvar];
            if avoid.iter().all(|&r| !overlaps(middle, r)) {
                return Ok(middle);
            }
        }
        Err(VdsoError::NoDisjointStaging)
    }
}

/// Move `[old_start, old_start+size)` to exactly `new_start`, failing if
/// the kernel places it anywhere else (undoing the move back to the
/// source in that case rather than leaving the mapping stranded).
///
/// # Safety
/// `old_start` must be a valid mapping of at least `size` bytes; the
/// destination range must not overlap the source (the staging-area dance
/// exists precisely to guarantee this at each call site).
unsafe fn move_fixed(old_start: u64, size: u64, new_start: u64) -> Result<(), VdsoError> {
    let got = mem::mremap(
        old_start as *mut c_void,
        size as usize,
        size as usize,
        libc::MREMAP_MAYMOVE | libc::MREMAP_FIXED,
        new_start as *mut c_void,
    );
    match got {
        Some(addr) if addr as u64 == new_start => Ok(()),
        Some(addr) => {
            let _ = mem::mremap(
                addr as *mut c_void,
                size as usize,
                size as usize,
                libc::MREMAP_MAYMOVE | libc::MREMAP_FIXED,
                old_start as *mut c_void,
            );
            Err(VdsoError::MisplacedRemap)
        }
        None => Err(VdsoError::MisplacedRemap),
    }
}

/// Run the full relocation: validate, stage, move vvar then vdso into the
/// recorded locations, then unmap staging.
///
/// `candidate_bases[i]` is passed as the address hint to the `i`-th
/// staging `mmap` (the kernel may still return a different address if the
/// hint is unavailable); any attempt past `candidate_bases.len()` falls
/// back to a hint-free, kernel-chosen address.
///
/// # Safety
/// Must run after the sweep, with nothing but the reserved range, vDSO,
/// and vvar still mapped.
pub unsafe fn relocate_vdso_vvar(plan: &VdsoPlan, candidate_bases: &[u64]) -> Result<(), VdsoError> {
    plan.validate()?;

    let total = len(plan.current_vdso) + len(plan.current_vvar);
    let stage_len = 3 * total;

    let mut staging = None;
    for i in 0..3 {
        let hint = candidate_bases.get(i).copied().unwrap_or(0) as *mut c_void;
        let base = mem::mmap(
            hint,
            stage_len as usize,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
        .ok_or(VdsoError::Mmap)? as u64;

        match plan.pick_staging(&[base]) {
            Ok(middle) => {
                let _ = mem::munmap(base as *mut c_void, (middle.0 - base) as usize);
                let _ = mem::munmap(middle.1 as *mut c_void, (base + stage_len - middle.1) as usize);
                staging = Some(middle);
                break;
            }
            Err(_) => {
                let _ = mem::munmap(base as *mut c_void, stage_len as usize);
                continue;
            }
        }
    }
    let (stage_start, _) = staging.ok_or(VdsoError::NoDisjointStaging)?;

    let vdso_len = len(plan.current_vdso);
    let vvar_len = len(plan.current_vvar);
    let stage_vdso = stage_start;
    let stage_vvar = stage_start + vdso_len;

    move_fixed(plan.current_vdso.0, vdso_len, stage_vdso)?;
    move_fixed(plan.current_vvar.0, vvar_len, stage_vvar)?;

    move_fixed(stage_vvar, vvar_len, plan.recorded_vvar.0)?;
    move_fixed(stage_vdso, vdso_len, plan.recorded_vdso.0)?;

    #[cfg(target_arch = "x86")]
    {
        // Kernel-return trampolines on 32-bit x86 may still dispatch through
        // the pre-move address; overlay it with a copy of the final bytes.
        shim_32bit(plan)?;
    }

    Ok(())
}

#[cfg(target_arch = "x86")]
unsafe fn shim_32bit(plan: &VdsoPlan) -> Result<(), VdsoError> {
    let vvar_len = len(plan.recorded_vvar) as usize;
    let vdso_len = len(plan.recorded_vdso) as usize;
    for (stage_addr, final_addr, size) in [
        (plan.current_vvar.0, plan.recorded_vvar.0, vvar_len),
        (plan.current_vdso.0, plan.recorded_vdso.0, vdso_len),
    ] {
        let page = mem::mmap(
            stage_addr as *mut c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
            -1,
            0,
        )
        .ok_or(VdsoError::Mmap)?;
        mem::memcpy(page as *mut u8, final_addr as *const u8, size);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> VdsoPlan {
        VdsoPlan {
            recorded_vdso: (0x7fff_aaaa_0000, 0x7fff_aaaa_2000),
            recorded_vvar: (0x7fff_aaaa_2000, 0x7fff_aaaa_4000),
            current_vdso: (0x7fff_bbbb_0000, 0x7fff_bbbb_2000),
            current_vvar: (0x7fff_bbbb_2000, 0x7fff_bbbb_4000),
        }
    }

    #[test]
    fn validates_matching_sizes_and_order() {
        assert!(plan().validate().is_ok());
    }

    #[test]
    fn rejects_size_mismatch() {
        let mut p = plan();
        p.current_vdso.1 += 0x1000;
        assert!(matches!(p.validate(), Err(VdsoError::SizeMismatch)));
    }

    #[test]
    fn rejects_ordering_mismatch() {
        let mut p = plan();
        // Flip current ordering: vvar now above vdso.
        std::mem::swap(&mut p.current_vdso, &mut p.current_vvar);
        assert!(matches!(p.validate(), Err(VdsoError::OrderingMismatch)));
    }

    #[test]
    fn picks_first_disjoint_candidate() {
        let p = plan();
        let (start, end) = p.pick_staging(&[0x9000_0000]).unwrap();
        assert!(end > start);
        assert!(!overlaps((start, end), p.current_vdso));
        assert!(!overlaps((start, end), p.current_vvar));
        assert!(!overlaps((start, end), p.recorded_vdso));
        assert!(!overlaps((start, end), p.recorded_vvar));
    }

    #[test]
    fn rejects_when_every_candidate_overlaps() {
        let p = plan();
        // A base chosen so the middle third lands exactly on current_vdso.
        let third = len(p.current_vdso) + len(p.current_vvar);
        let bad_base = p.current_vdso.0 - third;
        assert!(matches!(p.pick_staging(&[bad_base]), Err(VdsoError::NoDisjointStaging)));
    }
}
