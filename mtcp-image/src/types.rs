//! The on-disk and in-memory shape of a checkpoint image: [`Area`] records,
//! the [`MtcpHeader`] that precedes them, and the [`Properties`] bitset
//! that distinguishes zero-page sharing relationships between records.

use bitflags::bitflags;

/// Bounded label storage for an [`Area`]'s name/pathname. `/proc/self/maps`
/// lines are capped well under this by the kernel; a checkpoint image
/// written by a cooperating checkpointer observes the same cap. There is no
/// allocator available on the path that consumes these, so the buffer is
/// fixed-size rather than a `String`.
pub const AREA_NAME_MAX: usize = 256;

bitflags! {
    /// Checkpoint-specific markers layered on top of the plain VMA
    /// properties recorded in `flags`/`prot`. These distinguish regions that
    /// share backing pages through a zero-page relationship from one
    /// checkpointer snapshot to the next fork of the same memory.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Properties: u32 {
        /// Region is already mapped by an ancestor header; only the
        /// protection may need to change.
        const ZERO_PAGE = 0x1;
        /// This is the ancestor ("parent") header for a zero-page family:
        /// the mmap happens here, but the payload bytes are attached to the
        /// descendant ("child") records instead.
        const ZERO_PAGE_PARENT_HEADER = 0x2;
        /// This is a descendant of a `ZERO_PAGE_PARENT_HEADER`: the mapping
        /// step is skipped entirely because the ancestor's mapping is
        /// shared into this address range already.
        const ZERO_PAGE_CHILD_HEADER = 0x4;
    }
}

/// One memory-region descriptor, shared between the live `/proc/self/maps`
/// scanner and the on-disk image format. `#[repr(C)]` so that a
/// byte-for-byte read from the image file produces a valid value without a
/// deserialization step — there's no allocator to build one through once
/// the restorer is past self-relocation.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Area {
    pub addr: u64,
    pub end_addr: u64,
    pub prot: i32,
    pub flags: i32,
    pub offset: u64,
    pub dev_major: u32,
    pub dev_minor: u32,
    pub inode: u64,
    pub mmap_file_size: u64,
    pub properties: Properties,
    pub name_len: u32,
    pub name: [u8; AREA_NAME_MAX],
}

impl Area {
    /// `end_addr - addr`. Spec calls this `size`; kept as a method rather
    /// than a stored field to avoid the two ever disagreeing.
    pub fn size(&self) -> u64 {
        self.end_addr - self.addr
    }

    /// `true` for the stream terminator (`addr == 0`), which callers must
    /// check for before trusting any other field.
    pub fn is_terminator(&self) -> bool {
        self.addr == 0
    }

    /// `true` if `name` is empty, i.e. the mapping is anonymous.
    pub fn is_anonymous(&self) -> bool {
        self.name_len == 0
    }

    /// The valid prefix of `name` as bytes.
    pub fn name_bytes(&self) -> &[u8] {
        &self.name[..self.name_len as usize]
    }

    /// Build a zeroed area with `addr` set to the sentinel value, for
    /// constructing the terminator record.
    pub fn terminator() -> Area {
        Area {
            addr: 0,
            end_addr: 0,
            prot: 0,
            flags: 0,
            offset: 0,
            dev_major: 0,
            dev_minor: 0,
            inode: 0,
            mmap_file_size: 0,
            properties: Properties::empty(),
            name_len: 0,
            name: [0; AREA_NAME_MAX],
        }
    }
}

/// Fixed-length signature checked against the first bytes of a candidate
/// header-sized chunk while searching for the real header.
pub const MTCP_SIGNATURE: &[u8] = b"MTCP_SIGNATURE_23";
pub const MTCP_SIGNATURE_LEN: usize = MTCP_SIGNATURE.len();

/// Per-image metadata record, found once near the start of the file.
/// `post_restart` is a raw address, not a Rust function pointer, because
/// it's read from a file written by a process that may have had entirely
/// different code at that address.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct MtcpHeader {
    pub signature: [u8; MTCP_SIGNATURE_LEN],
    pub restore_addr: u64,
    pub restore_size: u64,
    pub saved_brk: u64,
    pub vdso_start: u64,
    pub vdso_end: u64,
    pub vvar_start: u64,
    pub vvar_end: u64,
    pub end_of_stack: u64,
    pub post_restart: u64,
}

impl MtcpHeader {
    /// The (inclusive, exclusive) reserved range the checkpointer promised
    /// not to collide with the snapshot's other mappings.
    pub fn reserved_range(&self) -> (u64, u64) {
        (self.restore_addr, self.restore_addr + self.restore_size)
    }

    /// `true` if the first bytes of this header match the expected
    /// signature — the test the image reader's search loop runs against
    /// each candidate chunk.
    pub fn has_valid_signature(&self) -> bool {
        self.signature == *MTCP_SIGNATURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn area_size_and_terminator() {
        let mut a = Area::terminator();
        assert!(a.is_terminator());
        a.addr = 0x1000;
        a.end_addr = 0x3000;
        assert_eq!(a.size(), 0x2000);
        assert!(!a.is_terminator());
    }

    #[test]
    fn properties_bits_are_distinct() {
        assert_ne!(Properties::ZERO_PAGE, Properties::ZERO_PAGE_PARENT_HEADER);
        let both = Properties::ZERO_PAGE_PARENT_HEADER | Properties::ZERO_PAGE_CHILD_HEADER;
        assert!(both.contains(Properties::ZERO_PAGE_PARENT_HEADER));
        assert!(!both.contains(Properties::ZERO_PAGE));
    }

    #[test]
    fn header_signature_check() {
        let mut h = zeroed_header();
        assert!(!h.has_valid_signature());
        h.signature.copy_from_slice(MTCP_SIGNATURE);
        assert!(h.has_valid_signature());
    }

    fn zeroed_header() -> MtcpHeader {
        MtcpHeader {
            signature: [0; MTCP_SIGNATURE_LEN],
            restore_addr: 0,
            restore_size: 0,
            saved_brk: 0,
            vdso_start: 0,
            vdso_end: 0,
            vvar_start: 0,
            vvar_end: 0,
            end_of_stack: 0,
            post_restart: 0,
        }
    }
}
