//! Streaming reader over a checkpoint image: header search, then a
//! [`fallible_iterator::FallibleIterator`] over `(Area, Payload)` records
//! terminated by the sentinel area.
//!
//! A lazy, pull-based decoder: each `next()` call reads exactly one record
//! and threads any I/O error through the iterator itself rather than
//! panicking, so a caller can stop cleanly partway through a corrupt image.
//! The wire format is fixed-size `#[repr(C)]` structs read with
//! `std::ptr::read_unaligned`, not a self-describing encoding — there is no
//! allocator-backed deserializer available on the paths that consume this.

use crate::types::{Area, MtcpHeader, Properties};
use fallible_iterator::FallibleIterator;
use std::io::{Read, Seek};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("I/O error reading checkpoint image: {0}")]
    Io(#[from] std::io::Error),
    #[error("no MTCP header signature found before end of file")]
    SignatureNotFound,
    #[error("truncated record: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
}

/// What follows an [`Area`] record in the image, determined by its
/// `properties`/`flags`.
pub enum Payload {
    /// `ZERO_PAGE` or `ZERO_PAGE_CHILD_HEADER`: no bytes follow.
    None,
    /// Bytes attached to this record, either `size` or `mmap_file_size` of
    /// them depending on the region's backing (the caller — the region
    /// restorer — knows which; the decoder just hands back what was read).
    Bytes(Vec<u8>),
}

/// Search `reader` for the MTCP header by repeatedly reading
/// `size_of::<MtcpHeader>()`-byte chunks until one's signature matches, or
/// EOF is reached first. Returns the header and leaves the reader
/// positioned immediately after it.
pub fn find_header<R: Read>(reader: &mut R) -> Result<MtcpHeader, ImageError> {
    let header_size = std::mem::size_of::<MtcpHeader>();
    let mut buf = vec![0u8; header_size];
    loop {
        match reader.read_exact(&mut buf) {
            Ok(()) => {
                let header = unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const MtcpHeader) };
                if header.has_valid_signature() {
                    return Ok(header);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ImageError::SignatureNotFound)
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// A streaming decoder over the area/payload records that follow the
/// header, up to and including the terminator.
pub struct Decoder<R> {
    reader: R,
    done: bool,
}

impl<R: Read + Seek> Decoder<R> {
    /// Build a decoder positioned immediately after the header (i.e. right
    /// after a successful [`find_header`] call on the same reader).
    pub fn new(reader: R) -> Self {
        Decoder { reader, done: false }
    }

    fn read_area(&mut self) -> Result<Area, ImageError> {
        let area_size = std::mem::size_of::<Area>();
        let mut buf = vec![0u8; area_size];
        let n = read_up_to(&mut self.reader, &mut buf)?;
        if n == 0 {
            // Clean EOF in place of an explicit terminator is treated the
            // same as one: there is nothing left to restore.
            return Ok(Area::terminator());
        }
        if n != area_size {
            return Err(ImageError::Truncated { expected: area_size, got: n });
        }
        Ok(unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const Area) })
    }

    fn payload_len(area: &Area) -> usize {
        if area
            .properties
            .intersects(Properties::ZERO_PAGE | Properties::ZERO_PAGE_CHILD_HEADER)
        {
            0
        } else if area.properties.contains(Properties::ZERO_PAGE_PARENT_HEADER) {
            0
        } else if area.mmap_file_size > 0 {
            area.mmap_file_size as usize
        } else {
            area.size() as usize
        }
    }

    fn read_payload(&mut self, len: usize) -> Result<Payload, ImageError> {
        if len == 0 {
            return Ok(Payload::None);
        }
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf)?;
        Ok(Payload::Bytes(buf))
    }
}

fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match reader.read(&mut buf[done..]) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

impl<R: Read + Seek> FallibleIterator for Decoder<R> {
    type Item = (Area, Payload);
    type Error = ImageError;

    fn next(&mut self) -> Result<Option<Self::Item>, ImageError> {
        if self.done {
            return Ok(None);
        }
        let area = self.read_area()?;
        if area.is_terminator() {
            self.done = true;
            return Ok(None);
        }
        let len = Self::payload_len(&area);
        let payload = self.read_payload(len)?;
        Ok(Some((area, payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AREA_NAME_MAX, MTCP_SIGNATURE, MTCP_SIGNATURE_LEN};
    use std::io::Cursor;

    fn header_bytes(restore_addr: u64, restore_size: u64) -> Vec<u8> {
        let mut sig = [0u8; MTCP_SIGNATURE_LEN];
        sig.copy_from_slice(MTCP_SIGNATURE);
        let header = MtcpHeader {
            signature: sig,
            restore_addr,
            restore_size,
            saved_brk: 0x600000,
            vdso_start: 0x7ffff000,
            vdso_end: 0x7ffff000 + 0x2000,
            vvar_start: 0x7ffff000 + 0x2000,
            vvar_end: 0x7ffff000 + 0x4000,
            end_of_stack: 0x7fffffff0000,
            post_restart: 0x401000,
        };
        unsafe {
            std::slice::from_raw_parts(
                &header as *const MtcpHeader as *const u8,
                std::mem::size_of::<MtcpHeader>(),
            )
            .to_vec()
        }
    }

    fn area_bytes(area: &Area) -> Vec<u8> {
        unsafe {
            std::slice::from_raw_parts(
                area as *const Area as *const u8,
                std::mem::size_of::<Area>(),
            )
            .to_vec()
        }
    }

    fn named_area(addr: u64, end: u64, name: &str) -> Area {
        let mut a = Area::terminator();
        a.addr = addr;
        a.end_addr = end;
        a.prot = libc::PROT_READ | libc::PROT_WRITE;
        a.flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        let bytes = name.as_bytes();
        let n = bytes.len().min(AREA_NAME_MAX);
        a.name[..n].copy_from_slice(&bytes[..n]);
        a.name_len = n as u32;
        a
    }

    #[test]
    fn finds_header_after_padding() {
        let mut buf = vec![0u8; 4096];
        buf.extend(header_bytes(0x500000, 0x10000));
        let header = find_header(&mut Cursor::new(&buf)).unwrap();
        assert!(header.has_valid_signature());
        assert_eq!(header.restore_addr, 0x500000);
    }

    #[test]
    fn header_not_found_is_eof_error() {
        let buf = vec![0u8; 4096];
        assert!(matches!(
            find_header(&mut Cursor::new(&buf)),
            Err(ImageError::SignatureNotFound)
        ));
    }

    #[test]
    fn decodes_one_anonymous_record_then_terminator() {
        let area = named_area(0x10000, 0x20000, "");
        let payload = vec![0xABu8; area.size() as usize];

        let mut buf = area_bytes(&area);
        buf.extend(&payload);
        buf.extend(area_bytes(&Area::terminator()));

        let mut decoder = Decoder::new(Cursor::new(buf));
        let (got_area, got_payload) = decoder.next().unwrap().unwrap();
        assert_eq!(got_area.addr, 0x10000);
        match got_payload {
            Payload::Bytes(b) => assert_eq!(b.len(), 0x10000),
            Payload::None => panic!("expected bytes"),
        }
        assert!(decoder.next().unwrap().is_none());
    }

    #[test]
    fn zero_page_child_has_no_payload() {
        let mut area = named_area(0x30000, 0x31000, "");
        area.properties = Properties::ZERO_PAGE_CHILD_HEADER;

        let mut buf = area_bytes(&area);
        buf.extend(area_bytes(&Area::terminator()));

        let mut decoder = Decoder::new(Cursor::new(buf));
        let (_, payload) = decoder.next().unwrap().unwrap();
        assert!(matches!(payload, Payload::None));
    }
}
