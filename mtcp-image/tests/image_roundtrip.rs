//! End-to-end exercise of the header search and record decoder over a
//! hand-built image file: a real file on disk, not just an in-memory
//! cursor, so `find_header`'s `Read`-only contract and `Decoder`'s
//! `Read + Seek` contract are both exercised against actual I/O.

use fallible_iterator::FallibleIterator;
use mtcp_image::types::{AREA_NAME_MAX, MTCP_SIGNATURE, MTCP_SIGNATURE_LEN};
use mtcp_image::{decode, Area, Decoder, MtcpHeader, Payload, Properties};
use std::io::{Seek, SeekFrom, Write};

fn header_bytes(restore_addr: u64, restore_size: u64, vdso: (u64, u64), vvar: (u64, u64)) -> Vec<u8> {
    let mut sig = [0u8; MTCP_SIGNATURE_LEN];
    sig.copy_from_slice(MTCP_SIGNATURE);
    let header = MtcpHeader {
        signature: sig,
        restore_addr,
        restore_size,
        saved_brk: 0x900000,
        vdso_start: vdso.0,
        vdso_end: vdso.1,
        vvar_start: vvar.0,
        vvar_end: vvar.1,
        end_of_stack: 0x7ffffffde000,
        post_restart: 0x401234,
    };
    unsafe {
        std::slice::from_raw_parts(&header as *const MtcpHeader as *const u8, std::mem::size_of::<MtcpHeader>())
            .to_vec()
    }
}

fn area_bytes(area: &Area) -> Vec<u8> {
    unsafe { std::slice::from_raw_parts(area as *const Area as *const u8, std::mem::size_of::<Area>()).to_vec() }
}

fn named_area(addr: u64, end: u64, name: &str, properties: Properties) -> Area {
    let mut a = Area::terminator();
    a.addr = addr;
    a.end_addr = end;
    a.prot = libc::PROT_READ | libc::PROT_WRITE;
    a.flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
    a.properties = properties;
    let bytes = name.as_bytes();
    let n = bytes.len().min(AREA_NAME_MAX);
    a.name[..n].copy_from_slice(&bytes[..n]);
    a.name_len = n as u32;
    a
}

#[test]
fn full_image_with_outer_header_padding_and_multiple_areas() {
    let mut file = tempfile::tempfile().unwrap();

    // An outer checkpointer format's header, a multiple of the MTCP
    // header size, that the search loop must skip over.
    let header_size = std::mem::size_of::<MtcpHeader>();
    file.write_all(&vec![0u8; header_size * 2]).unwrap();
    file.write_all(&header_bytes(0x600000, 0x40000, (0x7fff0000, 0x7fff2000), (0x7fff2000, 0x7fff4000)))
        .unwrap();

    let heap = named_area(0x10000, 0x20000, "[heap]", Properties::empty());
    let heap_payload = vec![0x11u8; heap.size() as usize];
    file.write_all(&area_bytes(&heap)).unwrap();
    file.write_all(&heap_payload).unwrap();

    let libfoo = named_area(0x30000, 0x31000, "/lib/libfoo.so", Properties::empty());
    let libfoo_payload = vec![0x22u8; libfoo.size() as usize];
    file.write_all(&area_bytes(&libfoo)).unwrap();
    file.write_all(&libfoo_payload).unwrap();

    file.write_all(&area_bytes(&Area::terminator())).unwrap();

    file.seek(SeekFrom::Start(0)).unwrap();
    let header = decode::find_header(&mut file).unwrap();
    assert_eq!(header.restore_addr, 0x600000);
    assert_eq!(header.vdso_end - header.vdso_start, 0x2000);

    let mut decoder = Decoder::new(file);
    let mut seen = Vec::new();
    while let Some((area, payload)) = decoder.next().unwrap() {
        let len = match payload {
            Payload::Bytes(b) => b.len(),
            Payload::None => 0,
        };
        seen.push((area.addr, area.name_bytes().to_vec(), len));
    }

    assert_eq!(
        seen,
        vec![
            (0x10000, b"[heap]".to_vec(), 0x10000),
            (0x30000, b"/lib/libfoo.so".to_vec(), 0x1000),
        ]
    );
}

#[test]
fn zero_data_image_yields_empty_stream() {
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(&header_bytes(0x600000, 0x40000, (0x7fff0000, 0x7fff2000), (0x7fff2000, 0x7fff4000)))
        .unwrap();
    file.write_all(&area_bytes(&Area::terminator())).unwrap();

    file.seek(SeekFrom::Start(0)).unwrap();
    decode::find_header(&mut file).unwrap();
    let mut decoder = Decoder::new(file);
    assert!(decoder.next().unwrap().is_none());
}
