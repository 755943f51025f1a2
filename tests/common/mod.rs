//! Shared fixtures for integration tests: a synthetic one-segment image
//! with little-endian helpers for laying out tables and strings.
#![allow(dead_code)]

use binweave::{Segment, SegmentMap};

/// VMA the test segment is mapped at; file offset 0.
pub const BASE_VMA: u64 = 0x40_0000;

pub fn image(len: usize) -> Vec<u8> {
    vec![0u8; len]
}

pub fn single_segment(len: u64) -> SegmentMap {
    SegmentMap::from_segments(vec![Segment {
        vma: BASE_VMA,
        file_offset: 0,
        file_size: len,
        align: 8,
    }])
}

pub fn vma(file_off: usize) -> u32 {
    (BASE_VMA + file_off as u64) as u32
}

pub fn put_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

pub fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

pub fn put_cstr(buf: &mut [u8], off: usize, text: &str) {
    let bytes = text.as_bytes();
    buf[off..off + bytes.len()].copy_from_slice(bytes);
    buf[off + bytes.len()] = 0;
}

/// Minimal 64-bit ELF: one PT_LOAD mapping the whole file at `BASE_VMA`.
/// `len` must leave room for the headers (0x78 bytes); the rest is payload.
pub fn minimal_elf(little: bool, len: usize) -> Vec<u8> {
    assert!(len >= 0x78);
    let mut buf = vec![0u8; len];
    buf[0..4].copy_from_slice(b"\x7fELF");
    buf[4] = 2; // ELFCLASS64
    buf[5] = if little { 1 } else { 2 };
    buf[6] = 1;
    let w16 = |b: &mut [u8], off: usize, v: u16| {
        let raw = if little { v.to_le_bytes() } else { v.to_be_bytes() };
        b[off..off + 2].copy_from_slice(&raw);
    };
    let w32 = |b: &mut [u8], off: usize, v: u32| {
        let raw = if little { v.to_le_bytes() } else { v.to_be_bytes() };
        b[off..off + 4].copy_from_slice(&raw);
    };
    let w64 = |b: &mut [u8], off: usize, v: u64| {
        let raw = if little { v.to_le_bytes() } else { v.to_be_bytes() };
        b[off..off + 8].copy_from_slice(&raw);
    };
    w16(&mut buf, 0x10, 2); // ET_EXEC
    w16(&mut buf, 0x12, 62);
    w32(&mut buf, 0x14, 1);
    w64(&mut buf, 0x18, BASE_VMA);
    w64(&mut buf, 0x20, 0x40); // program header table right after the ehdr
    w16(&mut buf, 0x34, 64);
    w16(&mut buf, 0x36, 56);
    w16(&mut buf, 0x38, 1);
    w16(&mut buf, 0x3a, 64);
    // The single PT_LOAD.
    w32(&mut buf, 0x40, 1);
    w32(&mut buf, 0x44, 5);
    w64(&mut buf, 0x48, 0);
    w64(&mut buf, 0x50, BASE_VMA);
    w64(&mut buf, 0x58, BASE_VMA);
    w64(&mut buf, 0x60, len as u64);
    w64(&mut buf, 0x68, len as u64);
    w64(&mut buf, 0x70, 0x1000);
    buf
}

/// Follow a pointer slot and fetch the NUL-terminated string it targets.
pub fn deref_cstr(buf: &[u8], ptr_off: usize) -> String {
    let ptr = get_u32(buf, ptr_off) as u64;
    assert!(ptr >= BASE_VMA, "null or out-of-segment pointer {ptr:#x}");
    let off = (ptr - BASE_VMA) as usize;
    let nul = buf[off..].iter().position(|&b| b == 0).unwrap();
    String::from_utf8(buf[off..off + nul].to_vec()).unwrap()
}
