//! Little-endian integer coding. gQUIC keeps everything little-endian on the
//! wire, including the handshake message index and frame fields.

use std::io::{self, Read};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};

pub fn read_u16<R: Read>(r: &mut R) -> io::Result<u16> {
    r.read_u16::<LittleEndian>()
}

pub fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    r.read_u32::<LittleEndian>()
}

pub fn read_u64<R: Read>(r: &mut R) -> io::Result<u64> {
    r.read_u64::<LittleEndian>()
}

/// Reads an unsigned integer of `nbytes <= 8` bytes.
pub fn read_uint<R: Read>(r: &mut R, nbytes: usize) -> io::Result<u64> {
    r.read_uint::<LittleEndian>(nbytes)
}

pub fn write_u16(buf: &mut Vec<u8>, x: u16) {
    let mut b = [0; 2];
    LittleEndian::write_u16(&mut b, x);
    buf.extend_from_slice(&b);
}

pub fn write_u32(buf: &mut Vec<u8>, x: u32) {
    let mut b = [0; 4];
    LittleEndian::write_u32(&mut b, x);
    buf.extend_from_slice(&b);
}

pub fn write_u48(buf: &mut Vec<u8>, x: u64) {
    write_uint(buf, x, 6)
}

pub fn write_u64(buf: &mut Vec<u8>, x: u64) {
    let mut b = [0; 8];
    LittleEndian::write_u64(&mut b, x);
    buf.extend_from_slice(&b);
}

/// Writes the low `nbytes <= 8` bytes of `x`.
pub fn write_uint(buf: &mut Vec<u8>, x: u64, nbytes: usize) {
    let mut b = [0; 8];
    LittleEndian::write_uint(&mut b, x, nbytes);
    buf.extend_from_slice(&b[..nbytes]);
}
