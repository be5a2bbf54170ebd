//! Canonical binary encoding of chain objects.
//!
//! Integers are u64 little-endian, slices and lists carry a u64 length
//! prefix, fixed-size arrays are written raw. The item bytes hashed into
//! Merkle leaves are produced by exactly this encoding.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::errcorrupt;
use crate::error::Result;

/// Upper bound on decoded length prefixes. Anything larger is corruption,
/// not data.
const MAX_LEN: u64 = 1 << 31;

pub trait Encodable {
    fn encode<W: Write>(&self, w: &mut W) -> Result<()>;

    /// Encodes into a fresh buffer.
    fn to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        // Writing to a Vec cannot fail.
        self.encode(&mut buf).expect("encoding to Vec failed");
        buf
    }
}

pub trait Decodable: Sized {
    fn decode<R: Read>(r: &mut R) -> Result<Self>;
}

pub fn write_u64<W: Write>(w: &mut W, v: u64) -> Result<()> {
    w.write_u64::<LittleEndian>(v)?;
    Ok(())
}

pub fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    Ok(r.read_u64::<LittleEndian>()?)
}

pub fn read_len<R: Read>(r: &mut R) -> Result<usize> {
    let len = read_u64(r)?;
    if len > MAX_LEN {
        return Err(errcorrupt!("length prefix {len} exceeds limit"));
    }
    Ok(len as usize)
}

pub fn write_bytes<W: Write>(w: &mut W, b: &[u8]) -> Result<()> {
    write_u64(w, b.len() as u64)?;
    w.write_all(b)?;
    Ok(())
}

pub fn read_bytes<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let len = read_len(r)?;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn read_array<R: Read, const N: usize>(r: &mut R) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn write_list<W: Write, T: Encodable>(w: &mut W, list: &[T]) -> Result<()> {
    write_u64(w, list.len() as u64)?;
    for item in list {
        item.encode(w)?;
    }
    Ok(())
}

pub fn read_list<R: Read, T: Decodable>(r: &mut R) -> Result<Vec<T>> {
    let len = read_len(r)?;
    let mut list = Vec::with_capacity(len.min(1024));
    for _ in 0..len {
        list.push(T::decode(r)?);
    }
    Ok(list)
}

impl Encodable for u64 {
    fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        write_u64(w, *self)
    }
}

impl Decodable for u64 {
    fn decode<R: Read>(r: &mut R) -> Result<Self> {
        read_u64(r)
    }
}

impl Encodable for Vec<u8> {
    fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        write_bytes(w, self)
    }
}

impl Decodable for Vec<u8> {
    fn decode<R: Read>(r: &mut R) -> Result<Self> {
        read_bytes(r)
    }
}
