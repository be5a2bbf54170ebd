//! Multimap: one key, an ordered list of fixed-size values.
//!
//! Each key owns a `container_len`-byte slot in the underlying paged map.
//! Groups of one or two values inline straight into the slot; larger
//! groups land in an overflow file as `varuint(count) || values`, with the
//! slot holding the overflow offset.

use std::io::Write;

use byteorder::{ByteOrder, LittleEndian};

use super::map::{Map, MapWriter};
use crate::error::{Error, Result};
use crate::{errconfig, errcorrupt, errinput};

const OOOO: [u8; 8] = [0x00; 8];
const FFFF: [u8; 8] = [0xFF; 8];

/// Slot-packing policy, fixed at construction time. `FfOo` requires the
/// container to be twice the value width and the overflow-offset width to
/// equal the value width; all-zero and all-0xFF values are reserved as
/// state markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inliner {
    /// Every group goes to the overflow file; the slot is just the offset.
    None,
    /// One value inlines as `FF..FF || value`, two as `value0 || value1`,
    /// more as `00..00 || offset`.
    FfOo { value_len: usize },
}

impl Inliner {
    /// The policy the builder and server agree on: inline exactly when the
    /// overflow-offset width matches the value width.
    pub fn choose(value_len: usize, offset_len: usize) -> Inliner {
        if offset_len == value_len {
            Inliner::FfOo { value_len }
        } else {
            Inliner::None
        }
    }

    pub fn container_len(&self, offset_len: usize) -> usize {
        match self {
            Inliner::None => offset_len,
            Inliner::FfOo { value_len } => 2 * value_len,
        }
    }

    /// Packs a batch into the slot. Returns true if the batch was fully
    /// inlined and needs no overflow record.
    fn inline(&self, container: &mut [u8], values: &[u8], offset: &[u8]) -> Result<bool> {
        match *self {
            Inliner::None => {
                container[..offset.len()].copy_from_slice(offset);
                Ok(false)
            }
            Inliner::FfOo { value_len } => {
                for value in values.chunks_exact(value_len) {
                    if value == &OOOO[..value_len] || value == &FFFF[..value_len] {
                        return Err(errinput!("value {value:02x?} is reserved"));
                    }
                }
                if values.len() == value_len {
                    container[..value_len].copy_from_slice(&FFFF[..value_len]);
                    container[value_len..].copy_from_slice(values);
                    Ok(true)
                } else if values.len() == 2 * value_len {
                    container.copy_from_slice(values);
                    Ok(true)
                } else {
                    container[..value_len].copy_from_slice(&OOOO[..value_len]);
                    container[value_len..].copy_from_slice(offset);
                    Ok(false)
                }
            }
        }
    }

    /// Classifies a stored slot. Returns (inlined, payload); for overflow
    /// slots the payload is the little-endian offset bytes.
    fn uninline<'a>(&self, container: &'a [u8]) -> (bool, &'a [u8]) {
        match *self {
            Inliner::None => (false, container),
            Inliner::FfOo { value_len } => {
                if container[..value_len] == OOOO[..value_len] {
                    (false, &container[value_len..])
                } else if container[..value_len] == FFFF[..value_len] {
                    (true, &container[value_len..])
                } else {
                    (true, container)
                }
            }
        }
    }
}

fn write_uvarint<W: Write>(w: &mut W, mut v: u64) -> Result<usize> {
    let mut buf = [0u8; 10];
    let mut n = 0;
    while v >= 0x80 {
        buf[n] = (v as u8) | 0x80;
        v >>= 7;
        n += 1;
    }
    buf[n] = v as u8;
    n += 1;
    w.write_all(&buf[..n])?;
    Ok(n)
}

fn read_uvarint(buf: &[u8]) -> Result<(u64, usize)> {
    let mut v = 0u64;
    let mut shift = 0;
    for (i, &b) in buf.iter().enumerate() {
        if shift >= 64 {
            break;
        }
        v |= u64::from(b & 0x7F) << shift;
        if b & 0x80 == 0 {
            return Ok((v, i + 1));
        }
        shift += 7;
    }
    Err(errcorrupt!("bad varuint in overflow file"))
}

/// Streams key-ascending (key, value) pairs; batches per key, deduplicates
/// consecutive identical values, and flushes each batch through the
/// inliner.
#[derive(Debug)]
pub struct MultiMapWriter<D: Write, P: Write, V: Write> {
    map: MapWriter<D, P>,
    values: V,
    key_len: usize,
    value_len: usize,
    container_len: usize,
    offset_len: usize,
    inliner: Inliner,

    prev_key: Vec<u8>,
    batch: Vec<u8>,
    have_batch: bool,
    offset: u64,
}

impl<D: Write, P: Write, V: Write> MultiMapWriter<D, P, V> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        page_len: usize,
        key_len: usize,
        value_len: usize,
        prefix_len: usize,
        offset_len: usize,
        inliner: Inliner,
        data: D,
        prefixes: P,
        values: V,
    ) -> Result<Self> {
        if offset_len == 0 || offset_len > 8 {
            return Err(errconfig!("offset_len {offset_len} out of range 1..=8"));
        }
        if let Inliner::FfOo { value_len: vl } = inliner {
            if vl != value_len || vl != offset_len {
                return Err(errconfig!(
                    "inlining requires value_len == offset_len, got {value_len} and {offset_len}"
                ));
            }
        }
        let container_len = inliner.container_len(offset_len);
        let map = MapWriter::new(page_len, key_len, container_len, prefix_len, data, prefixes)?;
        Ok(Self {
            map,
            values,
            key_len,
            value_len,
            container_len,
            offset_len,
            inliner,
            prev_key: vec![0u8; key_len],
            batch: Vec::new(),
            have_batch: false,
            offset: 0,
        })
    }

    fn dump(&mut self) -> Result<()> {
        let mut record = vec![0u8; self.key_len + self.container_len];
        record[..self.key_len].copy_from_slice(&self.prev_key);
        let mut offset_bytes = [0u8; 8];
        LittleEndian::write_u64(&mut offset_bytes, self.offset);
        let inlined = self.inliner.inline(
            &mut record[self.key_len..],
            &self.batch,
            &offset_bytes[..self.offset_len],
        )?;
        if !inlined {
            if self.offset_len < 8 && self.offset >= 1 << (8 * self.offset_len) {
                return Err(Error::OffsetTooNarrow);
            }
            let n = write_uvarint(&mut self.values, (self.batch.len() / self.value_len) as u64)?;
            self.values.write_all(&self.batch)?;
            self.offset += (n + self.batch.len()) as u64;
        }
        self.map.write(&record)?;
        self.batch.clear();
        Ok(())
    }

    /// Accepts one `key_len + value_len` record, key-ascending.
    pub fn write(&mut self, rec: &[u8]) -> Result<()> {
        if rec.len() != self.key_len + self.value_len {
            return Err(errinput!(
                "wrong record length {} (want {})",
                rec.len(),
                self.key_len + self.value_len
            ));
        }
        let (key, value) = rec.split_at(self.key_len);
        if !self.have_batch {
            self.prev_key.copy_from_slice(key);
            self.have_batch = true;
        } else if key == self.prev_key {
            if value == &self.batch[self.batch.len() - self.value_len..] {
                // Repeated value, skip.
                return Ok(());
            }
        } else {
            self.dump()?;
            self.prev_key.copy_from_slice(key);
        }
        self.batch.extend_from_slice(value);
        Ok(())
    }

    /// Flushes the final batch and the underlying map. An input with no
    /// records produces an empty map and an empty overflow file.
    pub fn finish(&mut self) -> Result<()> {
        if self.have_batch {
            self.dump()?;
            self.have_batch = false;
        }
        self.map.finish()?;
        self.values.flush()?;
        Ok(())
    }
}

/// Read side over any byte-slice backing.
#[derive(Debug)]
pub struct MultiMap<B> {
    map: Map<B>,
    values: B,
    value_len: usize,
    inliner: Inliner,
}

impl<B: AsRef<[u8]>> MultiMap<B> {
    pub fn open(
        data: B,
        prefixes: B,
        values: B,
        value_len: usize,
        offset_len: usize,
        inliner: Inliner,
    ) -> Result<Self> {
        let map = Map::open(data, prefixes)?;
        if map.value_len() != inliner.container_len(offset_len) {
            return Err(errcorrupt!(
                "container width {} does not match the inlining policy",
                map.value_len()
            ));
        }
        Ok(Self { map, values, value_len, inliner })
    }

    /// Returns the key's values concatenated (`count · value_len` bytes),
    /// or None for an unknown key.
    pub fn lookup(&self, key: &[u8]) -> Result<Option<&[u8]>> {
        let Some(container) = self.map.lookup(key)? else {
            return Ok(None);
        };
        let (inlined, payload) = self.inliner.uninline(container);
        if inlined {
            return Ok(Some(payload));
        }
        let mut full = [0u8; 8];
        full[..payload.len()].copy_from_slice(payload);
        let pos = LittleEndian::read_u64(&full) as usize;
        let values = self.values.as_ref();
        if pos >= values.len() {
            return Err(errcorrupt!("overflow offset {pos} beyond file end"));
        }
        let (count, n) = read_uvarint(&values[pos..])?;
        let start = pos + n;
        let end = start + count as usize * self.value_len;
        if end > values.len() {
            return Err(errcorrupt!("overflow group at {pos} runs past file end"));
        }
        Ok(Some(&values[start..end]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 64;
    const KEY: usize = 4;
    const VALUE: usize = 4;

    fn build(
        inliner: Inliner,
        offset_len: usize,
        pairs: &[(Vec<u8>, Vec<u8>)],
    ) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>)> {
        let mut data = Vec::new();
        let mut prefixes = Vec::new();
        let mut values = Vec::new();
        let mut writer = MultiMapWriter::new(
            PAGE, KEY, VALUE, 2, offset_len, inliner, &mut data, &mut prefixes, &mut values,
        )?;
        for (key, value) in pairs {
            let mut rec = key.clone();
            rec.extend_from_slice(value);
            writer.write(&rec)?;
        }
        writer.finish()?;
        drop(writer);
        Ok((data, prefixes, values))
    }

    fn key(i: u32) -> Vec<u8> {
        i.to_be_bytes().to_vec()
    }

    fn value(i: u32) -> Vec<u8> {
        // Stays clear of the reserved all-00 / all-FF patterns.
        (i + 0x0101).to_be_bytes().to_vec()
    }

    #[test]
    fn test_inline_and_overflow_groups() {
        // Group sizes 1, 2, 3 and 100: the first two inline, the rest
        // overflow with correct counts.
        let mut pairs = Vec::new();
        for (k, count) in [(1u32, 1u32), (2, 2), (3, 3), (4, 100)] {
            for v in 0..count {
                pairs.push((key(k), value(1000 * k + v)));
            }
        }
        let inliner = Inliner::choose(VALUE, VALUE);
        assert_eq!(inliner, Inliner::FfOo { value_len: VALUE });
        let (data, prefixes, values) = build(inliner, VALUE, &pairs).unwrap();

        // Only the two overflow groups hit the side file.
        assert_eq!(values.len(), (1 + 3 * VALUE) + (1 + 100 * VALUE));

        let map =
            MultiMap::open(data.as_slice(), prefixes.as_slice(), values.as_slice(), VALUE, VALUE, inliner)
                .unwrap();
        for (k, count) in [(1u32, 1u32), (2, 2), (3, 3), (4, 100)] {
            let got = map.lookup(&key(k)).unwrap().unwrap();
            assert_eq!(got.len(), count as usize * VALUE, "key {k}");
            for (i, chunk) in got.chunks_exact(VALUE).enumerate() {
                assert_eq!(chunk, value(1000 * k + i as u32), "key {k} value {i}");
            }
        }
        assert_eq!(map.lookup(&key(9)).unwrap(), None);
    }

    #[test]
    fn test_no_inliner_stores_everything_as_overflow() {
        let pairs = vec![(key(1), value(1))];
        let (data, prefixes, values) = build(Inliner::None, 6, &pairs).unwrap();
        assert_eq!(values.len(), 1 + VALUE);
        let map =
            MultiMap::open(data.as_slice(), prefixes.as_slice(), values.as_slice(), VALUE, 6, Inliner::None)
                .unwrap();
        assert_eq!(map.lookup(&key(1)).unwrap().unwrap(), value(1).as_slice());
    }

    #[test]
    fn test_consecutive_duplicates_collapse() {
        let pairs = vec![
            (key(1), value(7)),
            (key(1), value(7)),
            (key(1), value(7)),
            (key(1), value(8)),
        ];
        let inliner = Inliner::choose(VALUE, VALUE);
        let (data, prefixes, values) = build(inliner, VALUE, &pairs).unwrap();
        let map =
            MultiMap::open(data.as_slice(), prefixes.as_slice(), values.as_slice(), VALUE, VALUE, inliner)
                .unwrap();
        let got = map.lookup(&key(1)).unwrap().unwrap();
        assert_eq!(got.len(), 2 * VALUE);
        assert_eq!(&got[..VALUE], value(7).as_slice());
        assert_eq!(&got[VALUE..], value(8).as_slice());
    }

    #[test]
    fn test_values_kept_in_first_seen_order() {
        let pairs = vec![
            (key(1), value(9)),
            (key(1), value(3)),
            (key(1), value(9)),
        ];
        let inliner = Inliner::choose(VALUE, VALUE);
        let (data, prefixes, values) = build(inliner, VALUE, &pairs).unwrap();
        let map =
            MultiMap::open(data.as_slice(), prefixes.as_slice(), values.as_slice(), VALUE, VALUE, inliner)
                .unwrap();
        let got = map.lookup(&key(1)).unwrap().unwrap();
        let expect: Vec<u8> = [value(9), value(3), value(9)].concat();
        assert_eq!(got, expect.as_slice());
    }

    #[test]
    fn test_empty_input() {
        let inliner = Inliner::choose(VALUE, VALUE);
        let (data, prefixes, values) = build(inliner, VALUE, &[]).unwrap();
        assert!(data.is_empty());
        assert!(values.is_empty());
        let map =
            MultiMap::open(data.as_slice(), prefixes.as_slice(), values.as_slice(), VALUE, VALUE, inliner)
                .unwrap();
        assert_eq!(map.lookup(&key(1)).unwrap(), None);
    }

    #[test]
    fn test_reserved_values_rejected_when_inlining() {
        let pairs = vec![(key(1), vec![0u8; VALUE])];
        let inliner = Inliner::choose(VALUE, VALUE);
        assert!(matches!(
            build(inliner, VALUE, &pairs).unwrap_err(),
            Error::InvalidInput(_)
        ));
    }

    #[test]
    fn test_offset_too_narrow() {
        // A 1-byte offset width overflows once more than 255 bytes of
        // overflow groups accumulate. Keys get distinct leading bytes so
        // the page prefixes stay separable.
        let mut pairs = Vec::new();
        for k in 0..40u32 {
            for v in 0..3 {
                pairs.push(((k << 16).to_be_bytes().to_vec(), value(100 * k + v)));
            }
        }
        let err = build(Inliner::None, 1, &pairs).unwrap_err();
        assert_eq!(err, Error::OffsetTooNarrow);
    }

    #[test]
    fn test_corrupt_overflow_offset() {
        let pairs: Vec<_> = (0..3u32).map(|v| (key(1), value(v))).collect();
        let inliner = Inliner::choose(VALUE, VALUE);
        let (data, prefixes, values) = build(inliner, VALUE, &pairs).unwrap();
        // Truncating the overflow file makes the stored group run past EOF.
        let map = MultiMap::open(
            data.as_slice(),
            prefixes.as_slice(),
            &values[..values.len() - 1],
            VALUE,
            VALUE,
            inliner,
        )
        .unwrap();
        assert!(matches!(map.lookup(&key(1)).unwrap_err(), Error::Corrupt(_)));
    }
}
