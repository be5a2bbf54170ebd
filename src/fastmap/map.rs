//! Paged map: fixed-size sorted unique keys to fixed-size values.
//!
//! Data file layout: a sequence of `page_len`-byte pages, each holding all
//! keys first and then all values, so a lookup binary-searches one
//! contiguous key array. Prefixes file layout: the first key's
//! `prefix_len`-byte prefix of every page, then a 20-byte tail
//! `(npages, page_len, key_len, value_len, prefix_len)` as u32 LE.
//!
//! Invariant: records whose keys share a `prefix_len`-byte prefix never
//! straddle a page boundary, so the prefix table alone picks the page.

use std::io::Write;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::{errconfig, errcorrupt, errinput};

/// Size of the self-describing tail at the end of the prefixes file.
pub const TAIL_LEN: usize = 5 * 4;

/// Streams ascending unique records into the paged layout.
#[derive(Debug)]
pub struct MapWriter<D: Write, P: Write> {
    page_len: usize,
    key_len: usize,
    value_len: usize,
    prefix_len: usize,
    values_start: usize,

    data: D,
    prefixes_out: P,
    prefixes: Vec<u8>,

    prev_key: Vec<u8>,
    page: Vec<u8>,
    prev_page: Vec<u8>,
    key_start: usize,
    value_start: usize,
    npages: usize,
    has_prev_page: bool,
}

impl<D: Write, P: Write> MapWriter<D, P> {
    pub fn new(
        page_len: usize,
        key_len: usize,
        value_len: usize,
        prefix_len: usize,
        data: D,
        prefixes_out: P,
    ) -> Result<Self> {
        if key_len == 0 || value_len == 0 {
            return Err(errconfig!("key and value lengths must be positive"));
        }
        if prefix_len == 0 || prefix_len > key_len {
            return Err(errconfig!("prefix_len {prefix_len} out of range 1..={key_len}"));
        }
        let per_page = page_len / (key_len + value_len);
        if per_page == 0 {
            return Err(errconfig!("page_len {page_len} holds no records"));
        }
        let values_start = per_page * key_len;
        Ok(Self {
            page_len,
            key_len,
            value_len,
            prefix_len,
            values_start,
            data,
            prefixes_out,
            prefixes: Vec::new(),
            prev_key: vec![0u8; key_len],
            page: vec![0u8; page_len],
            prev_page: vec![0u8; page_len],
            key_start: 0,
            value_start: values_start,
            npages: 0,
            has_prev_page: false,
        })
    }

    /// Accepts one `key_len + value_len` record. Keys must arrive in
    /// strictly ascending order; the all-0xFF key is reserved for empty
    /// slots on disk.
    pub fn write(&mut self, rec: &[u8]) -> Result<()> {
        if rec.len() != self.key_len + self.value_len {
            return Err(errinput!(
                "wrong record length {} (want {})",
                rec.len(),
                self.key_len + self.value_len
            ));
        }
        let (key, value) = rec.split_at(self.key_len);
        if key.iter().all(|&b| b == 0xFF) {
            return Err(errinput!("key of all 0xFF bytes is reserved"));
        }
        if self.npages != 0 {
            match self.prev_key.as_slice().cmp(key) {
                std::cmp::Ordering::Equal => return Err(errinput!("input has duplicates")),
                std::cmp::Ordering::Greater => return Err(errinput!("input is not ordered")),
                std::cmp::Ordering::Less => {}
            }
        }
        self.prev_key.copy_from_slice(key);

        if self.has_prev_page {
            // Move trailing records of the full page forward until its last
            // prefix differs from the incoming key's prefix.
            let mut remove = 0;
            let mut k = self.key_start;
            while k >= self.key_len {
                k -= self.key_len;
                if self.prev_page[k..k + self.prefix_len] != key[..self.prefix_len] {
                    break;
                }
                remove += 1;
            }
            if remove * self.key_len == self.key_start {
                return Err(Error::PrefixTooShort);
            }
            let keys_from = self.key_start - remove * self.key_len;
            let moved_keys = self.key_start - keys_from;
            self.page[..moved_keys].copy_from_slice(&self.prev_page[keys_from..self.key_start]);
            let values_from = self.value_start - remove * self.value_len;
            let moved_values = self.value_start - values_from;
            self.page[self.values_start..self.values_start + moved_values]
                .copy_from_slice(&self.prev_page[values_from..self.value_start]);
            // Fill the vacated slots with 0xFF before the page hits disk.
            self.prev_page[keys_from..self.values_start].fill(0xFF);
            self.prev_page[values_from..self.page_len].fill(0xFF);
            self.data.write_all(&self.prev_page)?;
            self.key_start = moved_keys;
            self.value_start = self.values_start + moved_values;
        }

        let next_key_start = self.key_start + self.key_len;
        self.page[self.key_start..next_key_start].copy_from_slice(key);
        self.key_start = next_key_start;
        let next_value_start = self.value_start + self.value_len;
        self.page[self.value_start..next_value_start].copy_from_slice(value);
        self.value_start = next_value_start;

        if self.has_prev_page || self.npages == 0 {
            // First record of a fresh page: record its prefix.
            self.prefixes.extend_from_slice(&self.page[..self.prefix_len]);
            self.npages += 1;
            self.has_prev_page = false;
        }
        if self.key_start == self.values_start {
            // Page is full, but hold it back: the next record may force a
            // prefix-preserving move.
            std::mem::swap(&mut self.page, &mut self.prev_page);
            self.has_prev_page = true;
        }
        Ok(())
    }

    /// Emits any buffered page, then the prefix table and tail.
    pub fn finish(&mut self) -> Result<()> {
        if self.has_prev_page {
            std::mem::swap(&mut self.page, &mut self.prev_page);
            self.has_prev_page = false;
        }
        if self.key_start != 0 {
            self.page[self.key_start..self.values_start].fill(0xFF);
            self.page[self.value_start..self.page_len].fill(0xFF);
            self.data.write_all(&self.page)?;
            self.key_start = 0;
        }
        let mut tail = [0u8; TAIL_LEN];
        LittleEndian::write_u32(&mut tail[0..4], self.npages as u32);
        LittleEndian::write_u32(&mut tail[4..8], self.page_len as u32);
        LittleEndian::write_u32(&mut tail[8..12], self.key_len as u32);
        LittleEndian::write_u32(&mut tail[12..16], self.value_len as u32);
        LittleEndian::write_u32(&mut tail[16..20], self.prefix_len as u32);
        self.prefixes_out.write_all(&self.prefixes)?;
        self.prefixes_out.write_all(&tail)?;
        self.data.flush()?;
        self.prefixes_out.flush()?;
        Ok(())
    }
}

/// Read side of the paged map, over any byte-slice backing (a mmap in the
/// server, plain vectors in tests). Self-describing via the tail.
#[derive(Debug)]
pub struct Map<B> {
    data: B,
    prefixes: B,
    npages: usize,
    page_len: usize,
    key_len: usize,
    value_len: usize,
    prefix_len: usize,
    per_page: usize,
    values_start: usize,
}

impl<B: AsRef<[u8]>> Map<B> {
    pub fn open(data: B, prefixes: B) -> Result<Self> {
        let pbytes = prefixes.as_ref();
        if pbytes.len() < TAIL_LEN {
            return Err(errcorrupt!("prefixes file shorter than the tail"));
        }
        let tail = &pbytes[pbytes.len() - TAIL_LEN..];
        let npages = LittleEndian::read_u32(&tail[0..4]) as usize;
        let page_len = LittleEndian::read_u32(&tail[4..8]) as usize;
        let key_len = LittleEndian::read_u32(&tail[8..12]) as usize;
        let value_len = LittleEndian::read_u32(&tail[12..16]) as usize;
        let prefix_len = LittleEndian::read_u32(&tail[16..20]) as usize;
        if key_len == 0 || value_len == 0 || prefix_len == 0 || prefix_len > key_len {
            return Err(errcorrupt!("tail carries impossible record sizes"));
        }
        let per_page = page_len / (key_len + value_len);
        if per_page == 0 {
            return Err(errcorrupt!("tail carries an unusable page size"));
        }
        if pbytes.len() != npages * prefix_len + TAIL_LEN {
            return Err(errcorrupt!(
                "prefixes file has length {}, want {}",
                pbytes.len(),
                npages * prefix_len + TAIL_LEN
            ));
        }
        if data.as_ref().len() != npages * page_len {
            return Err(errcorrupt!(
                "data file has length {}, want {}",
                data.as_ref().len(),
                npages * page_len
            ));
        }
        Ok(Self {
            data,
            prefixes,
            npages,
            page_len,
            key_len,
            value_len,
            prefix_len,
            per_page,
            values_start: per_page * key_len,
        })
    }

    /// Width of the stored values, as recorded in the tail.
    pub fn value_len(&self) -> usize {
        self.value_len
    }

    pub fn lookup(&self, key: &[u8]) -> Result<Option<&[u8]>> {
        if key.len() != self.key_len {
            return Err(errinput!("wrong key length {} (want {})", key.len(), self.key_len));
        }
        let prefix = &key[..self.prefix_len];
        let prefixes = &self.prefixes.as_ref()[..self.npages * self.prefix_len];

        // Outer search: last page whose first prefix is <= the key's.
        let mut low = 0;
        let mut high = self.npages;
        while low < high {
            let mid = low + (high - low) / 2;
            let candidate = &prefixes[mid * self.prefix_len..(mid + 1) * self.prefix_len];
            if candidate <= prefix {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        if low == 0 {
            return Ok(None);
        }
        let ipage = low - 1;
        let page = &self.data.as_ref()[ipage * self.page_len..(ipage + 1) * self.page_len];

        // Inner search: first slot with key >= target. Empty slots are
        // 0xFF-filled and sort after every legal key.
        let mut low = 0;
        let mut high = self.per_page;
        while low < high {
            let mid = low + (high - low) / 2;
            let candidate = &page[mid * self.key_len..(mid + 1) * self.key_len];
            if candidate < key {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        if low == self.per_page {
            return Ok(None);
        }
        let candidate = &page[low * self.key_len..(low + 1) * self.key_len];
        if candidate != key {
            return Ok(None);
        }
        let start = self.values_start + low * self.value_len;
        Ok(Some(&page[start..start + self.value_len]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn build(
        page_len: usize,
        key_len: usize,
        value_len: usize,
        prefix_len: usize,
        records: &[(Vec<u8>, Vec<u8>)],
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut data = Vec::new();
        let mut prefixes = Vec::new();
        let mut writer =
            MapWriter::new(page_len, key_len, value_len, prefix_len, &mut data, &mut prefixes)?;
        for (key, value) in records {
            let mut rec = key.clone();
            rec.extend_from_slice(value);
            writer.write(&rec)?;
        }
        writer.finish()?;
        drop(writer);
        Ok((data, prefixes))
    }

    #[test]
    fn test_lookup_roundtrip() {
        let records: Vec<(Vec<u8>, Vec<u8>)> = (0u16..100)
            .map(|i| (i.to_be_bytes().to_vec(), (i * 3).to_be_bytes().to_vec()))
            .collect();
        let (data, prefixes) = build(16, 2, 2, 2, &records).unwrap();
        let map = Map::open(data.as_slice(), prefixes.as_slice()).unwrap();
        for (key, value) in &records {
            assert_eq!(map.lookup(key).unwrap(), Some(value.as_slice()));
        }
        assert_eq!(map.lookup(&1000u16.to_be_bytes()).unwrap(), None);
    }

    #[test]
    fn test_random_keys_all_found() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut records: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        let mut keys = std::collections::BTreeSet::new();
        while keys.len() < 3000 {
            let key: [u8; 8] = rng.gen();
            if key == [0xFF; 8] {
                continue;
            }
            if keys.insert(key) {
                let value: [u8; 4] = rng.gen();
                records.push((key.to_vec(), value.to_vec()));
            }
        }
        records.sort();
        let (data, prefixes) = build(96, 8, 4, 4, &records).unwrap();
        let map = Map::open(data.as_slice(), prefixes.as_slice()).unwrap();
        for (key, value) in &records {
            assert_eq!(map.lookup(key).unwrap(), Some(value.as_slice()), "key {key:02x?}");
        }
        for _ in 0..3000 {
            let probe: [u8; 8] = rng.gen();
            if keys.contains(&probe) || probe == [0xFF; 8] {
                continue;
            }
            assert_eq!(map.lookup(&probe).unwrap(), None);
        }
    }

    #[test]
    fn test_rejects_reserved_key() {
        let err = build(8, 2, 2, 1, &[(vec![0xFF, 0xFF], vec![0, 0])]).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_rejects_duplicates_and_disorder() {
        let dup = vec![
            (vec![0, 1], vec![0, 0]),
            (vec![0, 1], vec![0, 1]),
        ];
        assert!(matches!(build(8, 2, 2, 1, &dup).unwrap_err(), Error::InvalidInput(_)));

        let unordered = vec![
            (vec![0, 2], vec![0, 0]),
            (vec![0, 1], vec![0, 1]),
        ];
        assert!(matches!(build(8, 2, 2, 1, &unordered).unwrap_err(), Error::InvalidInput(_)));
    }

    #[test]
    fn test_prefix_too_short() {
        // Two-slot pages, every key sharing the 1-byte prefix: the page
        // cannot be split anywhere.
        let records = vec![
            (vec![1, 1], vec![0, 0]),
            (vec![1, 2], vec![0, 1]),
            (vec![1, 3], vec![0, 2]),
        ];
        assert_eq!(build(8, 2, 2, 1, &records).unwrap_err(), Error::PrefixTooShort);
    }

    #[test]
    fn test_boundary_records_move_to_next_page() {
        // Page holds two records; the third shares a prefix with the
        // second, so the second must move forward with it.
        let records = vec![
            (vec![1, 1], vec![0, 0]),
            (vec![2, 1], vec![0, 1]),
            (vec![2, 2], vec![0, 2]),
        ];
        let (data, prefixes) = build(8, 2, 2, 1, &records).unwrap();
        assert_eq!(data.len(), 16); // two pages
        let map = Map::open(data.as_slice(), prefixes.as_slice()).unwrap();
        for (key, value) in &records {
            assert_eq!(map.lookup(key).unwrap(), Some(value.as_slice()));
        }
        // First page ends up with a single record and 0xFF filler.
        assert_eq!(&data[..2], &[1, 1]);
        assert_eq!(&data[2..4], &[0xFF, 0xFF]);
    }

    #[test]
    fn test_empty_map() {
        let (data, prefixes) = build(8, 2, 2, 1, &[]).unwrap();
        assert!(data.is_empty());
        assert_eq!(prefixes.len(), TAIL_LEN);
        let map = Map::open(data.as_slice(), prefixes.as_slice()).unwrap();
        assert_eq!(map.lookup(&[0, 1]).unwrap(), None);
    }

    #[test]
    fn test_open_rejects_wrong_lengths() {
        let (data, prefixes) = build(8, 2, 2, 1, &[(vec![0, 1], vec![9, 9])]).unwrap();
        let mut truncated = data.clone();
        truncated.pop();
        assert!(Map::open(truncated.as_slice(), prefixes.as_slice()).is_err());
        assert!(Map::open(data.as_slice(), &prefixes[..TAIL_LEN - 1]).is_err());
    }
}
