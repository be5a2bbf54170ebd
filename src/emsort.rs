//! Disk-based external merge sort for fixed-size records.
//!
//! Records buffer in memory up to a ceiling, spill to a temp file as
//! sorted runs, and are k-way merged into the downstream sink on close.
//! The sink seam lets the builder compose a sorter directly with a
//! multimap writer.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::os::unix::fs::FileExt;

use crate::errinput;
use crate::error::Result;

/// Downstream of a sorter: receives records in sorted order, then a final
/// finish call.
pub trait Sink {
    fn write(&mut self, record: &[u8]) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
}

/// Record comparator; byte-lexicographic by default.
pub type Compare = fn(&[u8], &[u8]) -> Ordering;

fn bytes_compare(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

#[derive(Debug)]
pub struct ExternalSorter<S: Sink> {
    out: S,
    record_size: usize,
    mem_limit: usize,
    uniq: bool,
    cmp: Compare,

    tmp: File,
    runs: Vec<u64>,
    buf: Vec<u8>,
}

impl<S: Sink> ExternalSorter<S> {
    /// Byte-lexicographic sorter. `tmp` must be a fresh read-write file;
    /// the caller removes it after close.
    pub fn new(out: S, record_size: usize, uniq: bool, mem_limit: usize, tmp: File) -> Result<Self> {
        Self::with_compare(out, record_size, bytes_compare, uniq, mem_limit, tmp)
    }

    pub fn with_compare(
        out: S,
        record_size: usize,
        cmp: Compare,
        uniq: bool,
        mem_limit: usize,
        tmp: File,
    ) -> Result<Self> {
        if record_size == 0 {
            return Err(errinput!("record size must be positive"));
        }
        Ok(Self {
            out,
            record_size,
            mem_limit: mem_limit.max(record_size),
            uniq,
            cmp,
            tmp,
            runs: Vec::new(),
            buf: Vec::new(),
        })
    }

    /// Accepts exactly one record.
    pub fn write(&mut self, record: &[u8]) -> Result<()> {
        if record.len() != self.record_size {
            return Err(errinput!(
                "unaligned write of {} bytes (record size {})",
                record.len(),
                self.record_size
            ));
        }
        self.buf.extend_from_slice(record);
        if self.buf.len() >= self.mem_limit {
            self.spill()?;
        }
        Ok(())
    }

    fn spill(&mut self) -> Result<()> {
        let n = self.buf.len() / self.record_size;
        let mut order: Vec<usize> = (0..n).collect();
        let (buf, size, cmp) = (&self.buf, self.record_size, self.cmp);
        order.sort_unstable_by(|&a, &b| cmp(&buf[a * size..(a + 1) * size], &buf[b * size..(b + 1) * size]));

        let mut writer = BufWriter::new(&mut self.tmp);
        for i in order {
            writer.write_all(&self.buf[i * size..(i + 1) * size])?;
        }
        writer.flush()?;
        drop(writer);

        self.runs.push(self.buf.len() as u64);
        self.buf.clear();
        Ok(())
    }

    /// Flushes the last run, merges every run into the sink, and finishes
    /// the sink. Must be called for the sort to happen at all. Returns the
    /// sink.
    pub fn close(mut self) -> Result<S> {
        if !self.buf.is_empty() {
            self.spill()?;
        }
        self.buf = Vec::new();
        self.merge()?;
        self.out.finish()?;
        Ok(self.out)
    }

    fn merge(&mut self) -> Result<()> {
        if self.runs.is_empty() {
            return Ok(());
        }
        // Each run reader gets an equal share of the memory ceiling,
        // rounded to whole records.
        let share = self.mem_limit / self.runs.len();
        let chunk_records = (share / self.record_size).max(1);

        let mut readers = Vec::with_capacity(self.runs.len());
        let mut start = 0u64;
        for &len in &self.runs {
            readers.push(RunReader::new(&self.tmp, start, start + len, self.record_size, chunk_records));
            start += len;
        }

        let mut heap = BinaryHeap::with_capacity(readers.len());
        for (run, reader) in readers.iter_mut().enumerate() {
            let mut record = vec![0u8; self.record_size];
            if reader.next_into(&mut record)? {
                heap.push(HeapEntry { record, run, cmp: self.cmp });
            }
        }

        let mut last: Option<Vec<u8>> = None;
        while let Some(HeapEntry { mut record, run, .. }) = heap.pop() {
            let skip = self.uniq && last.as_deref() == Some(record.as_slice());
            if !skip {
                self.out.write(&record)?;
                if self.uniq {
                    match &mut last {
                        Some(prev) => prev.copy_from_slice(&record),
                        None => last = Some(record.clone()),
                    }
                }
            }
            if readers[run].next_into(&mut record)? {
                heap.push(HeapEntry { record, run, cmp: self.cmp });
            }
        }
        Ok(())
    }
}

/// Sequential reader over one sorted run, buffered in whole-record chunks
/// via positioned reads so every run shares the same file handle.
struct RunReader<'a> {
    file: &'a File,
    pos: u64,
    end: u64,
    record_size: usize,
    chunk: Vec<u8>,
    chunk_cap: usize,
    chunk_pos: usize,
}

impl<'a> RunReader<'a> {
    fn new(file: &'a File, start: u64, end: u64, record_size: usize, chunk_records: usize) -> Self {
        Self {
            file,
            pos: start,
            end,
            record_size,
            chunk: Vec::new(),
            chunk_cap: chunk_records * record_size,
            chunk_pos: 0,
        }
    }

    fn next_into(&mut self, record: &mut [u8]) -> Result<bool> {
        if self.chunk_pos == self.chunk.len() {
            let want = (self.end - self.pos).min(self.chunk_cap as u64) as usize;
            if want == 0 {
                return Ok(false);
            }
            self.chunk.resize(want, 0);
            self.file.read_exact_at(&mut self.chunk, self.pos)?;
            self.pos += want as u64;
            self.chunk_pos = 0;
        }
        record.copy_from_slice(&self.chunk[self.chunk_pos..self.chunk_pos + self.record_size]);
        self.chunk_pos += self.record_size;
        Ok(true)
    }
}

struct HeapEntry {
    record: Vec<u8>,
    run: usize,
    cmp: Compare,
}

// BinaryHeap is a max-heap; invert the comparison for a min-heap keyed by
// each run's head record.
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.cmp)(&other.record, &self.record).then_with(|| other.run.cmp(&self.run))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}
