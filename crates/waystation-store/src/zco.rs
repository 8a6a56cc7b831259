//! Zero-copy objects
//!
//! A [`Zco`] is an ordered sequence of extents, each backed either by
//! shared heap memory ([`bytes::Bytes`]) or by a byte range of a file.
//! Cloning a range of a ZCO clones extent descriptors, never payload
//! bytes: heap extents slice the shared buffer, file extents narrow the
//! range. Reading goes through a [`ZcoReader`] cursor.
//!
//! Heap extents draw on a shared [`Occupancy`] budget that they compete
//! for with bundle overhead; admission control keys off that budget.

use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// One extent of a ZCO
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Extent {
    /// Shared heap memory
    Heap(Bytes),
    /// A byte range of a file, read on demand
    File {
        path: PathBuf,
        offset: u64,
        length: u64,
    },
}

impl Extent {
    fn len(&self) -> u64 {
        match self {
            Extent::Heap(bytes) => bytes.len() as u64,
            Extent::File { length, .. } => *length,
        }
    }

    /// Narrow the extent to `[offset, offset + length)`
    fn slice(&self, offset: u64, length: u64) -> Extent {
        match self {
            Extent::Heap(bytes) => {
                Extent::Heap(bytes.slice(offset as usize..(offset + length) as usize))
            }
            Extent::File {
                path,
                offset: base,
                ..
            } => Extent::File {
                path: path.clone(),
                offset: base + offset,
                length,
            },
        }
    }
}

/// Zero-copy object: a catenation of extents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Zco {
    extents: Vec<Extent>,
    length: u64,
}

impl Zco {
    /// Create an empty ZCO
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a ZCO over a single heap extent
    pub fn from_bytes(bytes: Bytes) -> Self {
        let length = bytes.len() as u64;
        Self {
            extents: vec![Extent::Heap(bytes)],
            length,
        }
    }

    /// Create a ZCO over a byte range of a file
    pub fn from_file(path: PathBuf, offset: u64, length: u64) -> Self {
        Self {
            extents: vec![Extent::File {
                path,
                offset,
                length,
            }],
            length,
        }
    }

    /// Total length in bytes
    pub fn len(&self) -> u64 {
        self.length
    }

    /// Whether the ZCO holds no bytes
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Append heap bytes
    pub fn append(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        self.length += bytes.len() as u64;
        self.extents.push(Extent::Heap(bytes));
    }

    /// Append a file range
    pub fn append_file(&mut self, path: PathBuf, offset: u64, length: u64) {
        if length == 0 {
            return;
        }
        self.length += length;
        self.extents.push(Extent::File {
            path,
            offset,
            length,
        });
    }

    /// Append another ZCO's extents (payload concatenation)
    pub fn append_zco(&mut self, other: Zco) {
        self.length += other.length;
        self.extents.extend(other.extents);
    }

    /// Prepend heap bytes (header catenation)
    pub fn prepend(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        self.length += bytes.len() as u64;
        self.extents.insert(0, Extent::Heap(bytes));
    }

    /// Clone the byte range `[offset, offset + length)` into a new ZCO
    ///
    /// No payload bytes are copied.
    pub fn clone_range(&self, offset: u64, length: u64) -> Result<Zco, StoreError> {
        if offset + length > self.length {
            return Err(StoreError::RangeOutOfBounds {
                offset,
                length,
                object_length: self.length,
            });
        }
        let mut out = Zco::new();
        let mut remaining = length;
        let mut skip = offset;
        for extent in &self.extents {
            if remaining == 0 {
                break;
            }
            let extent_len = extent.len();
            if skip >= extent_len {
                skip -= extent_len;
                continue;
            }
            let take = (extent_len - skip).min(remaining);
            out.extents.push(extent.slice(skip, take));
            out.length += take;
            remaining -= take;
            skip = 0;
        }
        Ok(out)
    }

    /// Truncate to the first `new_len` bytes
    pub fn truncate(&mut self, new_len: u64) -> Result<(), StoreError> {
        if new_len > self.length {
            return Err(StoreError::RangeOutOfBounds {
                offset: new_len,
                length: 0,
                object_length: self.length,
            });
        }
        let head = self.clone_range(0, new_len)?;
        *self = head;
        Ok(())
    }

    /// Cursor over the ZCO's bytes
    pub fn reader(&self) -> ZcoReader<'_> {
        ZcoReader {
            zco: self,
            extent_index: 0,
            offset_in_extent: 0,
            consumed: 0,
        }
    }

    /// Materialize the full contents
    pub fn read_all(&self) -> Result<Vec<u8>, StoreError> {
        let mut out = vec![0u8; self.length as usize];
        let mut reader = self.reader();
        let mut filled = 0;
        while filled < out.len() {
            let n = reader.read(&mut out[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        out.truncate(filled);
        Ok(out)
    }

    /// Bytes of heap extents, for budget accounting
    pub fn heap_bytes(&self) -> u64 {
        self.extents
            .iter()
            .map(|e| match e {
                Extent::Heap(bytes) => bytes.len() as u64,
                Extent::File { .. } => 0,
            })
            .sum()
    }
}

/// Sequential cursor over a [`Zco`]
pub struct ZcoReader<'a> {
    zco: &'a Zco,
    extent_index: usize,
    offset_in_extent: u64,
    consumed: u64,
}

impl<'a> ZcoReader<'a> {
    /// Bytes consumed so far
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Bytes remaining
    pub fn remaining(&self) -> u64 {
        self.zco.length - self.consumed
    }

    /// Read up to `buf.len()` bytes, returning the count read
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, StoreError> {
        let mut filled = 0;
        while filled < buf.len() {
            let Some(extent) = self.zco.extents.get(self.extent_index) else {
                break;
            };
            let extent_len = extent.len();
            if self.offset_in_extent >= extent_len {
                self.extent_index += 1;
                self.offset_in_extent = 0;
                continue;
            }
            let want = ((extent_len - self.offset_in_extent) as usize).min(buf.len() - filled);
            match extent {
                Extent::Heap(bytes) => {
                    let start = self.offset_in_extent as usize;
                    buf[filled..filled + want].copy_from_slice(&bytes[start..start + want]);
                }
                Extent::File { path, offset, .. } => {
                    let mut file = std::fs::File::open(path)?;
                    file.seek(SeekFrom::Start(offset + self.offset_in_extent))?;
                    file.read_exact(&mut buf[filled..filled + want])?;
                }
            }
            filled += want;
            self.offset_in_extent += want as u64;
            self.consumed += want as u64;
        }
        Ok(filled)
    }

    /// Skip forward `n` bytes
    pub fn skip(&mut self, mut n: u64) {
        while n > 0 {
            let Some(extent) = self.zco.extents.get(self.extent_index) else {
                break;
            };
            let left = extent.len() - self.offset_in_extent;
            if n < left {
                self.offset_in_extent += n;
                self.consumed += n;
                break;
            }
            n -= left;
            self.consumed += left;
            self.extent_index += 1;
            self.offset_in_extent = 0;
        }
    }
}

/// Shared heap budget for ZCO bodies and bundle overhead
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Occupancy {
    current: u64,
    ceiling: u64,
}

impl Occupancy {
    /// Create a budget with the given ceiling in bytes
    pub fn new(ceiling: u64) -> Self {
        Self {
            current: 0,
            ceiling,
        }
    }

    /// Bytes currently accounted
    pub fn current(&self) -> u64 {
        self.current
    }

    /// Budget ceiling in bytes
    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    /// Whether accounting `delta` more bytes would exceed the ceiling
    pub fn would_exceed(&self, delta: u64) -> bool {
        self.current + delta > self.ceiling
    }

    /// Account additional bytes
    pub fn increase(&mut self, delta: u64) {
        self.current += delta;
    }

    /// Release accounted bytes
    pub fn reduce(&mut self, delta: u64) {
        self.current = self.current.saturating_sub(delta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_append_and_read_all() {
        let mut zco = Zco::from_bytes(Bytes::from_static(b"hello "));
        zco.append(Bytes::from_static(b"world"));

        assert_eq!(zco.len(), 11);
        assert_eq!(zco.read_all().unwrap(), b"hello world");
    }

    #[test]
    fn test_clone_range_across_extents() {
        let mut zco = Zco::from_bytes(Bytes::from_static(b"abcde"));
        zco.append(Bytes::from_static(b"fghij"));

        let mid = zco.clone_range(3, 4).unwrap();
        assert_eq!(mid.read_all().unwrap(), b"defg");
        // Original untouched.
        assert_eq!(zco.read_all().unwrap(), b"abcdefghij");
    }

    #[test]
    fn test_clone_range_bounds() {
        let zco = Zco::from_bytes(Bytes::from_static(b"abc"));
        assert!(zco.clone_range(2, 2).is_err());
        assert_eq!(zco.clone_range(0, 0).unwrap().len(), 0);
    }

    #[test]
    fn test_truncate() {
        let mut zco = Zco::from_bytes(Bytes::from_static(b"abcdefgh"));
        zco.truncate(3).unwrap();
        assert_eq!(zco.read_all().unwrap(), b"abc");
    }

    #[test]
    fn test_prepend_header() {
        let mut zco = Zco::from_bytes(Bytes::from_static(b"payload"));
        zco.prepend(Bytes::from_static(b"hdr|"));
        zco.append(Bytes::from_static(b"|trl"));
        assert_eq!(zco.read_all().unwrap(), b"hdr|payload|trl");
    }

    #[test]
    fn test_file_extent_read() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();

        let zco = Zco::from_file(file.path().to_path_buf(), 2, 5);
        assert_eq!(zco.read_all().unwrap(), b"23456");

        let tail = zco.clone_range(3, 2).unwrap();
        assert_eq!(tail.read_all().unwrap(), b"56");
    }

    #[test]
    fn test_reader_skip() {
        let mut zco = Zco::from_bytes(Bytes::from_static(b"abcde"));
        zco.append(Bytes::from_static(b"fghij"));

        let mut reader = zco.reader();
        reader.skip(7);
        let mut buf = [0u8; 3];
        assert_eq!(reader.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"hij");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_occupancy_budget() {
        let mut occupancy = Occupancy::new(100);
        assert!(!occupancy.would_exceed(100));
        occupancy.increase(80);
        assert!(occupancy.would_exceed(30));
        occupancy.reduce(50);
        assert_eq!(occupancy.current(), 30);
        assert!(!occupancy.would_exceed(70));
    }
}
