//! Parses an LVM snapshot's exception-store metadata device and enumerates
//! the origin chunks it records as modified.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::endian::from_network_u64;
use crate::error::{Error, MetadataError};

const MAGIC: u32 = 0x70416e53;
const HEADER_LEN: usize = 16;
const RECORD_LEN: u64 = 16;

/// Path to the procfs knob that drops the kernel's page cache. The kernel
/// doesn't keep this device's cache coherent with CoW activity, so stale
/// reads are likely without it.
const DROP_CACHES_PATH: &str = "/proc/sys/vm/drop_caches";

/// Best-effort: ask the kernel to drop page caches before reading the
/// exception store. Failure is logged at warning level and otherwise
/// ignored, per the spec's "CacheDropFailed" contract — callers should
/// still get their data, just possibly stale.
pub fn drop_page_cache() {
    if let Err(source) = std::fs::write(DROP_CACHES_PATH, b"3") {
        tracing::warn!(
            %source,
            path = DROP_CACHES_PATH,
            "failed to drop page caches before reading exception store; reads may be stale"
        );
    }
}

fn read_header<R: Read>(input: &mut R) -> Result<u32, Error> {
    let mut buf = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = input.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled < HEADER_LEN {
        return Err(MetadataError::TruncatedExceptionStore { expected: HEADER_LEN, actual: filled }.into());
    }

    let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    if magic != MAGIC {
        return Err(MetadataError::InvalidMagic.into());
    }

    let valid = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    if valid != 1 {
        return Err(MetadataError::SnapshotInvalid.into());
    }

    let metadata_version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
    if metadata_version != 1 {
        return Err(MetadataError::UnsupportedMetadataVersion(metadata_version).into());
    }

    let chunksize_in_sectors = u32::from_le_bytes(buf[12..16].try_into().unwrap());
    Ok(chunksize_in_sectors * 512)
}

/// Opens the exception-store device at `path`, drops the page cache, and
/// returns a reader positioned to enumerate its modified chunks.
pub fn open(path: &Path) -> Result<ExceptionStoreReader<File>, Error> {
    drop_page_cache();
    let mut file = File::open(path).map_err(|source| Error::io(path, source))?;
    let chunksize = read_header(&mut file)?;
    Ok(ExceptionStoreReader::new(file, chunksize))
}

/// A lazy, finite, non-restartable sequence of origin chunk indices read
/// from an exception store's records.
///
/// Duplicate indices are possible if the snapshot's exception list was
/// rewritten in place; consumers must handle re-transferring the same chunk
/// as harmless, not an error.
pub struct ExceptionStoreReader<R> {
    inner: R,
    chunksize: u32,
    records_per_block: usize,
    /// Start of the exception block currently being read.
    block_position: u64,
    /// Number of records already consumed from the current block.
    consumed_in_block: usize,
    done: bool,
}

impl<R: Read + Seek> ExceptionStoreReader<R> {
    pub(crate) fn new(inner: R, chunksize: u32) -> Self {
        ExceptionStoreReader {
            inner,
            chunksize,
            records_per_block: (chunksize as usize) / (RECORD_LEN as usize),
            block_position: chunksize as u64, // skip the header block
            consumed_in_block: 0,
            done: false,
        }
    }

    /// Chunk size in bytes, as declared by the snapshot header.
    pub fn chunksize(&self) -> u32 {
        self.chunksize
    }

    fn read_one_record(&mut self) -> Result<Option<(u64, u64)>, Error> {
        let mut buf = [0u8; RECORD_LEN as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.inner.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }
        if filled < buf.len() {
            return Err(MetadataError::TruncatedExceptionStore {
                expected: buf.len(),
                actual: filled,
            }
            .into());
        }

        let origin_net = u64::from_ne_bytes(buf[0..8].try_into().unwrap());
        let snap_net = u64::from_ne_bytes(buf[8..16].try_into().unwrap());
        Ok(Some((from_network_u64(origin_net)?, from_network_u64(snap_net)?)))
    }
}

impl<R: Read + Seek> Iterator for ExceptionStoreReader<R> {
    type Item = Result<u64, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            if self.consumed_in_block == 0 {
                if let Err(e) = self.inner.seek(SeekFrom::Start(self.block_position)) {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            }

            if self.consumed_in_block >= self.records_per_block {
                // Exhausted this block without hitting a terminator; advance
                // exactly one chunk and keep scanning (see the corrected
                // skip-arithmetic semantics in the Design Notes).
                self.block_position += self.chunksize as u64;
                self.consumed_in_block = 0;
                continue;
            }

            let record = match self.read_one_record() {
                Ok(Some(record)) => record,
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            self.consumed_in_block += 1;
            let (origin, snap) = record;
            if snap == 0 {
                self.done = true;
                return None;
            }
            return Some(Ok(origin));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    fn header_bytes(chunksize_in_sectors: u32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        buf.extend_from_slice(&MAGIC.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&chunksize_in_sectors.to_le_bytes());
        buf
    }

    fn push_record(buf: &mut Vec<u8>, origin: u64, snap: u64) {
        buf.extend_from_slice(&origin.to_be_bytes());
        buf.extend_from_slice(&snap.to_be_bytes());
    }

    #[test]
    fn s2_header_parses_chunksize() {
        let mut header = header_bytes(8);
        let chunksize = read_header(&mut Cursor::new(&mut header)).unwrap();
        assert_eq!(chunksize, 4096);
    }

    #[test]
    fn s2_zeroed_header_is_invalid_magic() {
        let mut zeroes = vec![0u8; HEADER_LEN];
        let err = read_header(&mut Cursor::new(&mut zeroes)).unwrap_err();
        assert!(matches!(err, Error::Metadata(MetadataError::UnsupportedMetadataVersion(_)) | Error::Metadata(MetadataError::InvalidMagic)));
    }

    fn build_store(chunksize: usize, blocks: &[Vec<(u64, u64)>]) -> Cursor<Vec<u8>> {
        let chunksize_in_sectors = (chunksize / 512) as u32;
        let mut data = header_bytes(chunksize_in_sectors);
        data.resize(chunksize, 0);

        for block in blocks {
            let block_start = data.len();
            for &(origin, snap) in block {
                push_record(&mut data, origin, snap);
            }
            data.resize(block_start + chunksize, 0);
        }
        Cursor::new(data)
    }

    #[test]
    fn s3_single_record_then_terminator() {
        let store = build_store(512, &[vec![(3, 1), (0, 0)]]);
        let reader = ExceptionStoreReader::new(store, 512);
        let chunks: Vec<u64> = reader.map(Result::unwrap).collect();
        assert_eq!(chunks, vec![3]);
    }

    #[test]
    fn s6_multi_block_enumeration_yields_35_records() {
        let mut block0: Vec<(u64, u64)> = (0..32).map(|i| (i, i + 1)).collect();
        let mut block1: Vec<(u64, u64)> = (32..35).map(|i| (i, i + 1)).collect();
        block1.push((0, 0)); // terminator
        let store = build_store(512, &[std::mem::take(&mut block0), std::mem::take(&mut block1)]);

        let reader = ExceptionStoreReader::new(store, 512);
        let chunks: Vec<u64> = reader.map(Result::unwrap).collect();
        assert_eq!(chunks.len(), 35);
        assert_eq!(chunks, (0..35).collect::<Vec<_>>());
    }

    #[test]
    fn termination_determinism_matches_record_count_before_terminator() {
        for k in [0usize, 1, 10, 31] {
            let mut records: Vec<(u64, u64)> = (0..k as u64).map(|i| (i, i + 1)).collect();
            records.push((0, 0));
            let store = build_store(512, &[records]);
            let reader = ExceptionStoreReader::new(store, 512);
            let count = reader.map(Result::unwrap).count();
            assert_eq!(count, k);
        }
    }

    #[test]
    fn duplicate_origin_indices_are_preserved_not_deduplicated() {
        let store = build_store(512, &[vec![(5, 1), (5, 2), (0, 0)]]);
        let reader = ExceptionStoreReader::new(store, 512);
        let chunks: Vec<u64> = reader.map(Result::unwrap).collect();
        assert_eq!(chunks, vec![5, 5]);
    }

    #[test]
    fn truncated_record_is_an_error() {
        let mut store = build_store(512, &[vec![]]);
        // Truncate mid-record within the first exception block.
        let len = store.get_ref().len();
        store.get_mut().truncate(len - 512 + 5);
        let mut reader = ExceptionStoreReader::new(store, 512);
        let first = reader.next().unwrap();
        assert!(matches!(first, Err(Error::Metadata(MetadataError::TruncatedExceptionStore { .. }))));
    }

    #[test]
    fn write_then_read_header_is_self_consistent() {
        let mut buf = Vec::new();
        buf.write_all(&header_bytes(16)).unwrap();
        let chunksize = read_header(&mut Cursor::new(buf)).unwrap();
        assert_eq!(chunksize, 16 * 512);
    }
}
