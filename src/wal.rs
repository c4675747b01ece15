//! Append-only checksummed log file.
//!
//! File layout:
//!
//! ```text
//! [XChecksum:4] [Record 1] [Record 2] ... [Record N] [BadTail?]
//! ```
//!
//! `XChecksum` is a running checksum over the raw bytes of every valid
//! record in append order, rewritten (with a forced flush) after each
//! successful append. Each record is:
//!
//! ```text
//! [Size:4] [Checksum:4] [Data:Size]
//! ```
//!
//! where `Checksum` covers `Data` alone, seeded from zero. A `BadTail`
//! is whatever a crash mid-append left after the last record covered by
//! the header checksum; it is truncated away at open and never reported
//! as an error.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use byteorder::{BigEndian, ByteOrder};
use log::info;
use parking_lot::Mutex;

use crate::error::{Error, Result};

pub const LOG_SUFFIX: &str = ".log";

// hash = hash * SEED + byte, over sign-extended bytes with wrapping
// 32-bit arithmetic. Fixed by the on-disk format.
const SEED: i32 = 13331;

const HEADER_SIZE: u64 = 4;
// [Size:4][Checksum:4]
const RECORD_HEADER_SIZE: u64 = 8;

fn checksum(mut acc: i32, data: &[u8]) -> i32 {
    for &b in data {
        acc = acc.wrapping_mul(SEED).wrapping_add(b as i8 as i32);
    }
    acc
}

struct WalInner {
    file: File,
    /// End of the valid log, fixed at open and advanced by appends.
    size: u64,
    /// Running checksum over all valid records, mirrored in the header.
    xchecksum: i32,
    /// Read cursor for rewind/next iteration.
    position: u64,
}

/// Durable append-only log. Appends are serialized by an internal lock;
/// iteration (`rewind`/`next`) shares the same cursor and is meant for
/// the single-threaded recovery pass.
pub struct Wal {
    inner: Mutex<WalInner>,
}

impl Wal {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let header = [0u8; HEADER_SIZE as usize];
        file.write_all_at(&header, 0)?;
        file.sync_data()?;
        Ok(Self {
            inner: Mutex::new(WalInner {
                file,
                size: HEADER_SIZE,
                xchecksum: 0,
                position: HEADER_SIZE,
            }),
        })
    }

    /// Opens an existing log and runs the integrity pass: the stored
    /// header checksum must match the running checksum after some
    /// prefix of records; everything past the longest such prefix is a
    /// bad tail from a crash mid-append and is truncated away. A header
    /// that matches no prefix is unexplainable corruption and fatal.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len();
        if size < HEADER_SIZE {
            return Err(Error::BadLogFile);
        }
        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact_at(&mut header, 0)?;
        let xchecksum = BigEndian::read_i32(&header);

        let mut inner = WalInner {
            file,
            size,
            xchecksum,
            position: HEADER_SIZE,
        };
        Self::check_and_remove_tail(&mut inner)?;
        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    fn check_and_remove_tail(inner: &mut WalInner) -> Result<()> {
        let mut pos = HEADER_SIZE;
        let mut acc: i32 = 0;
        // The empty prefix is valid when the header was never updated.
        let mut valid_end = (inner.xchecksum == 0).then_some(HEADER_SIZE);

        while let Some((wrapped, next)) = Self::read_record(inner, pos)? {
            acc = checksum(acc, &wrapped);
            pos = next;
            if acc == inner.xchecksum {
                valid_end = Some(pos);
            }
        }

        let valid_end = valid_end.ok_or(Error::BadLogFile)?;
        if valid_end < inner.size {
            info!(
                "discarding bad log tail: {} bytes past offset {}",
                inner.size - valid_end,
                valid_end
            );
            inner.file.set_len(valid_end)?;
            inner.file.sync_all()?;
            inner.size = valid_end;
        }
        inner.position = HEADER_SIZE;
        Ok(())
    }

    /// Reads the complete wrapped record at `pos`, or `None` when no
    /// complete, checksum-valid record starts there.
    fn read_record(inner: &WalInner, pos: u64) -> Result<Option<(Vec<u8>, u64)>> {
        if pos + RECORD_HEADER_SIZE >= inner.size {
            return Ok(None);
        }
        let mut size_buf = [0u8; 4];
        inner.file.read_exact_at(&mut size_buf, pos)?;
        let data_len = BigEndian::read_u32(&size_buf) as u64;
        if pos + RECORD_HEADER_SIZE + data_len > inner.size {
            return Ok(None);
        }

        let total = (RECORD_HEADER_SIZE + data_len) as usize;
        let mut wrapped = vec![0u8; total];
        inner.file.read_exact_at(&mut wrapped, pos)?;

        let stored = BigEndian::read_i32(&wrapped[4..8]);
        if checksum(0, &wrapped[RECORD_HEADER_SIZE as usize..]) != stored {
            return Ok(None);
        }
        Ok(Some((wrapped, pos + total as u64)))
    }

    /// Appends one record and force-flushes the updated header
    /// checksum. Safe for concurrent callers.
    pub fn append(&self, data: &[u8]) -> Result<()> {
        let mut wrapped = Vec::with_capacity(RECORD_HEADER_SIZE as usize + data.len());
        let mut size_buf = [0u8; 4];
        BigEndian::write_u32(&mut size_buf, data.len() as u32);
        wrapped.extend_from_slice(&size_buf);
        let mut check_buf = [0u8; 4];
        BigEndian::write_i32(&mut check_buf, checksum(0, data));
        wrapped.extend_from_slice(&check_buf);
        wrapped.extend_from_slice(data);

        let mut inner = self.inner.lock();
        inner.file.write_all_at(&wrapped, inner.size)?;
        inner.size += wrapped.len() as u64;

        inner.xchecksum = checksum(inner.xchecksum, &wrapped);
        let mut header = [0u8; HEADER_SIZE as usize];
        BigEndian::write_i32(&mut header, inner.xchecksum);
        inner.file.write_all_at(&header, 0)?;
        inner.file.sync_data()?;
        Ok(())
    }

    /// Resets the read cursor to the first record.
    pub fn rewind(&self) {
        self.inner.lock().position = HEADER_SIZE;
    }

    /// Returns the next record's data, or `None` at end of stream. An
    /// incomplete or checksum-invalid trailing record is end of stream,
    /// not an error.
    pub fn next(&self) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock();
        match Self::read_record(&inner, inner.position)? {
            None => Ok(None),
            Some((wrapped, next)) => {
                inner.position = next;
                Ok(Some(wrapped[RECORD_HEADER_SIZE as usize..].to_vec()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    fn collect(wal: &Wal) -> Result<Vec<Vec<u8>>> {
        wal.rewind();
        let mut records = Vec::new();
        while let Some(data) = wal.next()? {
            records.push(data);
        }
        Ok(records)
    }

    #[test]
    fn test_append_and_iterate() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.log");
        let wal = Wal::create(&path)?;

        let payloads: Vec<Vec<u8>> = vec![b"one".to_vec(), b"two".to_vec(), vec![0xAB; 300]];
        for p in &payloads {
            wal.append(p)?;
        }
        assert_eq!(collect(&wal)?, payloads);

        // Iteration is repeatable.
        assert_eq!(collect(&wal)?, payloads);
        Ok(())
    }

    #[test]
    fn test_reopen_preserves_records() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.log");
        {
            let wal = Wal::create(&path)?;
            wal.append(b"alpha")?;
            wal.append(b"beta")?;
        }
        let wal = Wal::open(&path)?;
        assert_eq!(collect(&wal)?, vec![b"alpha".to_vec(), b"beta".to_vec()]);

        // Appending after reopen keeps the checksum chain intact.
        wal.append(b"gamma")?;
        drop(wal);
        let wal = Wal::open(&path)?;
        assert_eq!(collect(&wal)?.len(), 3);
        Ok(())
    }

    #[test]
    fn test_truncated_tail_is_discarded() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.log");
        {
            let wal = Wal::create(&path)?;
            wal.append(b"kept one")?;
            wal.append(b"kept two")?;
        }
        let full_len = std::fs::metadata(&path)?.len();

        // Simulate a crash that tore the last record and never updated
        // the header: append a third record, then chop bytes off it and
        // restore the old header checksum.
        let old_header = std::fs::read(&path)?[..4].to_vec();
        {
            let wal = Wal::open(&path)?;
            wal.append(b"torn")?;
        }
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        file.set_len(full_len + 5)?;
        file.write_all_at(&old_header, 0)?;
        drop(file);

        let wal = Wal::open(&path)?;
        assert_eq!(
            collect(&wal)?,
            vec![b"kept one".to_vec(), b"kept two".to_vec()]
        );
        assert_eq!(std::fs::metadata(&path)?.len(), full_len);
        Ok(())
    }

    #[test]
    fn test_complete_record_past_stale_header_is_dropped() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.log");
        {
            let wal = Wal::create(&path)?;
            wal.append(b"first")?;
        }
        let old_header = std::fs::read(&path)?[..4].to_vec();
        {
            let wal = Wal::open(&path)?;
            wal.append(b"second")?;
        }
        // Crash before the header write: the second record is complete
        // on disk but not covered by the checksum. It must be dropped.
        let file = OpenOptions::new().write(true).open(&path)?;
        file.write_all_at(&old_header, 0)?;
        drop(file);

        let wal = Wal::open(&path)?;
        assert_eq!(collect(&wal)?, vec![b"first".to_vec()]);
        Ok(())
    }

    #[test]
    fn test_unexplainable_corruption_is_fatal() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.log");
        {
            let wal = Wal::create(&path)?;
            wal.append(b"aaaa")?;
            wal.append(b"bbbb")?;
        }
        // Flip a byte inside the *first* record's data: no prefix of
        // the log can explain the header checksum any more.
        let mut bytes = std::fs::read(&path)?;
        bytes[12] ^= 0xFF;
        std::fs::write(&path, &bytes)?;

        assert!(matches!(Wal::open(&path), Err(Error::BadLogFile)));
        Ok(())
    }

    #[test]
    fn test_empty_log() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.log");
        {
            Wal::create(&path)?;
        }
        let wal = Wal::open(&path)?;
        assert_eq!(collect(&wal)?, Vec::<Vec<u8>>::new());
        Ok(())
    }

    #[test]
    fn test_checksum_matches_reference() {
        // hash = hash * 13331 + byte, signed bytes, wrapping i32.
        assert_eq!(checksum(0, &[]), 0);
        assert_eq!(checksum(0, &[1]), 1);
        assert_eq!(checksum(0, &[1, 2]), 13333);
        assert_eq!(checksum(0, &[0xFF]), -1);
    }
}
