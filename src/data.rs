//! Record-level storage facade.
//!
//! Ties the subsystems together: the transaction ledger, the write-ahead
//! log, the page cache, and the free-space index, all rooted at one base
//! path (`base.xid`, `base.log`, `base.db`).
//!
//! Records live inside normal pages wrapped as:
//!
//! ```text
//! [ValidFlag:1] [Size:2] [Payload:Size]
//! ```
//!
//! and are addressed by a uid packing (page number, in-page offset).
//! Deletion is logical: the valid flag is flipped through a logged
//! update, so the slot itself is never reclaimed. Every mutation logs
//! its images before touching the page (write-ahead), which is what
//! makes the steal/no-force buffer policy recoverable.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use log::info;

use crate::error::{Error, Result};
use crate::recovery;
use crate::recovery::log_record::{uid, uid_parts, InsertRecord, LogRecord, UpdateRecord};
use crate::storage::page_cache::DB_SUFFIX;
use crate::storage::{page_one, FreeSpaceIndex, Page, PageCache, MAX_FREE_SPACE, PAGE_SIZE};
use crate::transaction::{TransactionManager, XID_SUFFIX};
use crate::wal::{Wal, LOG_SUFFIX};

const RAW_VALID: u8 = 0;
const RAW_INVALID: u8 = 1;
// [ValidFlag:1][Size:2]
const RAW_HEADER_SIZE: usize = 3;

/// How many times an insert retries page selection before giving up.
const INSERT_RETRIES: usize = 5;

fn wrap_record(data: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(RAW_HEADER_SIZE + data.len());
    raw.push(RAW_VALID);
    let mut size = [0u8; 2];
    BigEndian::write_u16(&mut size, data.len() as u16);
    raw.extend_from_slice(&size);
    raw.extend_from_slice(data);
    raw
}

pub(crate) fn set_raw_invalid(raw: &mut [u8]) {
    raw[0] = RAW_INVALID;
}

fn path_with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut os: OsString = base.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

/// The record store. One instance per database; all methods are safe
/// for concurrent callers.
pub struct DataManager {
    tm: Arc<TransactionManager>,
    wal: Wal,
    pc: PageCache,
    index: FreeSpaceIndex,
    page_one: Arc<Page>,
}

impl DataManager {
    /// Creates a fresh database at `base` (plus suffixes), overwriting
    /// any existing files.
    pub fn create(base: &Path, capacity: usize) -> Result<Self> {
        let tm = Arc::new(TransactionManager::create(&path_with_suffix(
            base, XID_SUFFIX,
        ))?);
        let wal = Wal::create(&path_with_suffix(base, LOG_SUFFIX))?;
        let pc = PageCache::create(&path_with_suffix(base, DB_SUFFIX), capacity)?;

        pc.new_page(page_one::init_raw())?;
        let page_one = pc.get_page(1)?;
        page_one::stamp_open(&page_one);
        pc.flush_page(&page_one)?;

        Ok(Self {
            tm,
            wal,
            pc,
            index: FreeSpaceIndex::new(),
            page_one,
        })
    }

    /// Opens an existing database, running crash recovery first when
    /// the previous shutdown was not clean.
    pub fn open(base: &Path, capacity: usize) -> Result<Self> {
        let tm = Arc::new(TransactionManager::open(&path_with_suffix(
            base, XID_SUFFIX,
        ))?);
        let wal = Wal::open(&path_with_suffix(base, LOG_SUFFIX))?;
        let pc = PageCache::open(&path_with_suffix(base, DB_SUFFIX), capacity)?;

        let page_one = pc.get_page(1)?;
        if !page_one::is_valid(&page_one) {
            info!("unclean shutdown detected");
            recovery::recover(&tm, &wal, &pc)?;
        }

        let dm = Self {
            tm,
            wal,
            pc,
            index: FreeSpaceIndex::new(),
            page_one,
        };
        dm.fill_index()?;

        page_one::stamp_open(&dm.page_one);
        dm.pc.flush_page(&dm.page_one)?;
        Ok(dm)
    }

    /// Rebuilds the free-space index from the normal pages.
    fn fill_index(&self) -> Result<()> {
        for pgno in 2..=self.pc.page_count() {
            let page = self.pc.get_page(pgno)?;
            self.index.add(pgno, page.free_space());
            self.pc.release_page(&page)?;
        }
        Ok(())
    }

    pub fn begin(&self) -> Result<u64> {
        self.tm.begin()
    }

    pub fn commit(&self, xid: u64) -> Result<()> {
        self.tm.commit(xid)
    }

    pub fn abort(&self, xid: u64) -> Result<()> {
        self.tm.abort(xid)
    }

    /// Inserts a record on behalf of `xid` and returns its uid. The
    /// log record goes to disk before the page is touched.
    pub fn insert(&self, xid: u64, data: &[u8]) -> Result<u64> {
        let raw = wrap_record(data);
        if raw.len() > MAX_FREE_SPACE {
            return Err(Error::DataTooLarge(data.len()));
        }

        let mut selected = None;
        for _ in 0..INSERT_RETRIES {
            if let Some(entry) = self.index.select(raw.len()) {
                selected = Some(entry);
                break;
            }
            let pgno = self.pc.new_page(Page::init_raw())?;
            self.index.add(pgno, MAX_FREE_SPACE);
        }
        let entry = selected.ok_or(Error::Busy)?;

        let page = self.pc.get_page(entry.pgno)?;
        let result = (|| {
            let offset = page.fso();
            self.wal.append(
                &LogRecord::Insert(InsertRecord {
                    xid,
                    pgno: entry.pgno,
                    offset,
                    raw: raw.clone(),
                })
                .encode(),
            )?;
            let offset = page.insert(&raw);
            Ok(uid(entry.pgno, offset))
        })();
        // The entry was consumed by select; put the page back with its
        // current free space whether or not the insert landed.
        self.index.add(entry.pgno, page.free_space());
        self.pc.release_page(&page)?;
        result
    }

    /// Reads a record's payload. A logically deleted record reads as
    /// `None`.
    pub fn read(&self, id: u64) -> Result<Option<Vec<u8>>> {
        let (pgno, offset) = uid_parts(id);
        let offset = offset as usize;
        if pgno < 2 || pgno > self.pc.page_count() || offset + RAW_HEADER_SIZE > PAGE_SIZE {
            return Err(Error::InvalidRecordId(id));
        }

        let page = self.pc.get_page(pgno)?;
        let result = (|| {
            let data = page.lock();
            if data[offset] == RAW_INVALID {
                return Ok(None);
            }
            let size = BigEndian::read_u16(&data[offset + 1..offset + 3]) as usize;
            let start = offset + RAW_HEADER_SIZE;
            if start + size > PAGE_SIZE {
                return Err(Error::InvalidRecordId(id));
            }
            Ok(Some(data[start..start + size].to_vec()))
        })();
        self.pc.release_page(&page)?;
        result
    }

    /// Replaces a record's payload in place. The new payload must have
    /// the same length as the old one; both images are logged before
    /// the page changes.
    pub fn update(&self, xid: u64, id: u64, data: &[u8]) -> Result<()> {
        let (pgno, offset) = uid_parts(id);
        let old_raw = self
            .read(id)?
            .map(|payload| wrap_record(&payload))
            .ok_or(Error::InvalidRecordId(id))?;
        let expected = old_raw.len() - RAW_HEADER_SIZE;
        if data.len() != expected {
            return Err(Error::UpdateSizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        let new_raw = wrap_record(data);
        self.apply_logged_update(xid, pgno, offset, old_raw, new_raw)
    }

    /// Logically deletes a record: a logged update that flips the valid
    /// flag. Deleting an already-deleted record is a no-op.
    pub fn delete(&self, xid: u64, id: u64) -> Result<()> {
        let (pgno, offset) = uid_parts(id);
        let old_raw = match self.read(id)? {
            Some(payload) => wrap_record(&payload),
            None => return Ok(()),
        };
        let mut new_raw = old_raw.clone();
        set_raw_invalid(&mut new_raw);
        self.apply_logged_update(xid, pgno, offset, old_raw, new_raw)
    }

    fn apply_logged_update(
        &self,
        xid: u64,
        pgno: u32,
        offset: u16,
        old_raw: Vec<u8>,
        new_raw: Vec<u8>,
    ) -> Result<()> {
        let page = self.pc.get_page(pgno)?;
        let result = (|| {
            self.wal.append(
                &LogRecord::Update(UpdateRecord {
                    xid,
                    pgno,
                    offset,
                    old_raw,
                    new_raw: new_raw.clone(),
                })
                .encode(),
            )?;
            page.recover_update(&new_raw, offset);
            Ok(())
        })();
        self.pc.release_page(&page)?;
        result
    }

    /// Clean shutdown: stamps the close marker and flushes every dirty
    /// page. The instance must not be used afterwards.
    pub fn close(&self) -> Result<()> {
        page_one::stamp_close(&self.page_one);
        self.pc.flush_page(&self.page_one)?;
        self.pc.release_page(&self.page_one)?;
        self.pc.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    #[test]
    fn test_insert_read_round_trip() -> Result<()> {
        let dir = tempdir()?;
        let dm = DataManager::create(&dir.path().join("test"), 16)?;

        let xid = dm.begin()?;
        let id = dm.insert(xid, b"hello world")?;
        assert_eq!(dm.read(id)?, Some(b"hello world".to_vec()));
        dm.commit(xid)?;
        dm.close()?;
        Ok(())
    }

    #[test]
    fn test_update_and_delete() -> Result<()> {
        let dir = tempdir()?;
        let dm = DataManager::create(&dir.path().join("test"), 16)?;

        let xid = dm.begin()?;
        let id = dm.insert(xid, b"aaaa")?;

        dm.update(xid, id, b"bbbb")?;
        assert_eq!(dm.read(id)?, Some(b"bbbb".to_vec()));

        assert!(matches!(
            dm.update(xid, id, b"too long"),
            Err(Error::UpdateSizeMismatch {
                expected: 4,
                actual: 8
            })
        ));

        dm.delete(xid, id)?;
        assert_eq!(dm.read(id)?, None);
        // Idempotent.
        dm.delete(xid, id)?;
        assert!(matches!(
            dm.update(xid, id, b"bbbb"),
            Err(Error::InvalidRecordId(_))
        ));

        dm.commit(xid)?;
        dm.close()?;
        Ok(())
    }

    #[test]
    fn test_data_too_large() -> Result<()> {
        let dir = tempdir()?;
        let dm = DataManager::create(&dir.path().join("test"), 16)?;
        let xid = dm.begin()?;

        let big = vec![0u8; MAX_FREE_SPACE];
        assert!(matches!(
            dm.insert(xid, &big),
            Err(Error::DataTooLarge(_))
        ));

        // The largest record that still fits with its wrap header.
        let max = vec![7u8; MAX_FREE_SPACE - RAW_HEADER_SIZE];
        let id = dm.insert(xid, &max)?;
        assert_eq!(dm.read(id)?.unwrap().len(), max.len());

        dm.commit(xid)?;
        dm.close()?;
        Ok(())
    }

    #[test]
    fn test_near_full_page_is_not_reused_for_page_sized_insert() -> Result<()> {
        let dir = tempdir()?;
        let dm = DataManager::create(&dir.path().join("test"), 16)?;
        let xid = dm.begin()?;

        // Leaves the first data page almost, but not entirely, free.
        let small_id = dm.insert(xid, &[1u8; 25])?;
        // Needs more space than that page has left; must go to a fresh
        // page instead of overrunning the first one.
        let big = vec![2u8; MAX_FREE_SPACE - RAW_HEADER_SIZE - 3];
        let big_id = dm.insert(xid, &big)?;

        assert_ne!(uid_parts(small_id).0, uid_parts(big_id).0);
        assert_eq!(dm.read(small_id)?.unwrap(), [1u8; 25]);
        assert_eq!(dm.read(big_id)?.unwrap(), big);

        dm.commit(xid)?;
        dm.close()?;
        Ok(())
    }

    #[test]
    fn test_read_rejects_bad_ids() -> Result<()> {
        let dir = tempdir()?;
        let dm = DataManager::create(&dir.path().join("test"), 16)?;
        // Page 1 never holds records; page 9 does not exist.
        assert!(matches!(dm.read(uid(1, 2)), Err(Error::InvalidRecordId(_))));
        assert!(matches!(dm.read(uid(9, 2)), Err(Error::InvalidRecordId(_))));
        dm.close()?;
        Ok(())
    }

    #[test]
    fn test_records_survive_clean_reopen() -> Result<()> {
        let dir = tempdir()?;
        let base = dir.path().join("test");

        let id = {
            let dm = DataManager::create(&base, 16)?;
            let xid = dm.begin()?;
            let id = dm.insert(xid, b"persistent")?;
            dm.commit(xid)?;
            dm.close()?;
            id
        };

        let dm = DataManager::open(&base, 16)?;
        assert_eq!(dm.read(id)?, Some(b"persistent".to_vec()));
        dm.close()?;
        Ok(())
    }

    #[test]
    fn test_inserts_spill_to_new_pages() -> Result<()> {
        let dir = tempdir()?;
        let dm = DataManager::create(&dir.path().join("test"), 64)?;
        let xid = dm.begin()?;

        // Each record takes ~2 KiB; after a few the first data page is
        // full and new pages are appended.
        let payload = vec![1u8; 2048];
        let ids: Vec<u64> = (0..12)
            .map(|_| dm.insert(xid, &payload))
            .collect::<crate::error::Result<_>>()?;
        assert!(dm.pc.page_count() > 2);

        for id in ids {
            assert_eq!(dm.read(id)?.unwrap(), payload);
        }
        dm.commit(xid)?;
        dm.close()?;
        Ok(())
    }
}
