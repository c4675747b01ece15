//! Durable transaction-status ledger.
//!
//! Every transaction is identified by a monotonically increasing 64-bit
//! XID and carries exactly one of three states, persisted as one byte
//! per XID in the `.xid` file:
//!
//! ```text
//! [XidCounter:8] [status xid=1] [status xid=2] ...
//! ```
//!
//! The state machine is one-way: Active -> Committed | Aborted, and the
//! terminal states are final. XID 0 is the super transaction: always
//! committed, never active or aborted, and never touches the file.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use byteorder::{BigEndian, ByteOrder};
use parking_lot::Mutex;

use crate::error::{Error, Result};

pub const XID_SUFFIX: &str = ".xid";

/// The reserved always-committed transaction.
pub const SUPER_XID: u64 = 0;

const HEADER_SIZE: u64 = 8;
const FIELD_SIZE: u64 = 1;

const STATUS_ACTIVE: u8 = 0;
const STATUS_COMMITTED: u8 = 1;
const STATUS_ABORTED: u8 = 2;

/// Manages the XID ledger file.
///
/// XID allocation is serialized by the counter lock; commit and abort
/// target disjoint single-byte offsets and need no further mutual
/// exclusion. Every status write is force-flushed before returning,
/// since every layer above relies on this ledger for durability.
pub struct TransactionManager {
    file: File,
    counter: Mutex<u64>,
}

impl TransactionManager {
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
            file,
            counter: Mutex::new(0),
        })
    }

    /// Opens an existing ledger and verifies the length invariant:
    /// file length = header + counter bytes. Any violation means a
    /// torn file and is fatal.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < HEADER_SIZE {
            return Err(Error::BadXidFile);
        }
        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact_at(&mut header, 0)?;
        let counter = BigEndian::read_u64(&header);
        if len != HEADER_SIZE + counter * FIELD_SIZE {
            return Err(Error::BadXidFile);
        }
        Ok(Self {
            file,
            counter: Mutex::new(counter),
        })
    }

    fn xid_position(xid: u64) -> u64 {
        HEADER_SIZE + (xid - 1) * FIELD_SIZE
    }

    fn update_status(&self, xid: u64, status: u8) -> Result<()> {
        self.file.write_all_at(&[status], Self::xid_position(xid))?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Allocates the next XID, persists it as Active, then durably
    /// bumps the issued-XID counter. The status byte goes first: a
    /// crash between the two writes leaves a ledger whose length check
    /// fails at the next open instead of a silently untracked XID.
    pub fn begin(&self) -> Result<u64> {
        let mut counter = self.counter.lock();
        let xid = *counter + 1;
        self.update_status(xid, STATUS_ACTIVE)?;

        let mut header = [0u8; HEADER_SIZE as usize];
        BigEndian::write_u64(&mut header, xid);
        self.file.write_all_at(&header, 0)?;
        self.file.sync_data()?;
        *counter = xid;
        Ok(xid)
    }

    pub fn commit(&self, xid: u64) -> Result<()> {
        self.update_status(xid, STATUS_COMMITTED)
    }

    pub fn abort(&self, xid: u64) -> Result<()> {
        self.update_status(xid, STATUS_ABORTED)
    }

    fn check_status(&self, xid: u64, status: u8) -> Result<bool> {
        let mut buf = [0u8; FIELD_SIZE as usize];
        self.file.read_exact_at(&mut buf, Self::xid_position(xid))?;
        Ok(buf[0] == status)
    }

    pub fn is_active(&self, xid: u64) -> Result<bool> {
        if xid == SUPER_XID {
            return Ok(false);
        }
        self.check_status(xid, STATUS_ACTIVE)
    }

    pub fn is_committed(&self, xid: u64) -> Result<bool> {
        if xid == SUPER_XID {
            return Ok(true);
        }
        self.check_status(xid, STATUS_COMMITTED)
    }

    pub fn is_aborted(&self, xid: u64) -> Result<bool> {
        if xid == SUPER_XID {
            return Ok(false);
        }
        self.check_status(xid, STATUS_ABORTED)
    }
}
