//! Physical log record wire format.
//!
//! Two record kinds, distinguished by the first byte:
//!
//! ```text
//! Insert: [0u8] [Xid:8] [Pgno:4] [Offset:2] [Raw]
//! Update: [1u8] [Xid:8] [Uid:8]  [OldRaw] [NewRaw]
//! ```
//!
//! A uid packs the page number into the upper 32 bits and the in-page
//! offset into the lower 16. Old and new images of an update have the
//! same record-type-determined length and split the remainder evenly.
//! All integers big-endian.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

const TYPE_INSERT: u8 = 0;
const TYPE_UPDATE: u8 = 1;

// [Type:1][Xid:8][Pgno:4][Offset:2]
const INSERT_HEADER_SIZE: usize = 15;
// [Type:1][Xid:8][Uid:8]
const UPDATE_HEADER_SIZE: usize = 17;

/// Packs a page number and in-page offset into a record id.
pub fn uid(pgno: u32, offset: u16) -> u64 {
    (pgno as u64) << 32 | offset as u64
}

/// Splits a record id back into (page number, offset).
pub fn uid_parts(uid: u64) -> (u32, u16) {
    ((uid >> 32) as u32, (uid & 0xFFFF) as u16)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertRecord {
    pub xid: u64,
    pub pgno: u32,
    pub offset: u16,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRecord {
    pub xid: u64,
    pub pgno: u32,
    pub offset: u16,
    pub old_raw: Vec<u8>,
    pub new_raw: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    Insert(InsertRecord),
    Update(UpdateRecord),
}

impl LogRecord {
    pub fn xid(&self) -> u64 {
        match self {
            LogRecord::Insert(r) => r.xid,
            LogRecord::Update(r) => r.xid,
        }
    }

    pub fn pgno(&self) -> u32 {
        match self {
            LogRecord::Insert(r) => r.pgno,
            LogRecord::Update(r) => r.pgno,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            LogRecord::Insert(r) => {
                let mut buf = Vec::with_capacity(INSERT_HEADER_SIZE + r.raw.len());
                buf.push(TYPE_INSERT);
                buf.extend_from_slice(&r.xid.to_be_bytes());
                buf.extend_from_slice(&r.pgno.to_be_bytes());
                buf.extend_from_slice(&r.offset.to_be_bytes());
                buf.extend_from_slice(&r.raw);
                buf
            }
            LogRecord::Update(r) => {
                debug_assert_eq!(r.old_raw.len(), r.new_raw.len());
                let mut buf =
                    Vec::with_capacity(UPDATE_HEADER_SIZE + r.old_raw.len() + r.new_raw.len());
                buf.push(TYPE_UPDATE);
                buf.extend_from_slice(&r.xid.to_be_bytes());
                buf.extend_from_slice(&uid(r.pgno, r.offset).to_be_bytes());
                buf.extend_from_slice(&r.old_raw);
                buf.extend_from_slice(&r.new_raw);
                buf
            }
        }
    }

    /// Decodes a record read back from the log. Only checksum-valid
    /// data reaches this point, so a malformed record means the log is
    /// corrupt beyond tail truncation.
    pub fn decode(data: &[u8]) -> Result<LogRecord> {
        match data.first() {
            Some(&TYPE_INSERT) if data.len() >= INSERT_HEADER_SIZE => {
                Ok(LogRecord::Insert(InsertRecord {
                    xid: BigEndian::read_u64(&data[1..9]),
                    pgno: BigEndian::read_u32(&data[9..13]),
                    offset: BigEndian::read_u16(&data[13..15]),
                    raw: data[INSERT_HEADER_SIZE..].to_vec(),
                }))
            }
            Some(&TYPE_UPDATE)
                if data.len() >= UPDATE_HEADER_SIZE
                    && (data.len() - UPDATE_HEADER_SIZE) % 2 == 0 =>
            {
                let xid = BigEndian::read_u64(&data[1..9]);
                let (pgno, offset) = uid_parts(BigEndian::read_u64(&data[9..17]));
                let half = (data.len() - UPDATE_HEADER_SIZE) / 2;
                Ok(LogRecord::Update(UpdateRecord {
                    xid,
                    pgno,
                    offset,
                    old_raw: data[UPDATE_HEADER_SIZE..UPDATE_HEADER_SIZE + half].to_vec(),
                    new_raw: data[UPDATE_HEADER_SIZE + half..].to_vec(),
                }))
            }
            _ => Err(Error::BadLogFile),
        }
    }
}
