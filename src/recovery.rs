//! Crash recovery.
//!
//! Runs once at startup, before any new transaction is admitted. The
//! log holds physical before/after images; the ledger says how each
//! transaction ended. Recovery replays the log twice:
//!
//! 1. **Redo** in append order for every transaction that is no longer
//!    active: committed and aborted work alike is brought back to its
//!    logged post-image (aborted transactions were already compensated
//!    in the log by the layer above).
//! 2. **Undo** in reverse order for every transaction still marked
//!    active at the crash: updates revert to their pre-image, inserts
//!    become logical tombstones. Each such transaction is then marked
//!    Aborted, the only transition out of Active without a client call.
//!
//! Redo runs first so a page shared between a committed write and an
//! active transaction's earlier write ends up with the committed value:
//! committed work is never subsequently undone.

pub mod log_record;

use std::collections::HashMap;

use log::info;

use crate::data::set_raw_invalid;
use crate::error::Result;
use crate::storage::PageCache;
use crate::transaction::TransactionManager;
use crate::wal::Wal;

use log_record::LogRecord;

/// Restores a consistent on-disk state after a crash. Single-threaded;
/// no other user of the page cache or ledger may be live.
pub fn recover(tm: &TransactionManager, wal: &Wal, pc: &PageCache) -> Result<()> {
    info!("recovering");

    // Pages allocated after the last logged mutation are crash
    // artifacts: any real write would have logged its page number.
    wal.rewind();
    let mut max_pgno = 0;
    while let Some(data) = wal.next()? {
        max_pgno = max_pgno.max(LogRecord::decode(&data)?.pgno());
    }
    if max_pgno == 0 {
        max_pgno = 1;
    }
    pc.truncate_to(max_pgno)?;
    info!("truncated page file to {} pages", max_pgno);

    redo_transactions(tm, wal, pc)?;
    info!("redo pass complete");

    undo_transactions(tm, wal, pc)?;
    info!("undo pass complete");

    Ok(())
}

fn redo_transactions(tm: &TransactionManager, wal: &Wal, pc: &PageCache) -> Result<()> {
    wal.rewind();
    while let Some(data) = wal.next()? {
        let record = LogRecord::decode(&data)?;
        if tm.is_active(record.xid())? {
            continue;
        }
        match record {
            LogRecord::Insert(r) => apply_insert(pc, r.pgno, &r.raw, r.offset)?,
            LogRecord::Update(r) => apply_update(pc, r.pgno, &r.new_raw, r.offset)?,
        }
    }
    Ok(())
}

fn undo_transactions(tm: &TransactionManager, wal: &Wal, pc: &PageCache) -> Result<()> {
    let mut pending: HashMap<u64, Vec<LogRecord>> = HashMap::new();
    wal.rewind();
    while let Some(data) = wal.next()? {
        let record = LogRecord::decode(&data)?;
        if tm.is_active(record.xid())? {
            pending.entry(record.xid()).or_default().push(record);
        }
    }

    for (xid, records) in pending {
        for record in records.iter().rev() {
            match record {
                LogRecord::Insert(r) => {
                    // Logical tombstone, not a physical erase: the slot
                    // stays allocated but reads as absent.
                    let mut raw = r.raw.clone();
                    set_raw_invalid(&mut raw);
                    apply_insert(pc, r.pgno, &raw, r.offset)?;
                }
                LogRecord::Update(r) => apply_update(pc, r.pgno, &r.old_raw, r.offset)?,
            }
        }
        tm.abort(xid)?;
    }
    Ok(())
}

fn apply_insert(pc: &PageCache, pgno: u32, raw: &[u8], offset: u16) -> Result<()> {
    let page = pc.get_page(pgno)?;
    page.recover_insert(raw, offset);
    pc.release_page(&page)
}

fn apply_update(pc: &PageCache, pgno: u32, raw: &[u8], offset: u16) -> Result<()> {
    let page = pc.get_page(pgno)?;
    page.recover_update(raw, offset);
    pc.release_page(&page)
}
