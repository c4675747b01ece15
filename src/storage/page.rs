use std::sync::atomic::{AtomicBool, Ordering};

use byteorder::{BigEndian, ByteOrder};
use parking_lot::{Mutex, MutexGuard};

pub const PAGE_SIZE: usize = 8192;

// Normal-page layout: [FreeSpaceOffset:2][Data]. The free-space offset
// (FSO) marks where the next record may be appended.
const FSO_OFFSET: usize = 0;
const DATA_OFFSET: usize = 2;

/// Largest record a normal page can hold.
pub const MAX_FREE_SPACE: usize = PAGE_SIZE - DATA_OFFSET;

/// A cached disk page, identified by its 1-based page number.
///
/// The buffer sits behind the page's own mutex, which doubles as the
/// exclusive mutation lock: callers that need a multi-step
/// read-modify-write hold [`Page::lock`] across it. The dirty flag is
/// set on every mutation and cleared by the page cache after write-back.
/// Pages are shared as `Arc<Page>` and released through the cache, never
/// directly.
pub struct Page {
    pgno: u32,
    data: Mutex<Box<[u8; PAGE_SIZE]>>,
    dirty: AtomicBool,
}

impl Page {
    pub(crate) fn new(pgno: u32, data: Box<[u8; PAGE_SIZE]>) -> Self {
        Self {
            pgno,
            data: Mutex::new(data),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn number(&self) -> u32 {
        self.pgno
    }

    pub fn lock(&self) -> MutexGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.data.lock()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn set_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub(crate) fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::SeqCst);
    }

    /// A freshly formatted empty normal page: FSO points just past the
    /// layout header.
    pub fn init_raw() -> Box<[u8; PAGE_SIZE]> {
        let mut raw = Box::new([0u8; PAGE_SIZE]);
        set_fso(&mut raw[..], DATA_OFFSET as u16);
        raw
    }

    /// Current free-space offset.
    pub fn fso(&self) -> u16 {
        get_fso(&self.lock()[..])
    }

    /// Bytes still available for appends.
    pub fn free_space(&self) -> usize {
        PAGE_SIZE - self.fso() as usize
    }

    /// Appends `record` at the free-space offset, advances it, and
    /// returns the offset written. The caller is responsible for having
    /// checked [`Page::free_space`] first.
    pub fn insert(&self, record: &[u8]) -> u16 {
        let mut data = self.lock();
        let offset = get_fso(&data[..]);
        debug_assert!(offset as usize + record.len() <= PAGE_SIZE);
        data[offset as usize..offset as usize + record.len()].copy_from_slice(record);
        set_fso(&mut data[..], offset + record.len() as u16);
        self.set_dirty();
        offset
    }

    /// Recovery primitive: writes `raw` at an explicit offset and
    /// advances the FSO only if this write extends past it. Idempotent
    /// under replay.
    pub fn recover_insert(&self, raw: &[u8], offset: u16) {
        let mut data = self.lock();
        let end = offset as usize + raw.len();
        debug_assert!(end <= PAGE_SIZE);
        data[offset as usize..end].copy_from_slice(raw);
        if (get_fso(&data[..]) as usize) < end {
            set_fso(&mut data[..], end as u16);
        }
        self.set_dirty();
    }

    /// Writes `raw` at an explicit offset without touching the FSO.
    /// Used to replay update post/pre-images and to apply logged
    /// in-place updates.
    pub fn recover_update(&self, raw: &[u8], offset: u16) {
        let mut data = self.lock();
        let end = offset as usize + raw.len();
        debug_assert!(end <= PAGE_SIZE);
        data[offset as usize..end].copy_from_slice(raw);
        self.set_dirty();
    }
}

fn get_fso(data: &[u8]) -> u16 {
    BigEndian::read_u16(&data[FSO_OFFSET..DATA_OFFSET])
}

fn set_fso(data: &mut [u8], fso: u16) {
    BigEndian::write_u16(&mut data[FSO_OFFSET..DATA_OFFSET], fso);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_raw() {
        let page = Page::new(1, Page::init_raw());
        assert_eq!(page.fso(), DATA_OFFSET as u16);
        assert_eq!(page.free_space(), MAX_FREE_SPACE);
        assert!(!page.is_dirty());
    }

    #[test]
    fn test_insert_offsets_are_monotonic() {
        let page = Page::new(1, Page::init_raw());

        let sizes = [1usize, 7, 100, 13, 512];
        let mut expected = DATA_OFFSET;
        for (i, &size) in sizes.iter().enumerate() {
            let record = vec![i as u8; size];
            let offset = page.insert(&record);
            assert_eq!(offset as usize, expected);
            expected += size;
        }
        assert_eq!(page.fso() as usize, expected);
        assert_eq!(page.free_space(), PAGE_SIZE - expected);
        assert!(page.is_dirty());

        // Records do not overlap.
        let data = page.lock();
        let mut pos = DATA_OFFSET;
        for (i, &size) in sizes.iter().enumerate() {
            assert!(data[pos..pos + size].iter().all(|&b| b == i as u8));
            pos += size;
        }
    }

    #[test]
    fn test_recover_insert_is_idempotent() {
        let page = Page::new(1, Page::init_raw());
        let raw = b"payload";

        page.recover_insert(raw, 10);
        assert_eq!(page.fso() as usize, 10 + raw.len());

        // Replaying the same record does not move the FSO again.
        page.recover_insert(raw, 10);
        assert_eq!(page.fso() as usize, 10 + raw.len());

        // A write entirely below the FSO leaves it alone.
        page.recover_insert(b"xy", 2);
        assert_eq!(page.fso() as usize, 10 + raw.len());
    }

    #[test]
    fn test_recover_update_leaves_fso() {
        let page = Page::new(1, Page::init_raw());
        page.insert(b"0123456789");
        let fso = page.fso();

        page.recover_update(b"abcd", 4);
        assert_eq!(page.fso(), fso);
        let data = page.lock();
        assert_eq!(&data[4..8], b"abcd");
    }
}
