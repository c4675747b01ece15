use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::cache::RefCache;
use crate::error::{Error, Result};

use super::page::{Page, PAGE_SIZE};

pub const DB_SUFFIX: &str = ".db";

/// The backing page file. Positional reads and writes, page 1 at
/// offset 0.
struct PageFile {
    file: File,
}

impl PageFile {
    fn offset(pgno: u32) -> u64 {
        (pgno as u64 - 1) * PAGE_SIZE as u64
    }

    fn read_page(&self, pgno: u32) -> Result<Box<[u8; PAGE_SIZE]>> {
        let mut buf = Box::new([0u8; PAGE_SIZE]);
        self.file.read_exact_at(&mut buf[..], Self::offset(pgno))?;
        Ok(buf)
    }

    fn write_page(&self, page: &Page) -> Result<()> {
        let data = page.lock();
        self.file.write_all_at(&data[..], Self::offset(page.number()))?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// Reference-counted cache of disk pages over a single backing file.
///
/// Pages are fetched on miss with one page-sized read and written back
/// (if dirty) when their last reference is released. The page count
/// always mirrors the on-disk file length in page units.
pub struct PageCache {
    cache: RefCache<Arc<Page>>,
    file: Arc<PageFile>,
    page_count: AtomicU32,
}

impl PageCache {
    pub fn create(path: &Path, capacity: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self::with_file(file, 0, capacity))
    }

    /// Opens an existing page file. A length that is not a multiple of
    /// the page size means the file was corrupted outside this layer's
    /// control and is fatal.
    pub fn open(path: &Path, capacity: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len % PAGE_SIZE as u64 != 0 {
            return Err(Error::BadPageFile);
        }
        Ok(Self::with_file(file, (len / PAGE_SIZE as u64) as u32, capacity))
    }

    fn with_file(file: File, page_count: u32, capacity: usize) -> Self {
        let file = Arc::new(PageFile { file });
        let fetch_file = Arc::clone(&file);
        let evict_file = Arc::clone(&file);
        let cache = RefCache::new(
            capacity,
            Box::new(move |key| {
                let pgno = key as u32;
                let data = fetch_file.read_page(pgno)?;
                Ok(Arc::new(Page::new(pgno, data)))
            }),
            Box::new(move |page: &Arc<Page>| {
                if page.is_dirty() {
                    evict_file.write_page(page)?;
                    page.clear_dirty();
                }
                Ok(())
            }),
        );
        Self {
            cache,
            file,
            page_count: AtomicU32::new(page_count),
        }
    }

    /// Appends a new page at end-of-file, persists it synchronously,
    /// and returns its page number.
    pub fn new_page(&self, raw: Box<[u8; PAGE_SIZE]>) -> Result<u32> {
        let pgno = self.page_count.fetch_add(1, Ordering::SeqCst) + 1;
        let page = Page::new(pgno, raw);
        self.file.write_page(&page)?;
        Ok(pgno)
    }

    pub fn get_page(&self, pgno: u32) -> Result<Arc<Page>> {
        if pgno == 0 || pgno > self.page_count.load(Ordering::SeqCst) {
            return Err(Error::PageNotFound(pgno));
        }
        self.cache.acquire(pgno as u64)
    }

    /// Drops one reference to `page`; the last release writes a dirty
    /// page back to disk.
    pub fn release_page(&self, page: &Page) -> Result<()> {
        self.cache.release(page.number() as u64)
    }

    /// Synchronous write-through, independent of reference counts.
    pub fn flush_page(&self, page: &Page) -> Result<()> {
        self.file.write_page(page)?;
        page.clear_dirty();
        Ok(())
    }

    /// Recovery only: truncates the backing file to exactly `max_pgno`
    /// pages, discarding allocation-only crash artifacts past it.
    pub fn truncate_to(&self, max_pgno: u32) -> Result<()> {
        self.file.file.set_len(max_pgno as u64 * PAGE_SIZE as u64)?;
        self.file.file.sync_all()?;
        self.page_count.store(max_pgno, Ordering::SeqCst);
        Ok(())
    }

    pub fn page_count(&self) -> u32 {
        self.page_count.load(Ordering::SeqCst)
    }

    /// Evicts every cached page, writing dirty ones back. Shutdown only.
    pub fn close(&self) -> Result<()> {
        self.cache.close()
    }
}
