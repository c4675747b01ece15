use parking_lot::Mutex;

use super::page::PAGE_SIZE;

// A page's free space is bucketed into 40 intervals of
// PAGE_SIZE / 40 bytes each.
const INTERVALS: usize = 40;
const THRESHOLD: usize = PAGE_SIZE / INTERVALS;

/// A page known to have roughly `free` bytes available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSpace {
    pub pgno: u32,
    pub free: usize,
}

/// Advisory in-memory index of pages by approximate free space.
///
/// Entries are consumed by [`FreeSpaceIndex::select`] and must be
/// re-added by the caller with the page's updated free space once the
/// insert completes. A lost entry is safe: the page is simply not
/// reused until the index is rebuilt at the next open.
pub struct FreeSpaceIndex {
    buckets: Mutex<Vec<Vec<PageSpace>>>,
}

impl FreeSpaceIndex {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(vec![Vec::new(); INTERVALS + 1]),
        }
    }

    pub fn add(&self, pgno: u32, free: usize) {
        let mut buckets = self.buckets.lock();
        let number = (free / THRESHOLD).min(INTERVALS);
        buckets[number].push(PageSpace { pgno, free });
    }

    /// Picks a page with at least `required` free bytes, removing it
    /// from the index. Rounds the bucket up one interval so bucket
    /// granularity can never hand out a short page; the top bucket is
    /// capped rather than rounded past, so entries there are checked
    /// against `required` exactly.
    pub fn select(&self, required: usize) -> Option<PageSpace> {
        let mut buckets = self.buckets.lock();
        let mut number = required / THRESHOLD;
        if number < INTERVALS {
            number += 1;
        }
        while number <= INTERVALS {
            if let Some(i) = buckets[number].iter().position(|e| e.free >= required) {
                return Some(buckets[number].remove(i));
            }
            number += 1;
        }
        None
    }
}

impl Default for FreeSpaceIndex {
    fn default() -> Self {
        Self::new()
    }
}
