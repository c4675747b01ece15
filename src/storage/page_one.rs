//! The first page of the database file.
//!
//! Page 1 holds no records, only a crash marker: 8 random bytes written
//! at one offset when the store is opened and copied to a second offset
//! on clean shutdown. If the two ranges disagree at open, the previous
//! process died without closing and recovery must run first.

use rand::Rng;

use super::page::{Page, PAGE_SIZE};

const CHECK_OFFSET: usize = 100;
const CHECK_LEN: usize = 8;

pub fn init_raw() -> Box<[u8; PAGE_SIZE]> {
    Box::new([0u8; PAGE_SIZE])
}

/// Stamps a fresh random open marker, invalidating the close copy.
pub fn stamp_open(page: &Page) {
    let mut stamp = [0u8; CHECK_LEN];
    rand::thread_rng().fill(&mut stamp[..]);
    let mut data = page.lock();
    data[CHECK_OFFSET..CHECK_OFFSET + CHECK_LEN].copy_from_slice(&stamp);
    drop(data);
    page.set_dirty();
}

/// Copies the open marker into the close slot on clean shutdown.
pub fn stamp_close(page: &Page) {
    let mut data = page.lock();
    let (open_half, close_half) = data[CHECK_OFFSET..CHECK_OFFSET + 2 * CHECK_LEN]
        .split_at_mut(CHECK_LEN);
    close_half.copy_from_slice(open_half);
    drop(data);
    page.set_dirty();
}

/// True when the previous shutdown was clean.
pub fn is_valid(page: &Page) -> bool {
    let data = page.lock();
    data[CHECK_OFFSET..CHECK_OFFSET + CHECK_LEN]
        == data[CHECK_OFFSET + CHECK_LEN..CHECK_OFFSET + 2 * CHECK_LEN]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_shutdown_round_trip() {
        let page = Page::new(1, init_raw());

        // A zeroed page compares equal, so stamp first.
        stamp_open(&page);
        assert!(!is_valid(&page));

        stamp_close(&page);
        assert!(is_valid(&page));

        // Re-opening invalidates the marker again.
        stamp_open(&page);
        assert!(!is_valid(&page));
    }
}
