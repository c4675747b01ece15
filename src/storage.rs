//! Page-oriented storage.
//!
//! - **Page**: fixed-size 8 KiB buffer, the basic unit of I/O, with the
//!   normal-page record layout (free-space offset + appended records)
//! - **PageCache**: owns the backing file and maps page numbers into
//!   memory through the reference-counted cache
//! - **FreeSpaceIndex**: bucketed in-memory index used to pick an
//!   insertion target without scanning pages
//! - first page: metadata page carrying the crash marker that decides
//!   whether recovery must run at open

pub mod free_space;
pub mod page;
pub mod page_cache;
pub mod page_one;

pub use free_space::{FreeSpaceIndex, PageSpace};
pub use page::{Page, MAX_FREE_SPACE, PAGE_SIZE};
pub use page_cache::PageCache;
