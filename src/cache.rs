//! Generic reference-counted cache.
//!
//! Values are fetched on miss by a caller-supplied closure and handed
//! out shared; each [`RefCache::acquire`] must be paired with a
//! [`RefCache::release`]. When the count reaches zero the value is
//! evicted synchronously through the eviction handler, so a dirty page
//! is on disk before the next fetch of the same key can observe it.
//!
//! While a key is being fetched or written back it sits in a `busy` set
//! and concurrent acquirers of that key block on a condvar. Both
//! handlers run outside the state lock; only bookkeeping happens under
//! it.

use std::collections::{HashMap, HashSet};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

pub type FetchFn<T> = Box<dyn Fn(u64) -> Result<T> + Send + Sync>;
pub type EvictFn<T> = Box<dyn Fn(&T) -> Result<()> + Send + Sync>;

struct Slot<T> {
    value: T,
    refs: usize,
}

struct State<T> {
    slots: HashMap<u64, Slot<T>>,
    busy: HashSet<u64>,
}

pub struct RefCache<T: Clone> {
    state: Mutex<State<T>>,
    cond: Condvar,
    /// Maximum number of resident-or-busy keys; 0 means unbounded.
    capacity: usize,
    fetch: FetchFn<T>,
    evict: EvictFn<T>,
}

impl<T: Clone> RefCache<T> {
    pub fn new(capacity: usize, fetch: FetchFn<T>, evict: EvictFn<T>) -> Self {
        Self {
            state: Mutex::new(State {
                slots: HashMap::new(),
                busy: HashSet::new(),
            }),
            cond: Condvar::new(),
            capacity,
            fetch,
            evict,
        }
    }

    /// Returns the cached value for `key`, fetching it on miss. Blocks
    /// while another thread is fetching or evicting the same key.
    pub fn acquire(&self, key: u64) -> Result<T> {
        let mut state = self.state.lock();
        loop {
            if state.busy.contains(&key) {
                self.cond.wait(&mut state);
                continue;
            }
            if let Some(slot) = state.slots.get_mut(&key) {
                slot.refs += 1;
                return Ok(slot.value.clone());
            }
            if self.capacity > 0 && state.slots.len() + state.busy.len() >= self.capacity {
                return Err(Error::CacheFull);
            }
            break;
        }

        // Reserve the key, fetch outside the lock.
        state.busy.insert(key);
        drop(state);

        let fetched = (self.fetch)(key);

        let mut state = self.state.lock();
        state.busy.remove(&key);
        self.cond.notify_all();
        let value = fetched?;
        state.slots.insert(
            key,
            Slot {
                value: value.clone(),
                refs: 1,
            },
        );
        Ok(value)
    }

    /// Drops one reference. The last release removes the value and runs
    /// the eviction handler before any new acquire of the same key can
    /// fetch.
    pub fn release(&self, key: u64) -> Result<()> {
        let mut state = self.state.lock();
        let slot = state
            .slots
            .get_mut(&key)
            .ok_or(Error::UnreferencedKey(key))?;
        slot.refs -= 1;
        if slot.refs > 0 {
            return Ok(());
        }
        let slot = state.slots.remove(&key).unwrap();
        state.busy.insert(key);
        drop(state);

        let evicted = (self.evict)(&slot.value);

        let mut state = self.state.lock();
        state.busy.remove(&key);
        drop(state);
        self.cond.notify_all();
        evicted
    }

    /// Evicts every cached value regardless of reference counts.
    /// Shutdown only; concurrent use of the cache afterwards is a bug.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        let slots = std::mem::take(&mut state.slots);
        drop(state);
        for slot in slots.values() {
            (self.evict)(&slot.value)?;
        }
        Ok(())
    }
}
