//! Per-connection bidirectional virtual-handle map.
//!
//! Owned exclusively by its [`crate::connection::Connection`]; entries
//! are reference-counted (`Arc`) so that a command mid-flight through
//! the dispatch worker can keep using its entry even if the connection
//! tears the map down concurrently.

mod entry;

pub use entry::ContextBlob;
pub use entry::HandleMapEntry;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use crate::error::Error;
use crate::handle::Handle;

struct Inner {
    entries: HashMap<Handle, Arc<HandleMapEntry>>,
    /// `None` once the transient range has been exhausted.
    next_vhandle: Option<u32>,
    capacity: u32,
}

/// A connection's transient-handle table: `vhandle -> HandleMapEntry`,
/// plus the monotone allocator that produces new vhandles.
///
/// All mutating operations take `&self`: the map is shared (via `Arc`)
/// between the owning connection and the dispatch worker that's
/// currently processing one of its commands, so its bookkeeping lives
/// behind a `Mutex` rather than requiring `&mut self`.
pub struct HandleMap {
    inner: Mutex<Inner>,
}

impl HandleMap {
    /// A fresh, empty map with the given capacity, allocating vhandles
    /// starting at `transient_handle_base`.
    pub fn new(capacity: u32, transient_handle_base: u32) -> HandleMap {
        HandleMap {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                next_vhandle: Some(transient_handle_base),
                capacity,
            }),
        }
    }

    /// A map using [`crate::config::ResourceManagerConfig`]'s defaults.
    pub fn with_config(config: &crate::config::ResourceManagerConfig) -> HandleMap {
        HandleMap::new(config.handle_map_capacity, config.transient_handle_base)
    }

    /// O(1) expected lookup, returning an owned (ref-counted) handle to
    /// the entry so the caller can keep using it past a concurrent
    /// removal.
    pub fn lookup(&self, vhandle: Handle) -> Option<Arc<HandleMapEntry>> {
        self.inner.lock().unwrap().entries.get(&vhandle).cloned()
    }

    /// Insert a new entry under `vhandle`. Fails with
    /// [`Error::Duplicate`] if the vhandle is already present, or
    /// [`Error::Full`] if the map is at capacity.
    ///
    /// Capacity is only enforced here, for newly allocated vhandles; it
    /// does not apply when reinserting a known vhandle, which this
    /// crate never does (entries are only ever inserted once, at
    /// virtualization time).
    pub fn insert(&self, vhandle: Handle, entry: HandleMapEntry) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.contains_key(&vhandle) {
            return Err(Error::Duplicate(vhandle));
        }
        if inner.entries.len() as u32 >= inner.capacity {
            return Err(Error::Full);
        }
        inner.entries.insert(vhandle, Arc::new(entry));
        Ok(())
    }

    /// Remove the entry for `vhandle`, if any. Idempotent: removing an
    /// absent vhandle is not an error, it simply returns `false`.
    pub fn remove(&self, vhandle: Handle) -> bool {
        self.inner.lock().unwrap().entries.remove(&vhandle).is_some()
    }

    /// Allocate the next unused vhandle in the transient range. Returns
    /// `None` if the counter has exhausted the 32-bit space below the
    /// next handle-kind boundary; the caller treats this as fatal.
    ///
    /// This does not itself check capacity; `insert` is the single
    /// point that enforces the cap, so a caller must always pair a
    /// successful `next_vhandle` with an `insert` attempt.
    pub fn next_vhandle(&self) -> Option<Handle> {
        let mut inner = self.inner.lock().unwrap();
        let candidate = inner.next_vhandle?;
        let kind = (candidate >> 24) as u8;

        // the candidate itself is always valid (it was the previous
        // call's "next", checked before being stored); once we hand it
        // out, work out whether there's a valid successor, and mark the
        // counter exhausted in `inner` if not, so later calls fail
        // immediately rather than wrapping into another handle kind.
        match candidate.overflowing_add(1) {
            (next, false) if (next >> 24) as u8 == kind => inner.next_vhandle = Some(next),
            _ => inner.next_vhandle = None,
        }

        Some(Handle::new(candidate))
    }

    /// True once `count == capacity`; used by the quota gate before
    /// dispatching a command known to create a new transient object.
    pub fn is_full(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.entries.len() as u32 >= inner.capacity
    }

    /// Number of live entries.
    pub fn count(&self) -> u32 {
        self.inner.lock().unwrap().entries.len() as u32
    }

    /// Drain every entry. Called when the owning connection closes;
    /// entries held elsewhere via `Arc` remain valid for as long as an
    /// in-flight command needs them, they're simply removed from the
    /// map itself.
    pub fn clear(&self) {
        self.inner.lock().unwrap().entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_at(vhandle: Handle) -> HandleMapEntry {
        HandleMapEntry::new_loaded(vhandle, Handle::new(0x8000_1000))
    }

    #[test]
    fn insert_lookup_remove() {
        let map = HandleMap::new(8, 0x8000_0000);
        let v = map.next_vhandle().unwrap();
        map.insert(v, entry_at(v)).unwrap();
        assert!(map.lookup(v).is_some());
        assert!(map.remove(v));
        assert!(map.lookup(v).is_none());
        // idempotent
        assert!(!map.remove(v));
    }

    #[test]
    fn duplicate_insert_fails() {
        let map = HandleMap::new(8, 0x8000_0000);
        let v = map.next_vhandle().unwrap();
        map.insert(v, entry_at(v)).unwrap();
        match map.insert(v, entry_at(v)) {
            Err(Error::Duplicate(h)) => assert_eq!(h, v),
            other => panic!("expected Duplicate, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn capacity_enforced_on_new_vhandles_only() {
        let map = HandleMap::new(1, 0x8000_0000);
        let v1 = map.next_vhandle().unwrap();
        map.insert(v1, entry_at(v1)).unwrap();
        assert!(map.is_full());

        let v2 = map.next_vhandle().unwrap();
        match map.insert(v2, entry_at(v2)) {
            Err(Error::Full) => {}
            other => panic!("expected Full, got {:?}", other.map(|_| ())),
        }
        assert_eq!(map.count(), 1);
    }

    #[test]
    fn vhandles_are_unique_and_increasing() {
        let map = HandleMap::new(8, 0x8000_0000);
        let v1 = map.next_vhandle().unwrap();
        let v2 = map.next_vhandle().unwrap();
        assert_ne!(v1, v2);
        assert!(v2.raw() > v1.raw());
    }

    #[test]
    fn exhaustion_is_none_not_a_wrap() {
        // base one below the transient/persistent boundary
        let map = HandleMap::new(8, 0x80ff_ffff);
        assert!(map.next_vhandle().is_some());
        assert!(map.next_vhandle().is_none());
    }

    #[test]
    fn clear_drains_all_entries() {
        let map = HandleMap::new(8, 0x8000_0000);
        let v = map.next_vhandle().unwrap();
        map.insert(v, entry_at(v)).unwrap();
        assert_eq!(map.count(), 1);
        map.clear();
        assert_eq!(map.count(), 0);
    }

    #[test]
    fn lookup_keeps_entry_alive_past_removal() {
        let map = HandleMap::new(8, 0x8000_0000);
        let v = map.next_vhandle().unwrap();
        map.insert(v, entry_at(v)).unwrap();
        let held = map.lookup(v).unwrap();
        assert!(map.remove(v));
        // the Arc clone is still usable even though the map no longer
        // knows about it
        assert_eq!(held.vhandle(), v);
    }
}
