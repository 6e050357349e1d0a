use std::sync::Mutex;

use crate::handle::Handle;

/// Opaque TPM-produced context blob: the only externalizable form of a
/// saved transient object. Produced by `context_saveflush`, consumed by
/// `context_load`.
pub type ContextBlob = Vec<u8>;

struct Inner {
    /// Non-zero when the context is currently loaded in the TPM; zero
    /// when it has been saved and evicted.
    phandle: Option<Handle>,
    /// The most recent saved context for this vhandle. Overwritten on
    /// every saveflush; empty until the first one.
    context_blob: ContextBlob,
}

/// Binding of `(vhandle, phandle, context_blob)` for one transient
/// object.
///
/// `vhandle` is fixed at construction and never changes. `phandle` and
/// `context_blob` are mutated in lockstep by the virtualizer over the
/// life of the entry: a load clears `context_blob`'s staleness by
/// setting `phandle`, a saveflush clears `phandle` back to `None` and
/// refreshes `context_blob`. The mutable state is behind a `Mutex`
/// rather than `&mut self` because entries are reference-counted and
/// may be read by the connection-teardown path while the dispatch
/// worker still holds a clone from an in-flight command's loaded set.
pub struct HandleMapEntry {
    vhandle: Handle,
    inner: Mutex<Inner>,
}

impl HandleMapEntry {
    /// A freshly virtualized entry: the object is currently loaded at
    /// `phandle`, no context has been saved yet.
    pub fn new_loaded(vhandle: Handle, phandle: Handle) -> HandleMapEntry {
        HandleMapEntry {
            vhandle,
            inner: Mutex::new(Inner {
                phandle: Some(phandle),
                context_blob: ContextBlob::new(),
            }),
        }
    }

    /// The immutable vhandle this entry is keyed under.
    pub fn vhandle(&self) -> Handle {
        self.vhandle
    }

    /// The current physical handle, if the context is loaded.
    pub fn phandle(&self) -> Option<Handle> {
        self.inner.lock().unwrap().phandle
    }

    /// True once a save has produced a context blob (even if it's since
    /// been reloaded).
    pub fn has_context(&self) -> bool {
        !self.inner.lock().unwrap().context_blob.is_empty()
    }

    /// A clone of the current context blob, for handing to
    /// `context_load`. Empty for an entry that has never been saved.
    pub fn context_blob(&self) -> ContextBlob {
        self.inner.lock().unwrap().context_blob.clone()
    }

    /// Record a successful `context_load`: the object is now loaded at
    /// `phandle`.
    pub fn mark_loaded(&self, phandle: Handle) {
        self.inner.lock().unwrap().phandle = Some(phandle);
    }

    /// Record a successful `context_saveflush`: the object has been
    /// evicted, replacing the stored context with the freshly saved one.
    pub fn mark_saved(&self, blob: ContextBlob) {
        let mut inner = self.inner.lock().unwrap();
        inner.phandle = None;
        inner.context_blob = blob;
    }
}

impl std::fmt::Debug for HandleMapEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("HandleMapEntry")
            .field("vhandle", &self.vhandle)
            .field("phandle", &inner.phandle)
            .field("context_len", &inner.context_blob.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loaded_then_saved_round_trips() {
        let entry = HandleMapEntry::new_loaded(Handle::new(0x8000_0000), Handle::new(0x8000_0001));
        assert_eq!(entry.phandle(), Some(Handle::new(0x8000_0001)));
        assert!(!entry.has_context());

        entry.mark_saved(vec![1, 2, 3]);
        assert_eq!(entry.phandle(), None);
        assert!(entry.has_context());
        assert_eq!(entry.context_blob(), vec![1, 2, 3]);

        entry.mark_loaded(Handle::new(0x8000_0002));
        assert_eq!(entry.phandle(), Some(Handle::new(0x8000_0002)));
        // saved blob remains available until the next saveflush
        assert_eq!(entry.context_blob(), vec![1, 2, 3]);
    }
}
