// Single-pass VarRW adapter.
//
// Most routes are read once, maybe have one or two variables rewritten, and
// are then committed. SingleVarRW turns a backend that only knows how to read
// or write one variable at a time into a VarRW with:
// 1. A per-run cache - every id hits the backend at most once per run
// 2. Lazy bulk initialization - start_read runs on the first read only
// 3. Buffered writes - the backend sees writes only at sync, in ascending id
//    order, bracketed by start_write/end_write, and not at all when nothing
//    was modified

use log::debug;
use std::collections::{BTreeMap, BTreeSet};

use crate::element::Element;
use crate::varrw::{VarId, VarRW};

// ============================================================================
// Backend hooks
// ============================================================================

/// Bulk initializer handed to `SingleVarBackend::start_read`
pub struct VarInit<'a> {
    cache: &'a mut BTreeMap<VarId, Element>,
}

impl<'a> VarInit<'a> {
    /// Pre-populates `id`. `None` leaves it to `single_read`; an id already
    /// written during this run keeps its written value.
    pub fn initialize(&mut self, id: VarId, value: Option<Element>) {
        if let Some(value) = value {
            self.cache.entry(id).or_insert(value);
        }
    }
}

/// One-variable-at-a-time access to the underlying route
pub trait SingleVarBackend {
    /// Called once, on the first read of a run
    fn start_read(&mut self, _init: &mut VarInit<'_>) {}

    /// Value of an id not pre-populated by `start_read`. `None` reads as Null.
    fn single_read(&mut self, id: VarId) -> Option<Element>;

    /// Called before the first `single_write` of a sync
    fn start_write(&mut self) {}

    /// Commits one modified variable
    fn single_write(&mut self, id: VarId, value: &Element);

    /// Called after the last `single_write` of a sync
    fn end_write(&mut self) {}

    fn trace_allowed(&self) -> bool {
        true
    }
}

// ============================================================================
// Adapter
// ============================================================================

/// Caching, write-buffering VarRW over a `SingleVarBackend`
#[derive(Debug)]
pub struct SingleVarRW<B> {
    backend: B,
    cache: BTreeMap<VarId, Element>,
    modified: BTreeSet<VarId>,
    did_first_read: bool,
}

impl<B: SingleVarBackend> SingleVarRW<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            cache: BTreeMap::new(),
            modified: BTreeSet::new(),
            did_first_read: false,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Mutable access to the backend, e.g. to point it at the next route.
    /// Any cached state from an unfinished run is dropped.
    pub fn backend_mut(&mut self) -> &mut B {
        self.reset();
        &mut self.backend
    }

    pub fn into_inner(self) -> B {
        self.backend
    }

    /// True if `id` was written since the last sync
    pub fn is_modified(&self, id: VarId) -> bool {
        self.modified.contains(&id)
    }

    fn reset(&mut self) {
        self.cache.clear();
        self.modified.clear();
        self.did_first_read = false;
    }
}

impl<B: SingleVarBackend> VarRW for SingleVarRW<B> {
    fn read(&mut self, id: VarId) -> Element {
        if !self.did_first_read {
            self.did_first_read = true;
            let mut init = VarInit {
                cache: &mut self.cache,
            };
            self.backend.start_read(&mut init);
        }

        if let Some(value) = self.cache.get(&id) {
            return value.clone();
        }

        let value = self.backend.single_read(id).unwrap_or(Element::Null);
        self.cache.insert(id, value.clone());
        value
    }

    fn write(&mut self, id: VarId, value: Element) {
        self.cache.insert(id, value);
        self.modified.insert(id);
    }

    fn sync(&mut self) {
        if !self.modified.is_empty() {
            debug!("Committing {} modified variable(s)", self.modified.len());
            self.backend.start_write();
            for id in &self.modified {
                if let Some(value) = self.cache.get(id) {
                    self.backend.single_write(*id, value);
                }
            }
            self.backend.end_write();
        }
        self.reset();
    }

    fn trace_allowed(&self) -> bool {
        self.backend.trace_allowed()
    }

    fn discard(&mut self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every hook call
    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
        preload: Vec<(VarId, Element)>,
    }

    impl SingleVarBackend for Recorder {
        fn start_read(&mut self, init: &mut VarInit<'_>) {
            self.calls.push("start_read".into());
            for (id, value) in &self.preload {
                init.initialize(*id, Some(value.clone()));
            }
        }

        fn single_read(&mut self, id: VarId) -> Option<Element> {
            self.calls.push(format!("read {}", id));
            if id == VarId::protocol(0) {
                Some(Element::U32(7))
            } else {
                None
            }
        }

        fn start_write(&mut self) {
            self.calls.push("start_write".into());
        }

        fn single_write(&mut self, id: VarId, value: &Element) {
            self.calls.push(format!("write {}={}", id, value));
        }

        fn end_write(&mut self) {
            self.calls.push("end_write".into());
        }
    }

    #[test]
    fn reads_hit_backend_once_per_run() {
        let mut rw = SingleVarRW::new(Recorder::default());
        assert_eq!(rw.read(VarId::PROTOCOL), Element::U32(7));
        assert_eq!(rw.read(VarId::PROTOCOL), Element::U32(7));
        assert_eq!(rw.read(VarId::protocol(1)), Element::Null);
        assert_eq!(rw.read(VarId::protocol(1)), Element::Null);
        assert_eq!(rw.backend().calls, vec!["start_read", "read 5", "read 6"]);
    }

    #[test]
    fn preloaded_values_skip_single_read() {
        let backend = Recorder {
            preload: vec![(VarId::POLICYTAGS, Element::U32(1))],
            ..Default::default()
        };
        let mut rw = SingleVarRW::new(backend);
        assert_eq!(rw.read(VarId::POLICYTAGS), Element::U32(1));
        assert_eq!(rw.backend().calls, vec!["start_read"]);
    }

    #[test]
    fn writes_are_buffered_until_sync() {
        let backend = Recorder {
            preload: vec![(VarId::POLICYTAGS, Element::U32(1))],
            ..Default::default()
        };
        let mut rw = SingleVarRW::new(backend);

        rw.write(VarId::protocol(3), Element::U32(30));
        rw.write(VarId::POLICYTAGS, Element::U32(2));
        assert!(rw.is_modified(VarId::POLICYTAGS));
        // Written before the first read: start_read must not clobber it.
        assert_eq!(rw.read(VarId::POLICYTAGS), Element::U32(2));
        assert_eq!(rw.backend().calls, vec!["start_read"]);

        rw.sync();
        assert_eq!(
            rw.backend().calls,
            vec!["start_read", "start_write", "write 1=2", "write 8=30", "end_write"]
        );
        assert!(!rw.is_modified(VarId::POLICYTAGS));
    }

    #[test]
    fn sync_without_writes_touches_nothing() {
        let mut rw = SingleVarRW::new(Recorder::default());
        rw.read(VarId::PROTOCOL);
        rw.sync();
        assert_eq!(rw.backend().calls, vec!["start_read", "read 5"]);

        // Next run starts from a cold cache.
        rw.read(VarId::PROTOCOL);
        assert_eq!(
            rw.backend().calls,
            vec!["start_read", "read 5", "start_read", "read 5"]
        );
    }

    #[test]
    fn discard_drops_buffered_writes() {
        let mut rw = SingleVarRW::new(Recorder::default());
        rw.write(VarId::POLICYTAGS, Element::U32(9));
        rw.discard();
        rw.sync();
        assert!(rw.into_inner().calls.is_empty());
    }
}
