//! Range-keyed physical-access handlers: ROM write protection, MMIO2 dirty
//! tracking, device MMIO.

use crate::{GcPhys, PgmError, PgmResult};

/// What kinds of access invoke the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessHandlerKind {
    /// Only writes are intercepted; reads go straight to the page.
    Write,

    /// Every access is intercepted.
    All,
}

/// The access that triggered a handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    /// A read access.
    Read,

    /// A write access.
    Write,
}

/// What the handler wants done after it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerAction {
    /// The engine should perform the access against the backing page.
    DoDefault,

    /// The handler fully serviced the access.
    Handled,
}

/// The callback invoked when a guest access falls into a handled range.
pub type HandlerCallback = Box<dyn FnMut(GcPhys, AccessKind) -> HandlerAction + Send>;

/// A registered physical access handler.
pub struct AccessHandler {
    first: GcPhys,
    last: GcPhys,
    kind: AccessHandlerKind,
    desc: String,
    callback: HandlerCallback,
}

impl AccessHandler {
    /// The first address covered (inclusive).
    pub fn first(&self) -> GcPhys {
        self.first
    }

    /// The last address covered (inclusive).
    pub fn last(&self) -> GcPhys {
        self.last
    }

    /// The kinds of access this handler intercepts.
    pub fn kind(&self) -> AccessHandlerKind {
        self.kind
    }

    /// The description given at registration.
    pub fn desc(&self) -> &str {
        &self.desc
    }

    /// Invokes the callback.
    pub fn invoke(&mut self, gc_phys: GcPhys, access: AccessKind) -> HandlerAction {
        (self.callback)(gc_phys, access)
    }
}

impl std::fmt::Debug for AccessHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("AccessHandler")
            .field("first", &self.first)
            .field("last", &self.last)
            .field("kind", &self.kind)
            .field("desc", &self.desc)
            .finish_non_exhaustive()
    }
}

/// A stable handle to a registered handler (its slab slot).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerHandle(u32);

/// The default slab capacity.
pub const HANDLER_CAPACITY: usize = 0x1000;

/// The reduced slab capacity used in the simplified "driverless" setup.
pub const HANDLER_CAPACITY_DRIVERLESS: usize = 32;

/// A range-keyed collection of [`AccessHandler`]s over a fixed-capacity
/// slab, with an address-sorted index searched by binary descent.
pub struct AccessHandlerTree {
    slab: Vec<Option<AccessHandler>>,
    free: Vec<u32>,

    /// Slab slots sorted by `first` address. Disjointness of the registered
    /// ranges makes this a total order.
    index: Vec<u32>,
}

impl AccessHandlerTree {
    /// Creates a tree with the given slab capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slab: (0..capacity).map(|_| None).collect(),
            free: (0..capacity as u32).rev().collect(),
            index: Vec::new(),
        }
    }

    /// Creates a tree with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(HANDLER_CAPACITY)
    }

    /// The number of registered handlers.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn entry(&self, slot: u32) -> &AccessHandler {
        self.slab[slot as usize]
            .as_ref()
            .expect("index references an empty slab slot")
    }

    /// Registers a handler over `[first, last]`.
    pub fn register(
        &mut self,
        kind: AccessHandlerKind,
        first: GcPhys,
        last: GcPhys,
        callback: HandlerCallback,
        desc: &str,
    ) -> PgmResult<HandlerHandle> {
        if first > last {
            return Err(PgmError::InvalidParameter("inverted range"));
        }

        // Position of the first handler starting at or after `first`.
        let pos = self
            .index
            .partition_point(|&slot| self.entry(slot).first < first);
        if pos > 0 {
            let prev = self.entry(self.index[pos - 1]);
            if prev.last >= first {
                return Err(PgmError::Conflict(prev.first));
            }
        }
        if let Some(&next_slot) = self.index.get(pos) {
            let next = self.entry(next_slot);
            if next.first <= last {
                return Err(PgmError::Conflict(next.first));
            }
        }

        let slot = self.free.pop().ok_or(PgmError::OutOfCapacity)?;
        tracing::debug!(%first, %last, ?kind, desc, slot, "registering access handler");

        self.slab[slot as usize] = Some(AccessHandler {
            first,
            last,
            kind,
            desc: desc.to_string(),
            callback,
        });
        self.index.insert(pos, slot);
        Ok(HandlerHandle(slot))
    }

    /// Removes a handler. Removing an already-removed handle is an error.
    pub fn deregister(&mut self, handle: HandlerHandle) -> PgmResult<()> {
        let slot = handle.0;
        if self.slab.get(slot as usize).map(Option::is_some) != Some(true) {
            return Err(PgmError::InvalidParameter("stale handler handle"));
        }

        let pos = self
            .index
            .iter()
            .position(|&s| s == slot)
            .ok_or(PgmError::Corruption("handler slab/index disagree"))?;
        self.index.remove(pos);
        self.slab[slot as usize] = None;
        self.free.push(slot);
        Ok(())
    }

    /// Looks up the handler covering the given address. A miss is a normal,
    /// non-error outcome.
    pub fn lookup(&self, gc_phys: GcPhys) -> Option<(HandlerHandle, &AccessHandler)> {
        let pos = self
            .index
            .partition_point(|&slot| self.entry(slot).first <= gc_phys);
        if pos == 0 {
            return None;
        }

        let slot = self.index[pos - 1];
        let handler = self.entry(slot);
        if handler.last >= gc_phys {
            Some((HandlerHandle(slot), handler))
        } else {
            None
        }
    }

    /// Looks up a handler mutably, e.g. to invoke its callback.
    pub fn lookup_mut(&mut self, gc_phys: GcPhys) -> Option<(HandlerHandle, &mut AccessHandler)> {
        let (handle, _) = self.lookup(gc_phys)?;
        let handler = self.slab[handle.0 as usize]
            .as_mut()
            .expect("lookup returned an empty slot");
        Some((handle, handler))
    }

    /// Resolves a handle back to its handler.
    pub fn get(&self, handle: HandlerHandle) -> Option<&AccessHandler> {
        self.slab.get(handle.0 as usize)?.as_ref()
    }

    /// Iterates over the handlers in address order.
    pub fn iter(&self) -> impl Iterator<Item = &AccessHandler> {
        self.index.iter().map(|&slot| self.entry(slot))
    }

    /// Walks the index both left-to-right and right-to-left, asserting
    /// strictly monotonic, non-overlapping keys in both directions, and
    /// cross-checks the slab population against the index. Any mismatch is
    /// a fatal corruption signal.
    pub fn check_integrity(&self) -> PgmResult<()> {
        let mut errors = 0usize;

        let mut prev_last: Option<GcPhys> = None;
        for &slot in &self.index {
            let Some(handler) = self.slab.get(slot as usize).and_then(Option::as_ref) else {
                errors += 1;
                continue;
            };
            if handler.first > handler.last {
                errors += 1;
            }
            if let Some(prev_last) = prev_last {
                if handler.first <= prev_last {
                    errors += 1;
                }
            }
            prev_last = Some(handler.last);
        }

        let mut next_first: Option<GcPhys> = None;
        for &slot in self.index.iter().rev() {
            let Some(handler) = self.slab.get(slot as usize).and_then(Option::as_ref) else {
                errors += 1;
                continue;
            };
            if let Some(next_first) = next_first {
                if handler.last >= next_first {
                    errors += 1;
                }
            }
            next_first = Some(handler.first);
        }

        let populated = self.slab.iter().filter(|slot| slot.is_some()).count();
        if populated != self.index.len() {
            errors += 1;
        }
        if self.free.len() + populated != self.slab.len() {
            errors += 1;
        }

        if errors != 0 {
            tracing::error!(errors, "access handler tree corrupt");
            return Err(PgmError::Corruption("access handler tree"));
        }
        Ok(())
    }
}

impl Default for AccessHandlerTree {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AccessHandlerTree {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("AccessHandlerTree")
            .field("len", &self.len())
            .field("capacity", &self.slab.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop() -> HandlerCallback {
        Box::new(|_, _| HandlerAction::DoDefault)
    }

    #[test]
    fn register_and_lookup() {
        let mut tree = AccessHandlerTree::new();
        let handle = tree
            .register(
                AccessHandlerKind::Write,
                GcPhys(0xC0000),
                GcPhys(0xC7FFF),
                nop(),
                "ROM",
            )
            .unwrap();

        let (found, handler) = tree.lookup(GcPhys(0xC4000)).unwrap();
        assert_eq!(found, handle);
        assert_eq!(handler.desc(), "ROM");

        assert!(tree.lookup(GcPhys(0xD0000)).is_none());
        assert!(tree.lookup(GcPhys(0xBFFFF)).is_none());

        // Boundary addresses are inside.
        assert!(tree.lookup(GcPhys(0xC0000)).is_some());
        assert!(tree.lookup(GcPhys(0xC7FFF)).is_some());
    }

    #[test]
    fn overlapping_registration_conflicts() {
        let mut tree = AccessHandlerTree::new();
        tree.register(
            AccessHandlerKind::All,
            GcPhys(0x1000),
            GcPhys(0x2FFF),
            nop(),
            "a",
        )
        .unwrap();

        for (first, last) in [
            (0x0u64, 0x1000u64),
            (0x2FFF, 0x4000),
            (0x1800, 0x1FFF),
            (0x0, 0xFFFF),
        ] {
            let err = tree
                .register(
                    AccessHandlerKind::All,
                    GcPhys(first),
                    GcPhys(last),
                    nop(),
                    "b",
                )
                .unwrap_err();
            assert!(matches!(err, PgmError::Conflict(_)), "{first:#x}-{last:#x}");
        }
    }

    #[test]
    fn capacity_is_bounded() {
        let mut tree = AccessHandlerTree::with_capacity(2);
        tree.register(AccessHandlerKind::All, GcPhys(0x0), GcPhys(0xFFF), nop(), "a")
            .unwrap();
        tree.register(
            AccessHandlerKind::All,
            GcPhys(0x1000),
            GcPhys(0x1FFF),
            nop(),
            "b",
        )
        .unwrap();

        let err = tree
            .register(
                AccessHandlerKind::All,
                GcPhys(0x2000),
                GcPhys(0x2FFF),
                nop(),
                "c",
            )
            .unwrap_err();
        assert!(matches!(err, PgmError::OutOfCapacity));
    }

    #[test]
    fn deregister_frees_the_slot() {
        let mut tree = AccessHandlerTree::with_capacity(1);
        let handle = tree
            .register(AccessHandlerKind::All, GcPhys(0x0), GcPhys(0xFFF), nop(), "a")
            .unwrap();
        tree.deregister(handle).unwrap();
        assert!(tree.lookup(GcPhys(0x0)).is_none());

        // Slot is reusable, and the stale handle is rejected.
        tree.register(
            AccessHandlerKind::All,
            GcPhys(0x5000),
            GcPhys(0x5FFF),
            nop(),
            "b",
        )
        .unwrap();
        tree.check_integrity().unwrap();
    }

    #[test]
    fn integrity_after_many_disjoint_registrations() {
        let mut tree = AccessHandlerTree::new();
        // Register out of order to exercise the sorted insert.
        for i in (0..64u64).rev() {
            tree.register(
                AccessHandlerKind::Write,
                GcPhys(i * 0x10000),
                GcPhys(i * 0x10000 + 0xFFF),
                nop(),
                "range",
            )
            .unwrap();
        }

        tree.check_integrity().unwrap();
        assert_eq!(tree.len(), 64);

        for i in 0..64u64 {
            let (_, handler) = tree.lookup(GcPhys(i * 0x10000 + 0x800)).unwrap();
            assert_eq!(handler.first(), GcPhys(i * 0x10000));
            assert!(tree.lookup(GcPhys(i * 0x10000 + 0x1000)).is_none());
        }
    }

    #[test]
    fn callbacks_fire() {
        let mut tree = AccessHandlerTree::new();
        let hits = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let hits2 = hits.clone();

        tree.register(
            AccessHandlerKind::Write,
            GcPhys(0x1000),
            GcPhys(0x1FFF),
            Box::new(move |_, access| {
                assert_eq!(access, AccessKind::Write);
                hits2.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                HandlerAction::Handled
            }),
            "counter",
        )
        .unwrap();

        let (_, handler) = tree.lookup_mut(GcPhys(0x1800)).unwrap();
        assert_eq!(
            handler.invoke(GcPhys(0x1800), AccessKind::Write),
            HandlerAction::Handled
        );
        assert_eq!(hits.load(std::sync::atomic::Ordering::Relaxed), 1);
    }
}
