//! Handle and transition registry.
//!
//! The registry owns the handle table mapping stub addresses back to their
//! wrappers, the adoption table for extension-owned instances, and the
//! deferred release queue. All mutation happens under the bridge's big
//! lock; `Drop` implementations never touch registry state directly, they
//! enqueue work that the next drain applies.
//!
//! Liveness is two-level. The handle table holds weak wrapper references,
//! so a value kept alive only by managed code can die normally. While
//! native code holds references above the managed baseline, the entry pins
//! wrapper and value strongly; the pin is dropped once the count returns
//! to the baseline.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, Weak};

use crate::abi;
use crate::bridge::stub;
use crate::bridge::wrapper::{Delegate, Regime, Wrapper, WrapperInner};
use crate::bridge::BridgeStats;
use crate::value::{NativeInstance, NativeRef, RuntimeError, Value};

/// One deferred release, produced when a managed owner dies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingFree {
    /// A counted handle died; its stub can be freed.
    Handle {
        pointer: usize,
        slot: Option<usize>,
    },
    /// The last managed reference to an adopted instance died; the managed
    /// baseline must be subtracted from its reference count.
    Foreign { pointer: usize },
}

/// Queue feeding the registry drain.
///
/// Pushes come from `Drop` implementations on arbitrary threads and must
/// never contend for the big lock, so the queue carries its own small
/// mutex. Disabling the queue (shutdown) silently discards later pushes;
/// by then the stubs they refer to have already been torn down.
#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: Mutex<Vec<PendingFree>>,
    disabled: std::sync::atomic::AtomicBool,
}

impl PendingQueue {
    pub fn new() -> PendingQueue {
        PendingQueue::default()
    }

    pub fn push(&self, free: PendingFree) {
        if self.disabled.load(Ordering::Acquire) {
            return;
        }
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(free);
    }

    pub fn take(&self) -> Vec<PendingFree> {
        std::mem::take(&mut self.entries.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn disable(&self) {
        self.disabled.store(true, Ordering::Release);
        self.take();
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Strong pair kept while native code owns references above the baseline.
#[derive(Debug)]
struct PinnedHandle {
    wrapper: Wrapper,
    value: Value,
}

#[derive(Debug)]
struct HandleSlot {
    wrapper: Weak<WrapperInner>,
    pin: Option<PinnedHandle>,
    pointer: usize,
    /// True when the registry allocated the stub and must free it. Type
    /// struct entries point into arena memory owned by their class.
    owns_stub: bool,
}

/// Result of one drain pass.
///
/// `deallocs` lists adopted instances whose count reached zero; the caller
/// runs their destructors after releasing the big lock, since destructor
/// code may call back into the bridge.
#[derive(Debug, Default)]
pub struct DrainOutcome {
    pub freed_handles: usize,
    pub released_foreign: usize,
    pub unpinned: usize,
    pub deallocs: Vec<usize>,
}

/// Outcome of resolving a native pointer.
pub enum Resolution {
    /// The pointer is a handle stub with a live wrapper.
    Handle(Wrapper),
    /// The pointer is not a handle; it belongs to the native domain.
    Foreign,
}

#[derive(Debug)]
pub struct Registry {
    slots: Vec<Option<HandleSlot>>,
    free_slots: Vec<usize>,
    by_pointer: HashMap<usize, usize>,
    foreign: HashMap<usize, Weak<NativeInstance>>,
    /// Container snapshot identity: delegate address to wrapper. Keeps
    /// repeated transitions of the same string or tuple on one handle.
    identity: HashMap<usize, Weak<WrapperInner>>,
    queue: Arc<PendingQueue>,
    stats: Arc<BridgeStats>,
}

impl Registry {
    pub fn new(queue: Arc<PendingQueue>, stats: Arc<BridgeStats>) -> Registry {
        Registry {
            slots: Vec::new(),
            free_slots: Vec::new(),
            by_pointer: HashMap::new(),
            foreign: HashMap::new(),
            identity: HashMap::new(),
            queue,
            stats,
        }
    }

    pub fn queue(&self) -> &Arc<PendingQueue> {
        &self.queue
    }

    /// Pre-sizes the handle table.
    pub fn reserve(&mut self, capacity: usize) {
        self.slots.reserve(capacity);
        self.by_pointer.reserve(capacity);
    }

    /// Returns the handle wrapper for `value`, creating one on first use.
    ///
    /// Wrapping is idempotent per identity: objects and classes carry
    /// their wrapper in a write-once cell, container snapshots go through
    /// the identity table. Cached primitives never reach this method; the
    /// bridge resolves them against the primitive cache first.
    pub fn wrap(&mut self, value: &Value) -> Wrapper {
        match value {
            Value::Object(obj) => {
                if let Some(existing) = obj.native_wrapper() {
                    return existing.clone();
                }
                let wrapper =
                    Wrapper::counted(Delegate::Object(Arc::downgrade(obj)), self.queue.clone());
                self.stats.handles_created.fetch_add(1, Ordering::Relaxed);
                obj.bind_native_wrapper(wrapper).clone()
            }
            Value::Class(cls) => {
                if let Some(existing) = cls.native_wrapper() {
                    return existing.clone();
                }
                let wrapper =
                    Wrapper::immortal(Delegate::Class(Arc::downgrade(cls)), self.queue.clone());
                self.stats.handles_created.fetch_add(1, Ordering::Relaxed);
                cls.bind_native_wrapper(wrapper).clone()
            }
            Value::Str(s) => {
                let key = Arc::as_ptr(s) as *const u8 as usize;
                self.wrap_snapshot(key, value)
            }
            Value::Tuple(items) => {
                let key = Arc::as_ptr(items) as *const Value as usize;
                self.wrap_snapshot(key, value)
            }
            Value::Native(inst) => {
                Wrapper::unowned(value.clone(), inst.pointer(), self.queue.clone())
            }
            // Uncached numerics get a transient handle per transition.
            _ => {
                self.stats.handles_created.fetch_add(1, Ordering::Relaxed);
                Wrapper::counted(Delegate::Value(value.clone()), self.queue.clone())
            }
        }
    }

    fn wrap_snapshot(&mut self, key: usize, value: &Value) -> Wrapper {
        if let Some(live) = self.identity.get(&key).and_then(Weak::upgrade) {
            return Wrapper::from_inner(live);
        }
        let wrapper = Wrapper::counted(Delegate::Value(value.clone()), self.queue.clone());
        self.identity.insert(key, wrapper.downgrade());
        self.stats.handles_created.fetch_add(1, Ordering::Relaxed);
        wrapper
    }

    /// Gives `wrapper` a stub and a handle table entry. Idempotent; the
    /// pointer is stable for the wrapper's whole life.
    ///
    /// `type_ptr` is the synthesized type struct for the value's class and
    /// lands in the stub's type field.
    pub fn promote(&mut self, wrapper: &Wrapper, type_ptr: usize) -> usize {
        if let Some(pointer) = wrapper.pointer() {
            return pointer;
        }
        let pointer = stub::alloc_stub();
        let refcnt = match wrapper.regime() {
            Regime::Immortal => abi::IMMORTAL_REFCNT,
            _ => abi::MANAGED_REFCNT,
        };
        unsafe {
            stub::init_header(pointer, refcnt, type_ptr);
            if let Some(Value::Tuple(items)) = wrapper.value() {
                stub::set_item_count(pointer, items.len() as i64);
            }
        }
        let index = self.install_slot(wrapper, pointer, true);
        wrapper.inner().mark_promoted(pointer, index);
        self.stats
            .native_bytes
            .fetch_add(stub::STUB_SIZE as u64, Ordering::Relaxed);
        self.stats.handles_live.fetch_add(1, Ordering::Relaxed);
        self.stats.weak_created.store(true, Ordering::Release);
        pointer
    }

    /// Registers a pointer the registry did not allocate (a synthesized
    /// type struct) under an immortal wrapper.
    pub fn register_foreign_backed(&mut self, wrapper: &Wrapper, pointer: usize) {
        if wrapper.pointer().is_some() {
            return;
        }
        let index = self.install_slot(wrapper, pointer, false);
        wrapper.inner().mark_promoted(pointer, index);
        self.stats.handles_live.fetch_add(1, Ordering::Relaxed);
    }

    fn install_slot(&mut self, wrapper: &Wrapper, pointer: usize, owns_stub: bool) -> usize {
        let slot = HandleSlot {
            wrapper: wrapper.downgrade(),
            pin: None,
            pointer,
            owns_stub,
        };
        let index = match self.free_slots.pop() {
            Some(index) => {
                self.slots[index] = Some(slot);
                index
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.by_pointer.insert(pointer, index);
        index
    }

    /// Classifies a pointer. A handle table hit with a dead wrapper is a
    /// fatal error: native code presented a handle the managed domain has
    /// already collected.
    pub fn resolve(&self, pointer: usize) -> Result<Resolution, RuntimeError> {
        let Some(&index) = self.by_pointer.get(&pointer) else {
            return Ok(Resolution::Foreign);
        };
        let slot = self.slots[index]
            .as_ref()
            .ok_or_else(|| RuntimeError::fatal(format!("stale handle table index {index}")))?;
        match slot.wrapper.upgrade() {
            Some(inner) => Ok(Resolution::Handle(Wrapper::from_inner(inner))),
            None => Err(RuntimeError::fatal(format!(
                "handle {pointer:#x} was used after its managed value was collected"
            ))),
        }
    }

    /// Looks up a live adopted instance for `pointer`.
    pub fn adopted(&self, pointer: usize) -> Option<NativeRef> {
        self.foreign.get(&pointer).and_then(Weak::upgrade)
    }

    /// Adopts an extension-owned instance into the managed domain.
    ///
    /// A fresh adoption installs the managed baseline on the instance's
    /// count. When the caller transfers an owned reference, that reference
    /// is folded into the baseline; otherwise the full baseline is added
    /// on top of whatever the native side holds.
    pub fn adopt(&mut self, pointer: usize, transfer: bool) -> NativeRef {
        if let Some(existing) = self.adopted(pointer) {
            if transfer {
                // The transferred reference is surplus; give it back.
                unsafe { abi::adjust_refcnt(pointer, -1) };
            }
            return existing;
        }
        let delta = if transfer {
            abi::MANAGED_REFCNT as i64 - 1
        } else {
            abi::MANAGED_REFCNT as i64
        };
        unsafe { abi::adjust_refcnt(pointer, delta) };
        let instance = NativeInstance::new(pointer, self.queue.clone());
        self.foreign.insert(pointer, Arc::downgrade(&instance));
        self.stats.foreign_adopted.fetch_add(1, Ordering::Relaxed);
        self.stats.weak_created.store(true, Ordering::Release);
        instance
    }

    /// Adds one native reference to a pointer in either domain.
    pub fn incref(&mut self, pointer: usize) -> Result<(), RuntimeError> {
        match self.resolve(pointer)? {
            Resolution::Handle(wrapper) => {
                if wrapper.regime() != Regime::Counted {
                    return Ok(());
                }
                unsafe { abi::adjust_refcnt(pointer, 1) };
                self.sync_pin(pointer);
                Ok(())
            }
            Resolution::Foreign => {
                unsafe { abi::adjust_refcnt(pointer, 1) };
                Ok(())
            }
        }
    }

    /// Removes one native reference. Returns a pointer that must be
    /// destructed by the caller once the big lock is released, if the
    /// count of an adopted instance reached zero.
    pub fn decref(&mut self, pointer: usize) -> Result<Option<usize>, RuntimeError> {
        match self.resolve(pointer)? {
            Resolution::Handle(wrapper) => {
                if wrapper.regime() != Regime::Counted {
                    return Ok(None);
                }
                let after = unsafe { abi::adjust_refcnt(pointer, -1) };
                // Item-steal sequences briefly dip one below the baseline.
                debug_assert!(after >= abi::MANAGED_REFCNT - 1);
                if after < abi::MANAGED_REFCNT - 1 {
                    log::error!("reference count underflow on handle {pointer:#x}: {after}");
                }
                self.sync_pin(pointer);
                Ok(None)
            }
            Resolution::Foreign => {
                let after = unsafe { abi::adjust_refcnt(pointer, -1) };
                Ok((after == 0).then_some(pointer))
            }
        }
    }

    /// Reconciles one entry's pin with its current reference count.
    pub fn sync_pin(&mut self, pointer: usize) {
        let Some(&index) = self.by_pointer.get(&pointer) else {
            return;
        };
        Self::sync_slot(&mut self.slots[index], &self.stats);
    }

    fn sync_slot(entry: &mut Option<HandleSlot>, stats: &BridgeStats) {
        let Some(slot) = entry.as_mut() else { return };
        let Some(inner) = slot.wrapper.upgrade() else {
            return;
        };
        if inner.regime() != Regime::Counted {
            return;
        }
        let count = unsafe { abi::load_refcnt(slot.pointer) };
        if count > abi::MANAGED_REFCNT && slot.pin.is_none() {
            let wrapper = Wrapper::from_inner(inner);
            match wrapper.value() {
                Some(value) => {
                    slot.pin = Some(PinnedHandle { wrapper, value });
                    stats.pins_live.fetch_add(1, Ordering::Relaxed);
                }
                None => log::error!(
                    "cannot pin handle {:#x}: managed value already collapsed",
                    slot.pointer
                ),
            }
        } else if count <= abi::MANAGED_REFCNT && slot.pin.is_some() {
            slot.pin = None;
            stats.pins_live.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Applies every deferred release and reconciles all pins.
    pub fn drain(&mut self) -> DrainOutcome {
        let mut outcome = DrainOutcome::default();
        for entry in self.queue.take() {
            match entry {
                PendingFree::Handle { pointer, slot } => {
                    self.free_handle(pointer, slot, &mut outcome);
                }
                PendingFree::Foreign { pointer } => {
                    self.release_foreign(pointer, &mut outcome);
                }
            }
        }
        // Catch reference count changes made by direct field writes.
        for index in 0..self.slots.len() {
            let before = self.slots[index].as_ref().map_or(false, |s| s.pin.is_some());
            Self::sync_slot(&mut self.slots[index], &self.stats);
            let after = self.slots[index].as_ref().map_or(false, |s| s.pin.is_some());
            if before && !after {
                outcome.unpinned += 1;
            }
        }
        self.identity.retain(|_, weak| weak.strong_count() > 0);
        self.stats.drains.fetch_add(1, Ordering::Relaxed);
        self.stats.weak_created.store(false, Ordering::Release);
        outcome
    }

    fn free_handle(&mut self, pointer: usize, slot: Option<usize>, outcome: &mut DrainOutcome) {
        let Some(&index) = self.by_pointer.get(&pointer) else {
            return;
        };
        if slot.is_some_and(|s| s != index) {
            log::error!("handle {pointer:#x} queued with slot {slot:?} but registered at {index}");
            return;
        }
        let Some(entry) = self.slots[index].take() else {
            return;
        };
        debug_assert!(entry.pin.is_none(), "pinned handle cannot have been dropped");
        self.by_pointer.remove(&pointer);
        self.free_slots.push(index);
        if entry.owns_stub {
            unsafe { stub::free_stub(pointer) };
            self.stats
                .native_bytes
                .fetch_sub(stub::STUB_SIZE as u64, Ordering::Relaxed);
        }
        self.stats.handles_live.fetch_sub(1, Ordering::Relaxed);
        self.stats.stubs_freed.fetch_add(1, Ordering::Relaxed);
        outcome.freed_handles += 1;
    }

    fn release_foreign(&mut self, pointer: usize, outcome: &mut DrainOutcome) {
        // Only clear the table entry if no new adoption replaced it.
        if self
            .foreign
            .get(&pointer)
            .is_some_and(|weak| weak.strong_count() == 0)
        {
            self.foreign.remove(&pointer);
        } else if self.foreign.contains_key(&pointer) {
            // The address was re-adopted before the drain ran; the old
            // baseline transfers to the new instance.
            return;
        }
        let after = unsafe { abi::adjust_refcnt(pointer, -(abi::MANAGED_REFCNT as i64)) };
        self.stats.foreign_released.fetch_add(1, Ordering::Relaxed);
        outcome.released_foreign += 1;
        if after == 0 {
            outcome.deallocs.push(pointer);
        }
    }

    /// Tears down every remaining entry. Runs with draining disabled, so
    /// no release produced by these drops will be applied later.
    pub fn shutdown_sweep(&mut self) -> usize {
        let mut freed = 0;
        for entry in self.slots.iter_mut() {
            if let Some(slot) = entry.take() {
                if slot.owns_stub {
                    unsafe { stub::free_stub(slot.pointer) };
                    freed += 1;
                }
                if slot.pin.is_some() {
                    log::warn!(
                        "handle {:#x} still referenced by native code at shutdown",
                        slot.pointer
                    );
                }
            }
        }
        self.slots.clear();
        self.free_slots.clear();
        self.by_pointer.clear();
        self.identity.clear();
        if !self.foreign.is_empty() {
            log::warn!(
                "{} adopted native instances still live at shutdown",
                self.foreign.len()
            );
            self.foreign.clear();
        }
        self.stats.handles_live.store(0, Ordering::Relaxed);
        freed
    }

    pub fn live_handles(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::ClassObject;
    use crate::value::ManagedObject;

    fn registry() -> Registry {
        Registry::new(Arc::new(PendingQueue::new()), Arc::new(BridgeStats::new()))
    }

    fn fake_foreign() -> (usize, Box<[u64; 3]>) {
        let mut block: Box<[u64; 3]> = Box::new([1, 0, 0]);
        let ptr = block.as_mut_ptr() as usize;
        (ptr, block)
    }

    #[test]
    fn test_wrap_object_is_idempotent() {
        let mut reg = registry();
        let cls = ClassObject::new("Point", Vec::new(), Vec::new()).unwrap();
        let obj = Value::Object(ManagedObject::new(cls));
        let a = reg.wrap(&obj);
        let b = reg.wrap(&obj);
        assert!(Arc::ptr_eq(a.inner(), b.inner()));
    }

    #[test]
    fn test_wrap_snapshot_identity_by_arc() {
        let mut reg = registry();
        let s = Value::str("shared");
        let a = reg.wrap(&s);
        let b = reg.wrap(&s.clone());
        assert!(Arc::ptr_eq(a.inner(), b.inner()));
        // Equal content behind a different allocation is a different handle.
        let other = Value::str(String::from("shared"));
        let c = reg.wrap(&other);
        assert!(!Arc::ptr_eq(a.inner(), c.inner()));
    }

    #[test]
    fn test_promote_installs_slot_and_header() {
        let mut reg = registry();
        let value = Value::str("promoted");
        let wrapper = reg.wrap(&value);
        let ptr = reg.promote(&wrapper, 0x7777);
        assert_eq!(wrapper.pointer(), Some(ptr));
        assert_eq!(unsafe { abi::load_refcnt(ptr) }, abi::MANAGED_REFCNT);
        assert_eq!(unsafe { stub::type_of(ptr) }, 0x7777);
        // A second promotion reuses the stub.
        assert_eq!(reg.promote(&wrapper, 0x7777), ptr);
        match reg.resolve(ptr).unwrap() {
            Resolution::Handle(found) => assert!(Arc::ptr_eq(found.inner(), wrapper.inner())),
            Resolution::Foreign => panic!("expected a handle"),
        }
    }

    #[test]
    fn test_tuple_stub_carries_item_count() {
        let mut reg = registry();
        let value = Value::tuple(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        let wrapper = reg.wrap(&value);
        let ptr = reg.promote(&wrapper, 0);
        assert_eq!(unsafe { abi::read_i64(ptr, abi::varobj::OB_SIZE) }, 3);
    }

    #[test]
    fn test_incref_pins_and_decref_unpins() {
        let mut reg = registry();
        let cls = ClassObject::new("Pinny", Vec::new(), Vec::new()).unwrap();
        let obj = ManagedObject::new(cls);
        let value = Value::Object(obj.clone());
        let wrapper = reg.wrap(&value);
        let ptr = reg.promote(&wrapper, 0);

        reg.incref(ptr).unwrap();
        let weak_obj = Arc::downgrade(&obj);
        drop(obj);
        drop(value);
        drop(wrapper);
        // Native still holds one reference above the baseline; the pin
        // keeps the object alive even with no managed references left.
        assert!(weak_obj.upgrade().is_some());

        assert_eq!(reg.decref(ptr).unwrap(), None);
        assert!(weak_obj.upgrade().is_none());
    }

    #[test]
    fn test_drain_frees_dead_handles() {
        let mut reg = registry();
        let value = Value::str("short lived");
        let wrapper = reg.wrap(&value);
        let ptr = reg.promote(&wrapper, 0);
        drop(wrapper);
        drop(value);
        assert_eq!(reg.queue().len(), 1);
        let outcome = reg.drain();
        assert_eq!(outcome.freed_handles, 1);
        assert!(matches!(reg.resolve(ptr), Ok(Resolution::Foreign)));
        assert_eq!(reg.live_handles(), 0);
    }

    #[test]
    fn test_drain_syncs_direct_count_writes() {
        let mut reg = registry();
        let cls = ClassObject::new("Macro", Vec::new(), Vec::new()).unwrap();
        let obj = ManagedObject::new(cls);
        let value = Value::Object(obj.clone());
        let wrapper = reg.wrap(&value);
        let ptr = reg.promote(&wrapper, 0);

        // Native code bumps the count with a plain store, no upcall.
        unsafe { abi::adjust_refcnt(ptr, 1) };
        reg.drain();
        let weak_obj = Arc::downgrade(&obj);
        drop(obj);
        drop(value);
        drop(wrapper);
        assert!(weak_obj.upgrade().is_some());

        unsafe { abi::adjust_refcnt(ptr, -1) };
        let outcome = reg.drain();
        assert_eq!(outcome.unpinned, 1);
        assert!(weak_obj.upgrade().is_none());
    }

    #[test]
    fn test_adopt_borrow_and_transfer_math() {
        let mut reg = registry();
        let (ptr, _block) = fake_foreign();

        let inst = reg.adopt(ptr, false);
        assert_eq!(unsafe { abi::load_refcnt(ptr) }, 1 + abi::MANAGED_REFCNT);
        // Adopting again under transfer folds the owned reference away.
        let again = reg.adopt(ptr, true);
        assert!(Arc::ptr_eq(&inst, &again));
        assert_eq!(unsafe { abi::load_refcnt(ptr) }, abi::MANAGED_REFCNT);
    }

    #[test]
    fn test_foreign_release_reaches_zero() {
        let mut reg = registry();
        let (ptr, _block) = fake_foreign();
        let inst = reg.adopt(ptr, true);
        assert_eq!(unsafe { abi::load_refcnt(ptr) }, abi::MANAGED_REFCNT);
        drop(inst);
        let outcome = reg.drain();
        assert_eq!(outcome.released_foreign, 1);
        assert_eq!(outcome.deallocs, vec![ptr]);
        assert_eq!(unsafe { abi::load_refcnt(ptr) }, 0);
    }

    #[test]
    fn test_shutdown_sweep_clears_everything() {
        let mut reg = registry();
        let value = Value::str("leftover");
        let wrapper = reg.wrap(&value);
        reg.promote(&wrapper, 0);
        reg.queue().disable();
        let freed = reg.shutdown_sweep();
        assert_eq!(freed, 1);
        assert_eq!(reg.live_handles(), 0);
        // Late drops after shutdown are discarded, not applied.
        drop(wrapper);
        assert!(reg.queue().is_empty());
    }
}
