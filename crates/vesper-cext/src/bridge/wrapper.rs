//! Handle wrappers: the managed side of every pointer handed to native code.
//!
//! A wrapper ties one managed value to one stub for the wrapper's entire
//! life, which is what makes repeated transitions of the same value yield
//! the same pointer. Wrappers come in three regimes:
//!
//! - `Immortal`: cached primitives and synthesized type structs. Never
//!   released, reference count pinned at the immortal sentinel.
//! - `Counted`: ordinary handles carrying the managed baseline count.
//! - `Unowned`: pass-through handles over extension-owned instances. The
//!   adoption entry owns the baseline, so these perform no bookkeeping.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::abi;
use crate::bridge::registry::{PendingFree, PendingQueue};
use crate::class::ClassObject;
use crate::value::{ManagedObject, Value};

/// Lifetime regime of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    Immortal,
    Counted,
    Unowned,
}

/// Edge from a wrapper back to its managed value.
///
/// Objects and classes own their wrapper strongly, so the reverse edge is
/// weak to keep the pair collectable. Values without a wrapper cell (the
/// primitives and container snapshots) are held strongly; nothing else
/// would keep them alive while native code uses the handle.
#[derive(Debug)]
pub(crate) enum Delegate {
    Value(Value),
    Object(Weak<ManagedObject>),
    Class(Weak<ClassObject>),
}

#[derive(Debug)]
pub struct WrapperInner {
    delegate: Delegate,
    regime: Regime,
    /// Stub address; zero until the first transition into native code.
    pointer: AtomicUsize,
    /// Registry slot index plus one; zero while unregistered.
    slot: AtomicUsize,
    queue: Arc<PendingQueue>,
}

impl WrapperInner {
    /// The managed value behind this handle, if still alive.
    pub fn value(&self) -> Option<Value> {
        match &self.delegate {
            Delegate::Value(v) => Some(v.clone()),
            Delegate::Object(weak) => weak.upgrade().map(Value::Object),
            Delegate::Class(weak) => weak.upgrade().map(Value::Class),
        }
    }

    pub fn regime(&self) -> Regime {
        self.regime
    }

    pub fn pointer(&self) -> Option<usize> {
        match self.pointer.load(Ordering::Acquire) {
            0 => None,
            ptr => Some(ptr),
        }
    }

    pub(crate) fn slot_index(&self) -> Option<usize> {
        match self.slot.load(Ordering::Acquire) {
            0 => None,
            idx => Some(idx - 1),
        }
    }

    pub(crate) fn mark_promoted(&self, pointer: usize, slot_index: usize) {
        self.slot.store(slot_index + 1, Ordering::Release);
        self.pointer.store(pointer, Ordering::Release);
    }

    /// Current reference count as native code sees it.
    pub fn refcnt(&self) -> u64 {
        match self.pointer() {
            Some(ptr) => unsafe { abi::load_refcnt(ptr) },
            None => match self.regime {
                Regime::Immortal => abi::IMMORTAL_REFCNT,
                _ => abi::MANAGED_REFCNT,
            },
        }
    }
}

impl Drop for WrapperInner {
    fn drop(&mut self) {
        // Only counted handles own their stub. Immortal stubs are torn
        // down by the registry at shutdown; unowned handles never had one.
        if self.regime != Regime::Counted {
            return;
        }
        if let Some(pointer) = self.pointer() {
            self.queue.push(PendingFree::Handle {
                pointer,
                slot: self.slot_index(),
            });
        }
    }
}

/// Shared handle to a [`WrapperInner`].
#[derive(Debug, Clone)]
pub struct Wrapper(Arc<WrapperInner>);

impl Wrapper {
    pub(crate) fn counted(delegate: Delegate, queue: Arc<PendingQueue>) -> Wrapper {
        Wrapper(Arc::new(WrapperInner {
            delegate,
            regime: Regime::Counted,
            pointer: AtomicUsize::new(0),
            slot: AtomicUsize::new(0),
            queue,
        }))
    }

    pub(crate) fn immortal(delegate: Delegate, queue: Arc<PendingQueue>) -> Wrapper {
        Wrapper(Arc::new(WrapperInner {
            delegate,
            regime: Regime::Immortal,
            pointer: AtomicUsize::new(0),
            slot: AtomicUsize::new(0),
            queue,
        }))
    }

    /// Pass-through handle over an extension-owned instance.
    pub(crate) fn unowned(value: Value, pointer: usize, queue: Arc<PendingQueue>) -> Wrapper {
        Wrapper(Arc::new(WrapperInner {
            delegate: Delegate::Value(value),
            regime: Regime::Unowned,
            pointer: AtomicUsize::new(pointer),
            slot: AtomicUsize::new(0),
            queue,
        }))
    }

    pub(crate) fn from_inner(inner: Arc<WrapperInner>) -> Wrapper {
        Wrapper(inner)
    }

    pub fn value(&self) -> Option<Value> {
        self.0.value()
    }

    pub fn regime(&self) -> Regime {
        self.0.regime()
    }

    pub fn pointer(&self) -> Option<usize> {
        self.0.pointer()
    }

    pub fn is_promoted(&self) -> bool {
        self.0.pointer().is_some()
    }

    pub fn refcnt(&self) -> u64 {
        self.0.refcnt()
    }

    pub(crate) fn inner(&self) -> &Arc<WrapperInner> {
        &self.0
    }

    pub(crate) fn downgrade(&self) -> Weak<WrapperInner> {
        Arc::downgrade(&self.0)
    }
}

/// Eagerly promoted handles for the shared primitives.
///
/// The singletons and the small integer range get one immortal handle each
/// at bridge startup, so identity over these values holds across every
/// transition in both directions.
#[derive(Debug)]
pub struct PrimitiveCache {
    none: Wrapper,
    truth: Wrapper,
    falsity: Wrapper,
    nan: Wrapper,
    small_ints: Vec<Wrapper>,
}

impl PrimitiveCache {
    pub(crate) fn new(
        none: Wrapper,
        truth: Wrapper,
        falsity: Wrapper,
        nan: Wrapper,
        small_ints: Vec<Wrapper>,
    ) -> PrimitiveCache {
        debug_assert_eq!(
            small_ints.len() as i64,
            abi::SMALL_INT_MAX - abi::SMALL_INT_MIN + 1
        );
        PrimitiveCache {
            none,
            truth,
            falsity,
            nan,
            small_ints,
        }
    }

    /// The cached handle for `value`, when one exists.
    pub fn lookup(&self, value: &Value) -> Option<&Wrapper> {
        match value {
            Value::None => Some(&self.none),
            Value::Bool(true) => Some(&self.truth),
            Value::Bool(false) => Some(&self.falsity),
            Value::Float(x) if x.is_nan() => Some(&self.nan),
            Value::Int(n) if (abi::SMALL_INT_MIN..=abi::SMALL_INT_MAX).contains(n) => {
                Some(&self.small_ints[(n - abi::SMALL_INT_MIN) as usize])
            }
            _ => None,
        }
    }

    /// All cached handles, for the shutdown sweep.
    pub(crate) fn all_wrappers(&self) -> impl Iterator<Item = &Wrapper> {
        [&self.none, &self.truth, &self.falsity, &self.nan]
            .into_iter()
            .chain(self.small_ints.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::ClassObject;

    #[test]
    fn test_value_delegate_is_strong() {
        let queue = Arc::new(PendingQueue::new());
        let wrapper = Wrapper::counted(Delegate::Value(Value::str("kept")), queue);
        assert_eq!(wrapper.value(), Some(Value::str("kept")));
        assert_eq!(wrapper.regime(), Regime::Counted);
        assert!(!wrapper.is_promoted());
    }

    #[test]
    fn test_object_delegate_is_weak() {
        let queue = Arc::new(PendingQueue::new());
        let cls = ClassObject::new("Ghost", Vec::new(), Vec::new()).unwrap();
        let obj = ManagedObject::new(cls);
        let wrapper = Wrapper::counted(Delegate::Object(Arc::downgrade(&obj)), queue);
        assert!(wrapper.value().is_some());
        drop(obj);
        assert_eq!(wrapper.value(), None);
    }

    #[test]
    fn test_counted_drop_enqueues_promoted_stub() {
        let queue = Arc::new(PendingQueue::new());
        let wrapper = Wrapper::counted(Delegate::Value(Value::Int(999)), queue.clone());
        wrapper.inner().mark_promoted(0x4000, 7);
        assert_eq!(wrapper.pointer(), Some(0x4000));
        drop(wrapper);
        let drained = queue.take();
        assert_eq!(
            drained,
            vec![PendingFree::Handle {
                pointer: 0x4000,
                slot: Some(7),
            }]
        );
    }

    #[test]
    fn test_unpromoted_drop_enqueues_nothing() {
        let queue = Arc::new(PendingQueue::new());
        let wrapper = Wrapper::counted(Delegate::Value(Value::Int(999)), queue.clone());
        drop(wrapper);
        assert!(queue.take().is_empty());
    }

    #[test]
    fn test_unowned_drop_enqueues_nothing() {
        let queue = Arc::new(PendingQueue::new());
        let wrapper = Wrapper::unowned(Value::None, 0x8000, queue.clone());
        assert_eq!(wrapper.pointer(), Some(0x8000));
        drop(wrapper);
        assert!(queue.take().is_empty());
    }

    #[test]
    fn test_unpromoted_refcnt_defaults() {
        let queue = Arc::new(PendingQueue::new());
        let counted = Wrapper::counted(Delegate::Value(Value::Int(1)), queue.clone());
        assert_eq!(counted.refcnt(), abi::MANAGED_REFCNT);
        let immortal = Wrapper::immortal(Delegate::Value(Value::None), queue);
        assert_eq!(immortal.refcnt(), abi::IMMORTAL_REFCNT);
    }
}
