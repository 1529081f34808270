//! The bridge context: one per runtime, owning everything both domains
//! share.
//!
//! All state is explicit and per-context; the only process-wide slot is the
//! weak installation pointer the incoming trampolines use to find their
//! context (see [`crate::marshal::incoming`]). The registry sits behind one
//! `RwLock`: pointer classification takes the read side so native threads
//! can resolve concurrently, while every insert, removal, promotion and
//! reference count transition takes the write side. No lock is ever held
//! across a call into managed or native code.
//!
//! Lifecycle: [`Bridge::new`] builds the builtin classes, eagerly promotes
//! the primitive cache and installs the context; [`Bridge::shutdown`] is
//! the terminal sequence that stops the monitor, applies the final drain,
//! disables the release queue and frees what remains.

pub mod registry;
pub mod stub;
pub mod wrapper;

use std::collections::HashMap;
use std::ffi::CString;
use std::os::raw::c_char;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use vesper_config::BridgeConfig;

use crate::abi;
use crate::class::ClassObject;
use crate::marshal::incoming;
use crate::marshal::members;
use crate::marshal::outgoing::{self, NativeTarget};
use crate::marshal::shape::CallShape;
use crate::mirror;
use crate::monitor::{self, CollectRequest, MonitorHandle};
use crate::value::{ClassRef, ManagedObject, Payload, RuntimeError, Value};

use registry::{PendingQueue, Registry, Resolution};
use wrapper::{Delegate, PrimitiveCache, Regime, Wrapper};

/// Counters shared between the registry, the marshal layer and the memory
/// monitor. The monitor reads these from its own thread; everything here
/// must stay plain atomics.
#[derive(Debug, Default)]
pub struct BridgeStats {
    pub handles_created: AtomicU64,
    pub handles_live: AtomicU64,
    pub stubs_freed: AtomicU64,
    pub pins_live: AtomicU64,
    pub foreign_adopted: AtomicU64,
    pub foreign_released: AtomicU64,
    pub drains: AtomicU64,
    /// Bytes of native memory the bridge itself allocated: stubs, type
    /// struct mirrors and their slot groups.
    pub native_bytes: AtomicU64,
    /// Set when a collectable registry entry appeared since the last
    /// drain; the monitor skips a forced collection when nothing new can
    /// be reclaimed.
    pub weak_created: AtomicBool,
}

impl BridgeStats {
    pub fn new() -> BridgeStats {
        BridgeStats::default()
    }
}

/// The builtin classes every value resolves its class through.
///
/// Synthesized type structs need a class for every value kind that can
/// cross the boundary, including the primitives.
#[derive(Debug)]
pub struct Builtins {
    pub object: ClassRef,
    pub metatype: ClassRef,
    pub none: ClassRef,
    pub boolean: ClassRef,
    pub integer: ClassRef,
    pub float: ClassRef,
    pub string: ClassRef,
    pub tuple: ClassRef,
    pub function: ClassRef,
    pub module: ClassRef,
    pub native: ClassRef,
}

impl Builtins {
    fn bootstrap() -> Builtins {
        // Root classes cannot fail linearization.
        let object = ClassObject::new("object", Vec::new(), Vec::new())
            .expect("object class bootstrap");
        let derived = |name: &str| {
            ClassObject::new(name, vec![object.clone()], Vec::new())
                .expect("builtin class bootstrap")
        };
        Builtins {
            metatype: derived("type"),
            none: derived("NoneType"),
            boolean: derived("bool"),
            integer: derived("int"),
            float: derived("float"),
            string: derived("str"),
            tuple: derived("tuple"),
            function: derived("builtin_function_or_method"),
            module: derived("module"),
            native: derived("native"),
            object,
        }
    }
}

/// State shared by every clone of a [`Bridge`] and by the incoming
/// trampolines.
pub struct BridgeShared {
    registry: RwLock<Registry>,
    queue: Arc<PendingQueue>,
    cache: PrimitiveCache,
    builtins: Builtins,
    stats: Arc<BridgeStats>,
    config: BridgeConfig,
    /// The context-wide exception slot native code reports failures into.
    pending: Mutex<Option<RuntimeError>>,
    /// Loaded extension modules by name.
    modules: Mutex<HashMap<String, Value>>,
    /// NUL-terminated UTF-8 copies handed to native code, keyed by the
    /// string handle they describe. Freed at shutdown.
    interned: Mutex<HashMap<usize, CString>>,
    /// Per-module state blocks (`m_size` bytes, zeroed), kept alive for
    /// the context's lifetime.
    module_state: Mutex<Vec<Box<[u8]>>>,
    /// Type struct mirror allocations, freed only at shutdown.
    mirrors: Mutex<Vec<mirror::MirrorAlloc>>,
    monitor: Mutex<Option<MonitorHandle>>,
    down: AtomicBool,
}

impl std::fmt::Debug for BridgeShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeShared")
            .field("handles_live", &self.stats.handles_live.load(Ordering::Relaxed))
            .field("down", &self.down.load(Ordering::Relaxed))
            .finish()
    }
}

/// A handle to the bridge context. Clones share one context.
#[derive(Debug, Clone)]
pub struct Bridge {
    shared: Arc<BridgeShared>,
}

impl Bridge {
    /// Builds a context, eagerly promotes the primitive cache and installs
    /// the context for incoming trampolines.
    pub fn new(config: BridgeConfig) -> Result<Bridge, RuntimeError> {
        let queue = Arc::new(PendingQueue::new());
        let stats = Arc::new(BridgeStats::new());
        let builtins = Builtins::bootstrap();
        let mut registry = Registry::new(queue.clone(), stats.clone());
        registry.reserve(config.registry.handle_capacity);

        let immortal =
            |value: Value| Wrapper::immortal(Delegate::Value(value), queue.clone());
        let small_ints: Vec<Wrapper> = (abi::SMALL_INT_MIN..=abi::SMALL_INT_MAX)
            .map(|n| immortal(Value::Int(n)))
            .collect();
        let cache = PrimitiveCache::new(
            immortal(Value::None),
            immortal(Value::Bool(true)),
            immortal(Value::Bool(false)),
            immortal(Value::Float(f64::NAN)),
            small_ints,
        );

        let bridge = Bridge {
            shared: Arc::new(BridgeShared {
                registry: RwLock::new(registry),
                queue,
                cache,
                builtins,
                stats,
                config,
                pending: Mutex::new(None),
                modules: Mutex::new(HashMap::new()),
                interned: Mutex::new(HashMap::new()),
                module_state: Mutex::new(Vec::new()),
                mirrors: Mutex::new(Vec::new()),
                monitor: Mutex::new(None),
                down: AtomicBool::new(false),
            }),
        };
        incoming::install(&bridge.shared);
        bridge.promote_cache()?;
        Ok(bridge)
    }

    pub(crate) fn from_shared(shared: Arc<BridgeShared>) -> Bridge {
        Bridge { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<BridgeShared> {
        &self.shared
    }

    pub fn stats(&self) -> &Arc<BridgeStats> {
        &self.shared.stats
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.shared.config
    }

    pub fn builtins(&self) -> &Builtins {
        &self.shared.builtins
    }

    fn promote_cache(&self) -> Result<(), RuntimeError> {
        // Promotion wants each primitive's type struct, which in turn
        // registers the builtin classes themselves.
        for cached in self.shared.cache.all_wrappers() {
            let value = cached
                .value()
                .ok_or_else(|| RuntimeError::fatal("primitive cache entry without a value"))?;
            let class = self.class_of(&value);
            let type_ptr = mirror::materialize(self, &class)?;
            let mut registry = self.write_registry();
            registry.promote(cached, type_ptr);
        }
        Ok(())
    }

    fn write_registry(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.shared
            .registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn read_registry(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.shared
            .registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
    }

    // -----------------------------------------------------------------
    // Wrapping and promotion.
    // -----------------------------------------------------------------

    /// The handle wrapper for `value`. Idempotent per identity; cached
    /// primitives always yield their shared immortal wrapper.
    pub fn wrap(&self, value: &Value) -> Wrapper {
        if let Some(cached) = self.shared.cache.lookup(value) {
            return cached.clone();
        }
        self.write_registry().wrap(value)
    }

    /// The handle wrapper for `value`, promoted: it carries a stable
    /// native pointer on return. Promoting an already promoted wrapper is
    /// a no-op yielding the same pointer.
    pub fn wrap_promoted(&self, value: &Value) -> Result<Wrapper, RuntimeError> {
        if let Value::Class(class) = value {
            // A class's native identity is its synthesized type struct;
            // materialization registers the wrapper against that address
            // and refreshes a stale struct in place.
            mirror::materialize(self, class)?;
            return Ok(self.wrap(value));
        }
        // Materializing on every transition keeps the class's struct
        // current even when the handle itself already has its stub.
        let class = self.class_of(value);
        let type_ptr = mirror::materialize(self, &class)?;
        let wrapper = self.wrap(value);
        if !wrapper.is_promoted() {
            self.write_registry().promote(&wrapper, type_ptr);
        }
        Ok(wrapper)
    }

    /// Lowers `value` to a pointer owned by the native caller: the handle
    /// carries one extra native reference (immortal handles are exempt).
    pub fn lower_owned(&self, value: &Value) -> Result<usize, RuntimeError> {
        let wrapper = self.wrap_promoted(value)?;
        let pointer = wrapper
            .pointer()
            .ok_or_else(|| RuntimeError::fatal("promotion left no pointer"))?;
        if wrapper.regime() != Regime::Immortal {
            self.write_registry().incref(pointer)?;
        }
        Ok(pointer)
    }

    /// Lifts a pointer native code passed by borrow. Unknown pointers are
    /// adopted as extension-owned instances.
    pub fn lift_borrowed(&self, pointer: usize) -> Result<Value, RuntimeError> {
        if pointer == 0 {
            return Err(RuntimeError::fatal("null pointer where a value was expected"));
        }
        let resolution = self.read_registry().resolve(pointer)?;
        match resolution {
            Resolution::Handle(wrapper) => wrapper.value().ok_or_else(|| {
                RuntimeError::fatal(format!(
                    "handle {pointer:#x} resolved after its value was collected"
                ))
            }),
            Resolution::Foreign => {
                let instance = self.write_registry().adopt(pointer, false);
                Ok(Value::Native(instance))
            }
        }
    }

    /// Lifts a pointer returned by native code. With `transfer` the caller
    /// received an owned reference, which is folded back into the handle's
    /// count (or into the adoption baseline for foreign pointers).
    pub fn from_native(&self, pointer: usize, transfer: bool) -> Result<Value, RuntimeError> {
        if pointer == 0 {
            return Err(RuntimeError::fatal("null pointer where a value was expected"));
        }
        let resolution = self.read_registry().resolve(pointer)?;
        match resolution {
            Resolution::Handle(wrapper) => {
                let value = wrapper.value().ok_or_else(|| {
                    RuntimeError::fatal(format!(
                        "handle {pointer:#x} resolved after its value was collected"
                    ))
                })?;
                if transfer && wrapper.regime() == Regime::Counted {
                    if let Some(dead) = self.write_registry().decref(pointer)? {
                        self.run_foreign_dealloc(dead);
                    }
                }
                Ok(value)
            }
            Resolution::Foreign => {
                let instance = self.write_registry().adopt(pointer, transfer);
                Ok(Value::Native(instance))
            }
        }
    }

    /// Reconciles one handle's pin with its current reference count.
    pub(crate) fn sync_handle(&self, pointer: usize) {
        self.write_registry().sync_pin(pointer);
    }

    /// Adds one native reference on behalf of extension code.
    pub fn native_incref(&self, pointer: usize) {
        if let Err(err) = self.write_registry().incref(pointer) {
            log::error!("incref on {pointer:#x} failed: {err}");
        }
    }

    /// Removes one native reference on behalf of extension code, running
    /// the destructor of an adopted instance whose count reaches zero.
    pub fn native_decref(&self, pointer: usize) {
        let dead = match self.write_registry().decref(pointer) {
            Ok(dead) => dead,
            Err(err) => {
                log::error!("decref on {pointer:#x} failed: {err}");
                return;
            }
        };
        if let Some(pointer) = dead {
            self.run_foreign_dealloc(pointer);
        }
    }

    /// Queues a stub whose count native code drove to zero; the next
    /// drain tears it down.
    pub(crate) fn release_stub(&self, pointer: usize) {
        self.shared.queue.push(registry::PendingFree::Handle {
            pointer,
            slot: None,
        });
    }

    /// Invokes the `tp_dealloc` slot of an extension-owned instance. Runs
    /// without any bridge lock held; destructor code may call back in.
    fn run_foreign_dealloc(&self, pointer: usize) {
        let dealloc = unsafe {
            let type_ptr = stub::type_of(pointer);
            if type_ptr == 0 {
                0
            } else {
                abi::read_word(type_ptr, abi::typeobj::TP_DEALLOC)
            }
        };
        if dealloc == 0 {
            log::warn!("instance {pointer:#x} reached zero without a destructor; leaking it");
            return;
        }
        unsafe { outgoing::call_dealloc(dealloc as *const (), pointer) };
    }

    // -----------------------------------------------------------------
    // Safe points and shutdown.
    // -----------------------------------------------------------------

    /// Applies every deferred release. Called at safe points: after a
    /// forced collection, on context exit, and whenever the embedder sees
    /// a [`CollectRequest`].
    pub fn drain_pending_frees(&self) -> registry::DrainOutcome {
        let mut outcome = self.write_registry().drain();
        let deallocs = std::mem::take(&mut outcome.deallocs);
        for pointer in deallocs {
            self.run_foreign_dealloc(pointer);
        }
        outcome
    }

    /// Starts the memory monitor, returning the channel its collection
    /// requests arrive on. No task is started when the monitor is
    /// disabled by configuration.
    pub fn start_monitor(&self) -> Option<tokio::sync::mpsc::Receiver<CollectRequest>> {
        if !self.shared.config.monitor.enabled {
            return None;
        }
        let mut slot = self
            .shared
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            log::warn!("monitor already running; ignoring second start");
            return None;
        }
        let (handle, requests) =
            monitor::spawn(self.shared.config.monitor.clone(), self.shared.stats.clone());
        *slot = Some(handle);
        Some(requests)
    }

    /// Terminal sequence. Stops the monitor, applies the final drain,
    /// disables the release queue so in-flight drops cannot double-free,
    /// then frees every remaining stub and mirror.
    pub fn shutdown(&self) {
        if self.shared.down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self
            .shared
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.stop();
        }
        self.drain_pending_frees();
        self.shared.queue.disable();
        incoming::uninstall(&self.shared);
        let freed = self.write_registry().shutdown_sweep();
        log::debug!("shutdown freed {freed} stubs");
        let mut mirrors = self
            .shared
            .mirrors
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for alloc in mirrors.drain(..) {
            // Safety: mirror blocks are only reachable through the
            // registry, which the sweep above emptied.
            unsafe { alloc.free(&self.shared.stats) };
        }
        self.shared
            .interned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    // -----------------------------------------------------------------
    // Pending exception slot.
    // -----------------------------------------------------------------

    pub fn set_pending(&self, err: RuntimeError) {
        let mut pending = self
            .shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = pending.as_ref() {
            log::debug!("pending exception `{existing}` replaced by `{err}`");
        }
        *pending = Some(err);
    }

    pub fn take_pending(&self) -> Option<RuntimeError> {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    pub fn has_pending(&self) -> bool {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// The pending exception, or a synthesized failure when native code
    /// signaled an error without setting one.
    pub fn take_pending_or_generic(&self, who: &str) -> RuntimeError {
        self.take_pending().unwrap_or_else(|| {
            RuntimeError::raised(
                "SystemError",
                format!("'{who}' signaled an error without setting an exception"),
            )
        })
    }

    // -----------------------------------------------------------------
    // Managed-side services the trampolines dispatch through.
    // -----------------------------------------------------------------

    /// The class of any value.
    pub fn class_of(&self, value: &Value) -> ClassRef {
        let b = &self.shared.builtins;
        match value {
            Value::None => b.none.clone(),
            Value::Bool(_) => b.boolean.clone(),
            Value::Int(_) => b.integer.clone(),
            Value::Float(_) => b.float.clone(),
            Value::Str(_) => b.string.clone(),
            Value::Tuple(_) => b.tuple.clone(),
            Value::Object(obj) => obj.class().clone(),
            Value::Class(_) => b.metatype.clone(),
            Value::Native(_) => b.native.clone(),
        }
    }

    /// Calls any callable value with flat positional arguments.
    pub fn call_value(&self, callee: &Value, argv: &[Value]) -> Result<Value, RuntimeError> {
        match callee {
            Value::Object(obj) => {
                let target = obj.with_payload_mut(|payload| match payload {
                    Payload::Function(f) => Some(Callable::Managed(f.clone())),
                    Payload::NativeFn(t) => Some(Callable::Native(t.clone())),
                    _ => None,
                });
                match target {
                    Some(Callable::Managed(f)) => f.call(argv),
                    Some(Callable::Native(t)) => outgoing::call_adapted(self, &t, argv),
                    None => match obj.class().resolve("__call__") {
                        Some(call) => {
                            let mut with_recv = Vec::with_capacity(argv.len() + 1);
                            with_recv.push(callee.clone());
                            with_recv.extend_from_slice(argv);
                            self.call_value(&call, &with_recv)
                        }
                        None => Err(RuntimeError::type_error(format!(
                            "'{}' object is not callable",
                            obj.class().name()
                        ))),
                    },
                }
            }
            Value::Class(class) => self.instantiate(class, argv),
            other => Err(RuntimeError::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    /// Constructs an instance of `class`, running its `__init__` when one
    /// is defined.
    pub fn instantiate(&self, class: &ClassRef, argv: &[Value]) -> Result<Value, RuntimeError> {
        let instance = Value::Object(ManagedObject::new(class.clone()));
        match class.resolve("__init__") {
            Some(init) => {
                let mut with_recv = Vec::with_capacity(argv.len() + 1);
                with_recv.push(instance.clone());
                with_recv.extend_from_slice(argv);
                self.call_value(&init, &with_recv)?;
            }
            None if !argv.is_empty() => {
                return Err(RuntimeError::type_error(format!(
                    "{}() takes no arguments",
                    class.name()
                )))
            }
            None => {}
        }
        Ok(instance)
    }

    /// Attribute read, covering managed instances, classes and adopted
    /// extension instances (member and getter/setter tables).
    pub fn get_attr_value(&self, value: &Value, name: &str) -> Result<Value, RuntimeError> {
        match value {
            Value::Object(obj) => obj
                .get_attr(name)
                .or_else(|| obj.class().resolve(name))
                .ok_or_else(|| {
                    RuntimeError::attribute_error(format!(
                        "'{}' object has no attribute '{name}'",
                        obj.class().name()
                    ))
                }),
            Value::Class(class) => class.resolve(name).ok_or_else(|| {
                RuntimeError::attribute_error(format!(
                    "class '{}' has no attribute '{name}'",
                    class.name()
                ))
            }),
            Value::Native(instance) => self.native_get_attr(instance.pointer(), name),
            other => Err(RuntimeError::attribute_error(format!(
                "'{}' object has no attribute '{name}'",
                other.type_name()
            ))),
        }
    }

    /// Attribute write or delete (`value` of `None`), with the same
    /// coverage as [`Bridge::get_attr_value`]. Writing a class attribute
    /// marks the class's synthesized type struct for rebuild.
    pub fn set_attr_value(
        &self,
        target: &Value,
        name: &str,
        value: Option<Value>,
    ) -> Result<(), RuntimeError> {
        match target {
            Value::Object(obj) => {
                match value {
                    Some(value) => obj.set_attr(name, value),
                    None => {
                        obj.remove_attr(name).ok_or_else(|| {
                            RuntimeError::attribute_error(format!(
                                "'{}' object has no attribute '{name}'",
                                obj.class().name()
                            ))
                        })?;
                    }
                }
                Ok(())
            }
            Value::Class(class) => {
                match value {
                    Some(value) => class.set_attr(name, value),
                    None => {
                        class.remove_attr(name).ok_or_else(|| {
                            RuntimeError::attribute_error(format!(
                                "class '{}' has no attribute '{name}'",
                                class.name()
                            ))
                        })?;
                    }
                }
                self.invalidate_type(class);
                Ok(())
            }
            Value::Native(instance) => {
                self.native_set_attr(instance.pointer(), name, value.as_ref())
            }
            other => Err(RuntimeError::attribute_error(format!(
                "'{}' object has no attribute '{name}'",
                other.type_name()
            ))),
        }
    }

    fn native_get_attr(&self, pointer: usize, name: &str) -> Result<Value, RuntimeError> {
        let type_ptr = unsafe { stub::type_of(pointer) };
        if let Some(def) = unsafe { members::find_getset(type_ptr, name) } {
            if def.getter == 0 {
                return Err(RuntimeError::attribute_error(format!(
                    "attribute '{name}' is not readable"
                )));
            }
            let target = NativeTarget::new(name, CallShape::Getter, def.getter as *const ())
                .with_closure(def.closure);
            return outgoing::call(self, &target, &[Value::Native(self.adopt_again(pointer))]);
        }
        if let Some(def) = unsafe { members::find_member(type_ptr, name) } {
            return members::load(self, pointer, &def);
        }
        Err(RuntimeError::attribute_error(format!(
            "native object has no attribute '{name}'"
        )))
    }

    fn native_set_attr(
        &self,
        pointer: usize,
        name: &str,
        value: Option<&Value>,
    ) -> Result<(), RuntimeError> {
        let type_ptr = unsafe { stub::type_of(pointer) };
        if let Some(def) = unsafe { members::find_getset(type_ptr, name) } {
            if def.setter == 0 {
                return Err(RuntimeError::attribute_error(format!(
                    "attribute '{name}' is read-only"
                )));
            }
            let target = NativeTarget::new(name, CallShape::Setter, def.setter as *const ())
                .with_closure(def.closure);
            let recv = Value::Native(self.adopt_again(pointer));
            let value = value.cloned().unwrap_or(Value::None);
            outgoing::call(self, &target, &[recv, value])?;
            return Ok(());
        }
        if let Some(def) = unsafe { members::find_member(type_ptr, name) } {
            return members::store(self, pointer, &def, value);
        }
        Err(RuntimeError::attribute_error(format!(
            "native object has no attribute '{name}'"
        )))
    }

    fn adopt_again(&self, pointer: usize) -> crate::value::NativeRef {
        self.write_registry().adopt(pointer, false)
    }

    /// Marks `class`'s synthesized type struct stale; the next transition
    /// through it rebuilds the slots in place.
    pub fn invalidate_type(&self, class: &ClassRef) {
        mirror::invalidate(class);
    }

    /// Calls a native function through its declared convention.
    pub fn call_native(&self, target: &NativeTarget, argv: &[Value]) -> Result<Value, RuntimeError> {
        outgoing::call(self, target, argv)
    }

    /// Calls a native function the way managed call sites do, adapting
    /// flat positional arguments to the convention's argument carriers.
    pub fn call_native_adapted(
        &self,
        target: &NativeTarget,
        argv: &[Value],
    ) -> Result<Value, RuntimeError> {
        outgoing::call_adapted(self, target, argv)
    }

    // -----------------------------------------------------------------
    // Modules and auxiliary native-facing storage.
    // -----------------------------------------------------------------

    /// Initializes and registers the extension module `name` from an
    /// already loaded library.
    pub fn load_module(
        &self,
        library: &Arc<crate::loader::LoadedLibrary>,
        name: &str,
    ) -> Result<Value, RuntimeError> {
        crate::module_loader::load_module(self, library, name)
    }

    pub fn register_module(&self, name: impl Into<String>, module: Value) {
        self.shared
            .modules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), module);
    }

    pub fn module(&self, name: &str) -> Option<Value> {
        self.shared
            .modules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Keeps a zeroed module state block alive for the context's life.
    pub(crate) fn retain_module_state(&self, size: usize) -> usize {
        let block = vec![0u8; size].into_boxed_slice();
        let pointer = block.as_ptr() as usize;
        self.shared
            .module_state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(block);
        pointer
    }

    pub(crate) fn retain_mirror(&self, alloc: mirror::MirrorAlloc) {
        self.shared
            .mirrors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(alloc);
    }

    /// Registers `address` (not allocated by the registry) as the native
    /// identity of `value`'s wrapper.
    pub(crate) fn register_type_address(&self, value: &Value, address: usize) {
        let mut registry = self.write_registry();
        let wrapper = registry.wrap(value);
        registry.register_foreign_backed(&wrapper, address);
    }

    /// A stable NUL-terminated copy of a string handle's text.
    pub(crate) fn intern_utf8(&self, handle: usize, text: &str) -> *const c_char {
        let mut interned = self
            .shared
            .interned
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let owned = interned.entry(handle).or_insert_with(|| {
            CString::new(text).unwrap_or_else(|_| CString::new("?").expect("literal"))
        });
        owned.as_ptr()
    }

    pub fn live_handles(&self) -> usize {
        self.read_registry().live_handles()
    }
}

enum Callable {
    Managed(crate::value::ManagedFn),
    Native(NativeTarget),
}

impl Drop for BridgeShared {
    fn drop(&mut self) {
        // A context dropped without shutdown still must not leak mirror
        // blocks or leave the queue armed.
        self.queue.disable();
        let mut mirrors = self.mirrors.lock().unwrap_or_else(|e| e.into_inner());
        for alloc in mirrors.drain(..) {
            unsafe { alloc.free(&self.stats) };
        }
    }
}
