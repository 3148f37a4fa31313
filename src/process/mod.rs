//! The modeled target process.
//!
//! Mapping operates against a [`ProcessSpace`], which bundles everything a
//! loaded module can touch at runtime: the virtual address space, the routine
//! dispatch table, process-wide TLS slots, exception registrations, the image
//! store dependency resolution draws from, and the registry of mapped modules.
//!
//! # Architecture
//!
//! Every sub-structure guards its own state with a short-lived lock, and none
//! of them is held while module code runs. [`ProcessSpace::call_routine`] and
//! the thread notification path take a snapshot of whatever they need before
//! invoking a routine, so module code is free to call back into the process
//! (spawn threads, read TLS, inspect the module list) without deadlocking.
//!
//! # Key Components
//!
//! - [`memory::VirtualMemory`] - page-protected byte-addressable memory
//! - [`routines::RoutineTable`] - token-to-closure dispatch for mapped code
//! - [`tls::TlsSlotTable`] - per-thread storage behind process-wide slots
//! - [`exceptions::DispatchTable`] - registered function tables for unwinding
//! - [`store::ImageStore`] - published images for dependency resolution
//! - [`ModuleRecord`] - the registry entry describing one mapped module
//!
//! # Examples
//!
//! ```rust
//! use lodestone::process::ProcessSpace;
//!
//! let space = ProcessSpace::new();
//! space.store().publish("dep.lmd", vec![]);
//! assert!(space.store().contains("dep.lmd"));
//! ```

pub mod exceptions;
pub mod memory;
pub mod routines;
pub mod store;
pub mod tls;

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
};

use dashmap::DashMap;

use crate::{
    image::{
        exports::ExportDirectory,
        format::PlatformAbi,
        imports::ImportTarget,
    },
    process::{
        exceptions::DispatchTable,
        memory::VirtualMemory,
        routines::{NotificationReason, RoutineFrame, RoutineTable},
        store::ImageStore,
        tls::TlsSlotTable,
    },
    Result,
};

/// Snapshot of a module's notification history.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModuleRuntimeState {
    /// The most recent notification delivered to the module
    pub last_reason: Option<NotificationReason>,
    /// Whether the process attach notification completed successfully
    pub attached: bool,
    /// Whether the process detach notification has been delivered
    pub detached: bool,
    /// Whether the module's teardown has fully completed
    pub torn_down: bool,
    /// Number of TLS callback invocations completed across all reasons
    pub callbacks_completed: usize,
}

/// Everything the mapper knows about a module at registration time.
pub(crate) struct ModuleInit {
    pub name: String,
    pub origin: String,
    pub base: u64,
    pub span: u64,
    pub abi: PlatformAbi,
    pub entry_point: Option<u64>,
    pub tls_slot: Option<usize>,
    pub tls_callbacks: Vec<u64>,
    pub exports: ExportDirectory,
    pub dependency: bool,
    pub routines_enabled: bool,
    pub deps: Vec<Arc<ModuleRecord>>,
}

/// A mapped module as seen by the process.
///
/// The descriptive fields are fixed at registration; only the runtime state,
/// the marker table and the reference count change afterwards. Records are
/// shared behind [`Arc`] between the registry, dependents and callers.
pub struct ModuleRecord {
    name: String,
    origin: String,
    base: u64,
    span: u64,
    abi: PlatformAbi,
    entry_point: Option<u64>,
    tls_slot: Option<usize>,
    tls_callbacks: Vec<u64>,
    exports: ExportDirectory,
    dependency: bool,
    routines_enabled: bool,
    deps: Vec<Arc<ModuleRecord>>,
    refs: AtomicUsize,
    markers: DashMap<String, u64>,
    state: Mutex<ModuleRuntimeState>,
}

impl ModuleRecord {
    pub(crate) fn new(init: ModuleInit) -> Arc<Self> {
        Arc::new(ModuleRecord {
            name: init.name,
            origin: init.origin,
            base: init.base,
            span: init.span,
            abi: init.abi,
            entry_point: init.entry_point,
            tls_slot: init.tls_slot,
            tls_callbacks: init.tls_callbacks,
            exports: init.exports,
            dependency: init.dependency,
            routines_enabled: init.routines_enabled,
            deps: init.deps,
            refs: AtomicUsize::new(1),
            markers: DashMap::new(),
            state: Mutex::new(ModuleRuntimeState::default()),
        })
    }

    /// The module's short name, as dependencies refer to it.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The store origin the module was mapped from.
    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Base address of the mapped image.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Size of the mapped image in bytes.
    #[must_use]
    pub fn span(&self) -> u64 {
        self.span
    }

    /// The image's architecture width.
    #[must_use]
    pub fn abi(&self) -> PlatformAbi {
        self.abi
    }

    /// Absolute address of the entry routine, if the image declares one.
    #[must_use]
    pub fn entry_point(&self) -> Option<u64> {
        self.entry_point
    }

    /// The process-wide TLS slot assigned to the module, if it carries TLS.
    #[must_use]
    pub fn tls_slot(&self) -> Option<usize> {
        self.tls_slot
    }

    /// Absolute addresses of the module's TLS callbacks, in directory order.
    #[must_use]
    pub fn tls_callbacks(&self) -> &[u64] {
        &self.tls_callbacks
    }

    /// Absolute address of the export matching `target`, if the module
    /// publishes one.
    #[must_use]
    pub fn export_address(&self, target: &ImportTarget) -> Option<u64> {
        self.exports.find(target).map(|rva| self.base + u64::from(rva))
    }

    /// Whether the module was mapped as a dependency of another module.
    #[must_use]
    pub fn is_dependency(&self) -> bool {
        self.dependency
    }

    /// Whether notifications are delivered to this module at all.
    #[must_use]
    pub fn routines_enabled(&self) -> bool {
        self.routines_enabled
    }

    /// The dependencies this module holds references on.
    #[must_use]
    pub fn deps(&self) -> &[Arc<ModuleRecord>] {
        &self.deps
    }

    /// Whether `address` falls inside the mapped image.
    #[must_use]
    pub fn contains(&self, address: u64) -> bool {
        address >= self.base && address < self.base + self.span
    }

    /// Record an observation under `key`; routines use this to leave evidence.
    pub fn set_marker(&self, key: &str, value: u64) {
        self.markers.insert(key.to_string(), value);
    }

    /// Read back a recorded observation.
    #[must_use]
    pub fn marker(&self, key: &str) -> Option<u64> {
        self.markers.get(key).map(|entry| *entry.value())
    }

    /// Current notification history.
    #[must_use]
    pub fn runtime_state(&self) -> ModuleRuntimeState {
        *lock!(self.state)
    }

    pub(crate) fn update_state(&self, apply: impl FnOnce(&mut ModuleRuntimeState)) {
        let mut state = lock!(self.state);
        apply(&mut state);
    }

    pub(crate) fn add_ref(&self) -> usize {
        self.refs.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn release_ref(&self) -> usize {
        self.refs.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub(crate) fn ref_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }
}

/// The modeled process mapping operates against.
pub struct ProcessSpace {
    memory: VirtualMemory,
    routines: RoutineTable,
    tls: TlsSlotTable,
    exceptions: DispatchTable,
    store: ImageStore,
    modules: Mutex<Vec<Arc<ModuleRecord>>>,
}

impl ProcessSpace {
    /// Create an empty process.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(ProcessSpace {
            memory: VirtualMemory::new(),
            routines: RoutineTable::new(),
            tls: TlsSlotTable::new(),
            exceptions: DispatchTable::new(),
            store: ImageStore::new(),
            modules: Mutex::new(Vec::new()),
        })
    }

    /// The process's address space.
    #[must_use]
    pub fn memory(&self) -> &VirtualMemory {
        &self.memory
    }

    /// The routine dispatch table.
    #[must_use]
    pub fn routines(&self) -> &RoutineTable {
        &self.routines
    }

    /// The process-wide TLS slot table.
    #[must_use]
    pub fn tls(&self) -> &TlsSlotTable {
        &self.tls
    }

    /// The exception dispatch registrations.
    #[must_use]
    pub fn exceptions(&self) -> &DispatchTable {
        &self.exceptions
    }

    /// The image store dependency resolution draws from.
    #[must_use]
    pub fn store(&self) -> &ImageStore {
        &self.store
    }

    pub(crate) fn register_module(&self, record: Arc<ModuleRecord>) {
        let mut modules = lock!(self.modules);
        modules.push(record);
    }

    pub(crate) fn remove_module(&self, base: u64) {
        let mut modules = lock!(self.modules);
        modules.retain(|module| module.base() != base);
    }

    /// The module mapped at `base`, if any.
    #[must_use]
    pub fn module_at(&self, base: u64) -> Option<Arc<ModuleRecord>> {
        let modules = lock!(self.modules);
        modules.iter().find(|m| m.base() == base).cloned()
    }

    /// Look a module up by its short name or store origin.
    #[must_use]
    pub fn find_module(&self, name: &str) -> Option<Arc<ModuleRecord>> {
        let modules = lock!(self.modules);
        modules
            .iter()
            .find(|m| m.name() == name || m.origin() == name)
            .cloned()
    }

    /// Store origins of every mapped module, in mapping order.
    #[must_use]
    pub fn module_origins(&self) -> Vec<String> {
        let modules = lock!(self.modules);
        modules.iter().map(|m| m.origin().to_string()).collect()
    }

    /// Number of mapped modules.
    #[must_use]
    pub fn module_count(&self) -> usize {
        let modules = lock!(self.modules);
        modules.len()
    }

    fn module_snapshot(&self) -> Vec<Arc<ModuleRecord>> {
        let modules = lock!(self.modules);
        modules.clone()
    }

    /// Resolve the handler for a fault at `address` through the registered
    /// function tables.
    #[must_use]
    pub fn dispatch_exception(&self, address: u64) -> Option<u64> {
        self.exceptions.dispatch(address)
    }

    /// Invoke the routine whose token is stored at `address` in mapped code.
    ///
    /// The token is fetched as an instruction read, so calling into a page
    /// without EXECUTE faults. No process lock is held while the routine runs;
    /// a panic escaping it is contained and reported as
    /// [`crate::Error::EntryPointPanic`].
    ///
    /// # Errors
    /// Fails on a bad address, an unknown token, or an escaped panic.
    pub fn call_routine(
        self: &Arc<Self>,
        module: &Arc<ModuleRecord>,
        address: u64,
        reason: NotificationReason,
    ) -> Result<u32> {
        let token = self.memory.read_code_u32(address)?;
        let routine = self.routines.resolve(token)?;

        let frame = RoutineFrame::new(self, module, reason);
        catch_unwind(AssertUnwindSafe(|| routine(&frame)))
            .map_err(|_| crate::Error::EntryPointPanic { reason })
    }

    /// Deliver one notification to a module: TLS storage for the calling thread
    /// is materialized first, then the TLS callbacks run in directory order,
    /// then the entry routine. Returns the entry routine's result, or `None`
    /// when the module has no entry routine or notifications are disabled.
    ///
    /// # Errors
    /// Propagates faults and escaped panics from any callback or the entry
    /// routine; remaining callbacks are not run after a failure.
    pub fn notify_module(
        self: &Arc<Self>,
        module: &Arc<ModuleRecord>,
        reason: NotificationReason,
    ) -> Result<Option<u32>> {
        if !module.routines_enabled() {
            return Ok(None);
        }

        // The thread's block exists before any module code can observe it
        if let Some(slot) = module.tls_slot() {
            self.tls.slot_storage(slot)?;
        }

        for callback in module.tls_callbacks() {
            self.call_routine(module, *callback, reason)?;
            module.update_state(|state| state.callbacks_completed += 1);
        }

        module.update_state(|state| state.last_reason = Some(reason));

        match module.entry_point() {
            Some(entry) => Ok(Some(self.call_routine(module, entry, reason)?)),
            None => Ok(None),
        }
    }

    /// Spawn an OS thread that observes the mapped modules the way a new
    /// thread in the target would: every module receives a thread attach
    /// notification before `body` runs and a thread detach notification after,
    /// detach in reverse mapping order. Entry routine results are ignored for
    /// thread notifications; faults and escaped panics still abort the thread.
    pub fn spawn_thread<T, F>(self: &Arc<Self>, body: F) -> JoinHandle<Result<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let space = self.clone();
        std::thread::spawn(move || {
            let snapshot = space.module_snapshot();

            for module in &snapshot {
                space.notify_module(module, NotificationReason::ThreadAttach)?;
            }

            let value = body();

            for module in snapshot.iter().rev() {
                space.notify_module(module, NotificationReason::ThreadDetach)?;
            }

            Ok(value)
        })
    }
}
