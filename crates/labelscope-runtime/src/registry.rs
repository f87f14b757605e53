//! Context registry.
//!
//! Maps every live execution context to its active [`LabelSet`] and keeps
//! the reader-visible surface (slot table plus current pointer) in step.
//!
//! Writer-side bookkeeping lives behind one mutex. Under the single-writer
//! model it is never contended, and it is never held while application
//! code runs. External readers only ever touch the surface atomics.
//!
//! Runs are tracked per OS thread: each thread has its own stack of running
//! contexts, so a scope entered by a context on one thread is never visible
//! to a context polled on another. A thread with nothing running operates on
//! the root. The header's current pointer follows the most recent run
//! transition on any thread.
//!
//! Every label set displaced from the surface is parked in a bounded FIFO
//! before it is released, so a reader that loaded an old head address has
//! a grace period in which the chain is still intact.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use labelscope_core::{ContextId, EventFault, Interner, LabelSet, Override};
use labelscope_settings::LabelscopeSettings;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::hooks::{HostCapabilities, RunNotifications};
use crate::surface::{LABELSCOPE_ANCHOR, SlotTable, SurfaceHeader};

/// Smallest slot table the registry will build (the root plus one context).
const MIN_CAPACITY: usize = 2;

/// Registry construction parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Slot table capacity.
    pub capacity: usize,
    /// Number of displaced label sets kept alive for slow readers.
    pub retire_depth: usize,
    /// Share identical derivations through an [`Interner`].
    pub dedup: bool,
    /// Derived chains deeper than this are compacted before install.
    pub max_chain_depth: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::from(&LabelscopeSettings::default())
    }
}

impl From<&LabelscopeSettings> for RegistryConfig {
    fn from(settings: &LabelscopeSettings) -> Self {
        Self {
            capacity: settings.registry.capacity,
            retire_depth: settings.registry.retire_depth,
            dedup: settings.labels.dedup,
            max_chain_depth: settings.labels.max_chain_depth,
        }
    }
}

/// Counters describing registry activity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Live contexts, including the root.
    pub live: usize,
    /// Live contexts that hold a slot.
    pub published: usize,
    /// Slot table capacity.
    pub capacity: usize,
    /// Contexts created since construction.
    pub created: u64,
    /// Contexts destroyed since construction.
    pub destroyed: u64,
    /// Events ignored because they referenced an unknown or invalid context.
    pub stale_events: u64,
    /// Creations whose trigger had no labels to inherit.
    pub orphaned: u64,
    /// Creations that found the slot table full.
    pub unpublished: u64,
    /// Derivations answered by the interner.
    pub interned: u64,
    /// Displaced label sets currently held for readers.
    pub retired: usize,
}

/// Diagnostic view of one live context.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ContextSnapshot {
    /// The context.
    pub context: ContextId,
    /// The context it was created from, if any.
    pub parent: Option<ContextId>,
    /// Whether external readers can find it.
    pub published: bool,
    /// Its active label set.
    pub labels: LabelSet,
}

struct ContextEntry {
    labels: LabelSet,
    parent: Option<ContextId>,
    slot: Option<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct RunFrame {
    ctx: ContextId,
    depth: usize,
}

#[derive(Default)]
struct Counters {
    created: u64,
    destroyed: u64,
    stale_events: u64,
    orphaned: u64,
    unpublished: u64,
    published: usize,
}

struct WriterState {
    contexts: HashMap<ContextId, ContextEntry>,
    running: HashMap<ThreadId, Vec<RunFrame>>,
    retired: VecDeque<LabelSet>,
    interner: Interner,
    counters: Counters,
}

impl WriterState {
    /// Innermost context running on `thread`, or the root.
    fn current(&self, thread: ThreadId) -> ContextId {
        self.running
            .get(&thread)
            .and_then(|stack| stack.last())
            .map_or(ContextId::ROOT, |frame| frame.ctx)
    }
}

/// Outcome of a scheduler event: non-fatal notes, or the fault that caused
/// the event to be ignored.
pub(crate) type EventOutcome = Result<Vec<EventFault>, EventFault>;

/// Process-wide context registry.
pub struct Registry {
    config: RegistryConfig,
    table: SlotTable,
    header: Box<SurfaceHeader>,
    state: Mutex<WriterState>,
    next_id: AtomicU64,
    pub(crate) host: OnceLock<HostCapabilities>,
    pub(crate) capability_reported: AtomicBool,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.config)
            .field("header", &format_args!("{:#x}", self.header.addr()))
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Build a registry with a permanent root context holding the empty set.
    pub fn new(config: RegistryConfig) -> Self {
        let table = SlotTable::new(config.capacity.max(MIN_CAPACITY));
        let header = Box::new(SurfaceHeader::new(&table));
        let root_slot = table.insert(ContextId::ROOT, 0);
        header.set_live(1);

        let mut contexts = HashMap::new();
        let _ = contexts.insert(
            ContextId::ROOT,
            ContextEntry {
                labels: LabelSet::empty(),
                parent: None,
                slot: root_slot,
            },
        );
        Self {
            config,
            table,
            header,
            state: Mutex::new(WriterState {
                contexts,
                running: HashMap::new(),
                retired: VecDeque::new(),
                interner: Interner::new(),
                counters: Counters {
                    published: usize::from(root_slot.is_some()),
                    ..Counters::default()
                },
            }),
            next_id: AtomicU64::new(ContextId::ROOT.get() + 1),
            host: OnceLock::new(),
            capability_reported: AtomicBool::new(false),
        }
    }

    /// Build a registry from loaded settings.
    pub fn from_settings(settings: &LabelscopeSettings) -> Self {
        Self::new(RegistryConfig::from(settings))
    }

    /// Construction parameters.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Fresh identifier for an adapter-created context.
    pub fn next_context_id(&self) -> ContextId {
        let raw = self.next_id.fetch_add(1, Ordering::Relaxed);
        ContextId::new(raw).unwrap_or(ContextId::ROOT)
    }

    /// Declare what the host scheduler provides. The first binding wins;
    /// returns whether `caps` is now the bound set.
    pub fn bind_host(&self, caps: HostCapabilities) -> bool {
        let bound = self.bind_host_if_unbound(caps);
        if bound != caps {
            warn!(?bound, requested = ?caps, "host already bound with different capabilities");
        }
        bound == caps
    }

    /// Bind `caps` unless a host is already bound, and return whatever is
    /// bound afterwards. Never logs.
    pub fn bind_host_if_unbound(&self, caps: HostCapabilities) -> HostCapabilities {
        *self.host.get_or_init(|| caps)
    }

    /// Capabilities the host declared, if any.
    pub fn host(&self) -> Option<HostCapabilities> {
        self.host.get().copied()
    }

    /// Address of the surface header, for readers attaching directly.
    pub fn header_addr(&self) -> u64 {
        self.header.addr()
    }

    /// Point the exported anchor at this registry. Only one registry per
    /// process can be published, so this requires a registry that lives
    /// for the rest of the process.
    pub fn publish_anchor(&'static self) -> bool {
        let published = LABELSCOPE_ANCHOR.publish(self.header_addr());
        if published {
            debug!(header = format_args!("{:#x}", self.header_addr()), "published surface anchor");
        }
        published
    }

    /// The context running on the calling thread, or the root.
    pub fn current_context(&self) -> ContextId {
        self.state.lock().current(thread::current().id())
    }

    /// Active labels of `ctx`, if it is live.
    pub fn labels_of(&self, ctx: ContextId) -> Option<LabelSet> {
        self.state.lock().contexts.get(&ctx).map(|e| e.labels.clone())
    }

    /// Whether `ctx` is live.
    pub fn contains(&self, ctx: ContextId) -> bool {
        self.state.lock().contexts.contains_key(&ctx)
    }

    /// Whether external readers can find `ctx`.
    pub fn is_published(&self, ctx: ContextId) -> bool {
        self.table.lookup(ctx).is_some()
    }

    /// Snapshot counters.
    pub fn stats(&self) -> RegistryStats {
        let state = self.state.lock();
        RegistryStats {
            live: state.contexts.len(),
            published: state.counters.published,
            capacity: self.config.capacity.max(MIN_CAPACITY),
            created: state.counters.created,
            destroyed: state.counters.destroyed,
            stale_events: state.counters.stale_events,
            orphaned: state.counters.orphaned,
            unpublished: state.counters.unpublished,
            interned: state.interner.hits(),
            retired: state.retired.len(),
        }
    }

    /// Every live context ordered by id.
    pub fn snapshot(&self) -> Vec<ContextSnapshot> {
        let state = self.state.lock();
        let mut out: Vec<ContextSnapshot> = state
            .contexts
            .iter()
            .map(|(ctx, entry)| ContextSnapshot {
                context: *ctx,
                parent: entry.parent,
                published: entry.slot.is_some(),
                labels: entry.labels.clone(),
            })
            .collect();
        out.sort_by_key(|s| s.context);
        out
    }

    // ── Lifecycle events ────────────────────────────────────────────

    pub(crate) fn create(
        &self,
        child: ContextId,
        trigger: ContextId,
        overrides: Vec<(Arc<str>, Override)>,
    ) -> EventOutcome {
        let mut state = self.state.lock();
        if state.contexts.contains_key(&child) {
            state.counters.stale_events += 1;
            return Err(EventFault::DuplicateContext);
        }
        let mut notes = Vec::new();
        let inherited = if let Some(entry) = state.contexts.get(&trigger) {
            entry.labels.clone()
        } else {
            state.counters.orphaned += 1;
            notes.push(EventFault::OrphanedTrigger);
            LabelSet::empty()
        };
        let labels = if overrides.is_empty() {
            inherited
        } else {
            self.derive(&mut state, &inherited, overrides)
        };

        let slot = self.table.insert(child, labels.addr());
        if slot.is_some() {
            state.counters.published += 1;
        } else {
            state.counters.unpublished += 1;
            notes.push(EventFault::CapacityExhausted);
        }
        let _ = state.contexts.insert(
            child,
            ContextEntry {
                labels,
                parent: Some(trigger),
                slot,
            },
        );
        state.counters.created += 1;
        self.header.set_live(state.counters.published as u64);
        Ok(notes)
    }

    pub(crate) fn before_run(&self, ctx: ContextId) -> EventOutcome {
        let mut state = self.state.lock();
        if !state.contexts.contains_key(&ctx) {
            state.counters.stale_events += 1;
            return Err(EventFault::UnknownContext);
        }
        let replace_stack = self
            .host()
            .is_some_and(|h| h.run_notifications == RunNotifications::BeforeEachResume);
        let thread = thread::current().id();
        let stack = state.running.entry(thread).or_default();
        if replace_stack {
            stack.clear();
        }
        match stack.last_mut() {
            Some(top) if top.ctx == ctx => top.depth += 1,
            _ => stack.push(RunFrame { ctx, depth: 1 }),
        }
        self.publish_current(&state, thread);
        Ok(Vec::new())
    }

    pub(crate) fn after_run(&self, ctx: ContextId) -> EventOutcome {
        let mut state = self.state.lock();
        let thread = thread::current().id();
        if state.current(thread) != ctx || ctx.is_root() {
            state.counters.stale_events += 1;
            return Err(if state.contexts.contains_key(&ctx) {
                EventFault::NotRunning
            } else {
                EventFault::UnknownContext
            });
        }
        let emptied = match state.running.get_mut(&thread) {
            Some(stack) => {
                if let Some(top) = stack.last_mut() {
                    top.depth -= 1;
                    if top.depth == 0 {
                        let _ = stack.pop();
                    }
                }
                stack.is_empty()
            }
            None => false,
        };
        if emptied {
            let _ = state.running.remove(&thread);
        }
        self.publish_current(&state, thread);
        Ok(Vec::new())
    }

    pub(crate) fn destroy(&self, ctx: ContextId) -> EventOutcome {
        let mut state = self.state.lock();
        if ctx.is_root() {
            state.counters.stale_events += 1;
            return Err(EventFault::RootDestroy);
        }
        let Some(entry) = state.contexts.remove(&ctx) else {
            state.counters.stale_events += 1;
            return Err(EventFault::UnknownContext);
        };
        if let Some(slot) = entry.slot {
            self.table.remove(slot);
            state.counters.published -= 1;
        }
        for stack in state.running.values_mut() {
            stack.retain(|frame| frame.ctx != ctx);
        }
        state.running.retain(|_, stack| !stack.is_empty());
        self.publish_current(&state, thread::current().id());
        self.retire(&mut state, entry.labels);
        state.counters.destroyed += 1;
        self.header.set_live(state.counters.published as u64);
        Ok(Vec::new())
    }

    // ── Label installation ──────────────────────────────────────────

    /// Derive `base + overrides`, sharing through the interner when enabled
    /// and compacting chains that grew past the configured depth.
    fn derive(
        &self,
        state: &mut WriterState,
        base: &LabelSet,
        overrides: impl IntoIterator<Item = (Arc<str>, Override)>,
    ) -> LabelSet {
        let derived = if self.config.dedup {
            state.interner.apply(base, overrides)
        } else {
            base.apply(overrides)
        };
        if derived.depth() > self.config.max_chain_depth {
            trace!(depth = derived.depth(), "compacting label chain");
            derived.compact()
        } else {
            derived
        }
    }

    /// Derive from the current context's set and install the result.
    /// Returns the context and the set it displaced, or `None` when nothing
    /// changed.
    pub(crate) fn push_overrides(
        &self,
        overrides: impl IntoIterator<Item = (Arc<str>, Override)>,
    ) -> Option<(ContextId, LabelSet)> {
        let mut state = self.state.lock();
        let ctx = state.current(thread::current().id());
        let base = state.contexts.get(&ctx)?.labels.clone();
        let derived = self.derive(&mut state, &base, overrides);
        if derived.ptr_eq(&base) {
            return None;
        }
        self.install(&mut state, ctx, derived);
        Some((ctx, base))
    }

    /// Put `labels` back as the active set of `ctx`, if it is still live.
    pub(crate) fn restore(&self, ctx: ContextId, labels: LabelSet) {
        let mut state = self.state.lock();
        self.install(&mut state, ctx, labels);
    }

    /// Active set of the current context.
    pub(crate) fn current_labels(&self) -> LabelSet {
        let state = self.state.lock();
        state
            .contexts
            .get(&state.current(thread::current().id()))
            .map(|e| e.labels.clone())
            .unwrap_or_default()
    }

    fn install(&self, state: &mut WriterState, ctx: ContextId, labels: LabelSet) {
        let is_current = state.current(thread::current().id()) == ctx;
        let Some(entry) = state.contexts.get_mut(&ctx) else {
            return;
        };
        let head = labels.addr();
        let old = std::mem::replace(&mut entry.labels, labels);
        if let Some(slot) = entry.slot {
            self.table.store_head(slot, head);
        }
        if is_current {
            self.header.publish_current_set(head);
            trace!(context = %ctx, head = format_args!("{head:#x}"), "published current set");
        }
        self.retire(state, old);
    }

    fn publish_current(&self, state: &WriterState, thread: ThreadId) {
        let ctx = state.current(thread);
        let head = state.contexts.get(&ctx).map_or(0, |e| e.labels.addr());
        self.header.publish_current(ctx, head);
        trace!(context = %ctx, head = format_args!("{head:#x}"), "published current context");
    }

    fn retire(&self, state: &mut WriterState, labels: LabelSet) {
        if labels.addr() == 0 || self.config.retire_depth == 0 {
            return;
        }
        state.retired.push_back(labels);
        while state.retired.len() > self.config.retire_depth {
            let _ = state.retired.pop_front();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
