//! External-read surface.
//!
//! An out-of-process reader finds the registry through a single exported
//! symbol, [`LABELSCOPE_ANCHOR`] (`labelscope_anchor` in the symbol table),
//! and from there walks plain `#[repr(C)]` structures:
//!
//! ```text
//! Anchor          { magic, version, reserved, header }
//!   └─ SurfaceHeader { magic, version, slot_size, node_size, reserved,
//!                      capacity, slots, current_context, current_set, live }
//!        └─ [Slot; capacity] { id, head }
//!             └─ RawNode chain (see labelscope_core::RawNode)
//! ```
//!
//! All fields are native-endian `u64`/`u32`. The slot table never relocates.
//! Slots are found by open addressing: start at `splitmix64(id) % capacity`
//! and probe linearly, skipping tombstones (`u64::MAX`) and stopping at an
//! empty slot (`0`).
//!
//! Writers publish a chain only after it is fully built: a new slot gets its
//! `head` before its `id`, and a removed slot gets its tombstone id before
//! its `head` is cleared, both with release ordering. Readers take no locks
//! and may observe a stale but internally consistent chain.

pub mod reader;

use std::sync::atomic::{AtomicU64, Ordering};

use labelscope_core::{ContextId, RawNode};

/// Magic value at the start of the anchor and of the header.
pub const SURFACE_MAGIC: u64 = u64::from_ne_bytes(*b"LBLSCOPE");

/// Layout version of every structure reachable from the anchor.
pub const SCHEMA_VERSION: u32 = 1;

/// Name of the exported anchor symbol.
pub const ANCHOR_SYMBOL: &str = "labelscope_anchor";

pub(crate) const EMPTY_ID: u64 = 0;
pub(crate) const TOMBSTONE_ID: u64 = u64::MAX;

/// Probe start for `id` in a table of `capacity` slots.
pub fn home_slot(id: u64, capacity: u64) -> u64 {
    let mut z = id.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    (z ^ (z >> 31)) % capacity
}

fn address_of<T>(ptr: *const T) -> u64 {
    ptr.addr() as u64
}

// ─────────────────────────────────────────────────────────────────────────────
// Anchor
// ─────────────────────────────────────────────────────────────────────────────

/// The process-wide entry point for external readers.
#[repr(C)]
pub struct Anchor {
    magic: u64,
    version: u32,
    reserved: u32,
    header: AtomicU64,
}

impl Anchor {
    /// Size of the anchor in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Address of the published header, or zero.
    pub fn header(&self) -> u64 {
        self.header.load(Ordering::Acquire)
    }

    /// Address of this anchor.
    pub fn addr(&self) -> u64 {
        address_of(std::ptr::from_ref(self))
    }

    /// Point the anchor at `header`. Only the first publication wins.
    pub(crate) fn publish(&self, header: u64) -> bool {
        self.header
            .compare_exchange(0, header, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Exported anchor. Its header is set once, by the process-global registry.
#[allow(unsafe_code)]
#[unsafe(export_name = "labelscope_anchor")]
pub static LABELSCOPE_ANCHOR: Anchor = Anchor {
    magic: SURFACE_MAGIC,
    version: SCHEMA_VERSION,
    reserved: 0,
    header: AtomicU64::new(0),
};

// ─────────────────────────────────────────────────────────────────────────────
// Header
// ─────────────────────────────────────────────────────────────────────────────

/// Fixed header describing one registry's slot table and current pointer.
#[repr(C)]
pub struct SurfaceHeader {
    magic: u64,
    version: u32,
    slot_size: u32,
    node_size: u32,
    reserved: u32,
    capacity: u64,
    slots: u64,
    current_context: AtomicU64,
    current_set: AtomicU64,
    live: AtomicU64,
}

impl SurfaceHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn new(table: &SlotTable) -> Self {
        Self {
            magic: SURFACE_MAGIC,
            version: SCHEMA_VERSION,
            slot_size: Slot::SIZE as u32,
            node_size: RawNode::SIZE as u32,
            reserved: 0,
            capacity: table.capacity(),
            slots: table.addr(),
            current_context: AtomicU64::new(ContextId::ROOT.get()),
            current_set: AtomicU64::new(0),
            live: AtomicU64::new(0),
        }
    }

    pub(crate) fn addr(&self) -> u64 {
        address_of(std::ptr::from_ref(self))
    }

    pub(crate) fn publish_current(&self, ctx: ContextId, head: u64) {
        self.current_set.store(head, Ordering::Release);
        self.current_context.store(ctx.get(), Ordering::Release);
    }

    pub(crate) fn publish_current_set(&self, head: u64) {
        self.current_set.store(head, Ordering::Release);
    }

    pub(crate) fn current_set(&self) -> u64 {
        self.current_set.load(Ordering::Acquire)
    }

    pub(crate) fn set_live(&self, live: u64) {
        self.live.store(live, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn live(&self) -> u64 {
        self.live.load(Ordering::Acquire)
    }
}

/// Decoded copy of a [`SurfaceHeader`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderView {
    /// Must equal [`SURFACE_MAGIC`].
    pub magic: u64,
    /// Must equal [`SCHEMA_VERSION`].
    pub version: u32,
    /// Size of one slot in bytes.
    pub slot_size: u32,
    /// Size of the node prefix in bytes.
    pub node_size: u32,
    /// Number of slots.
    pub capacity: u64,
    /// Address of slot zero.
    pub slots: u64,
    /// Id of the context whose set is current.
    pub current_context: u64,
    /// Head of the current set.
    pub current_set: u64,
    /// Number of occupied slots.
    pub live: u64,
}

impl HeaderView {
    /// Decode a header from native-endian bytes.
    pub fn from_bytes(buf: &[u8; SurfaceHeader::SIZE]) -> Self {
        let word = |off: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[off..off + 8]);
            u64::from_ne_bytes(b)
        };
        let half = |off: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&buf[off..off + 4]);
            u32::from_ne_bytes(b)
        };
        Self {
            magic: word(0),
            version: half(8),
            slot_size: half(12),
            node_size: half(16),
            capacity: word(24),
            slots: word(32),
            current_context: word(40),
            current_set: word(48),
            live: word(56),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Slot table
// ─────────────────────────────────────────────────────────────────────────────

/// One `{ id, head }` entry of the slot table.
#[repr(C)]
pub struct Slot {
    id: AtomicU64,
    head: AtomicU64,
}

impl Slot {
    /// Size of a slot in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

/// Fixed-capacity open-addressing table. Mutated only by the registry's
/// writer; read concurrently through raw memory.
pub(crate) struct SlotTable {
    slots: Box<[Slot]>,
}

impl SlotTable {
    pub(crate) fn new(capacity: usize) -> Self {
        let slots = (0..capacity.max(1))
            .map(|_| Slot {
                id: AtomicU64::new(EMPTY_ID),
                head: AtomicU64::new(0),
            })
            .collect();
        Self { slots }
    }

    pub(crate) fn capacity(&self) -> u64 {
        self.slots.len() as u64
    }

    pub(crate) fn addr(&self) -> u64 {
        address_of(self.slots.as_ptr())
    }

    fn probe(&self, id: ContextId) -> impl Iterator<Item = usize> {
        let len = self.slots.len();
        let start = usize::try_from(home_slot(id.get(), self.capacity())).unwrap_or(0);
        (0..len).map(move |step| (start + step) % len)
    }

    /// Claim a slot for `id` with `head` as its chain. `None` when full.
    ///
    /// The caller guarantees `id` is not already present.
    pub(crate) fn insert(&self, id: ContextId, head: u64) -> Option<usize> {
        let index = self.probe(id).find(|&i| {
            let current = self.slots[i].id.load(Ordering::Relaxed);
            current == EMPTY_ID || current == TOMBSTONE_ID
        })?;
        let slot = &self.slots[index];
        slot.head.store(head, Ordering::Release);
        slot.id.store(id.get(), Ordering::Release);
        Some(index)
    }

    pub(crate) fn store_head(&self, index: usize, head: u64) {
        self.slots[index].head.store(head, Ordering::Release);
    }

    /// Tombstone `index`, then turn trailing tombstones back into empty
    /// slots when nothing can be probed past them.
    pub(crate) fn remove(&self, index: usize) {
        let slot = &self.slots[index];
        slot.id.store(TOMBSTONE_ID, Ordering::Release);
        slot.head.store(0, Ordering::Release);

        let len = self.slots.len();
        let next = (index + 1) % len;
        if self.slots[next].id.load(Ordering::Relaxed) != EMPTY_ID {
            return;
        }
        let mut i = index;
        for _ in 0..len {
            if self.slots[i].id.load(Ordering::Relaxed) != TOMBSTONE_ID {
                break;
            }
            self.slots[i].id.store(EMPTY_ID, Ordering::Release);
            i = (i + len - 1) % len;
        }
    }

    /// Published head for `id`, probing the way an external reader does.
    pub(crate) fn lookup(&self, id: ContextId) -> Option<u64> {
        for i in self.probe(id) {
            let slot = &self.slots[i];
            match slot.id.load(Ordering::Acquire) {
                EMPTY_ID => return None,
                found if found == id.get() => return Some(slot.head.load(Ordering::Acquire)),
                _ => {}
            }
        }
        None
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u64) -> ContextId {
        ContextId::new(raw).unwrap()
    }

    fn slot_id(table: &SlotTable, index: usize) -> u64 {
        table.slots[index].id.load(Ordering::Relaxed)
    }

    /// Ids whose home slot is `target` in a table of `capacity`.
    fn ids_homed_at(target: u64, capacity: u64, count: usize) -> Vec<ContextId> {
        (2..)
            .filter(|raw| home_slot(*raw, capacity) == target)
            .take(count)
            .map(id)
            .collect()
    }

    #[test]
    fn layout_sizes() {
        assert_eq!(Slot::SIZE, 16);
        assert_eq!(SurfaceHeader::SIZE, 64);
        assert_eq!(Anchor::SIZE, 24);
    }

    #[test]
    fn magic_spells_name() {
        assert_eq!(&SURFACE_MAGIC.to_ne_bytes(), b"LBLSCOPE");
    }

    #[test]
    fn insert_lookup_remove() {
        let table = SlotTable::new(8);
        let index = table.insert(id(5), 0x1000).unwrap();
        assert_eq!(table.lookup(id(5)), Some(0x1000));
        table.store_head(index, 0x2000);
        assert_eq!(table.lookup(id(5)), Some(0x2000));
        table.remove(index);
        assert_eq!(table.lookup(id(5)), None);
    }

    #[test]
    fn collisions_probe_past_tombstones() {
        let table = SlotTable::new(8);
        let ids = ids_homed_at(3, 8, 3);
        let slots: Vec<usize> = ids.iter().map(|i| table.insert(*i, 0).unwrap()).collect();
        assert_eq!(slots, [3, 4, 5]);

        table.remove(slots[1]);
        assert_eq!(slot_id(&table, 4), TOMBSTONE_ID);
        assert_eq!(table.lookup(ids[2]), Some(0));

        // The tombstone is reused by the next colliding insert.
        let extra = ids_homed_at(3, 8, 4)[3];
        assert_eq!(table.insert(extra, 0), Some(4));
    }

    #[test]
    fn trailing_tombstones_become_empty() {
        let table = SlotTable::new(8);
        let ids = ids_homed_at(6, 8, 2);
        let a = table.insert(ids[0], 0).unwrap();
        let b = table.insert(ids[1], 0).unwrap();
        table.remove(a);
        assert_eq!(slot_id(&table, a), TOMBSTONE_ID);
        table.remove(b);
        assert_eq!(slot_id(&table, a), EMPTY_ID);
        assert_eq!(slot_id(&table, b), EMPTY_ID);
    }

    #[test]
    fn full_table_rejects_insert() {
        let table = SlotTable::new(4);
        for raw in 2..6 {
            assert!(table.insert(id(raw), 0).is_some());
        }
        assert_eq!(table.insert(id(6), 0), None);
    }

    #[test]
    fn header_view_round_trips_live_header() {
        let table = SlotTable::new(32);
        let header = SurfaceHeader::new(&table);
        header.publish_current(id(9), 0xabc0);
        header.set_live(3);

        let mut buf = [0u8; SurfaceHeader::SIZE];
        buf[0..8].copy_from_slice(&header.magic.to_ne_bytes());
        buf[8..12].copy_from_slice(&header.version.to_ne_bytes());
        buf[12..16].copy_from_slice(&header.slot_size.to_ne_bytes());
        buf[16..20].copy_from_slice(&header.node_size.to_ne_bytes());
        buf[24..32].copy_from_slice(&header.capacity.to_ne_bytes());
        buf[32..40].copy_from_slice(&header.slots.to_ne_bytes());
        buf[40..48].copy_from_slice(&9u64.to_ne_bytes());
        buf[48..56].copy_from_slice(&0xabc0u64.to_ne_bytes());
        buf[56..64].copy_from_slice(&3u64.to_ne_bytes());

        let view = HeaderView::from_bytes(&buf);
        assert_eq!(view.magic, SURFACE_MAGIC);
        assert_eq!(view.slot_size, 16);
        assert_eq!(view.node_size, 48);
        assert_eq!(view.capacity, 32);
        assert_eq!(view.slots, table.addr());
        assert_eq!(view.current_context, 9);
        assert_eq!(header.current_set(), 0xabc0);
    }
}
