//! Decoder for a published surface.
//!
//! [`SurfaceReader`] needs nothing from the target process beyond the
//! ability to copy bytes out of it ([`MemorySource`]). Every pointer it
//! follows is validated before use: chains are length-limited and
//! cycle-checked, and a read that does not decode is reported as
//! [`SurfaceError::Corrupt`] rather than trusted. Since the writer never
//! blocks on readers, a torn read is possible and callers are expected to
//! retry.

use std::collections::{BTreeMap, HashSet};
use std::io;

use labelscope_core::{ContextId, Label, LabelValue, RawNode, SurfaceError, ValueTag};
use serde::Serialize;

use super::{
    Anchor, EMPTY_ID, HeaderView, SCHEMA_VERSION, SURFACE_MAGIC, Slot, SurfaceHeader,
    TOMBSTONE_ID, home_slot,
};

/// Chains longer than this are treated as corrupt.
pub const MAX_CHAIN_NODES: usize = 1 << 16;
/// Keys longer than this are treated as corrupt.
pub const MAX_KEY_LEN: u64 = 4096;
/// String values longer than this are treated as corrupt.
pub const MAX_VALUE_LEN: u64 = 1 << 20;

const SLOTS_PER_READ: u64 = 4096;

/// Random-access view of another address space.
pub trait MemorySource {
    /// Fill `buf` with the bytes at `addr`.
    fn read_at(&self, addr: u64, buf: &mut [u8]) -> io::Result<()>;
}

impl<M: MemorySource + ?Sized> MemorySource for &M {
    fn read_at(&self, addr: u64, buf: &mut [u8]) -> io::Result<()> {
        (**self).read_at(addr, buf)
    }
}

/// Memory of a live process, read through `/proc/<pid>/mem`.
#[cfg(target_os = "linux")]
#[derive(Debug)]
pub struct ProcMemory {
    pid: u32,
    file: std::fs::File,
}

#[cfg(target_os = "linux")]
impl ProcMemory {
    /// Open the memory of process `pid`. Requires ptrace access to it.
    pub fn open(pid: u32) -> io::Result<Self> {
        let file = std::fs::File::open(format!("/proc/{pid}/mem"))?;
        Ok(Self { pid, file })
    }

    /// Open this process's own memory.
    pub fn current() -> io::Result<Self> {
        Self::open(std::process::id())
    }

    /// The target process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }
}

#[cfg(target_os = "linux")]
impl MemorySource for ProcMemory {
    fn read_at(&self, addr: u64, buf: &mut [u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, addr)
    }
}

/// The current pointer as seen by a reader.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CurrentView {
    /// Context whose set is current, if the id decoded.
    pub context: Option<ContextId>,
    /// Its effective labels.
    pub labels: Vec<Label>,
}

/// Lock-free decoder for a registry's surface.
#[derive(Debug)]
pub struct SurfaceReader<M> {
    mem: M,
    header_addr: u64,
    header: HeaderView,
}

impl<M: MemorySource> SurfaceReader<M> {
    /// Validate the header at `header_addr` and build a reader over it.
    pub fn attach(mem: M, header_addr: u64) -> Result<Self, SurfaceError> {
        let header = read_header(&mem, header_addr)?;
        Ok(Self {
            mem,
            header_addr,
            header,
        })
    }

    /// Follow the anchor at `anchor_addr` to its header.
    pub fn from_anchor(mem: M, anchor_addr: u64) -> Result<Self, SurfaceError> {
        let mut buf = [0u8; Anchor::SIZE];
        read(&mem, anchor_addr, &mut buf)?;
        let magic = word(&buf, 0);
        if magic != SURFACE_MAGIC {
            return Err(SurfaceError::BadMagic {
                addr: anchor_addr,
                found: magic,
            });
        }
        let version = half(&buf, 8);
        if version != SCHEMA_VERSION {
            return Err(SurfaceError::UnsupportedVersion {
                found: version,
                supported: SCHEMA_VERSION,
            });
        }
        match word(&buf, 16) {
            0 => Err(SurfaceError::NotPublished),
            header => Self::attach(mem, header),
        }
    }

    /// Address of the header this reader decodes.
    pub fn header_addr(&self) -> u64 {
        self.header_addr
    }

    /// The header as of the last [`attach`](Self::attach) or
    /// [`refresh`](Self::refresh).
    pub fn header(&self) -> &HeaderView {
        &self.header
    }

    /// Re-read the header's mutable fields.
    pub fn refresh(&mut self) -> Result<(), SurfaceError> {
        self.header = read_header(&self.mem, self.header_addr)?;
        Ok(())
    }

    fn slot(&self, index: u64) -> Result<(u64, u64), SurfaceError> {
        let mut buf = [0u8; Slot::SIZE];
        read(&self.mem, self.slot_addr(index)?, &mut buf)?;
        Ok((word(&buf, 0), word(&buf, 8)))
    }

    fn slot_addr(&self, index: u64) -> Result<u64, SurfaceError> {
        index
            .checked_mul(Slot::SIZE as u64)
            .and_then(|off| self.header.slots.checked_add(off))
            .ok_or_else(|| corrupt(self.header_addr, format!("slot {index} lies outside the address space")))
    }

    /// Head address published for `ctx`.
    pub fn find(&self, ctx: ContextId) -> Result<u64, SurfaceError> {
        let capacity = self.header.capacity;
        let start = home_slot(ctx.get(), capacity);
        for index in (start..capacity).chain(0..start) {
            let (id, head) = self.slot(index)?;
            if id == EMPTY_ID {
                break;
            }
            if id == ctx.get() {
                return Ok(head);
            }
        }
        Err(SurfaceError::NotFound(ctx))
    }

    /// Every published context and its head address, in slot order.
    pub fn contexts(&self) -> Result<Vec<(ContextId, u64)>, SurfaceError> {
        let mut out = Vec::new();
        let mut index = 0;
        while index < self.header.capacity {
            let count = SLOTS_PER_READ.min(self.header.capacity - index);
            let mut buf = vec![0u8; usize::try_from(count).unwrap_or(0) * Slot::SIZE];
            read(&self.mem, self.slot_addr(index)?, &mut buf)?;
            for chunk in buf.chunks_exact(Slot::SIZE) {
                let id = word(chunk, 0);
                if id == EMPTY_ID || id == TOMBSTONE_ID {
                    continue;
                }
                if let Some(ctx) = ContextId::new(id) {
                    out.push((ctx, word(chunk, 8)));
                }
            }
            index += count;
        }
        Ok(out)
    }

    /// Effective labels of `ctx`.
    pub fn labels_for(&self, ctx: ContextId) -> Result<Vec<Label>, SurfaceError> {
        let head = self.find(ctx)?;
        self.decode_chain(head)
    }

    /// The current context and its labels, read from the live header.
    pub fn current(&self) -> Result<CurrentView, SurfaceError> {
        let header = read_header(&self.mem, self.header_addr)?;
        Ok(CurrentView {
            context: ContextId::new(header.current_context),
            labels: self.decode_chain(header.current_set)?,
        })
    }

    /// Walk the chain at `head`. See [`decode_chain`].
    pub fn decode_chain(&self, head: u64) -> Result<Vec<Label>, SurfaceError> {
        decode_chain(&self.mem, head)
    }
}

/// Walk the chain at `head` and resolve it into key-ordered labels.
///
/// The first node naming a key decides its value; absent markers hide the
/// key from the result.
pub fn decode_chain<M: MemorySource>(mem: &M, head: u64) -> Result<Vec<Label>, SurfaceError> {
    let mut resolved: BTreeMap<String, Option<LabelValue>> = BTreeMap::new();
    let mut seen = HashSet::new();
    let mut addr = head;
    while addr != 0 {
        if !seen.insert(addr) {
            return Err(corrupt(addr, "cycle in label chain"));
        }
        if seen.len() > MAX_CHAIN_NODES {
            return Err(corrupt(
                head,
                format!("chain longer than {MAX_CHAIN_NODES} nodes"),
            ));
        }
        let mut buf = [0u8; RawNode::SIZE];
        read(mem, addr, &mut buf)?;
        let raw = RawNode::from_bytes(&buf);

        let key = read_string(mem, raw.key_ptr, raw.key_len, MAX_KEY_LEN, addr)?;
        if !resolved.contains_key(&key) {
            let tag = ValueTag::from_raw(raw.tag)
                .ok_or_else(|| corrupt(addr, format!("unknown value tag {}", raw.tag)))?;
            let value = match tag {
                ValueTag::Str => Some(LabelValue::from(read_string(
                    mem,
                    raw.value_word,
                    raw.value_len,
                    MAX_VALUE_LEN,
                    addr,
                )?)),
                ValueTag::Bool => Some(LabelValue::Bool(raw.value_word != 0)),
                ValueTag::Num => Some(LabelValue::Num(f64::from_bits(raw.value_word))),
                ValueTag::Absent => None,
            };
            let _ = resolved.insert(key, value);
        }
        addr = raw.parent;
    }
    Ok(resolved
        .into_iter()
        .filter_map(|(key, value)| {
            value.map(|value| Label {
                key: key.into(),
                value,
            })
        })
        .collect())
}

fn read_string<M: MemorySource>(
    mem: &M,
    ptr: u64,
    len: u64,
    limit: u64,
    node: u64,
) -> Result<String, SurfaceError> {
    if len > limit {
        return Err(corrupt(node, format!("string length {len} exceeds {limit}")));
    }
    if len == 0 {
        return Ok(String::new());
    }
    let mut buf = vec![0u8; usize::try_from(len).unwrap_or(0)];
    read(mem, ptr, &mut buf)?;
    String::from_utf8(buf).map_err(|_| corrupt(node, "string is not UTF-8"))
}

fn read_header<M: MemorySource>(mem: &M, addr: u64) -> Result<HeaderView, SurfaceError> {
    let mut buf = [0u8; SurfaceHeader::SIZE];
    read(mem, addr, &mut buf)?;
    let header = HeaderView::from_bytes(&buf);
    if header.magic != SURFACE_MAGIC {
        return Err(SurfaceError::BadMagic {
            addr,
            found: header.magic,
        });
    }
    if header.version != SCHEMA_VERSION {
        return Err(SurfaceError::UnsupportedVersion {
            found: header.version,
            supported: SCHEMA_VERSION,
        });
    }
    if header.slot_size as usize != Slot::SIZE || header.node_size as usize != RawNode::SIZE {
        return Err(corrupt(
            addr,
            format!(
                "layout mismatch: slot {} node {}",
                header.slot_size, header.node_size
            ),
        ));
    }
    if header.capacity == 0 || header.slots == 0 {
        return Err(corrupt(addr, "empty slot table"));
    }
    Ok(header)
}

fn read<M: MemorySource>(mem: &M, addr: u64, buf: &mut [u8]) -> Result<(), SurfaceError> {
    mem.read_at(addr, buf).map_err(|source| SurfaceError::Io {
        addr,
        len: buf.len(),
        source,
    })
}

fn corrupt(addr: u64, reason: impl Into<String>) -> SurfaceError {
    SurfaceError::Corrupt {
        addr,
        reason: reason.into(),
    }
}

fn word(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_ne_bytes(b)
}

fn half(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_ne_bytes(b)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
