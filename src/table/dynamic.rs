// Copyright 2022 - 2023 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The dynamic table shared between the two peers of a connection, plus
//! the two independent views each side keeps on top of it: the decoder
//! mutates it from encoder instructions and blocks readers until it has
//! advanced far enough; the encoder mutates it itself and additionally
//! tracks reference counts and a referenceable prefix so it never points a
//! new header block at an entry that might be evicted before the peer
//! catches up.

use std::collections::{HashMap, VecDeque};

use log::{debug, trace};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::{QpackError, QpackResult};
use crate::header::{FieldName, FieldValue};

/// A single resident entry. Content is immutable once inserted; only the
/// table's bookkeeping around it (reference counts, eviction) changes.
#[derive(Clone, Debug)]
pub struct DynEntry {
    pub name: FieldName,
    pub value: FieldValue,
    /// The `insert_count` immediately after this entry was added. First
    /// insertion has base 1.
    pub base: u64,
    size: usize,
}

impl DynEntry {
    fn table_size(name: &FieldName, value: &FieldValue) -> usize {
        name.bytes_len() + value.bytes_len() + 32
    }
}

/// Resolves a header-block-local relative index against that block's
/// `base` (RFC 9204 §3.2.5, field-line representations).
pub fn resolve_relative(block_base: u64, relative: u64) -> Option<u64> {
    block_base.checked_sub(relative)
}

/// Resolves a header-block-local post-base index.
pub fn resolve_post_base(block_base: u64, offset: u64) -> u64 {
    block_base + 1 + offset
}

/// Resolves a relative index as used on the encoder-instruction stream,
/// where 0 always means "the most recently inserted entry" relative to the
/// table's current insert count.
pub fn resolve_relative_to_insert_count(insert_count: u64, relative: u64) -> Option<u64> {
    insert_count.checked_sub(relative)
}

/// The eviction-agnostic core: a FIFO ring of entries with capacity
/// accounting. Shared in spirit (not in code, since the two sides need
/// different synchronization primitives) between [`EncoderTable`] and
/// [`DecoderTable`].
struct TableCore {
    entries: VecDeque<DynEntry>,
    capacity: usize,
    used: usize,
    insert_count: u64,
}

impl TableCore {
    fn new(capacity: usize) -> TableCore {
        TableCore {
            entries: VecDeque::new(),
            capacity,
            used: 0,
            insert_count: 0,
        }
    }

    fn get(&self, base: u64) -> Option<&DynEntry> {
        let front_base = self.entries.front()?.base;
        if base < front_base {
            return None;
        }
        let idx = (base - front_base) as usize;
        self.entries.get(idx).filter(|e| e.base == base)
    }

    /// Attempts to insert `name`/`value`, evicting oldest-first only while
    /// `can_evict` allows it. Fails without mutation if there is no way to
    /// make room, or if the entry alone exceeds capacity.
    fn try_insert(
        &mut self,
        name: FieldName,
        value: FieldValue,
        can_evict: impl Fn(&DynEntry) -> bool,
    ) -> QpackResult<u64> {
        let size = DynEntry::table_size(&name, &value);
        if size > self.capacity {
            return Err(QpackError::TableOverflow);
        }

        let mut freed = 0usize;
        let mut evict_n = 0usize;
        for e in self.entries.iter() {
            if self.used - freed + size <= self.capacity {
                break;
            }
            if !can_evict(e) {
                return Err(QpackError::TableOverflow);
            }
            freed += e.size;
            evict_n += 1;
        }
        if self.used - freed + size > self.capacity {
            return Err(QpackError::TableOverflow);
        }

        for _ in 0..evict_n {
            let evicted = self.entries.pop_front().expect("counted above");
            self.used -= evicted.size;
            trace!("evicted dynamic entry base={}", evicted.base);
        }

        self.insert_count += 1;
        let base = self.insert_count;
        self.used += size;
        self.entries.push_back(DynEntry {
            name,
            value,
            base,
            size,
        });
        Ok(base)
    }

    fn set_capacity(&mut self, new_capacity: usize, can_evict: impl Fn(&DynEntry) -> bool) -> QpackResult<()> {
        while self.used > new_capacity {
            let can = match self.entries.front() {
                Some(e) => can_evict(e),
                None => break,
            };
            if !can {
                return Err(QpackError::TableOverflow);
            }
            let evicted = self.entries.pop_front().unwrap();
            self.used -= evicted.size;
        }
        self.capacity = new_capacity;
        Ok(())
    }
}

/// A name/value match found while scanning the dynamic table.
#[derive(Debug, Clone, Copy, Default)]
pub struct DynLookup {
    pub full_match: Option<u64>,
    pub name_match: Option<u64>,
}

// ---------------------------------------------------------------------
// Decoder-side table
// ---------------------------------------------------------------------

struct DecoderState {
    core: TableCore,
    /// Bases currently referenced by a `read_header_block` call in
    /// progress; an entry pinned here survives eviction pressure even if
    /// it would otherwise be the oldest.
    pinned: HashMap<u64, u32>,
}

/// The decoder's view of the dynamic table. All mutation happens on the
/// single instruction-servicing thread (`service_updates`); many
/// concurrent `read_header_block` callers only read, and block via the
/// condition variable until the table has advanced far enough.
pub struct DecoderTable {
    state: Mutex<DecoderState>,
    advanced: Condvar,
}

impl DecoderTable {
    pub fn new(capacity: usize) -> DecoderTable {
        DecoderTable {
            state: Mutex::new(DecoderState {
                core: TableCore::new(capacity),
                pinned: HashMap::new(),
            }),
            advanced: Condvar::new(),
        }
    }

    pub fn insert_count(&self) -> u64 {
        self.state.lock().core.insert_count
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().core.capacity
    }

    pub fn set_capacity(&self, new_capacity: usize) -> QpackResult<()> {
        let mut state = self.state.lock();
        let pinned = &state.pinned;
        state.core.set_capacity(new_capacity, |e| !pinned.contains_key(&e.base))
    }

    pub fn insert(&self, name: FieldName, value: FieldValue) -> QpackResult<u64> {
        let mut state = self.state.lock();
        let pinned = state.pinned.clone();
        let base = state.core.try_insert(name, value, |e| !pinned.contains_key(&e.base))?;
        debug!("decoder dynamic table insert base={}", base);
        self.advanced.notify_all();
        Ok(base)
    }

    pub fn duplicate(&self, insert_count_relative: u64) -> QpackResult<u64> {
        let mut state = self.state.lock();
        let current = state.core.insert_count;
        let source_base = resolve_relative_to_insert_count(current, insert_count_relative)
            .ok_or(QpackError::IndexError)?;
        let (name, value) = {
            let entry = state.core.get(source_base).ok_or(QpackError::IndexError)?;
            (entry.name.clone(), entry.value.clone())
        };
        let pinned = state.pinned.clone();
        let base = state.core.try_insert(name, value, |e| !pinned.contains_key(&e.base))?;
        self.advanced.notify_all();
        Ok(base)
    }

    /// Blocks the calling thread until `insert_count >= required`.
    pub fn wait_for_insert_count(&self, required: u64) {
        let mut state = self.state.lock();
        while state.core.insert_count < required {
            self.advanced.wait(&mut state);
        }
    }

    pub fn get_by_relative_to_insert_count(&self, relative: u64) -> QpackResult<(FieldName, FieldValue)> {
        let state = self.state.lock();
        let base = resolve_relative_to_insert_count(state.core.insert_count, relative)
            .ok_or(QpackError::IndexError)?;
        let entry = state.core.get(base).ok_or(QpackError::IndexError)?;
        Ok((entry.name.clone(), entry.value.clone()))
    }

    pub fn get_by_base(&self, base: u64) -> QpackResult<(FieldName, FieldValue)> {
        let state = self.state.lock();
        let entry = state.core.get(base).ok_or(QpackError::IndexError)?;
        Ok((entry.name.clone(), entry.value.clone()))
    }

    /// Pins `base` against eviction for the duration of a header-block
    /// decode that references it.
    pub fn pin(&self, base: u64) {
        let mut state = self.state.lock();
        *state.pinned.entry(base).or_insert(0) += 1;
    }

    pub fn unpin(&self, base: u64) {
        let mut state = self.state.lock();
        if let Some(count) = state.pinned.get_mut(&base) {
            *count -= 1;
            if *count == 0 {
                state.pinned.remove(&base);
            }
        }
    }
}

// ---------------------------------------------------------------------
// Encoder-side table
// ---------------------------------------------------------------------

struct EncoderState {
    core: TableCore,
    /// Outstanding reference count per entry base; an entry with a
    /// non-zero count is pinned against eviction.
    use_counts: HashMap<u64, u32>,
    /// Upper bound on the size of the referenceable prefix.
    margin: usize,
}

/// The encoder's view of the dynamic table: exclusive during
/// `write_header_block` (a write lock covers lookup, insertion, and
/// reference-count bookkeeping as one step), shared for nothing else —
/// acknowledgment processing also needs exclusive access to release
/// counts, so this is a plain `RwLock` used almost entirely in write mode.
pub struct EncoderTable {
    state: RwLock<EncoderState>,
}

impl EncoderTable {
    pub fn new(capacity: usize, margin: usize) -> EncoderTable {
        EncoderTable {
            state: RwLock::new(EncoderState {
                core: TableCore::new(capacity),
                use_counts: HashMap::new(),
                margin: margin.min(capacity),
            }),
        }
    }

    /// Must only be called before any insertion; behavior otherwise is a
    /// caller contract, not something this type enforces at runtime.
    pub fn set_capacity(&self, new_capacity: usize) -> QpackResult<()> {
        let mut state = self.state.write();
        let use_counts = state.use_counts.clone();
        state.core.set_capacity(new_capacity, |e| {
            use_counts.get(&e.base).copied().unwrap_or(0) == 0
        })?;
        state.margin = state.margin.min(new_capacity);
        Ok(())
    }

    pub fn insert_count(&self) -> u64 {
        self.state.read().core.insert_count
    }

    pub fn capacity(&self) -> usize {
        self.state.read().core.capacity
    }

    /// The smallest base still inside the referenceable prefix; entries at
    /// or above this base may be referenced by newly emitted header
    /// blocks. `u64::MAX` if the table is empty.
    pub fn referenceable_min_base(&self) -> u64 {
        let state = self.state.read();
        let mut acc = 0usize;
        let mut min_base = u64::MAX;
        for e in state.core.entries.iter().rev() {
            if acc + e.size > state.margin {
                break;
            }
            acc += e.size;
            min_base = e.base;
        }
        min_base
    }

    /// Scans the dynamic table most-recent-first for a name/value match,
    /// restricted to `base <= max_base` (entries not yet acknowledged, or
    /// not yet safe to reference, are excluded by the caller choosing
    /// `max_base` and `min_base` appropriately).
    pub fn find(&self, name: &[u8], value: &[u8], min_base: u64, max_base: u64) -> DynLookup {
        let state = self.state.read();
        let mut result = DynLookup::default();
        for e in state.core.entries.iter().rev() {
            if e.base > max_base || e.base < min_base {
                continue;
            }
            if e.name.as_bytes() != name {
                continue;
            }
            if result.name_match.is_none() {
                result.name_match = Some(e.base);
            }
            if e.value.as_bytes() == value {
                result.full_match = Some(e.base);
                break;
            }
        }
        result
    }

    pub fn get(&self, base: u64) -> QpackResult<(FieldName, FieldValue)> {
        let state = self.state.read();
        let e = state.core.get(base).ok_or(QpackError::IndexError)?;
        Ok((e.name.clone(), e.value.clone()))
    }

    pub fn insert(&self, name: FieldName, value: FieldValue) -> QpackResult<u64> {
        let mut state = self.state.write();
        let use_counts = state.use_counts.clone();
        let base = state
            .core
            .try_insert(name, value, |e| use_counts.get(&e.base).copied().unwrap_or(0) == 0)?;
        debug!("encoder dynamic table insert base={}", base);
        Ok(base)
    }

    pub fn duplicate(&self, base: u64) -> QpackResult<u64> {
        let mut state = self.state.write();
        let (name, value) = {
            let e = state.core.get(base).ok_or(QpackError::IndexError)?;
            (e.name.clone(), e.value.clone())
        };
        let use_counts = state.use_counts.clone();
        state
            .core
            .try_insert(name, value, |e| use_counts.get(&e.base).copied().unwrap_or(0) == 0)
    }

    /// Increments `base`'s reference count, pinning it against eviction
    /// until a matching [`EncoderTable::release`].
    pub fn reference(&self, base: u64) {
        let mut state = self.state.write();
        *state.use_counts.entry(base).or_insert(0) += 1;
    }

    /// Releases one reference previously taken by [`EncoderTable::reference`],
    /// called when the peer acknowledges the header block that used it.
    pub fn release(&self, base: u64) {
        let mut state = self.state.write();
        if let Some(count) = state.use_counts.get_mut(&base) {
            *count -= 1;
            if *count == 0 {
                state.use_counts.remove(&base);
            }
        }
    }
}
