//! Entity communication database: which processes share or ghost each entity.
//!
//! Every entity with remote copies owns an [`EntityComm`] record holding a sorted
//! vector of [`EntityCommInfo`] pairs `(ghost_id, proc)`. `ghost_id == 0` is the
//! sharing protocol; larger ids name ghostings. Records disappear as soon as their
//! vector becomes empty, so "absent" and "not communicated" are the same state.
//!
//! Lookups go through a single-slot cache because callers very often query the
//! same key several times in a row (`comm`, then `shared_comm_info`, then erase).

use crate::debug_invariants::DebugInvariants;
use crate::mesh_error::MeshError;
use crate::topology::entity::EntityKey;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::cell::Cell;

/// Protocol id of the sharing relation.
pub const SHARED: u32 = 0;

/// One (protocol, destination) pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityCommInfo {
    pub ghost_id: u32,
    pub proc: usize,
}

impl EntityCommInfo {
    pub const fn new(ghost_id: u32, proc: usize) -> Self {
        Self { ghost_id, proc }
    }

    pub const fn shared(proc: usize) -> Self {
        Self::new(SHARED, proc)
    }
}

/// Comm record of one entity.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EntityComm {
    comm_map: Vec<EntityCommInfo>,
    is_shared: bool,
    is_ghost: bool,
}

impl EntityComm {
    pub fn comm_map(&self) -> &[EntityCommInfo] {
        &self.comm_map
    }

    pub fn is_shared(&self) -> bool {
        self.is_shared
    }

    pub fn is_ghost(&self) -> bool {
        self.is_ghost
    }

    fn refresh_flags(&mut self) {
        self.is_shared = self.comm_map.first().is_some_and(|i| i.ghost_id == SHARED);
        self.is_ghost = self.comm_map.iter().any(|i| i.ghost_id != SHARED);
    }

    fn ghost_range(&self, ghost_id: u32) -> std::ops::Range<usize> {
        let begin = self
            .comm_map
            .partition_point(|i| *i < EntityCommInfo::new(ghost_id, 0));
        let end = match ghost_id.checked_add(1) {
            Some(next) => self
                .comm_map
                .partition_point(|i| *i < EntityCommInfo::new(next, 0)),
            None => self.comm_map.len(),
        };
        begin..end
    }
}

/// Notified when comm entries or whole records are removed.
pub trait CommMapChangeListener: Send {
    fn removed_ghost(&mut self, key: EntityKey, ghost_id: u32, proc: usize);
    fn removed_key(&mut self, key: EntityKey);
}

/// Map `EntityKey → EntityComm` with a single-slot lookup cache.
#[derive(Default)]
pub struct EntityCommDatabase {
    records: Vec<(EntityKey, EntityComm)>,
    index: HashMap<EntityKey, usize>,
    last_lookup: Cell<Option<(EntityKey, usize)>>,
    listener: Option<Box<dyn CommMapChangeListener>>,
}

impl std::fmt::Debug for EntityCommDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityCommDatabase")
            .field("records", &self.records.len())
            .field("has_listener", &self.listener.is_some())
            .finish()
    }
}

impl EntityCommDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_listener(&mut self, listener: Box<dyn CommMapChangeListener>) {
        self.listener = Some(listener);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All keys with a record, sorted.
    pub fn keys(&self) -> Vec<EntityKey> {
        let mut keys: Vec<_> = self.records.iter().map(|(k, _)| *k).collect();
        keys.sort_unstable();
        keys
    }

    fn cached_find(&self, key: EntityKey) -> Option<usize> {
        if let Some((cached, slot)) = self.last_lookup.get() {
            if cached == key {
                return Some(slot);
            }
        }
        let slot = *self.index.get(&key)?;
        self.last_lookup.set(Some((key, slot)));
        Some(slot)
    }

    /// Return the record for `key`, creating an empty one if needed.
    pub fn insert(&mut self, key: EntityKey) -> &EntityComm {
        let slot = match self.cached_find(key) {
            Some(slot) => slot,
            None => {
                let slot = self.records.len();
                self.records.push((key, EntityComm::default()));
                self.index.insert(key, slot);
                self.last_lookup.set(Some((key, slot)));
                slot
            }
        };
        &self.records[slot].1
    }

    /// Add `info` to the record of `key`. Returns whether it was newly added.
    pub fn insert_info(&mut self, key: EntityKey, info: EntityCommInfo) -> bool {
        self.insert(key);
        let Some(slot) = self.cached_find(key) else {
            return false;
        };
        let record = &mut self.records[slot].1;
        if info.ghost_id == SHARED {
            record.is_shared = true;
        } else {
            record.is_ghost = true;
        }
        match record.comm_map.binary_search(&info) {
            Ok(_) => false,
            Err(pos) => {
                record.comm_map.insert(pos, info);
                true
            }
        }
    }

    /// Remove one pair. Returns whether it was present.
    pub fn erase_info(&mut self, key: EntityKey, info: EntityCommInfo) -> bool {
        let Some(slot) = self.cached_find(key) else {
            return false;
        };
        let Ok(pos) = self.records[slot].1.comm_map.binary_search(&info) else {
            return false;
        };
        if let Some(l) = self.listener.as_mut() {
            l.removed_ghost(key, info.ghost_id, info.proc);
        }
        self.records[slot].1.comm_map.remove(pos);
        self.after_erase(key, slot);
        true
    }

    /// Remove every pair of protocol `ghost_id`. Returns whether anything was removed.
    pub fn erase_ghosting(&mut self, key: EntityKey, ghost_id: u32) -> bool {
        let Some(slot) = self.cached_find(key) else {
            return false;
        };
        let range = self.records[slot].1.ghost_range(ghost_id);
        if range.is_empty() {
            return false;
        }
        if let Some(l) = self.listener.as_mut() {
            for info in &self.records[slot].1.comm_map[range.clone()] {
                l.removed_ghost(key, info.ghost_id, info.proc);
            }
        }
        self.records[slot].1.comm_map.drain(range);
        self.after_erase(key, slot);
        true
    }

    /// Drop every ghosting pair, keeping sharing. Returns whether anything was removed.
    pub fn comm_clear_ghosting(&mut self, key: EntityKey) -> bool {
        let Some(slot) = self.cached_find(key) else {
            return false;
        };
        let record = &mut self.records[slot].1;
        let first_ghost = record.comm_map.partition_point(|i| i.ghost_id == SHARED);
        let cleared = first_ghost < record.comm_map.len();
        record.comm_map.truncate(first_ghost);
        self.after_erase(key, slot);
        cleared
    }

    /// Drop the whole record. Returns whether it existed.
    pub fn comm_clear(&mut self, key: EntityKey) -> bool {
        let Some(slot) = self.cached_find(key) else {
            return false;
        };
        self.records[slot].1.comm_map.clear();
        self.after_erase(key, slot);
        true
    }

    fn after_erase(&mut self, key: EntityKey, slot: usize) {
        if !self.records[slot].1.comm_map.is_empty() {
            self.records[slot].1.refresh_flags();
            return;
        }
        self.records.swap_remove(slot);
        self.index.remove(&key);
        if let Some((moved, _)) = self.records.get(slot) {
            self.index.insert(*moved, slot);
        }
        self.last_lookup.set(None);
        if let Some(l) = self.listener.as_mut() {
            l.removed_key(key);
        }
    }

    pub fn entity_comm(&self, key: EntityKey) -> Option<&EntityComm> {
        self.cached_find(key).map(|slot| &self.records[slot].1)
    }

    /// All pairs of `key` (empty on miss).
    pub fn comm(&self, key: EntityKey) -> &[EntityCommInfo] {
        self.entity_comm(key).map_or(&[], |r| r.comm_map.as_slice())
    }

    /// Pairs of one protocol.
    pub fn comm_for(&self, key: EntityKey, ghost_id: u32) -> &[EntityCommInfo] {
        match self.entity_comm(key) {
            Some(r) => &r.comm_map[r.ghost_range(ghost_id)],
            None => &[],
        }
    }

    pub fn shared_comm_info(&self, key: EntityKey) -> &[EntityCommInfo] {
        self.comm_for(key, SHARED)
    }

    /// Sorted procs sharing `key`.
    pub fn sharing_procs(&self, key: EntityKey) -> Vec<usize> {
        self.shared_comm_info(key).iter().map(|i| i.proc).collect()
    }

    pub fn is_shared(&self, key: EntityKey) -> bool {
        self.entity_comm(key).is_some_and(EntityComm::is_shared)
    }

    pub fn is_ghost(&self, key: EntityKey) -> bool {
        self.entity_comm(key).is_some_and(EntityComm::is_ghost)
    }
}

impl DebugInvariants for EntityCommDatabase {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "EntityCommDatabase");
    }

    fn validate_invariants(&self) -> Result<(), MeshError> {
        if self.records.len() != self.index.len() {
            return Err(MeshError::InvariantViolation(
                "comm index out of sync with records".into(),
            ));
        }
        for (slot, (key, record)) in self.records.iter().enumerate() {
            if self.index.get(key) != Some(&slot) {
                return Err(MeshError::InvariantViolation(format!(
                    "comm index for {key} points to the wrong slot"
                )));
            }
            if !record.comm_map.windows(2).all(|w| w[0] < w[1]) {
                return Err(MeshError::InvariantViolation(format!(
                    "comm record of {key} not strictly sorted"
                )));
            }
            let mut refreshed = record.clone();
            refreshed.refresh_flags();
            if refreshed.is_shared != record.is_shared || refreshed.is_ghost != record.is_ghost {
                return Err(MeshError::InvariantViolation(format!(
                    "stale shared/ghost flags for {key}"
                )));
            }
        }
        Ok(())
    }
}
