//! The tag database (C3): a persistent bidirectional map between entry
//! names and their kind (tag or file), plus the dense file×tag bit-matrix.
//! Ground: `original_source/tagdb.h`.

mod check;
mod serde;

pub use check::{check, Checked};
pub use serde::{flush, open};

use std::ops::ControlFlow;

use crate::bitset::Bitset;
use crate::cuckoo::CuckooMap;
use crate::error::{Result, TagfsError};

const INITIAL_TAG_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Tag,
    File,
}

/// The Tag/File sum type from spec.md §3. Callers only ever read the
/// variant matching `kind()`.
#[derive(Debug, Clone)]
pub enum Entry {
    Tag { tag_id: usize },
    File { file_tags: Bitset },
}

impl Entry {
    pub fn kind(&self) -> EntryKind {
        match self {
            Entry::Tag { .. } => EntryKind::Tag,
            Entry::File { .. } => EntryKind::File,
        }
    }

    pub fn tag_id(&self) -> Option<usize> {
        match self {
            Entry::Tag { tag_id } => Some(*tag_id),
            Entry::File { .. } => None,
        }
    }

    pub fn file_tags(&self) -> Option<&Bitset> {
        match self {
            Entry::File { file_tags } => Some(file_tags),
            Entry::Tag { .. } => None,
        }
    }
}

pub enum TryInsert<'a> {
    Inserted(&'a mut Entry),
    Existed(&'a mut Entry),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameOutcome {
    Moved,
    AlreadyExists,
}

pub struct Tdb {
    entries: CuckooMap<Entry>,
    tag_ids: Bitset,
    tag_capacity: usize,
}

impl Default for Tdb {
    fn default() -> Self {
        Self::new()
    }
}

impl Tdb {
    pub fn new() -> Self {
        Self {
            entries: CuckooMap::new(),
            tag_ids: Bitset::new(INITIAL_TAG_CAPACITY),
            tag_capacity: INITIAL_TAG_CAPACITY,
        }
    }

    pub fn tag_capacity(&self) -> usize {
        self.tag_capacity
    }

    pub fn get(&self, name: &str) -> Option<&Entry> {
        self.entries.get(name).map(|s| s.value())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Entry> {
        self.entries.get_mut(name).map(|s| s.value_mut())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Entry)> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self, f: impl FnMut(&str, &mut Entry) -> ControlFlow<()>) {
        self.entries.iterate(f)
    }

    /// Allocates the lowest free tag ID, doubling `tag_capacity` (and
    /// resizing every File entry's bitset, then `tag_ids`) if none is
    /// free. Mirrors `_tdb_mkentry`'s tag branch in `tagdb.h`.
    fn allocate_tag_id(&mut self) -> usize {
        if let Some(id) = self.tag_ids.next(0, self.tag_capacity, false) {
            self.tag_ids.set(id, true);
            return id;
        }

        let old_cap = self.tag_capacity;
        let new_cap = old_cap * 2;

        self.entries.iterate(|_name, entry| {
            if let Entry::File { file_tags } = entry {
                file_tags.resize(old_cap, new_cap);
            }
            ControlFlow::Continue(())
        });

        self.tag_ids.resize(old_cap, new_cap);
        self.tag_capacity = new_cap;

        self.tag_ids.set(old_cap, true);
        old_cap
    }

    fn finalize(&mut self, kind: EntryKind) -> Entry {
        match kind {
            EntryKind::File => Entry::File {
                file_tags: Bitset::new(self.tag_capacity),
            },
            EntryKind::Tag => {
                let tag_id = self.allocate_tag_id();
                Entry::Tag { tag_id }
            }
        }
    }

    /// If `name` already has an entry, returns it regardless of whether its
    /// kind matches `kind` (callers must re-check). Otherwise creates and
    /// finalizes a new entry of `kind`.
    pub fn insert(&mut self, name: &str, kind: EntryKind) -> &Entry {
        if self.entries.contains(name) {
            return self.entries.get(name).unwrap().value();
        }
        let entry = self.finalize(kind);
        let (slot, _) = self.entries.insert_if_absent(name, entry);
        slot.value()
    }

    pub fn try_insert(&mut self, name: &str, kind: EntryKind) -> TryInsert<'_> {
        if self.entries.contains(name) {
            return TryInsert::Existed(self.entries.get_mut(name).unwrap().value_mut());
        }
        let entry = self.finalize(kind);
        let (slot, inserted) = self.entries.insert_if_absent(name, entry);
        debug_assert!(inserted);
        TryInsert::Inserted(slot.value_mut())
    }

    /// Frees a Tag's ID in `tag_ids`. Does not walk File entries to clear
    /// the freed bit (Design Note in spec.md §9 — invariant 2 is restored
    /// lazily, at the next `open`, since the bit no longer names a live
    /// tag and is simply not serialized).
    pub fn remove(&mut self, name: &str) -> bool {
        let Some(slot) = self.entries.remove_slot(name) else {
            return false;
        };
        if let Entry::Tag { tag_id } = slot {
            self.tag_ids.set(tag_id, false);
        }
        true
    }

    pub fn rename(&mut self, old_name: &str, new_name: &str) -> Result<RenameOutcome> {
        if old_name == new_name {
            return Ok(RenameOutcome::Moved);
        }
        if self.entries.contains(new_name) {
            return Ok(RenameOutcome::AlreadyExists);
        }
        let Some(slot) = self.entries.remove_slot(old_name) else {
            return Err(TagfsError::NotFound);
        };
        let (_, inserted) = self.entries.insert_if_absent(new_name, slot);
        debug_assert!(inserted);
        Ok(RenameOutcome::Moved)
    }

    pub fn entry_get_tag(file_entry: &Entry, tag_id: usize) -> bool {
        match file_entry {
            Entry::File { file_tags } => file_tags.get(tag_id),
            Entry::Tag { .. } => false,
        }
    }

    pub fn entry_set_tag(file_entry: &mut Entry, tag_id: usize, value: bool) {
        if let Entry::File { file_tags } = file_entry {
            file_tags.set(tag_id, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn insert_then_get_returns_new_entry_with_requested_kind() {
        let mut tdb = Tdb::new();
        tdb.insert("red", EntryKind::Tag);
        assert_eq!(tdb.get("red").unwrap().kind(), EntryKind::Tag);
    }

    #[test]
    fn tag_ids_are_never_duplicated() {
        let mut tdb = Tdb::new();
        for i in 0..40 {
            tdb.insert(&format!("tag{i}"), EntryKind::Tag);
        }
        let mut ids = std::collections::HashSet::new();
        for (_, e) in tdb.iter() {
            if let Some(id) = e.tag_id() {
                assert!(ids.insert(id), "duplicate tag id {id}");
            }
        }
        assert_eq!(ids.len(), 40);
    }

    #[test]
    fn capacity_doubles_once_sixteen_tags_are_exhausted() {
        let mut tdb = Tdb::new();
        for i in 0..16 {
            tdb.insert(&format!("t{i}"), EntryKind::Tag);
        }
        assert_eq!(tdb.tag_capacity(), 16);
        tdb.insert("a_file", EntryKind::File);
        tdb.insert("t16", EntryKind::Tag);
        assert_eq!(tdb.tag_capacity(), 32);
        let file = tdb.get("a_file").unwrap();
        assert!(file.file_tags().unwrap().all(32, false));
    }

    #[test]
    fn rename_moves_entry_and_clears_old_name() {
        let mut tdb = Tdb::new();
        tdb.insert("a", EntryKind::File);
        assert_eq!(tdb.rename("a", "b").unwrap(), RenameOutcome::Moved);
        assert!(tdb.get("a").is_none());
        assert!(tdb.get("b").is_some());
    }

    #[test]
    fn rename_refuses_to_clobber_existing_name() {
        let mut tdb = Tdb::new();
        tdb.insert("a", EntryKind::File);
        tdb.insert("b", EntryKind::File);
        assert_eq!(tdb.rename("a", "b").unwrap(), RenameOutcome::AlreadyExists);
        assert!(tdb.get("a").is_some());
    }

    #[test]
    fn serialization_round_trips_without_duplicate_assignments() {
        let mut tdb = Tdb::new();
        tdb.insert("red", EntryKind::Tag);
        tdb.insert("blue", EntryKind::Tag);
        tdb.insert("a", EntryKind::File);
        tdb.insert("b", EntryKind::File);
        let red_id = tdb.get("red").unwrap().tag_id().unwrap();
        let blue_id = tdb.get("blue").unwrap().tag_id().unwrap();
        Tdb::entry_set_tag(tdb.get_mut("a").unwrap(), red_id, true);
        Tdb::entry_set_tag(tdb.get_mut("b").unwrap(), blue_id, true);

        let mut buf = Vec::new();
        flush(&tdb, &mut buf).unwrap();

        let tdb2 = open(Cursor::new(buf)).unwrap();
        assert_eq!(tdb2.get("a").unwrap().kind(), EntryKind::File);
        let red_id2 = tdb2.get("red").unwrap().tag_id().unwrap();
        assert!(Tdb::entry_get_tag(tdb2.get("a").unwrap(), red_id2));
        assert!(!Tdb::entry_get_tag(tdb2.get("b").unwrap(), red_id2));
    }
}
