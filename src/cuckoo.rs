//! Open-addressed cuckoo hash map keyed by owned strings, the name→value
//! store backing the tag database (ground: `original_source/hashmap.h`).
//!
//! Every key has two candidate slots, derived from two independent hashes.
//! Insertion walks an iterative eviction trail instead of the C source's
//! unbounded recursion (Design Note in SPEC_FULL.md §4.2) and grows the
//! table geometrically when a trail runs out of room.
//!
//! Borrows returned by `get_mut`/`insert_if_absent`/`put` carry the
//! lifetime of `&mut self`, so the borrow checker itself enforces the
//! "valid until the next insertion" contract the C source only documents.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::ops::ControlFlow;

const INITIAL_CAPACITY: usize = 11;

/// A single entry, bundling the owned key with its value so that, once a
/// caller holds a `&mut Slot<V>`, they can recover the key without a second
/// lookup (mirrors `hmap_key` in the source, which walks back from the
/// value pointer to the enclosing `hmap_entry`).
pub struct Slot<V> {
    key: Box<str>,
    value: V,
}

impl<V> Slot<V> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut V {
        &mut self.value
    }
}

fn hash_with_salt(key: &str, salt: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    salt.hash(&mut hasher);
    key.hash(&mut hasher);
    hasher.finish()
}

fn positions(key: &str, len: usize) -> (usize, usize) {
    (
        (hash_with_salt(key, 0) % len as u64) as usize,
        (hash_with_salt(key, 1) % len as u64) as usize,
    )
}

pub struct CuckooMap<V> {
    slots: Vec<Option<Slot<V>>>,
    len: usize,
}

impl<V> Default for CuckooMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> CuckooMap<V> {
    pub fn new() -> Self {
        Self {
            slots: (0..INITIAL_CAPACITY).map(|_| None).collect(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn find_index(&self, key: &str) -> Option<usize> {
        let (p, s) = positions(key, self.slots.len());
        if self.slots[p].as_ref().is_some_and(|e| &*e.key == key) {
            return Some(p);
        }
        if self.slots[s].as_ref().is_some_and(|e| &*e.key == key) {
            return Some(s);
        }
        None
    }

    pub fn get(&self, key: &str) -> Option<&Slot<V>> {
        self.find_index(key).map(|i| self.slots[i].as_ref().unwrap())
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Slot<V>> {
        self.find_index(key).map(move |i| self.slots[i].as_mut().unwrap())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.find_index(key).is_some()
    }

    /// Tries to relocate the occupant of `slots[at]` to its alternate slot,
    /// recursively freeing that slot first if needed. Uses an explicit
    /// trail of visited indices bounded by table length, instead of the C
    /// source's unbounded call-stack recursion, to detect cycles.
    fn evict(&mut self, at: usize) -> bool {
        let len = self.slots.len();
        let mut trail = vec![at];
        let mut cur = at;

        loop {
            let key = self.slots[cur].as_ref().unwrap().key.clone();
            let (p, s) = positions(&key, len);
            let alt = if cur == p { s } else { p };

            if alt == cur {
                return false;
            }

            if self.slots[alt].is_none() {
                // Slide every entry in the trail one step closer to the
                // free slot we just found, freeing `at` last.
                let mut hole = alt;
                for &from in trail.iter().rev() {
                    self.slots[hole] = self.slots[from].take();
                    hole = from;
                }
                return true;
            }

            if trail.len() >= len {
                return false;
            }
            trail.push(alt);
            cur = alt;
        }
    }

    /// Inserts `slot` into a table of the current size, using eviction if
    /// both candidate slots are occupied. Returns the occupied index, or
    /// the slot back if this table size cannot accommodate it.
    fn try_place(&mut self, slot: Slot<V>) -> Result<usize, Slot<V>> {
        let len = self.slots.len();
        let (p, s) = positions(&slot.key, len);

        if self.slots[p].is_none() {
            self.slots[p] = Some(slot);
            return Ok(p);
        }
        if self.slots[s].is_none() {
            self.slots[s] = Some(slot);
            return Ok(s);
        }
        if self.evict(p) {
            self.slots[p] = Some(slot);
            return Ok(p);
        }
        if self.evict(s) {
            self.slots[s] = Some(slot);
            return Ok(s);
        }
        Err(slot)
    }

    /// Grows the table until `new_slot`, plus every entry already present,
    /// fits, then returns the index of `new_slot`.
    fn grow_and_insert(&mut self, new_slot: Slot<V>) -> usize {
        let mut carry: Vec<Slot<V>> = self.slots.drain(..).flatten().collect();
        carry.push(new_slot);

        let mut size = (carry.len() * 2) | 1;
        loop {
            self.slots = (0..size).map(|_| None).collect();
            let mut placed = Vec::with_capacity(carry.len());
            let mut ok = true;
            for entry in carry.drain(..) {
                match self.try_place(entry) {
                    Ok(idx) => placed.push(idx),
                    Err(entry) => {
                        carry.push(entry);
                        ok = false;
                        break;
                    }
                }
            }
            if ok {
                // The slot we care about was the last one pushed, so it was
                // the last one placed.
                return *placed.last().unwrap();
            }
            // Retry at a larger size; recover everything we already placed
            // back into `carry` so the next attempt starts from scratch.
            for slot in self.slots.drain(..).flatten() {
                carry.push(slot);
            }
            size = (size * 2) | 1;
        }
    }

    fn insert_new(&mut self, key: &str, value: V) -> usize {
        let slot = Slot {
            key: key.into(),
            value,
        };
        match self.try_place(slot) {
            Ok(idx) => idx,
            Err(slot) => self.grow_and_insert(slot),
        }
    }

    /// Returns the existing slot if `key` is present; otherwise inserts
    /// `value` and returns the new slot.
    pub fn insert_if_absent(&mut self, key: &str, value: V) -> (&mut Slot<V>, bool) {
        if let Some(idx) = self.find_index(key) {
            return (self.slots[idx].as_mut().unwrap(), false);
        }
        let idx = self.insert_new(key, value);
        self.len += 1;
        (self.slots[idx].as_mut().unwrap(), true)
    }

    /// Overwrites the value if `key` is present; otherwise inserts it.
    pub fn put(&mut self, key: &str, value: V) -> &mut Slot<V> {
        if let Some(idx) = self.find_index(key) {
            self.slots[idx].as_mut().unwrap().value = value;
            return self.slots[idx].as_mut().unwrap();
        }
        let idx = self.insert_new(key, value);
        self.len += 1;
        self.slots[idx].as_mut().unwrap()
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.remove_slot(key).is_some()
    }

    pub fn remove_slot(&mut self, key: &str) -> Option<Slot<V>> {
        let idx = self.find_index(key)?;
        self.len -= 1;
        self.slots[idx].take()
    }

    /// Finds the slot owning `value`, identified by pointer rather than by
    /// key, and removes it. `value` must be a borrow this map itself handed
    /// out (via `get_mut`/`insert_if_absent`/`put`) and not yet invalidated
    /// by a later insertion.
    fn index_of_ref(&self, value: &V) -> usize {
        let target = value as *const V;
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|slot| std::ptr::eq(&slot.value, target)))
            .expect("value handle does not belong to this map")
    }

    /// Removes the entry `value` belongs to, without a second key lookup.
    /// `value` can't still be borrowed from a live `get_mut`/`insert_if_absent`
    /// call on this same map at the call site (the borrow checker won't
    /// allow reborrowing `self` mutably while it is) — it must come from a
    /// pointer the caller captured earlier and is now redeeming.
    pub fn remove_by_ref(&mut self, value: &mut V) {
        let idx = self.index_of_ref(value);
        self.slots[idx] = None;
        self.len -= 1;
    }

    /// Retrieves the key associated with a value handle this map handed
    /// out, without a second key lookup. Same caller obligation as
    /// `remove_by_ref`.
    pub fn key_of(&self, value: &V) -> &str {
        let idx = self.index_of_ref(value);
        &self.slots[idx].as_ref().unwrap().key
    }

    /// Visits every occupied slot. Safe against the callback removing the
    /// slot it was just given (it simply won't be re-visited); inserting
    /// new entries mid-iteration is unspecified, matching the source's
    /// `HMAP_FORALL` contract.
    pub fn iterate(&mut self, mut f: impl FnMut(&str, &mut V) -> ControlFlow<()>) {
        for slot in self.slots.iter_mut() {
            if let Some(entry) = slot {
                if f(&entry.key, &mut entry.value).is_break() {
                    return;
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.slots
            .iter()
            .filter_map(|s| s.as_ref())
            .map(|e| (&*e.key, &e.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_get_roundtrips() {
        let mut m = CuckooMap::new();
        m.insert_if_absent("a", 1);
        m.insert_if_absent("b", 2);
        assert_eq!(*m.get("a").unwrap().value(), 1);
        assert_eq!(*m.get("b").unwrap().value(), 2);
        assert!(m.get("c").is_none());
    }

    #[test]
    fn insert_if_absent_does_not_overwrite() {
        let mut m = CuckooMap::new();
        m.insert_if_absent("a", 1);
        let (slot, inserted) = m.insert_if_absent("a", 99);
        assert!(!inserted);
        assert_eq!(*slot.value(), 1);
    }

    #[test]
    fn put_overwrites_existing() {
        let mut m = CuckooMap::new();
        m.insert_if_absent("a", 1);
        m.put("a", 2);
        assert_eq!(*m.get("a").unwrap().value(), 2);
    }

    #[test]
    fn remove_then_get_is_none() {
        let mut m = CuckooMap::new();
        m.insert_if_absent("a", 1);
        assert!(m.remove("a"));
        assert!(m.get("a").is_none());
        assert!(!m.remove("a"));
    }

    #[test]
    fn survives_many_insertions_triggering_growth_and_eviction() {
        let mut m = CuckooMap::new();
        for i in 0..500 {
            m.insert_if_absent(&format!("key-{i}"), i);
        }
        assert_eq!(m.len(), 500);
        for i in 0..500 {
            assert_eq!(*m.get(&format!("key-{i}")).unwrap().value(), i);
        }
    }

    #[test]
    fn key_of_recovers_the_key_from_a_value_handle() {
        let mut m = CuckooMap::new();
        m.insert_if_absent("a", 1);
        m.insert_if_absent("b", 2);
        // Capture the handle as a raw pointer so the borrow from `get_mut`
        // ends here; `key_of` then reborrows the map on its own.
        let ptr = m.get_mut("b").unwrap().value_mut() as *mut i32;
        let value = unsafe { &*ptr };
        assert_eq!(m.key_of(value), "b");
    }

    #[test]
    fn remove_by_ref_removes_the_owning_entry() {
        let mut m = CuckooMap::new();
        m.insert_if_absent("a", 1);
        m.insert_if_absent("b", 2);
        let ptr = m.get_mut("a").unwrap().value_mut() as *mut i32;
        let value = unsafe { &mut *ptr };
        m.remove_by_ref(value);
        assert!(m.get("a").is_none());
        assert!(m.get("b").is_some());
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn iterate_visits_every_entry_exactly_once() {
        let mut m = CuckooMap::new();
        for i in 0..50 {
            m.insert_if_absent(&format!("k{i}"), i);
        }
        let mut seen = std::collections::HashSet::new();
        m.iterate(|k, v| {
            assert!(seen.insert(k.to_string()));
            assert_eq!(k, format!("k{v}"));
            ControlFlow::Continue(())
        });
        assert_eq!(seen.len(), 50);
    }
}
