//! The open-addressed hash map underlying globals, fields, methods, string
//! interning, and the guest `Map` object.
//!
//! Load factor is fixed at 0.75 and capacity is always a power of two, so
//! probe indices are `hash & (capacity - 1)`. The `Undefined` tag is the
//! empty-key sentinel; a tombstone is `(Undefined, Bool(true))`. Deleting
//! leaves the count unchanged, so tombstones still pay toward the load
//! factor until the next resize drops them.
//!
//! Hashing a value needs the heap (strings cache their hash there), so the
//! caller computes the hash up front and every entry caches it for
//! rehashing.

use crate::memory::Heap;
use crate::object::{ObjData, ObjRef};
use crate::value::Value;

const MAX_LOAD: f64 = 0.75;

#[derive(Debug, Clone, Copy)]
struct Entry {
    key: Value,
    value: Value,
    hash: u32,
}

const EMPTY: Entry = Entry {
    key: Value::Undefined,
    value: Value::Nil,
    hash: 0,
};

const TOMBSTONE: Entry = Entry {
    key: Value::Undefined,
    value: Value::Bool(true),
    hash: 0,
};

impl Entry {
    fn is_empty_slot(&self) -> bool {
        matches!(self.key, Value::Undefined)
    }

    fn is_tombstone(&self) -> bool {
        self.is_empty_slot() && !matches!(self.value, Value::Nil)
    }
}

#[derive(Debug, Default)]
pub struct Table {
    /// Live entries plus tombstones.
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Self {
        Table {
            count: 0,
            entries: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Live entries plus tombstones, as maintained by insert/delete.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Live entries only.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Linear probe for `key`, remembering the first tombstone seen so
    /// deleted slots get recycled.
    fn find(entries: &[Entry], key: Value, hash: u32) -> usize {
        let mask = entries.len() - 1;
        let mut index = hash as usize & mask;
        let mut tombstone: Option<usize> = None;

        loop {
            let entry = &entries[index];

            if entry.is_empty_slot() {
                if entry.is_tombstone() {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                } else {
                    return tombstone.unwrap_or(index);
                }
            } else if entry.key == key {
                return index;
            }

            index = (index + 1) & mask;
        }
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        let mut entries = vec![EMPTY; capacity];

        // Rehash live entries; tombstones are dropped, so the count is
        // rebuilt from scratch.
        self.count = 0;
        for entry in &self.entries {
            if entry.is_empty_slot() {
                continue;
            }
            let dest = Self::find(&entries, entry.key, entry.hash);
            entries[dest] = *entry;
            self.count += 1;
        }

        self.entries = entries;
    }

    pub fn get(&self, key: Value, hash: u32) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let index = Self::find(&self.entries, key, hash);
        let entry = &self.entries[index];
        if entry.is_empty_slot() {
            None
        } else {
            Some(entry.value)
        }
    }

    pub fn has(&self, key: Value, hash: u32) -> bool {
        self.get(key, hash).is_some()
    }

    /// Insert or overwrite; returns true when the key was new.
    pub fn set(&mut self, key: Value, value: Value, hash: u32) -> bool {
        if (self.count + 1) as f64 > self.capacity() as f64 * MAX_LOAD {
            let capacity = if self.capacity() < 8 {
                8
            } else {
                self.capacity() * 2
            };
            self.adjust_capacity(capacity);
        }

        let index = Self::find(&self.entries, key, hash);
        let entry = &mut self.entries[index];

        let is_new = entry.is_empty_slot();
        // A recycled tombstone already counts toward the load factor.
        if is_new && !entry.is_tombstone() {
            self.count += 1;
        }

        *entry = Entry { key, value, hash };
        is_new
    }

    /// Replace the entry with a tombstone; the count is left unchanged.
    pub fn delete(&mut self, key: Value, hash: u32) -> bool {
        if self.count == 0 {
            return false;
        }

        let index = Self::find(&self.entries, key, hash);
        if self.entries[index].is_empty_slot() {
            return false;
        }

        self.entries[index] = TOMBSTONE;
        true
    }

    /// Copy every live entry of `other` into `self`.
    pub fn add_all_from(&mut self, other: &Table) {
        for entry in &other.entries {
            if !entry.is_empty_slot() {
                self.set(entry.key, entry.value, entry.hash);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries
            .iter()
            .filter(|e| !e.is_empty_slot())
            .map(|e| (e.key, e.value))
    }

    /// Specialized probe for string interning: compares length, hash, and
    /// bytes rather than value identity.
    pub fn find_string(&self, heap: &Heap, text: &str, hash: u32) -> Option<ObjRef> {
        if self.count == 0 {
            return None;
        }

        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        loop {
            let entry = &self.entries[index];
            if entry.is_empty_slot() {
                // Stop at a truly empty, non-tombstone slot.
                if !entry.is_tombstone() {
                    return None;
                }
            } else if let Value::Obj(r) = entry.key {
                if let ObjData::String(s) = heap.get(r) {
                    if entry.hash == hash && s.text.len() == text.len() && s.text == text {
                        return Some(r);
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Delete every key whose object is unmarked. Run on the string-intern
    /// table after marking so interning does not keep strings alive.
    pub fn remove_white(&mut self, heap: &Heap) {
        for index in 0..self.entries.len() {
            let entry = &self.entries[index];
            if entry.is_empty_slot() {
                continue;
            }
            if let Value::Obj(r) = entry.key {
                if !heap.is_marked(r) {
                    self.entries[index] = TOMBSTONE;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{hash_number, hash_value};
    use proptest::prelude::*;

    fn num(n: f64) -> (Value, u32) {
        (Value::Number(n), hash_number(n))
    }

    #[test]
    fn set_get_has_round_trip() {
        let mut table = Table::new();
        let (k, h) = num(1.0);
        assert!(table.set(k, Value::Bool(true), h));
        assert_eq!(table.get(k, h), Some(Value::Bool(true)));
        assert!(table.has(k, h));

        // Overwrite is not a new key.
        assert!(!table.set(k, Value::Bool(false), h));
        assert_eq!(table.get(k, h), Some(Value::Bool(false)));
    }

    #[test]
    fn delete_leaves_a_tombstone_that_gets_recycled() {
        let mut table = Table::new();
        let (k, h) = num(7.0);
        table.set(k, Value::Nil, h);
        let count_before = table.count();

        assert!(table.delete(k, h));
        assert!(!table.has(k, h));
        // The tombstone still counts toward the load factor.
        assert_eq!(table.count(), count_before);

        // Reinserting recycles the slot without growing the count.
        table.set(k, Value::Unit, h);
        assert_eq!(table.count(), count_before);
        assert_eq!(table.get(k, h), Some(Value::Unit));
    }

    #[test]
    fn probing_survives_collisions_and_growth() {
        let mut table = Table::new();
        for i in 0..64 {
            let (k, h) = num(i as f64);
            table.set(k, Value::Number(i as f64 * 2.0), h);
        }
        for i in 0..64 {
            let (k, h) = num(i as f64);
            assert_eq!(table.get(k, h), Some(Value::Number(i as f64 * 2.0)));
        }
        assert!(table.capacity().is_power_of_two());
    }

    #[test]
    fn add_all_copies_live_entries_only() {
        let mut from = Table::new();
        let (ka, ha) = num(1.0);
        let (kb, hb) = num(2.0);
        from.set(ka, Value::Bool(true), ha);
        from.set(kb, Value::Bool(true), hb);
        from.delete(kb, hb);

        let mut to = Table::new();
        to.add_all_from(&from);
        assert!(to.has(ka, ha));
        assert!(!to.has(kb, hb));
    }

    #[test]
    fn mixed_key_kinds_coexist() {
        let heap = Heap::new();
        let mut table = Table::new();
        let keys = [Value::Nil, Value::Unit, Value::Undefined, Value::Bool(true), Value::Number(3.5)];
        for (i, k) in keys.iter().enumerate() {
            table.set(*k, Value::Number(i as f64), hash_value(&heap, *k));
        }
        for (i, k) in keys.iter().enumerate() {
            assert_eq!(table.get(*k, hash_value(&heap, *k)), Some(Value::Number(i as f64)));
        }
    }

    proptest! {
        // For all hashable keys: set then get round-trips, delete removes,
        // and a model HashMap agrees at every step.
        #[test]
        fn behaves_like_a_map(ops in proptest::collection::vec((0u8..3, -32i64..32, -100i64..100), 1..200)) {
            let mut table = Table::new();
            let mut model: std::collections::HashMap<i64, i64> = std::collections::HashMap::new();

            for (op, key, value) in ops {
                let (k, h) = num(key as f64);
                match op {
                    0 => {
                        table.set(k, Value::Number(value as f64), h);
                        model.insert(key, value);
                    }
                    1 => {
                        table.delete(k, h);
                        model.remove(&key);
                    }
                    _ => {
                        let got = table.get(k, h).and_then(Value::as_integer);
                        prop_assert_eq!(got, model.get(&key).copied());
                    }
                }
            }

            prop_assert_eq!(table.len(), model.len());
        }
    }
}
