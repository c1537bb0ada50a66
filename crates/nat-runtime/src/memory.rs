//! The object heap and its tracing mark-sweep collector.
//!
//! Objects live in an index-addressed arena; an [`ObjRef`] is a slot index,
//! never an owning pointer, so the class/instance/upvalue back-reference
//! cycles stay acyclic in ownership terms. Each slot carries the shared
//! object header: mark bit, hash slot, and annotation list.
//!
//! Collection is driven by the VM at allocation time (when the net byte
//! estimate crosses `next_gc`): the VM marks its roots, then [`Heap::trace`]
//! blackens the gray stack, the intern table drops unmarked strings, and
//! [`Heap::sweep`] frees what is left unmarked.

use crate::object::{ObjData, ObjRef};
use crate::value::Value;

const GC_HEAP_GROW_FACTOR: usize = 2;
const FIRST_GC: usize = 1024 * 1024;

#[derive(Debug)]
struct Slot {
    marked: bool,
    /// Header hash: strings set it at intern time, users via `setHash`;
    /// zero means "not hashable until set".
    hash: u32,
    /// Type annotations attached to this object; inspected, never enforced.
    annotations: Vec<Value>,
    data: ObjData,
}

#[derive(Debug)]
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<usize>,
    gray: Vec<ObjRef>,
    pub bytes_allocated: usize,
    pub next_gc: usize,
}

/// Rough net size of an object: header plus owned payload at allocation
/// time. Interior growth of live buffers is not re-measured.
fn size_estimate(data: &ObjData) -> usize {
    let payload = match data {
        ObjData::String(s) => s.text.len(),
        ObjData::Function(f) => {
            f.chunk.count() + f.chunk.constants.len() * std::mem::size_of::<Value>()
        }
        ObjData::Closure(c) => c.upvalues.len() * std::mem::size_of::<ObjRef>(),
        ObjData::Sequence(values) => values.len() * std::mem::size_of::<Value>(),
        ObjData::Map(table) => table.capacity() * 3 * std::mem::size_of::<Value>(),
        ObjData::Overload(cases) => cases.len() * std::mem::size_of::<ObjRef>(),
        _ => 0,
    };
    std::mem::size_of::<Slot>() + payload
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            slots: Vec::new(),
            free: Vec::new(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC,
        }
    }

    pub fn object_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Link a new object into the arena. The caller (the VM) decides when
    /// to collect; a freshly returned ref is unrooted until stored.
    pub fn alloc_raw(&mut self, data: ObjData) -> ObjRef {
        self.bytes_allocated += size_estimate(&data);

        let slot = Slot {
            marked: false,
            hash: 0,
            annotations: Vec::new(),
            data,
        };

        let r = match self.free.pop() {
            Some(index) => {
                self.slots[index] = slot;
                ObjRef::new(index)
            }
            None => {
                self.slots.push(slot);
                ObjRef::new(self.slots.len() - 1)
            }
        };

        #[cfg(feature = "gc-log")]
        eprintln!("{:>6} allocate {}", r.index(), self.get(r).kind_name());

        r
    }

    pub fn get(&self, r: ObjRef) -> &ObjData {
        &self.slots[r.index()].data
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut ObjData {
        &mut self.slots[r.index()].data
    }

    pub fn hash_of(&self, r: ObjRef) -> u32 {
        self.slots[r.index()].hash
    }

    pub fn set_hash(&mut self, r: ObjRef, hash: u32) {
        self.slots[r.index()].hash = hash;
    }

    pub fn annotations(&self, r: ObjRef) -> &[Value] {
        &self.slots[r.index()].annotations
    }

    pub fn annotate(&mut self, r: ObjRef, annotation: Value) {
        self.slots[r.index()].annotations.push(annotation);
    }

    pub fn is_marked(&self, r: ObjRef) -> bool {
        self.slots[r.index()].marked
    }

    // Kind accessors for slots whose kind is a bytecode invariant. A
    // mismatch is a compiler bug, not a user error.

    pub fn string(&self, r: ObjRef) -> &str {
        match self.get(r) {
            ObjData::String(s) => &s.text,
            other => unreachable!("expected string, found {}", other.kind_name()),
        }
    }

    pub fn function(&self, r: ObjRef) -> &crate::object::FunctionData {
        match self.get(r) {
            ObjData::Function(f) => f,
            other => unreachable!("expected function, found {}", other.kind_name()),
        }
    }

    pub fn function_mut(&mut self, r: ObjRef) -> &mut crate::object::FunctionData {
        match self.get_mut(r) {
            ObjData::Function(f) => f,
            other => unreachable!("expected function, found {}", other.kind_name()),
        }
    }

    pub fn closure(&self, r: ObjRef) -> &crate::object::ClosureData {
        match self.get(r) {
            ObjData::Closure(c) => c,
            other => unreachable!("expected closure, found {}", other.kind_name()),
        }
    }

    pub fn closure_mut(&mut self, r: ObjRef) -> &mut crate::object::ClosureData {
        match self.get_mut(r) {
            ObjData::Closure(c) => c,
            other => unreachable!("expected closure, found {}", other.kind_name()),
        }
    }

    pub fn class(&self, r: ObjRef) -> &crate::object::ClassData {
        match self.get(r) {
            ObjData::Class(c) => c,
            other => unreachable!("expected class, found {}", other.kind_name()),
        }
    }

    pub fn upvalue(&self, r: ObjRef) -> &crate::object::UpvalueData {
        match self.get(r) {
            ObjData::Upvalue(u) => u,
            other => unreachable!("expected upvalue, found {}", other.kind_name()),
        }
    }

    pub fn upvalue_mut(&mut self, r: ObjRef) -> &mut crate::object::UpvalueData {
        match self.get_mut(r) {
            ObjData::Upvalue(u) => u,
            other => unreachable!("expected upvalue, found {}", other.kind_name()),
        }
    }

    // === Mark phase ===

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    pub fn mark_object(&mut self, r: ObjRef) {
        let slot = &mut self.slots[r.index()];
        if slot.marked || matches!(slot.data, ObjData::Free) {
            return;
        }
        slot.marked = true;

        #[cfg(feature = "gc-log")]
        eprintln!("{:>6} mark {}", r.index(), slot.data.kind_name());

        self.gray.push(r);
    }

    pub fn mark_table(&mut self, table: &crate::table::Table) {
        for (key, value) in table.iter() {
            self.mark_value(key);
            self.mark_value(value);
        }
    }

    /// Blacken gray objects until the worklist drains.
    pub fn trace(&mut self) {
        while let Some(r) = self.gray.pop() {
            self.blacken(r);
        }
    }

    /// Walk one object's structural references and mark them gray.
    fn blacken(&mut self, r: ObjRef) {
        let slot = &self.slots[r.index()];
        let mut children: Vec<Value> = slot.annotations.clone();

        match &slot.data {
            ObjData::Free | ObjData::String(_) | ObjData::Native(_) => {}
            ObjData::Function(f) => {
                if let Some(name) = f.name {
                    children.push(Value::Obj(name));
                }
                children.extend(f.chunk.constants.iter().copied());
                for (k, v) in f.constants.iter() {
                    children.push(k);
                    children.push(v);
                }
                children.extend(f.patterns.iter().flatten().copied());
                if let Some(sig) = f.signature {
                    children.push(sig);
                }
            }
            ObjData::Closure(c) => {
                children.push(Value::Obj(c.function));
                children.extend(c.upvalues.iter().map(|u| Value::Obj(*u)));
            }
            ObjData::Upvalue(u) => {
                if let crate::object::UpvalueState::Closed(v) = u.state {
                    children.push(v);
                }
            }
            ObjData::Class(c) => {
                children.push(Value::Obj(c.name));
                if let Some(superclass) = c.superclass {
                    children.push(Value::Obj(superclass));
                }
                for (k, v) in c.methods.iter() {
                    children.push(k);
                    children.push(v);
                }
            }
            ObjData::Instance(i) => {
                children.push(Value::Obj(i.class));
                for (k, v) in i.fields.iter() {
                    children.push(k);
                    children.push(v);
                }
            }
            ObjData::BoundMethod(b) => {
                children.push(b.receiver);
                children.push(b.method);
            }
            ObjData::Map(table) => {
                for (k, v) in table.iter() {
                    children.push(k);
                    children.push(v);
                }
            }
            ObjData::Sequence(values) => children.extend(values.iter().copied()),
            ObjData::Overload(cases) => {
                children.extend(cases.iter().map(|c| Value::Obj(*c)));
            }
            ObjData::Spread(v) => children.push(*v),
        }

        // Natives mark their name separately; it is not a Value child.
        if let ObjData::Native(n) = &slot.data {
            children.push(Value::Obj(n.name));
        }

        for child in children {
            self.mark_value(child);
        }
    }

    // === Sweep phase ===

    /// Free unmarked objects and clear the mark bit on survivors.
    pub fn sweep(&mut self) {
        for index in 0..self.slots.len() {
            let slot = &mut self.slots[index];
            if matches!(slot.data, ObjData::Free) {
                continue;
            }
            if slot.marked {
                slot.marked = false;
            } else {
                #[cfg(feature = "gc-log")]
                eprintln!("{:>6} free {}", index, slot.data.kind_name());

                self.bytes_allocated = self
                    .bytes_allocated
                    .saturating_sub(size_estimate(&slot.data));
                slot.data = ObjData::Free;
                slot.annotations = Vec::new();
                slot.hash = 0;
                self.free.push(index);
            }
        }

        self.next_gc = self.bytes_allocated * GC_HEAP_GROW_FACTOR;
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::StringData;

    fn string_obj(text: &str) -> ObjData {
        ObjData::String(StringData { text: text.to_string() })
    }

    #[test]
    fn allocation_reuses_swept_slots() {
        let mut heap = Heap::new();
        let a = heap.alloc_raw(string_obj("a"));
        let b = heap.alloc_raw(string_obj("b"));

        // Mark only `b`; sweeping frees `a` and recycles its slot.
        heap.mark_object(b);
        heap.trace();
        heap.sweep();

        assert!(matches!(heap.get(a), ObjData::Free));
        let c = heap.alloc_raw(string_obj("c"));
        assert_eq!(c.index(), a.index());
        assert_eq!(heap.object_count(), 2);
    }

    #[test]
    fn sweep_clears_marks_on_survivors() {
        let mut heap = Heap::new();
        let a = heap.alloc_raw(string_obj("a"));
        heap.mark_object(a);
        heap.trace();
        heap.sweep();
        assert!(!heap.is_marked(a));
        assert!(matches!(heap.get(a), ObjData::String(_)));
    }

    #[test]
    fn blacken_reaches_sequence_elements() {
        let mut heap = Heap::new();
        let s = heap.alloc_raw(string_obj("element"));
        let seq = heap.alloc_raw(ObjData::Sequence(vec![Value::Obj(s)]));

        heap.mark_object(seq);
        heap.trace();
        heap.sweep();

        assert!(matches!(heap.get(s), ObjData::String(_)));
    }

    #[test]
    fn byte_accounting_moves_with_alloc_and_free() {
        let mut heap = Heap::new();
        let before = heap.bytes_allocated;
        let a = heap.alloc_raw(string_obj("abcdefgh"));
        assert!(heap.bytes_allocated > before);

        let _ = a;
        heap.trace();
        heap.sweep();
        assert_eq!(heap.bytes_allocated, before);
    }
}
