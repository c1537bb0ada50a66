//! Heap object kinds.
//!
//! Every object lives in a slot of the [`crate::memory::Heap`] arena and is
//! addressed by an [`ObjRef`] index. The shared header (mark bit, hash slot,
//! annotations) lives on the slot; the payload is one of the variants here,
//! so the collector can walk objects without knowing their kind.

use crate::bytecode::Chunk;
use crate::error::RuntimeError;
use crate::table::Table;
use crate::value::Value;
use crate::vm::Vm;

/// Index of an object in the heap arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjRef(u32);

impl ObjRef {
    pub(crate) fn new(index: usize) -> Self {
        ObjRef(index as u32)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// A native function reads its arguments from the stack and must leave a
/// single result in place of the callee and arguments on success.
pub type NativeFn = fn(&mut Vm, usize) -> Result<(), RuntimeError>;

#[derive(Debug)]
pub struct StringData {
    pub text: String,
}

#[derive(Debug)]
pub struct FunctionData {
    pub arity: usize,
    pub upvalue_count: usize,
    pub variadic: bool,
    /// Some parameter positions are literal patterns rather than bindings.
    pub patterned: bool,
    /// Literal pattern per parameter slot, `None` for ordinary bindings.
    pub patterns: Vec<Option<Value>>,
    pub name: Option<ObjRef>,
    pub chunk: Chunk,
    /// Constant-to-index map used to deduplicate hashable constants.
    pub constants: Table,
    /// Signature instance attached by `OP_SIGN`.
    pub signature: Option<Value>,
}

impl FunctionData {
    pub fn new() -> Self {
        FunctionData {
            arity: 0,
            upvalue_count: 0,
            variadic: false,
            patterned: false,
            patterns: Vec::new(),
            name: None,
            chunk: Chunk::new(),
            constants: Table::new(),
            signature: None,
        }
    }
}

impl Default for FunctionData {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct ClosureData {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

#[derive(Debug, Clone, Copy)]
pub enum UpvalueState {
    /// Points at a live value-stack slot.
    Open(usize),
    /// Owns the captured value.
    Closed(Value),
}

#[derive(Debug)]
pub struct UpvalueData {
    pub state: UpvalueState,
    /// Next link of the open-upvalues list, sorted by descending stack slot.
    pub next: Option<ObjRef>,
}

pub struct NativeData {
    pub arity: usize,
    pub variadic: bool,
    pub name: ObjRef,
    pub function: NativeFn,
}

impl std::fmt::Debug for NativeData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeData")
            .field("arity", &self.arity)
            .field("variadic", &self.variadic)
            .field("name", &self.name)
            .finish()
    }
}

#[derive(Debug)]
pub struct ClassData {
    pub name: ObjRef,
    pub methods: Table,
    /// Non-owning back-reference; kept alive by GC reachability.
    pub superclass: Option<ObjRef>,
}

#[derive(Debug)]
pub struct InstanceData {
    pub class: ObjRef,
    pub fields: Table,
}

#[derive(Debug)]
pub struct BoundMethodData {
    pub receiver: Value,
    /// The bound callable: a closure, native, or overload.
    pub method: Value,
}

/// Payload of a heap object.
#[derive(Debug)]
pub enum ObjData {
    /// An empty slot on the free list.
    Free,
    String(StringData),
    Function(FunctionData),
    Closure(ClosureData),
    Upvalue(UpvalueData),
    Native(NativeData),
    Class(ClassData),
    Instance(InstanceData),
    BoundMethod(BoundMethodData),
    Map(Table),
    Sequence(Vec<Value>),
    /// Closures of an overloaded function, in declaration order.
    Overload(Vec<ObjRef>),
    /// A spread argument awaiting splicing at call time.
    Spread(Value),
}

impl ObjData {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ObjData::Free => "free",
            ObjData::String(_) => "string",
            ObjData::Function(_) => "function",
            ObjData::Closure(_) => "closure",
            ObjData::Upvalue(_) => "upvalue",
            ObjData::Native(_) => "native",
            ObjData::Class(_) => "class",
            ObjData::Instance(_) => "instance",
            ObjData::BoundMethod(_) => "bound method",
            ObjData::Map(_) => "map",
            ObjData::Sequence(_) => "sequence",
            ObjData::Overload(_) => "overload",
            ObjData::Spread(_) => "spread",
        }
    }
}
