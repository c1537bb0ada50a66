//! The virtual machine.
//!
//! A register-less stack machine: a value stack of frame windows, a frame
//! stack of running closures, a linked list of open upvalues ordered by
//! descending stack slot, the globals map, the infix precedence map, and the
//! string-intern table. The dispatch loop reads one opcode at a time; any
//! arm that can push a frame simply continues the loop, and the new frame's
//! return lands its result where the callee stood.
//!
//! Allocation may trigger a collection, so any arm that builds a composite
//! value roots partially-constructed intermediates on the value stack before
//! allocating their components.

mod frame;

pub use frame::{CallFrame, FrameAction, FRAMES_MAX, STACK_MAX};

use std::io::Write;
use std::sync::{Arc, Mutex};

use crate::bytecode::Opcode;
use crate::compiler;
use crate::error::{NatError, RuntimeError, RuntimeTrace, TraceFrame};
use crate::memory::Heap;
use crate::module_loader::{FsLoader, ModuleLoader};
use crate::object::{
    BoundMethodData, ClosureData, InstanceData, ObjData, ObjRef, StringData, UpvalueData,
    UpvalueState,
};
use crate::stdlib;
use crate::table::Table;
use crate::value::{display_value, hash_string, hash_value, is_hashable, Value};

/// Interned names the VM itself dispatches on.
#[derive(Clone, Copy)]
pub(crate) struct WellKnown {
    pub init: ObjRef,
    pub call: ObjRef,
    pub add: ObjRef,
    pub message: ObjRef,
    pub values: ObjRef,
    pub eq: ObjRef,
    pub member: ObjRef,
    pub subscript_get: ObjRef,
    pub subscript_set: ObjRef,
    pub length: ObjRef,
    pub signature_class: ObjRef,
    pub destructure: ObjRef,
}

/// Classes the native layer constructs instances of.
#[derive(Default, Clone, Copy)]
pub(crate) struct CoreClasses {
    pub object: Option<ObjRef>,
    pub sequence: Option<ObjRef>,
    pub tuple: Option<ObjRef>,
}

/// A cloneable sink that captures `print` output; mainly for tests and
/// embedders.
#[derive(Clone, Default)]
pub struct SharedOutput(Arc<Mutex<Vec<u8>>>);

impl SharedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_string(&self) -> String {
        let mut buf = self.0.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&std::mem::take(&mut *buf)).into_owned()
    }
}

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<CallFrame>,
    pub(crate) globals: Table,
    /// Operator name -> signed precedence (positive left, negative right).
    pub(crate) infixes: Table,
    /// The string-intern table; weak during collection.
    pub(crate) strings: Table,
    open_upvalues: Option<ObjRef>,
    /// Functions owned by in-progress compilations, marked as GC roots.
    pub(crate) compiler_roots: Vec<ObjRef>,
    pub(crate) names: WellKnown,
    pub(crate) classes: CoreClasses,
    output: Box<dyn Write>,
    /// When set, top-level expression statements print their value.
    repl: bool,
    /// Set while the bootstrap module runs; suppresses signature attachment
    /// for the signature constructors themselves.
    pub(crate) bootstrapping: bool,
    loader: Box<dyn ModuleLoader>,
    start: std::time::Instant,
}

fn intern_in(heap: &mut Heap, strings: &mut Table, text: &str) -> ObjRef {
    let hash = hash_string(text.as_bytes());
    if let Some(existing) = strings.find_string(heap, text, hash) {
        return existing;
    }
    let r = heap.alloc_raw(ObjData::String(StringData { text: text.to_string() }));
    heap.set_hash(r, hash);
    strings.set(Value::Obj(r), Value::Nil, hash);
    r
}

impl Vm {
    /// A VM over the current directory's filesystem and stdout. Compiles and
    /// runs the core library before returning.
    pub fn new() -> Result<Self, NatError> {
        Self::with(Box::new(FsLoader::new(".")), Box::new(std::io::stdout()))
    }

    pub fn with(loader: Box<dyn ModuleLoader>, output: Box<dyn Write>) -> Result<Self, NatError> {
        let mut heap = Heap::new();
        let mut strings = Table::new();

        let names = WellKnown {
            init: intern_in(&mut heap, &mut strings, "init"),
            call: intern_in(&mut heap, &mut strings, "call"),
            add: intern_in(&mut heap, &mut strings, "add"),
            message: intern_in(&mut heap, &mut strings, "message"),
            values: intern_in(&mut heap, &mut strings, "values"),
            eq: intern_in(&mut heap, &mut strings, "__eq__"),
            member: intern_in(&mut heap, &mut strings, "__in__"),
            subscript_get: intern_in(&mut heap, &mut strings, "__get__"),
            subscript_set: intern_in(&mut heap, &mut strings, "__set__"),
            length: intern_in(&mut heap, &mut strings, "__len__"),
            signature_class: intern_in(&mut heap, &mut strings, "Signature"),
            destructure: intern_in(&mut heap, &mut strings, "destructure"),
        };

        let mut vm = Vm {
            heap,
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            infixes: Table::new(),
            strings,
            open_upvalues: None,
            compiler_roots: Vec::new(),
            names,
            classes: CoreClasses::default(),
            output,
            repl: false,
            bootstrapping: false,
            loader,
            start: std::time::Instant::now(),
        };

        stdlib::initialize_core(&mut vm)?;
        Ok(vm)
    }

    pub fn set_output(&mut self, output: Box<dyn Write>) {
        self.output = output;
    }

    /// Read-only view of the heap, for disassembly and tooling.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Fetch module source through the configured loader (used by the
    /// compiler for imports).
    pub(crate) fn load_module_source(&self, path: &str) -> std::io::Result<String> {
        self.loader.load(path)
    }

    /// Load, compile, and execute the module at `path`.
    pub fn interpret_module(&mut self, path: &str) -> Result<(), NatError> {
        let source = self.loader.load(path).map_err(|source| NatError::Io {
            path: path.to_string(),
            source,
        })?;
        self.interpret(path, &source)
    }

    /// Compile and execute `source` as the module named `path`.
    pub fn interpret(&mut self, path: &str, source: &str) -> Result<(), NatError> {
        let function = compiler::compile(self, path, source).map_err(NatError::Compile)?;

        self.push(Value::Obj(function));
        let closure = self.alloc(ObjData::Closure(ClosureData {
            function,
            upvalues: Vec::new(),
        }));
        self.pop();
        self.push(Value::Obj(closure));

        let result = self
            .call_closure(closure, 0, FrameAction::Discard)
            .and_then(|_| self.run(0));
        result.map_err(|error| NatError::Runtime(self.unwind(error)))
    }

    /// Evaluate one REPL line in the module "repl": top-level expression
    /// statement values are printed.
    pub fn interpret_expr(&mut self, source: &str) -> Result<(), NatError> {
        self.repl = true;
        let result = self.interpret("repl", source);
        self.repl = false;
        result
    }

    // === Allocation and interning ===

    fn maybe_collect(&mut self) {
        #[cfg(feature = "gc-stress")]
        self.collect_garbage();

        if self.heap.bytes_allocated > self.heap.next_gc {
            self.collect_garbage();
        }
    }

    /// Allocate an object, possibly collecting first. The returned ref is
    /// unrooted: store it or push it before allocating anything else.
    pub(crate) fn alloc(&mut self, data: ObjData) -> ObjRef {
        self.maybe_collect();
        self.heap.alloc_raw(data)
    }

    pub(crate) fn intern(&mut self, text: &str) -> ObjRef {
        let hash = hash_string(text.as_bytes());
        if let Some(existing) = self.strings.find_string(&self.heap, text, hash) {
            return existing;
        }
        self.maybe_collect();
        let r = self.heap.alloc_raw(ObjData::String(StringData { text: text.to_string() }));
        self.heap.set_hash(r, hash);
        self.strings.set(Value::Obj(r), Value::Nil, hash);
        r
    }

    pub(crate) fn hash(&self, value: Value) -> u32 {
        hash_value(&self.heap, value)
    }

    pub(crate) fn name_key(&self, name: ObjRef) -> (Value, u32) {
        (Value::Obj(name), self.heap.hash_of(name))
    }

    pub(crate) fn global(&self, name: ObjRef) -> Option<Value> {
        let (key, hash) = self.name_key(name);
        self.globals.get(key, hash)
    }

    pub(crate) fn define_global(&mut self, name: ObjRef, value: Value) {
        let (key, hash) = self.name_key(name);
        self.globals.set(key, value, hash);
    }

    // === Garbage collection ===

    pub(crate) fn collect_garbage(&mut self) {
        #[cfg(feature = "gc-log")]
        eprintln!("-- gc begin ({} bytes)", self.heap.bytes_allocated);

        // Roots: every stack slot, every frame's closure, every open
        // upvalue, the globals and infix maps, the interned names the VM
        // holds directly, the core classes, and in-progress compilations.
        for i in 0..self.stack.len() {
            let v = self.stack[i];
            self.heap.mark_value(v);
        }
        for i in 0..self.frames.len() {
            let closure = self.frames[i].closure;
            self.heap.mark_object(closure);
        }
        let mut upvalue = self.open_upvalues;
        while let Some(r) = upvalue {
            self.heap.mark_object(r);
            upvalue = self.heap.upvalue(r).next;
        }

        self.heap.mark_table(&self.globals);
        self.heap.mark_table(&self.infixes);

        let WellKnown {
            init,
            call,
            add,
            message,
            values,
            eq,
            member,
            subscript_get,
            subscript_set,
            length,
            signature_class,
            destructure,
        } = self.names;
        for name in [
            init,
            call,
            add,
            message,
            values,
            eq,
            member,
            subscript_get,
            subscript_set,
            length,
            signature_class,
            destructure,
        ] {
            self.heap.mark_object(name);
        }

        for class in [self.classes.object, self.classes.sequence, self.classes.tuple]
            .into_iter()
            .flatten()
        {
            self.heap.mark_object(class);
        }

        for i in 0..self.compiler_roots.len() {
            let r = self.compiler_roots[i];
            self.heap.mark_object(r);
        }

        self.heap.trace();

        // Interning must not keep strings alive.
        self.strings.remove_white(&self.heap);

        self.heap.sweep();

        #[cfg(feature = "gc-log")]
        eprintln!(
            "-- gc end ({} bytes, next at {})",
            self.heap.bytes_allocated, self.heap.next_gc
        );
    }

    // === Stack ===

    pub(crate) fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub(crate) fn pop(&mut self) -> Value {
        match self.stack.pop() {
            Some(v) => v,
            None => unreachable!("value stack underflow"),
        }
    }

    pub(crate) fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn frame(&self) -> &CallFrame {
        &self.frames[self.frames.len() - 1]
    }

    fn read_byte(&mut self) -> u8 {
        let i = self.frames.len() - 1;
        let frame = self.frames[i];
        let byte = self.heap.function(frame.function).chunk.byte(frame.ip);
        self.frames[i].ip += 1;
        byte
    }

    fn read_short(&mut self) -> u16 {
        let hi = u16::from(self.read_byte());
        let lo = u16::from(self.read_byte());
        (hi << 8) | lo
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_short() as usize;
        let frame = self.frame();
        self.heap.function(frame.function).chunk.constants[index]
    }

    fn read_string(&mut self) -> Result<ObjRef, RuntimeError> {
        match self.read_constant() {
            Value::Obj(r) if matches!(self.heap.get(r), ObjData::String(_)) => Ok(r),
            other => Err(RuntimeError::Internal(format!(
                "expected string constant, found {}",
                display_value(&self.heap, other)
            ))),
        }
    }

    // === Errors and introspection helpers ===

    fn unwind(&mut self, error: RuntimeError) -> RuntimeTrace {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let function = self.heap.function(frame.function);
            let line = if function.chunk.count() == 0 {
                0
            } else {
                let offset = frame.ip.saturating_sub(1).min(function.chunk.count() - 1);
                function.chunk.line(offset)
            };
            let name = match function.name {
                Some(name) => self.heap.string(name).to_string(),
                None => "script".to_string(),
            };
            trace.push(TraceFrame { line, name });
        }

        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;

        RuntimeTrace { error, frames: trace }
    }

    pub(crate) fn class_name(&self, class: ObjRef) -> String {
        self.heap.string(self.heap.class(class).name).to_string()
    }

    pub(crate) fn class_method(&self, class: ObjRef, name: ObjRef) -> Option<Value> {
        let (key, hash) = self.name_key(name);
        self.heap.class(class).methods.get(key, hash)
    }

    pub(crate) fn validate_hashable(&self, value: Value) -> Result<(), RuntimeError> {
        if let Value::Obj(r) = value {
            if !matches!(self.heap.get(r), ObjData::String(_)) {
                if self.heap.hash_of(r) == 0 && !matches!(self.heap.get(r), ObjData::Class(_)) {
                    return Err(RuntimeError::Type("Object lacks a valid hash.".to_string()));
                }
                return Ok(());
            }
        }

        if !is_hashable(&self.heap, value) {
            return Err(RuntimeError::Type(
                "Not a hashable type: num, nil, bool, or string.".to_string(),
            ));
        }
        Ok(())
    }

    fn write_print(&mut self, value: Value) {
        let text = display_value(&self.heap, value);
        let _ = writeln!(self.output, "{text}");
        let _ = self.output.flush();
    }

    pub(crate) fn clock_seconds(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    // === Calls ===

    /// Splice any spread arguments flat into the argument window, returning
    /// the adjusted argument count.
    fn expand_spreads(&mut self, arg_count: usize) -> Result<usize, RuntimeError> {
        let base = self.stack.len() - arg_count;
        let has_spread = self.stack[base..]
            .iter()
            .any(|v| matches!(v, Value::Obj(r) if matches!(self.heap.get(*r), ObjData::Spread(_))));
        if !has_spread {
            return Ok(arg_count);
        }

        let args: Vec<Value> = self.stack[base..].to_vec();
        self.stack.truncate(base);
        let mut count = 0;

        for arg in args {
            let spread_inner = match arg {
                Value::Obj(r) => match self.heap.get(r) {
                    ObjData::Spread(inner) => Some(*inner),
                    _ => None,
                },
                _ => None,
            };

            let Some(inner) = spread_inner else {
                self.push(arg);
                count += 1;
                continue;
            };

            let elements = self.sequence_values_of(inner).ok_or_else(|| {
                RuntimeError::Type("Can only spread sequences.".to_string())
            })?;
            count += elements.len();
            for element in elements {
                self.push(element);
            }
        }

        Ok(count)
    }

    /// The raw element array behind a sequence value: either a bare
    /// sequence object or an instance carrying one in its `values` field.
    pub(crate) fn sequence_values_of(&self, value: Value) -> Option<Vec<Value>> {
        let r = value.as_obj()?;
        match self.heap.get(r) {
            ObjData::Sequence(values) => Some(values.clone()),
            ObjData::Instance(instance) => {
                let (key, hash) = self.name_key(self.names.values);
                let field = instance.fields.get(key, hash)?;
                match self.heap.get(field.as_obj()?) {
                    ObjData::Sequence(values) => Some(values.clone()),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    pub(crate) fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), RuntimeError> {
        let arg_count = self.expand_spreads(arg_count)?;
        self.call_dispatch(callee, arg_count)
    }

    fn call_dispatch(&mut self, callee: Value, arg_count: usize) -> Result<(), RuntimeError> {
        let Value::Obj(r) = callee else {
            return Err(RuntimeError::NotCallable);
        };

        match self.heap.get(r) {
            ObjData::BoundMethod(bound) => {
                let (receiver, method) = (bound.receiver, bound.method);
                let slot = self.stack.len() - arg_count - 1;
                self.stack[slot] = receiver;
                self.call_dispatch(method, arg_count)
            }
            ObjData::Class(_) => {
                let instance = self.alloc(ObjData::Instance(InstanceData {
                    class: r,
                    fields: Table::new(),
                }));
                let slot = self.stack.len() - arg_count - 1;
                self.stack[slot] = Value::Obj(instance);
                self.init_class(r, arg_count)
            }
            ObjData::Closure(_) => self.call_closure(r, arg_count, FrameAction::Call),
            ObjData::Native(_) => self.call_native(r, arg_count),
            ObjData::Instance(instance) => {
                let class = instance.class;
                match self.class_method(class, self.names.call) {
                    Some(Value::Obj(m)) if matches!(self.heap.get(m), ObjData::Closure(_)) => {
                        self.call_closure(m, arg_count, FrameAction::Call)
                    }
                    _ => Err(RuntimeError::Type(
                        "Objects require a 'call' method to be called.".to_string(),
                    )),
                }
            }
            ObjData::Overload(_) => self.call_overload(r, arg_count),
            _ => Err(RuntimeError::NotCallable),
        }
    }

    pub(crate) fn init_class(&mut self, class: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        match self.class_method(class, self.names.init) {
            Some(initializer) => self.call_dispatch(initializer, arg_count),
            None if arg_count != 0 => Err(RuntimeError::Arity {
                expected: 0,
                got: arg_count,
            }),
            None => Ok(()),
        }
    }

    fn call_closure(
        &mut self,
        closure: ObjRef,
        mut arg_count: usize,
        action: FrameAction,
    ) -> Result<(), RuntimeError> {
        let function = self.heap.closure(closure).function;

        if self.heap.function(function).variadic {
            arg_count = self.variadify(function, arg_count)?;
        }

        let arity = self.heap.function(function).arity;
        if arg_count != arity {
            return Err(RuntimeError::Arity {
                expected: arity,
                got: arg_count,
            });
        }

        if self.frames.len() == FRAMES_MAX || self.stack.len() >= STACK_MAX {
            return Err(RuntimeError::StackOverflow);
        }

        self.frames.push(CallFrame {
            closure,
            function,
            ip: 0,
            slots: self.stack.len() - arg_count - 1,
            action,
        });
        Ok(())
    }

    fn call_native(&mut self, native: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        let (arity, variadic, function) = match self.heap.get(native) {
            ObjData::Native(n) => (n.arity, n.variadic, n.function),
            other => {
                return Err(RuntimeError::Internal(format!(
                    "call_native on {}",
                    other.kind_name()
                )))
            }
        };

        if !variadic && arg_count != arity {
            return Err(RuntimeError::Arity {
                expected: arity,
                got: arg_count,
            });
        }

        function(self, arg_count)
    }

    fn call_overload(&mut self, overload: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        let cases = match self.heap.get(overload) {
            ObjData::Overload(cases) => cases.clone(),
            other => {
                return Err(RuntimeError::Internal(format!(
                    "call_overload on {}",
                    other.kind_name()
                )))
            }
        };

        let base = self.stack.len() - arg_count;
        for case in cases {
            let function = self.heap.closure(case).function;
            let f = self.heap.function(function);

            let arity_fits = if f.variadic {
                arg_count + 1 >= f.arity
            } else {
                arg_count == f.arity
            };
            if !arity_fits {
                continue;
            }

            let matched = f.patterns.iter().enumerate().all(|(i, pattern)| {
                pattern
                    .map(|expected| i < arg_count && self.stack[base + i] == expected)
                    .unwrap_or(true)
            });
            if matched {
                return self.call_closure(case, arg_count, FrameAction::Call);
            }
        }

        Err(RuntimeError::Type(
            "No signature of the overloaded function matches the call.".to_string(),
        ))
    }

    /// Collapse trailing arguments of a variadic call into a single fresh
    /// sequence, returning the effective argument count.
    fn variadify(&mut self, function: ObjRef, arg_count: usize) -> Result<usize, RuntimeError> {
        let seq_class = self.classes.sequence.ok_or_else(|| {
            RuntimeError::Internal("variadic call before core initialization".to_string())
        })?;

        // Root the instance before allocating its element storage.
        let instance = self.alloc(ObjData::Instance(InstanceData {
            class: seq_class,
            fields: Table::new(),
        }));
        self.push(Value::Obj(instance));
        let values = self.alloc(ObjData::Sequence(Vec::new()));
        let (key, hash) = self.name_key(self.names.values);
        match self.heap.get_mut(instance) {
            ObjData::Instance(data) => {
                data.fields.set(key, Value::Obj(values), hash);
            }
            _ => unreachable!("fresh instance changed kind"),
        }
        let seq = self.pop();

        let arity = self.heap.function(function).arity;

        // Called one short: the trailing sequence is empty.
        if arg_count < arity {
            self.push(seq);
            return Ok(arg_count + 1);
        }

        // Feed the trailing arguments to the sequence's `add` method in
        // application order, then collapse their slots into the sequence.
        let trailing = arg_count - arity + 1;
        let start = self.stack.len() - trailing;
        for i in 0..trailing {
            let arg = self.stack[start + i];
            self.push(seq);
            self.push(arg);
            self.call_method_now(self.names.add, 1)?;
            self.pop();
        }

        self.stack.truncate(start);
        self.push(seq);
        Ok(arity)
    }

    /// Invoke a method and, if it pushed a frame, run it to completion so
    /// the result is on the stack when this returns.
    fn call_method_now(&mut self, name: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        let depth = self.frames.len();
        self.invoke(name, arg_count)?;
        if self.frames.len() > depth {
            self.run(depth)?;
        }
        Ok(())
    }

    fn invoke(&mut self, name: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        let receiver = self.peek(arg_count);

        let instance_ref = match receiver {
            Value::Obj(r) if matches!(self.heap.get(r), ObjData::Instance(_)) => r,
            _ => return Err(RuntimeError::Type("Only instances have methods.".to_string())),
        };

        let (key, hash) = self.name_key(name);
        let (class, field) = match self.heap.get(instance_ref) {
            ObjData::Instance(instance) => (instance.class, instance.fields.get(key, hash)),
            _ => unreachable!("checked above"),
        };

        if let Some(field) = field {
            let slot = self.stack.len() - arg_count - 1;
            self.stack[slot] = field;
            return self.call_value(field, arg_count);
        }

        self.invoke_from_class(class, name, arg_count)
    }

    fn invoke_from_class(
        &mut self,
        class: ObjRef,
        name: ObjRef,
        arg_count: usize,
    ) -> Result<(), RuntimeError> {
        match self.class_method(class, name) {
            Some(method) => self.call_value(method, arg_count),
            None => Err(RuntimeError::UndefinedMethod {
                name: self.heap.string(name).to_string(),
                class: self.class_name(class),
            }),
        }
    }

    /// Bind a class method over the receiver at the stack top.
    fn bind_method(&mut self, class: ObjRef, name: ObjRef) -> Result<(), RuntimeError> {
        let Some(method) = self.class_method(class, name) else {
            return Err(RuntimeError::UndefinedProperty(
                self.heap.string(name).to_string(),
            ));
        };

        let receiver = self.peek(0);
        let bound = self.alloc(ObjData::BoundMethod(BoundMethodData { receiver, method }));
        self.pop();
        self.push(Value::Obj(bound));
        Ok(())
    }

    // === Upvalues ===

    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut prev: Option<ObjRef> = None;
        let mut current = self.open_upvalues;

        while let Some(r) = current {
            match self.heap.upvalue(r).state {
                UpvalueState::Open(s) if s > slot => {
                    prev = Some(r);
                    current = self.heap.upvalue(r).next;
                }
                _ => break,
            }
        }

        if let Some(r) = current {
            if let UpvalueState::Open(s) = self.heap.upvalue(r).state {
                if s == slot {
                    return r;
                }
            }
        }

        let created = self.alloc(ObjData::Upvalue(UpvalueData {
            state: UpvalueState::Open(slot),
            next: current,
        }));

        match prev {
            None => self.open_upvalues = Some(created),
            Some(p) => self.heap.upvalue_mut(p).next = Some(created),
        }

        created
    }

    /// Close every open upvalue at stack slots >= `from`.
    fn close_upvalues(&mut self, from: usize) {
        while let Some(r) = self.open_upvalues {
            let (slot, next) = match self.heap.upvalue(r).state {
                UpvalueState::Open(s) => (s, self.heap.upvalue(r).next),
                UpvalueState::Closed(_) => break,
            };
            if slot < from {
                break;
            }

            let value = self.stack[slot];
            let upvalue = self.heap.upvalue_mut(r);
            upvalue.state = UpvalueState::Closed(value);
            upvalue.next = None;
            self.open_upvalues = next;
        }
    }

    fn instance_has(&self, instance: ObjRef, value: Value) -> Result<bool, RuntimeError> {
        self.validate_hashable(value)?;
        let hash = self.hash(value);
        let (class, in_fields) = match self.heap.get(instance) {
            ObjData::Instance(data) => (data.class, data.fields.has(value, hash)),
            other => {
                return Err(RuntimeError::Internal(format!(
                    "instance_has on {}",
                    other.kind_name()
                )))
            }
        };
        Ok(in_fields || self.heap.class(class).methods.has(value, hash))
    }

    fn check_seq_index(&self, len: usize, key: Value) -> Result<usize, RuntimeError> {
        let index = key.as_integer().ok_or_else(|| {
            RuntimeError::Type("Sequences must be indexed by integer.".to_string())
        })?;
        if index < 0 || index as usize >= len {
            return Err(RuntimeError::IndexOutOfBounds { index, len });
        }
        Ok(index as usize)
    }

    // === The dispatch loop ===

    /// Run until the frame stack shrinks back to `base` frames.
    fn run(&mut self, base: usize) -> Result<(), RuntimeError> {
        loop {
            let byte = self.read_byte();
            let op = Opcode::from_byte(byte).ok_or_else(|| {
                RuntimeError::Internal(format!("unknown opcode {byte}"))
            })?;

            match op {
                Opcode::Constant => {
                    let constant = self.read_constant();
                    self.push(constant);
                }
                Opcode::Nil => self.push(Value::Nil),
                Opcode::True => self.push(Value::Bool(true)),
                Opcode::False => self.push(Value::Bool(false)),
                Opcode::Unit => self.push(Value::Unit),
                Opcode::Undefined => self.push(Value::Undefined),
                Opcode::Pop => {
                    self.pop();
                }

                Opcode::GetLocal => {
                    let slot = self.read_short() as usize;
                    let value = self.stack[self.frame().slots + slot];
                    self.push(value);
                }
                Opcode::SetLocal => {
                    let slot = self.read_short() as usize;
                    let base_slot = self.frame().slots;
                    self.stack[base_slot + slot] = self.peek(0);
                }
                Opcode::GetUpvalue => {
                    let slot = self.read_short() as usize;
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[slot];
                    let value = match self.heap.upvalue(upvalue).state {
                        UpvalueState::Open(s) => self.stack[s],
                        UpvalueState::Closed(v) => v,
                    };
                    self.push(value);
                }
                Opcode::SetUpvalue => {
                    let slot = self.read_short() as usize;
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[slot];
                    let value = self.peek(0);
                    match self.heap.upvalue(upvalue).state {
                        UpvalueState::Open(s) => self.stack[s] = value,
                        UpvalueState::Closed(_) => {
                            self.heap.upvalue_mut(upvalue).state = UpvalueState::Closed(value);
                        }
                    }
                }
                Opcode::GetGlobal => {
                    let name = self.read_string()?;
                    let Some(value) = self.global(name) else {
                        return Err(RuntimeError::UndefinedVariable(
                            self.heap.string(name).to_string(),
                        ));
                    };
                    self.push(value);
                }
                Opcode::DefineGlobal => {
                    let name = self.read_string()?;
                    let value = self.peek(0);
                    self.define_global(name, value);
                    self.pop();
                }
                Opcode::SetGlobal => {
                    let name = self.read_string()?;
                    let (key, hash) = self.name_key(name);
                    let value = self.peek(0);
                    if self.globals.set(key, value, hash) {
                        self.globals.delete(key, hash);
                        return Err(RuntimeError::UndefinedVariable(
                            self.heap.string(name).to_string(),
                        ));
                    }
                }
                Opcode::GetProperty => {
                    let name = self.read_string()?;
                    let receiver = self.peek(0);
                    let instance_ref = match receiver {
                        Value::Obj(r) if matches!(self.heap.get(r), ObjData::Instance(_)) => r,
                        _ => {
                            return Err(RuntimeError::Type(
                                "Only objects have properties.".to_string(),
                            ))
                        }
                    };

                    let (key, hash) = self.name_key(name);
                    let (class, field) = match self.heap.get(instance_ref) {
                        ObjData::Instance(instance) => {
                            (instance.class, instance.fields.get(key, hash))
                        }
                        _ => unreachable!("checked above"),
                    };

                    if let Some(value) = field {
                        self.pop();
                        self.push(value);
                    } else {
                        self.bind_method(class, name)?;
                    }
                }
                Opcode::SetProperty => {
                    let name = self.read_string()?;
                    let receiver = self.peek(1);
                    let instance_ref = match receiver {
                        Value::Obj(r) if matches!(self.heap.get(r), ObjData::Instance(_)) => r,
                        _ => {
                            return Err(RuntimeError::Type(
                                "Only objects have properties.".to_string(),
                            ))
                        }
                    };

                    let (key, hash) = self.name_key(name);
                    let value = self.peek(0);
                    match self.heap.get_mut(instance_ref) {
                        ObjData::Instance(instance) => {
                            instance.fields.set(key, value, hash);
                        }
                        _ => unreachable!("checked above"),
                    }
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                Opcode::GetSuper => {
                    let name = self.read_string()?;
                    let superclass = match self.pop() {
                        Value::Obj(r) if matches!(self.heap.get(r), ObjData::Class(_)) => r,
                        _ => {
                            return Err(RuntimeError::Internal(
                                "super lookup without a superclass".to_string(),
                            ))
                        }
                    };
                    self.bind_method(superclass, name)?;
                }

                Opcode::Equal => {
                    let a = self.pop();
                    let b = self.pop();

                    // Classes can override the equality relation.
                    let instance_classes = match (a, b) {
                        (Value::Obj(ra), Value::Obj(rb)) => {
                            match (self.heap.get(ra), self.heap.get(rb)) {
                                (ObjData::Instance(ia), ObjData::Instance(ib)) => {
                                    Some((ia.class, ib.class))
                                }
                                _ => None,
                            }
                        }
                        _ => None,
                    };
                    if let Some((class_a, class_b)) = instance_classes {
                        if class_a == class_b {
                            if let Some(equal_fn) = self.class_method(class_a, self.names.eq) {
                                self.push(a);
                                self.push(b);
                                self.call_value(equal_fn, 1)?;
                                continue;
                            }
                        }
                    }

                    self.push(Value::Bool(a == b));
                }
                Opcode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                Opcode::Negate => {
                    let Some(n) = self.peek(0).as_number() else {
                        return Err(RuntimeError::Type("Operand must be a number.".to_string()));
                    };
                    self.pop();
                    self.push(Value::Number(-n));
                }

                Opcode::Jump => {
                    let offset = self.read_short() as usize;
                    let i = self.frames.len() - 1;
                    self.frames[i].ip += offset;
                }
                Opcode::JumpIfFalse => {
                    let offset = self.read_short() as usize;
                    if self.peek(0).is_falsey() {
                        let i = self.frames.len() - 1;
                        self.frames[i].ip += offset;
                    }
                }
                Opcode::Loop => {
                    let offset = self.read_short() as usize;
                    let i = self.frames.len() - 1;
                    self.frames[i].ip -= offset;
                }
                Opcode::Call => {
                    let arg_count = self.read_byte() as usize;
                    let callee = self.peek(arg_count);
                    self.call_value(callee, arg_count)?;
                }
                Opcode::CallInfix => {
                    let right = self.pop();
                    let infix = self.pop();
                    let left = self.pop();

                    self.push(infix);
                    self.push(left);
                    self.push(right);
                    self.call_value(infix, 2)?;
                }
                Opcode::CallPostfix => {
                    let arg_count = self.read_byte() as usize;
                    let callee = self.pop();
                    let at = self.stack.len() - arg_count;
                    self.stack.insert(at, callee);
                    self.call_value(callee, arg_count)?;
                }
                Opcode::Invoke => {
                    let name = self.read_string()?;
                    let arg_count = self.read_byte() as usize;
                    self.invoke(name, arg_count)?;
                }
                Opcode::SuperInvoke => {
                    let name = self.read_string()?;
                    let arg_count = self.read_byte() as usize;
                    let superclass = match self.pop() {
                        Value::Obj(r) if matches!(self.heap.get(r), ObjData::Class(_)) => r,
                        _ => {
                            return Err(RuntimeError::Internal(
                                "super invoke without a superclass".to_string(),
                            ))
                        }
                    };
                    self.invoke_from_class(superclass, name, arg_count)?;
                }
                Opcode::Return | Opcode::ImplicitReturn => {
                    let result = self.pop();
                    let frame = *self.frame();
                    self.close_upvalues(frame.slots);
                    self.frames.pop();
                    self.stack.truncate(frame.slots);
                    if frame.action == FrameAction::Call {
                        self.push(result);
                    }
                    if self.frames.len() == base {
                        return Ok(());
                    }
                }

                Opcode::Closure => {
                    let function = match self.read_constant() {
                        Value::Obj(r) if matches!(self.heap.get(r), ObjData::Function(_)) => r,
                        _ => {
                            return Err(RuntimeError::Internal(
                                "closure over a non-function constant".to_string(),
                            ))
                        }
                    };
                    self.push_new_closure(function)?;
                }
                Opcode::Sign => {
                    let function = match self.read_constant() {
                        Value::Obj(r) if matches!(self.heap.get(r), ObjData::Function(_)) => r,
                        _ => {
                            return Err(RuntimeError::Internal(
                                "signature over a non-function constant".to_string(),
                            ))
                        }
                    };
                    let sig_closure = self.push_new_closure(function)?;

                    let signature_defined = self.global(self.names.signature_class).is_some();
                    if self.bootstrapping || !signature_defined {
                        // The constructors aren't bound yet; skip attachment.
                        self.pop();
                    } else {
                        let depth = self.frames.len();
                        self.call_value(Value::Obj(sig_closure), 0)?;
                        if self.frames.len() > depth {
                            self.run(depth)?;
                        }
                        let signature = self.pop();

                        if let Value::Obj(target) = self.peek(0) {
                            if matches!(self.heap.get(target), ObjData::Closure(_)) {
                                let target_fn = self.heap.closure(target).function;
                                self.heap.function_mut(target_fn).signature = Some(signature);
                            }
                        }
                    }
                }
                Opcode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                Opcode::Class => {
                    let name = self.read_string()?;
                    let class = self.alloc(ObjData::Class(crate::object::ClassData {
                        name,
                        methods: Table::new(),
                        superclass: None,
                    }));
                    self.push(Value::Obj(class));
                }
                Opcode::Inherit => {
                    let superclass = match self.peek(1) {
                        Value::Obj(r) if matches!(self.heap.get(r), ObjData::Class(_)) => r,
                        _ => {
                            return Err(RuntimeError::Type(
                                "Superclass must be a class.".to_string(),
                            ))
                        }
                    };
                    let subclass = match self.peek(0) {
                        Value::Obj(r) if matches!(self.heap.get(r), ObjData::Class(_)) => r,
                        _ => {
                            return Err(RuntimeError::Internal(
                                "inherit into a non-class".to_string(),
                            ))
                        }
                    };

                    // Copy the superclass's methods down, so the chain walk
                    // at dispatch time is a single map lookup.
                    let methods = {
                        let mut copied = Table::new();
                        copied.add_all_from(&self.heap.class(superclass).methods);
                        copied
                    };
                    match self.heap.get_mut(subclass) {
                        ObjData::Class(class) => {
                            let mut methods = methods;
                            methods.add_all_from(&class.methods);
                            class.methods = methods;
                            class.superclass = Some(superclass);
                        }
                        _ => unreachable!("checked above"),
                    }
                    self.pop();
                }
                Opcode::Method => {
                    let name = self.read_string()?;
                    let method = self.peek(0);
                    let class = match self.peek(1) {
                        Value::Obj(r) if matches!(self.heap.get(r), ObjData::Class(_)) => r,
                        _ => {
                            return Err(RuntimeError::Internal(
                                "method outside a class".to_string(),
                            ))
                        }
                    };
                    let (key, hash) = self.name_key(name);
                    match self.heap.get_mut(class) {
                        ObjData::Class(data) => {
                            data.methods.set(key, method, hash);
                        }
                        _ => unreachable!("checked above"),
                    }
                    self.pop();
                }
                Opcode::Overload => {
                    let count = self.read_byte() as usize;
                    let start = self.stack.len() - count;
                    let mut cases = Vec::with_capacity(count);
                    for value in &self.stack[start..] {
                        match value {
                            Value::Obj(r) if matches!(self.heap.get(*r), ObjData::Closure(_)) => {
                                cases.push(*r);
                            }
                            _ => {
                                return Err(RuntimeError::Internal(
                                    "overload over a non-closure".to_string(),
                                ))
                            }
                        }
                    }
                    let overload = self.alloc(ObjData::Overload(cases));
                    self.stack.truncate(start);
                    self.push(Value::Obj(overload));
                }

                Opcode::SubscriptGet => {
                    let key = self.pop();
                    let receiver = self.pop();

                    let r = receiver.as_obj();
                    if let Some(r) = r {
                        if let ObjData::Sequence(values) = self.heap.get(r) {
                            let index = self.check_seq_index(values.len(), key)?;
                            let value = values[index];
                            self.push(value);
                            continue;
                        }
                    }

                    let instance = match r {
                        Some(r) if matches!(self.heap.get(r), ObjData::Instance(_)) => r,
                        _ => {
                            return Err(RuntimeError::Type(format!(
                                "Only objects, sequences, and instances with a '{}' method support access by subscript.",
                                self.heap.string(self.names.subscript_get)
                            )))
                        }
                    };

                    // Classes may define their own subscript access operator.
                    let class = match self.heap.get(instance) {
                        ObjData::Instance(data) => data.class,
                        _ => unreachable!("checked above"),
                    };
                    if let Some(get_fn) = self.class_method(class, self.names.subscript_get) {
                        self.push(receiver);
                        self.push(key);
                        self.call_value(get_fn, 1)?;
                        continue;
                    }

                    // Otherwise fall back to property access; a missing key
                    // is nil, not an error.
                    self.validate_hashable(key)?;
                    let hash = self.hash(key);
                    let value = match self.heap.get(instance) {
                        ObjData::Instance(data) => data.fields.get(key, hash),
                        _ => unreachable!("checked above"),
                    };
                    self.push(value.unwrap_or(Value::Nil));
                }
                Opcode::SubscriptSet => {
                    let value = self.pop();
                    let key = self.pop();
                    let receiver = self.pop();

                    let r = receiver.as_obj();
                    if let Some(r) = r {
                        if let ObjData::Sequence(values) = self.heap.get(r) {
                            let index = self.check_seq_index(values.len(), key)?;
                            match self.heap.get_mut(r) {
                                ObjData::Sequence(values) => values[index] = value,
                                _ => unreachable!("checked above"),
                            }
                            self.push(receiver);
                            continue;
                        }
                    }

                    let instance = match r {
                        Some(r) if matches!(self.heap.get(r), ObjData::Instance(_)) => r,
                        _ => {
                            return Err(RuntimeError::Type(format!(
                                "Only objects, sequences, and instances with a '{}' method support assignment by subscript.",
                                self.heap.string(self.names.subscript_set)
                            )))
                        }
                    };

                    let class = match self.heap.get(instance) {
                        ObjData::Instance(data) => data.class,
                        _ => unreachable!("checked above"),
                    };
                    if let Some(set_fn) = self.class_method(class, self.names.subscript_set) {
                        self.push(receiver);
                        self.push(key);
                        self.push(value);
                        self.call_value(set_fn, 2)?;
                        continue;
                    }

                    self.validate_hashable(key)?;
                    let hash = self.hash(key);
                    match self.heap.get_mut(instance) {
                        ObjData::Instance(data) => {
                            data.fields.set(key, value, hash);
                        }
                        _ => unreachable!("checked above"),
                    }
                    self.push(receiver);
                }
                Opcode::Member => {
                    let container = self.pop();
                    let value = self.pop();

                    if let Some(r) = container.as_obj() {
                        if let ObjData::Sequence(values) = self.heap.get(r) {
                            let found = values.contains(&value);
                            self.push(Value::Bool(found));
                            continue;
                        }
                    }

                    let instance = match container.as_obj() {
                        Some(r) if matches!(self.heap.get(r), ObjData::Instance(_)) => r,
                        _ => {
                            return Err(RuntimeError::Type(
                                "Only objects or sequences may be tested for membership."
                                    .to_string(),
                            ))
                        }
                    };

                    // Classes can override the membership predicate.
                    let class = match self.heap.get(instance) {
                        ObjData::Instance(data) => data.class,
                        _ => unreachable!("checked above"),
                    };
                    if let Some(member_fn) = self.class_method(class, self.names.member) {
                        self.push(container);
                        self.push(value);
                        self.call_value(member_fn, 1)?;
                        continue;
                    }

                    let found = self.instance_has(instance, value)?;
                    self.push(Value::Bool(found));
                }
                Opcode::Spread => {
                    let value = self.peek(0);
                    let spread = self.alloc(ObjData::Spread(value));
                    let top = self.stack.len() - 1;
                    self.stack[top] = Value::Obj(spread);
                }
                Opcode::Destructure => {
                    let Some(destructure) = self.global(self.names.destructure) else {
                        return Err(RuntimeError::UndefinedVariable("destructure".to_string()));
                    };
                    let value = self.pop();
                    self.push(destructure);
                    self.push(value);
                    self.call_value(destructure, 1)?;
                }

                Opcode::Print => {
                    let value = self.pop();
                    self.write_print(value);
                }
                Opcode::ExprStatement => {
                    let value = self.pop();
                    if self.repl && self.frames.len() == 1 && value != Value::Nil {
                        self.write_print(value);
                    }
                }
                Opcode::Import => {
                    let function = match self.read_constant() {
                        Value::Obj(r) if matches!(self.heap.get(r), ObjData::Function(_)) => r,
                        _ => {
                            return Err(RuntimeError::Internal(
                                "import of a non-function constant".to_string(),
                            ))
                        }
                    };
                    let closure = self.alloc(ObjData::Closure(ClosureData {
                        function,
                        upvalues: Vec::new(),
                    }));
                    self.push(Value::Obj(closure));
                    self.call_closure(closure, 0, FrameAction::Discard)?;
                }
                Opcode::Throw => {
                    let value = self.pop();

                    let instance = match value.as_obj() {
                        Some(r) if matches!(self.heap.get(r), ObjData::Instance(_)) => r,
                        _ => {
                            return Err(RuntimeError::Type(
                                "Can only throw instance of 'Error'.".to_string(),
                            ))
                        }
                    };

                    let (key, hash) = self.name_key(self.names.message);
                    let (class, message) = match self.heap.get(instance) {
                        ObjData::Instance(data) => (data.class, data.fields.get(key, hash)),
                        _ => unreachable!("checked above"),
                    };
                    let Some(message) = message else {
                        return Err(RuntimeError::Type(
                            "Error must define a 'message'.".to_string(),
                        ));
                    };
                    let message = match message.as_obj() {
                        Some(r) if matches!(self.heap.get(r), ObjData::String(_)) => {
                            self.heap.string(r).to_string()
                        }
                        _ => {
                            return Err(RuntimeError::Type(
                                "Error 'message' must be a string.".to_string(),
                            ))
                        }
                    };

                    return Err(RuntimeError::Thrown {
                        class: self.class_name(class),
                        message,
                    });
                }
                Opcode::SetTypeLocal => {
                    let slot = self.read_short() as usize;
                    let annotation = self.peek(0);
                    let base_slot = self.frame().slots;
                    if let Value::Obj(r) = self.stack[base_slot + slot] {
                        self.heap.annotate(r, annotation);
                    }
                }
                Opcode::SetTypeGlobal => {
                    let name = self.read_string()?;
                    let annotation = self.peek(0);
                    if let Some(Value::Obj(r)) = self.global(name) {
                        self.heap.annotate(r, annotation);
                    }
                }

                Opcode::Case | Opcode::CaseOr => {
                    return Err(RuntimeError::Internal(format!(
                        "reserved opcode {}",
                        op.name()
                    )));
                }
                Opcode::End => {
                    return Err(RuntimeError::Internal(
                        "executed chunk sentinel".to_string(),
                    ));
                }
            }
        }
    }

    /// Allocate a closure over `function`, push it, and capture its
    /// upvalues from the inline operand pairs.
    fn push_new_closure(&mut self, function: ObjRef) -> Result<ObjRef, RuntimeError> {
        let upvalue_count = self.heap.function(function).upvalue_count;
        let closure = self.alloc(ObjData::Closure(ClosureData {
            function,
            upvalues: Vec::with_capacity(upvalue_count),
        }));
        self.push(Value::Obj(closure));

        for _ in 0..upvalue_count {
            let is_local = self.read_byte() == 1;
            let index = self.read_byte() as usize;
            let upvalue = if is_local {
                let base = self.frame().slots;
                self.capture_upvalue(base + index)
            } else {
                self.heap.closure(self.frame().closure).upvalues[index]
            };
            self.heap.closure_mut(closure).upvalues.push(upvalue);
        }

        Ok(closure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module_loader::SourceMap;

    fn test_vm() -> (Vm, SharedOutput) {
        let output = SharedOutput::new();
        let vm = Vm::with(Box::new(SourceMap::new()), Box::new(output.clone()))
            .expect("core initialization");
        (vm, output)
    }

    #[test]
    fn strings_are_interned() {
        let (mut vm, _) = test_vm();
        let a = vm.intern("identity");
        let b = vm.intern("identity");
        assert_eq!(a, b);

        let c = vm.intern("different");
        assert_ne!(a, c);
    }

    #[test]
    fn interning_two_equal_byte_sequences_yields_one_object() {
        let (mut vm, _) = test_vm();
        let from_parts = format!("{}{}", "con", "cat");
        let a = vm.intern(&from_parts);
        let b = vm.intern("concat");
        assert_eq!(a, b);
    }

    #[test]
    fn collection_frees_unreachable_and_keeps_rooted() {
        let (mut vm, _) = test_vm();

        // Unrooted: only the weak intern table refers to it.
        let ephemeral = vm.intern("an-ephemeral-string");
        // Rooted on the value stack.
        let kept = vm.alloc(ObjData::Sequence(vec![Value::Number(1.0)]));
        vm.push(Value::Obj(kept));

        vm.collect_garbage();

        assert!(matches!(vm.heap.get(ephemeral), ObjData::Free));
        assert!(matches!(vm.heap.get(kept), ObjData::Sequence(_)));
        // Survivors come out of the sweep unmarked.
        assert!(!vm.heap.is_marked(kept));

        // The intern table no longer serves the dead string.
        let hash = crate::value::hash_string(b"an-ephemeral-string");
        assert!(vm
            .strings
            .find_string(&vm.heap, "an-ephemeral-string", hash)
            .is_none());

        vm.pop();
    }

    #[test]
    fn globals_root_their_values() {
        let (mut vm, _) = test_vm();
        let name = vm.intern("pinned");
        let value = vm.alloc(ObjData::Sequence(Vec::new()));
        vm.define_global(name, Value::Obj(value));

        vm.collect_garbage();

        assert!(matches!(vm.heap.get(value), ObjData::Sequence(_)));
    }

    #[test]
    fn repl_mode_prints_expression_statement_values() {
        let (mut vm, output) = test_vm();
        vm.interpret_expr("1 + 2;").expect("evaluates");
        assert_eq!(output.take_string(), "3\n");

        // Outside the REPL the same statement prints nothing.
        vm.interpret("main", "1 + 2;").expect("evaluates");
        assert_eq!(output.take_string(), "");
    }

    #[test]
    fn runtime_errors_reset_the_stacks() {
        let (mut vm, _) = test_vm();
        let error = vm.interpret("main", "print missing;");
        assert!(error.is_err());
        assert!(vm.stack.is_empty());
        assert!(vm.frames.is_empty());

        // The VM is reusable afterwards.
        vm.interpret("main", "let x = 1;").expect("still works");
    }
}
