//! The native core library and bootstrap.
//!
//! Natives follow the VM's calling convention: arguments sit above the
//! callee slot (which holds the receiver for method natives), and a native
//! must leave exactly one result in place of the callee and arguments.
//!
//! Initialization installs the native globals and the native `Object`
//! class, runs the embedded bootstrap module (the guest half of the core),
//! verifies the globals user code depends on, and rebinds the `Sequence`
//! and `Tuple` constructors natively.

use crate::error::{NatError, RuntimeError};
use crate::object::{ClassData, NativeData, NativeFn, ObjData, ObjRef};
use crate::table::Table;
use crate::value::{format_number, Value};
use crate::vm::Vm;

/// The guest half of the core library, compiled and run by `initialize_core`.
const BOOTSTRAP: &str = include_str!("bootstrap.nat");

/// Globals that must exist once the bootstrap module has run.
const REQUIRED_GLOBALS: &[&str] = &[
    "Object",
    "Tuple",
    "Sequence",
    "Map",
    "Set",
    "Iterator",
    "Node",
    "Root",
    "Domain",
    "Signature",
    "Pattern",
    "PatternElement",
    "Variable",
    "compose",
    "iter",
    "destructure",
];

fn define_native(
    vm: &mut Vm,
    name: &str,
    arity: usize,
    variadic: bool,
    function: NativeFn,
) -> ObjRef {
    let name_ref = vm.intern(name);
    // Root the name while the native object is allocated.
    vm.push(Value::Obj(name_ref));
    let native = vm.alloc(ObjData::Native(NativeData {
        arity,
        variadic,
        name: name_ref,
        function,
    }));
    vm.pop();
    native
}

fn define_native_global(vm: &mut Vm, name: &str, arity: usize, function: NativeFn) {
    let native = define_native(vm, name, arity, false, function);
    let name_ref = vm.intern(name);
    vm.define_global(name_ref, Value::Obj(native));
}

fn define_native_method(
    vm: &mut Vm,
    class: ObjRef,
    name: &str,
    arity: usize,
    variadic: bool,
    function: NativeFn,
) {
    let native = define_native(vm, name, arity, variadic, function);
    let name_ref = vm.intern(name);
    let (key, hash) = vm.name_key(name_ref);
    match vm.heap.get_mut(class) {
        ObjData::Class(data) => {
            data.methods.set(key, Value::Obj(native), hash);
        }
        other => unreachable!("native method on {}", other.kind_name()),
    }
}

fn define_native_class(vm: &mut Vm, name: &str) -> ObjRef {
    let name_ref = vm.intern(name);
    vm.push(Value::Obj(name_ref));
    let class = vm.alloc(ObjData::Class(ClassData {
        name: name_ref,
        methods: Table::new(),
        superclass: None,
    }));
    vm.pop();
    vm.define_global(name_ref, Value::Obj(class));
    class
}

fn get_class(vm: &mut Vm, name: &str) -> Result<ObjRef, NatError> {
    let name_ref = vm.intern(name);
    match vm.global(name_ref) {
        Some(Value::Obj(r)) if matches!(vm.heap.get(r), ObjData::Class(_)) => Ok(r),
        Some(_) => Err(NatError::Init(format!("'{name}' is not a class"))),
        None => Err(NatError::Init(format!("couldn't find class '{name}'"))),
    }
}

// === Native functions ===

fn as_instance(vm: &Vm, value: Value) -> Option<ObjRef> {
    match value {
        Value::Obj(r) if matches!(vm.heap.get(r), ObjData::Instance(_)) => Some(r),
        _ => None,
    }
}

/// `len(x)`: sequence length, `__len__` dispatch, or field count.
fn native_len(vm: &mut Vm, _arg_count: usize) -> Result<(), RuntimeError> {
    let value = vm.peek(0);

    if let Some(r) = value.as_obj() {
        if let ObjData::Sequence(values) = vm.heap.get(r) {
            let length = values.len();
            vm.pop();
            vm.pop();
            vm.push(Value::Number(length as f64));
            return Ok(());
        }
    }

    let Some(instance) = as_instance(vm, value) else {
        return Err(RuntimeError::Type(
            "Only sequences and objects with a '__len__' method have length.".to_string(),
        ));
    };

    let class = match vm.heap.get(instance) {
        ObjData::Instance(data) => data.class,
        _ => unreachable!("checked above"),
    };

    // Use the object's length method if defined.
    if let Some(method) = vm.class_method(class, vm.names.length) {
        vm.pop();
        vm.pop();
        vm.push(Value::Obj(instance));
        return vm.call_value(method, 0);
    }

    // Otherwise default to the instance's field count.
    let length = match vm.heap.get(instance) {
        ObjData::Instance(data) => data.fields.len(),
        _ => unreachable!("checked above"),
    };
    vm.pop();
    vm.pop();
    vm.push(Value::Number(length as f64));
    Ok(())
}

fn native_str(vm: &mut Vm, _arg_count: usize) -> Result<(), RuntimeError> {
    let value = vm.peek(0);

    // Strings pass through unchanged.
    if let Some(r) = value.as_obj() {
        if matches!(vm.heap.get(r), ObjData::String(_)) {
            vm.pop();
            vm.pop();
            vm.push(value);
            return Ok(());
        }
    }

    let text = match value {
        Value::Number(n) => format_number(n),
        Value::Nil => "nil".to_string(),
        Value::Bool(true) => "true".to_string(),
        Value::Bool(false) => "false".to_string(),
        _ => return Err(RuntimeError::Type("Can't convert value to string.".to_string())),
    };

    let string = vm.intern(&text);
    vm.pop();
    vm.pop();
    vm.push(Value::Obj(string));
    Ok(())
}

fn native_type(vm: &mut Vm, _arg_count: usize) -> Result<(), RuntimeError> {
    let value = vm.peek(0);

    // Instances answer with their class.
    if let Some(instance) = as_instance(vm, value) {
        let class = match vm.heap.get(instance) {
            ObjData::Instance(data) => data.class,
            _ => unreachable!("checked above"),
        };
        vm.pop();
        vm.pop();
        vm.push(Value::Obj(class));
        return Ok(());
    }

    let name = match value {
        Value::Unit => "CUnit",
        Value::Nil => "CNil",
        Value::Bool(_) => "CBool",
        Value::Number(_) => "CNumber",
        Value::Undefined => "CUndef",
        Value::Obj(r) => match vm.heap.get(r) {
            ObjData::String(_) => "OString",
            ObjData::Function(_) | ObjData::Closure(_) => "OFunction",
            ObjData::BoundMethod(_) => "OBoundFunction",
            ObjData::Native(_) => "ONative",
            ObjData::Class(_) => "OClass",
            ObjData::Overload(_) => "OOverload",
            ObjData::Sequence(_) => "OSequence",
            ObjData::Map(_) => "OMap",
            _ => "OVariable",
        },
    };

    let string = vm.intern(name);
    vm.pop();
    vm.pop();
    vm.push(Value::Obj(string));
    Ok(())
}

fn native_clock(vm: &mut Vm, _arg_count: usize) -> Result<(), RuntimeError> {
    let seconds = vm.clock_seconds();
    vm.pop();
    vm.push(Value::Number(seconds));
    Ok(())
}

/// `entries(obj)`: the instance's fields as a sequence of `[key, value]`
/// sequences.
fn native_entries(vm: &mut Vm, _arg_count: usize) -> Result<(), RuntimeError> {
    let value = vm.peek(0);
    let Some(instance) = as_instance(vm, value) else {
        return Err(RuntimeError::Type("Only objects have entries.".to_string()));
    };

    let pairs: Vec<(Value, Value)> = match vm.heap.get(instance) {
        ObjData::Instance(data) => data.fields.iter().collect(),
        _ => unreachable!("checked above"),
    };

    // The entry sequence goes on the stack so the per-entry allocations
    // below can't collect it.
    let entries = vm.alloc(ObjData::Sequence(Vec::with_capacity(pairs.len())));
    vm.push(Value::Obj(entries));

    for (key, entry_value) in pairs {
        let entry = vm.alloc(ObjData::Sequence(vec![key, entry_value]));
        match vm.heap.get_mut(entries) {
            ObjData::Sequence(values) => values.push(Value::Obj(entry)),
            _ => unreachable!("entries changed kind"),
        }
    }

    let entries = vm.pop();
    vm.pop();
    vm.pop();
    vm.push(entries);
    Ok(())
}

fn native_get_hash(vm: &mut Vm, _arg_count: usize) -> Result<(), RuntimeError> {
    let value = vm.pop();
    vm.pop();
    let hash = vm.hash(value);
    vm.push(Value::Number(f64::from(hash)));
    Ok(())
}

fn native_set_hash(vm: &mut Vm, _arg_count: usize) -> Result<(), RuntimeError> {
    let hash = vm.pop();
    let value = vm.pop();
    vm.pop();

    let Some(r) = value.as_obj() else {
        return Err(RuntimeError::Type("Can only set hash of an object.".to_string()));
    };
    if matches!(vm.heap.get(r), ObjData::String(_)) {
        return Err(RuntimeError::Type("Can't set hash of a string.".to_string()));
    }
    let Value::Number(hash) = hash else {
        return Err(RuntimeError::Type("Hash must be a number.".to_string()));
    };

    vm.heap.set_hash(r, hash as u32);
    vm.push(Value::Nil);
    Ok(())
}

fn binary_numbers(vm: &mut Vm, op: fn(f64, f64) -> Value) -> Result<(), RuntimeError> {
    let (Some(a), Some(b)) = (vm.peek(1).as_number(), vm.peek(0).as_number()) else {
        return Err(RuntimeError::Type("Operands must be numbers.".to_string()));
    };
    vm.pop();
    vm.pop();
    vm.pop();
    vm.push(op(a, b));
    Ok(())
}

fn native_add(vm: &mut Vm, _arg_count: usize) -> Result<(), RuntimeError> {
    let (a, b) = (vm.peek(1), vm.peek(0));

    let strings = match (a.as_obj(), b.as_obj()) {
        (Some(ra), Some(rb)) => {
            match (vm.heap.get(ra), vm.heap.get(rb)) {
                (ObjData::String(sa), ObjData::String(sb)) => {
                    Some(format!("{}{}", sa.text, sb.text))
                }
                _ => None,
            }
        }
        _ => None,
    };

    if let Some(text) = strings {
        // The operands stay on the stack until the result exists.
        let result = vm.intern(&text);
        vm.pop();
        vm.pop();
        vm.pop();
        vm.push(Value::Obj(result));
        return Ok(());
    }

    match (a, b) {
        (Value::Number(a), Value::Number(b)) => {
            vm.pop();
            vm.pop();
            vm.pop();
            vm.push(Value::Number(a + b));
            Ok(())
        }
        _ => Err(RuntimeError::Type(
            "Operands must be two numbers or two strings.".to_string(),
        )),
    }
}

fn native_sub(vm: &mut Vm, _arg_count: usize) -> Result<(), RuntimeError> {
    binary_numbers(vm, |a, b| Value::Number(a - b))
}

fn native_mul(vm: &mut Vm, _arg_count: usize) -> Result<(), RuntimeError> {
    binary_numbers(vm, |a, b| Value::Number(a * b))
}

fn native_div(vm: &mut Vm, _arg_count: usize) -> Result<(), RuntimeError> {
    binary_numbers(vm, |a, b| Value::Number(a / b))
}

fn native_gt(vm: &mut Vm, _arg_count: usize) -> Result<(), RuntimeError> {
    binary_numbers(vm, |a, b| Value::Bool(a > b))
}

fn native_lt(vm: &mut Vm, _arg_count: usize) -> Result<(), RuntimeError> {
    binary_numbers(vm, |a, b| Value::Bool(a < b))
}

fn native_gte(vm: &mut Vm, _arg_count: usize) -> Result<(), RuntimeError> {
    binary_numbers(vm, |a, b| Value::Bool(a >= b))
}

fn native_lte(vm: &mut Vm, _arg_count: usize) -> Result<(), RuntimeError> {
    binary_numbers(vm, |a, b| Value::Bool(a <= b))
}

// === Object natives ===

fn native_object_get(vm: &mut Vm, _arg_count: usize) -> Result<(), RuntimeError> {
    vm.validate_hashable(vm.peek(0))?;

    let key = vm.peek(0);
    let hash = vm.hash(key);
    let Some(instance) = as_instance(vm, vm.peek(1)) else {
        return Err(RuntimeError::Type("Only objects have entries.".to_string()));
    };

    let value = match vm.heap.get(instance) {
        ObjData::Instance(data) => data
            .fields
            .get(key, hash)
            .or_else(|| vm.heap.class(data.class).methods.get(key, hash)),
        _ => unreachable!("checked above"),
    };

    vm.pop();
    vm.pop();
    vm.push(value.unwrap_or(Value::Nil));
    Ok(())
}

fn native_object_set(vm: &mut Vm, _arg_count: usize) -> Result<(), RuntimeError> {
    vm.validate_hashable(vm.peek(1))?;

    let value = vm.peek(0);
    let key = vm.peek(1);
    let hash = vm.hash(key);
    let Some(instance) = as_instance(vm, vm.peek(2)) else {
        return Err(RuntimeError::Type("Only objects have entries.".to_string()));
    };

    match vm.heap.get_mut(instance) {
        ObjData::Instance(data) => {
            data.fields.set(key, value, hash);
        }
        _ => unreachable!("checked above"),
    }

    vm.pop();
    vm.pop();
    vm.pop();
    vm.push(Value::Nil);
    Ok(())
}

fn native_object_has(vm: &mut Vm, _arg_count: usize) -> Result<(), RuntimeError> {
    vm.validate_hashable(vm.peek(0))?;

    let key = vm.peek(0);
    let hash = vm.hash(key);
    let Some(instance) = as_instance(vm, vm.peek(1)) else {
        return Err(RuntimeError::Type("Only objects have entries.".to_string()));
    };

    let has = match vm.heap.get(instance) {
        ObjData::Instance(data) => {
            data.fields.has(key, hash) || vm.heap.class(data.class).methods.has(key, hash)
        }
        _ => unreachable!("checked above"),
    };

    vm.pop();
    vm.pop();
    vm.push(Value::Bool(has));
    Ok(())
}

// === Sequence and Tuple natives ===

/// Variadic initializer shared by `Sequence` and `Tuple`: seeds the
/// instance's `values` field from the construction arguments.
fn native_sequential_init(vm: &mut Vm, arg_count: usize) -> Result<(), RuntimeError> {
    let Some(instance) = as_instance(vm, vm.peek(arg_count)) else {
        return Err(RuntimeError::Internal("initializer without a receiver".to_string()));
    };

    let elements: Vec<Value> = (0..arg_count).map(|i| vm.peek(arg_count - 1 - i)).collect();
    // The arguments root the elements while the array is allocated.
    let values = vm.alloc(ObjData::Sequence(elements));

    let (key, hash) = vm.name_key(vm.names.values);
    match vm.heap.get_mut(instance) {
        ObjData::Instance(data) => {
            data.fields.set(key, Value::Obj(values), hash);
        }
        _ => unreachable!("checked above"),
    }

    for _ in 0..arg_count {
        vm.pop();
    }
    Ok(())
}

fn sequence_value_field(vm: &Vm, instance: ObjRef) -> Result<ObjRef, RuntimeError> {
    let (key, hash) = vm.name_key(vm.names.values);
    let field = match vm.heap.get(instance) {
        ObjData::Instance(data) => data.fields.get(key, hash),
        _ => None,
    };
    match field.and_then(Value::as_obj) {
        Some(r) if matches!(vm.heap.get(r), ObjData::Sequence(_)) => Ok(r),
        _ => Err(RuntimeError::Type(
            "Sequence instance missing its values!".to_string(),
        )),
    }
}

fn native_sequence_push(vm: &mut Vm, _arg_count: usize) -> Result<(), RuntimeError> {
    let value = vm.peek(0);
    let Some(instance) = as_instance(vm, vm.peek(1)) else {
        return Err(RuntimeError::Type("Expecting sequence.".to_string()));
    };
    let values = sequence_value_field(vm, instance)?;

    match vm.heap.get_mut(values) {
        ObjData::Sequence(elements) => elements.push(value),
        _ => unreachable!("validated above"),
    }

    vm.pop();
    Ok(())
}

fn native_sequence_pop(vm: &mut Vm, _arg_count: usize) -> Result<(), RuntimeError> {
    let Some(instance) = as_instance(vm, vm.peek(0)) else {
        return Err(RuntimeError::Type("Expecting sequence.".to_string()));
    };
    let values = sequence_value_field(vm, instance)?;

    let popped = match vm.heap.get_mut(values) {
        ObjData::Sequence(elements) => elements.pop(),
        _ => unreachable!("validated above"),
    };
    let Some(popped) = popped else {
        return Err(RuntimeError::Type("Can't pop from an empty sequence.".to_string()));
    };

    vm.pop();
    vm.push(popped);
    Ok(())
}

// === Initialization ===

/// Install the native layer, run the bootstrap module, and verify the
/// globals user code depends on.
pub(crate) fn initialize_core(vm: &mut Vm) -> Result<(), NatError> {
    // Native functions.
    define_native_global(vm, "len", 1, native_len);
    define_native_global(vm, "str", 1, native_str);
    define_native_global(vm, "getHash", 1, native_get_hash);
    define_native_global(vm, "setHash", 2, native_set_hash);
    define_native_global(vm, "type", 1, native_type);
    define_native_global(vm, "entries", 1, native_entries);
    define_native_global(vm, "clock", 0, native_clock);

    define_native_global(vm, "__gt__", 2, native_gt);
    define_native_global(vm, "__lt__", 2, native_lt);
    define_native_global(vm, "__gte__", 2, native_gte);
    define_native_global(vm, "__lte__", 2, native_lte);
    define_native_global(vm, "__add__", 2, native_add);
    define_native_global(vm, "__sub__", 2, native_sub);
    define_native_global(vm, "__div__", 2, native_div);
    define_native_global(vm, "__mul__", 2, native_mul);

    let object = define_native_class(vm, "Object");
    vm.classes.object = Some(object);
    define_native_method(vm, object, "get", 1, false, native_object_get);
    define_native_method(vm, object, "set", 2, false, native_object_set);
    define_native_method(vm, object, "has", 1, false, native_object_has);

    // The guest half.
    vm.bootstrapping = true;
    let bootstrapped = vm.interpret("core", BOOTSTRAP);
    vm.bootstrapping = false;
    bootstrapped.map_err(|e| NatError::Init(e.to_string()))?;

    for name in REQUIRED_GLOBALS {
        let name_ref = vm.intern(name);
        if vm.global(name_ref).is_none() {
            return Err(NatError::Init(format!(
                "bootstrap module did not define '{name}'"
            )));
        }
    }

    // Rebind the constructors natively.
    let sequence = get_class(vm, "Sequence")?;
    vm.classes.sequence = Some(sequence);
    define_native_method(vm, sequence, "init", 0, true, native_sequential_init);
    define_native_method(vm, sequence, "push", 1, false, native_sequence_push);
    define_native_method(vm, sequence, "pop", 0, false, native_sequence_pop);

    let tuple = get_class(vm, "Tuple")?;
    vm.classes.tuple = Some(tuple);
    define_native_method(vm, tuple, "init", 0, true, native_sequential_init);

    Ok(())
}
