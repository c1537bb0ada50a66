//! End-to-end scenarios: compile and run source, assert on printed output.

use pretty_assertions::assert_eq;
use rstest::rstest;

use nat_runtime::module_loader::SourceMap;
use nat_runtime::{NatError, RuntimeError, SharedOutput, Vm};

fn vm_with(modules: &[(&str, &str)]) -> (Vm, SharedOutput) {
    let mut loader = SourceMap::new();
    for (path, source) in modules {
        loader.insert(*path, *source);
    }
    let output = SharedOutput::new();
    let vm = Vm::with(Box::new(loader), Box::new(output.clone())).expect("core initialization");
    (vm, output)
}

fn run(source: &str) -> (String, Result<(), NatError>) {
    let (mut vm, output) = vm_with(&[]);
    let result = vm.interpret("main", source);
    (output.take_string(), result)
}

fn run_ok(source: &str) -> String {
    let (output, result) = run(source);
    if let Err(error) = result {
        panic!("execution failed: {error}\noutput so far: {output}");
    }
    output
}

fn run_err(source: &str) -> RuntimeError {
    let (_, result) = run(source);
    match result {
        Err(NatError::Runtime(trace)) => trace.error,
        Err(other) => panic!("expected a runtime error, got: {other}"),
        Ok(()) => panic!("expected a runtime error, got success"),
    }
}

#[rstest]
#[case::arithmetic("let x = 1; print x + 2;", "3\n")]
#[case::recursion(
    "let f = (n) => if (n == 0) 1; else n * f(n - 1); print f(5);",
    "120\n"
)]
#[case::super_dispatch(
    "class A { m() => 1; } class B extends A { m() => 2 + super.m(); } print B().m();",
    "3\n"
)]
#[case::closure("let mk = (n) => () => n; let g = mk(7); print g();", "7\n")]
#[case::upvalue_update(
    "let c = 0; let inc = () => { c = c + 1; return c; }; print inc(); print inc();",
    "1\n2\n"
)]
#[case::user_infix(
    "let infixr (3) $ = (f, x) => f(x); print (n => n + 1) $ 41;",
    "42\n"
)]
#[case::variadic(
    "let s = (first, *rest) => first + rest.len(); print s(10, \"a\", \"b\", \"c\");",
    "13\n"
)]
#[case::comprehension("print [x * x | x in Sequence(1, 2, 3)].len();", "3\n")]
fn scenarios(#[case] source: &str, #[case] expected: &str) {
    assert_eq!(run_ok(source), expected);
}

// === Closures and upvalues ===

#[test]
fn closures_observe_the_value_at_close_time() {
    let source = "
        let make = () => {
          let a = 1;
          let get = () => a;
          a = 2;
          return get;
        };
        print make()();
    ";
    assert_eq!(run_ok(source), "2\n");
}

#[test]
fn sibling_closures_share_one_upvalue() {
    let source = "
        let make = () => {
          let a = 1;
          let inc = () => { a = a + 1; return a; };
          let get = () => a;
          inc();
          return get;
        };
        print make()();
    ";
    assert_eq!(run_ok(source), "2\n");
}

// === Variadics ===

#[rstest]
#[case("print v(1);", "0\n")]
#[case("print v(1, 2);", "1\n")]
#[case("print v(1, 2, 3);", "2\n")]
fn variadic_trailing_lengths(#[case] call: &str, #[case] expected: &str) {
    let source = format!("let v = (a, *rest) => rest.len(); {call}");
    assert_eq!(run_ok(&source), expected);
}

#[test]
fn variadic_called_too_short_is_an_arity_error() {
    let error = run_err("let v = (a, *rest) => rest.len(); v();");
    assert_eq!(error, RuntimeError::Arity { expected: 2, got: 1 });
}

#[test]
fn spread_splices_arguments_flat() {
    let source = "
        let f = (a, b, c) => a + b + c;
        let xs = Sequence(1, 2, 3);
        print f(..xs);
    ";
    assert_eq!(run_ok(source), "6\n");
}

// === Classes ===

#[test]
fn inherit_copies_methods_down() {
    let source = "
        class A { m() => 1; }
        class B extends A {}
        print B().m();
    ";
    assert_eq!(run_ok(source), "1\n");
}

#[test]
fn initializers_return_the_instance() {
    let source = "
        class Point {
          init(x, y) => {
            this.x = x;
            this.y = y;
          }
          sum() => this.x + this.y;
        }
        print Point(3, 4).sum();
    ";
    assert_eq!(run_ok(source), "7\n");
}

#[test]
fn fields_shadow_methods_on_property_access() {
    let source = "
        class A { m() => 1; }
        let a = A();
        a.m = () => 2;
        print a.m();
    ";
    assert_eq!(run_ok(source), "2\n");
}

#[test]
fn equality_is_overridable_per_class() {
    let source = "
        class P {
          init(x) => { this.x = x; }
          __eq__(o) => this.x == o.x;
        }
        print P(1) == P(1);
        print P(1) == P(2);
    ";
    assert_eq!(run_ok(source), "true\nfalse\n");
}

#[test]
fn calling_a_plain_instance_is_an_error() {
    let error = run_err("class A {} A()();");
    assert_eq!(
        error,
        RuntimeError::Type("Objects require a 'call' method to be called.".to_string())
    );
}

#[test]
fn instances_with_a_call_method_are_callable() {
    let source = "
        class Adder {
          init(n) => { this.n = n; }
          call(x) => this.n + x;
        }
        print Adder(40)(2);
    ";
    assert_eq!(run_ok(source), "42\n");
}

// === Operators ===

#[test]
fn user_infix_right_associativity_chains() {
    // a ** b = a + 2b; right associativity folds from the right.
    let source = "
        let infixr (3) ** = (a, b) => a + b + b;
        print 1 ** 2 ** 3;
    ";
    assert_eq!(run_ok(source), "17\n");
}

#[test]
fn whitespace_dot_composes_functions() {
    let source = "
        let add1 = (x) => x + 1;
        let dbl = (x) => x + x;
        print (add1 . dbl)(5);
    ";
    assert_eq!(run_ok(source), "11\n");
}

#[test]
fn comparison_and_logical_operators() {
    assert_eq!(run_ok("print 1 < 2;"), "true\n");
    assert_eq!(run_ok("print 2 <= 1;"), "false\n");
    assert_eq!(run_ok("print 3 >= 3;"), "true\n");
    assert_eq!(run_ok("print true && false;"), "false\n");
    assert_eq!(run_ok("print false || true;"), "true\n");
    assert_eq!(run_ok("print !nil;"), "true\n");
    assert_eq!(run_ok("print 1 != 2;"), "true\n");
}

#[test]
fn numeric_operators_are_shadowable_globals() {
    let source = "
        let old = __add__;
        + = (a, b) => old(old(a, b), 1);
        print 1 + 2;
    ";
    // The operator resolves through an ordinary global, so reassigning it
    // changes what `+` does.
    assert_eq!(run_ok(source), "4\n");
}

#[test]
fn string_concatenation_and_interning() {
    assert_eq!(run_ok("print \"ab\" + \"cd\";"), "abcd\n");
    assert_eq!(run_ok("print \"ab\" == \"ab\";"), "true\n");
    assert_eq!(run_ok("print (\"a\" + \"b\") == \"ab\";"), "true\n");
}

// === Collections ===

#[test]
fn sequence_literals_index_and_mutate() {
    let source = "
        let xs = [10, 20, 30];
        print xs[1];
        xs[1] = 21;
        print xs[1];
        print xs.len();
    ";
    assert_eq!(run_ok(source), "20\n21\n3\n");
}

#[test]
fn sequence_membership_scans_elements() {
    assert_eq!(run_ok("print 2 in [1, 2, 3];"), "true\n");
    assert_eq!(run_ok("print 9 in [1, 2, 3];"), "false\n");
}

#[test]
fn map_literals_lower_to_tuple_entries() {
    let source = "
        let m = {\"a\": 1, \"b\": 2};
        print m[\"a\"] + m[\"b\"];
        print \"a\" in m;
        print \"z\" in m;
    ";
    assert_eq!(run_ok(source), "3\ntrue\nfalse\n");
}

#[test]
fn set_literals_deduplicate_membership() {
    let source = "
        let s = {1, 2, 3};
        print 2 in s;
        print 9 in s;
    ";
    assert_eq!(run_ok(source), "true\nfalse\n");
}

#[test]
fn tuple_literals_support_indexing() {
    let source = "
        let t = (1, 2, 3);
        print t[0] + t[2];
        print t.len();
    ";
    assert_eq!(run_ok(source), "4\n3\n");
}

#[test]
fn unit_is_the_empty_parenthesis() {
    assert_eq!(run_ok("print ();"), "()\n");
}

#[test]
fn comprehension_predicates_filter() {
    let source = "print [x | x in Sequence(1, 2, 3, 4), x > 2].len();";
    assert_eq!(run_ok(source), "2\n");
}

#[test]
fn comprehension_nests_generators() {
    let source = "print [x + y | x in Sequence(1, 2), y in Sequence(10, 20)].len();";
    assert_eq!(run_ok(source), "4\n");
}

#[test]
fn comprehension_elements_evaluate_in_order() {
    let source = "
        let xs = [x * x | x in Sequence(1, 2, 3)];
        print xs[0];
        print xs[1];
        print xs[2];
    ";
    assert_eq!(run_ok(source), "1\n4\n9\n");
}

// === Statements ===

#[test]
fn while_loops_run_to_exhaustion() {
    let source = "
        let i = 0;
        let total = 0;
        while (i < 4) {
          total = total + i;
          i = i + 1;
        }
        print total;
    ";
    assert_eq!(run_ok(source), "6\n");
}

#[test]
fn c_style_for_loops() {
    let source = "
        let total = 0;
        for (let i = 0; i < 3; i = i + 1) {
          total = total + i;
        }
        print total;
    ";
    assert_eq!(run_ok(source), "3\n");
}

#[test]
fn for_in_drives_the_iterator_protocol() {
    let source = "
        let total = 0;
        for (x in Sequence(1, 2, 3)) {
          total = total + x;
        }
        print total;
    ";
    assert_eq!(run_ok(source), "6\n");
}

#[test]
fn multi_let_and_const_declarations() {
    assert_eq!(run_ok("let a = 1, b = 2; print a + b;"), "3\n");
    // A const binds the name to its own name string.
    assert_eq!(run_ok("const tag; print tag;"), "tag\n");
}

#[test]
fn destructure_unwraps_via_the_user_hook() {
    let source = "
        let box = Sequence(42);
        let x <- box;
        print x;
    ";
    assert_eq!(run_ok(source), "42\n");
}

#[test]
fn dom_declarations_build_domains() {
    let source = "
        dom D = {1, 2, 3};
        print 2 in D;
        print 9 in D;
    ";
    assert_eq!(run_ok(source), "true\nfalse\n");
}

#[test]
fn type_annotations_are_parsed_but_not_enforced() {
    assert_eq!(run_ok("let x : u = \"anything\"; print x;"), "anything\n");
}

// === Overloads and patterns ===

#[test]
fn overloads_dispatch_on_literal_patterns() {
    let source = "
        let fib = (0) => 0 | (1) => 1 | (n) => fib(n - 1) + fib(n - 2);
        print fib(10);
    ";
    assert_eq!(run_ok(source), "55\n");
}

#[test]
fn overloads_dispatch_on_arity() {
    let source = "
        let f = (a) => 1 | (a, b) => 2;
        print f(0);
        print f(0, 0);
    ";
    assert_eq!(run_ok(source), "1\n2\n");
}

#[test]
fn unmatched_overloads_are_a_runtime_error() {
    let error = run_err("let f = (0) => 0; let g = (1) => 1 | (2) => 2; g(3);");
    assert!(matches!(error, RuntimeError::Type(_)));
}

#[test]
fn naked_functions_curry() {
    let source = "let add = a b => a + b; print add(2)(3);";
    assert_eq!(run_ok(source), "5\n");
}

// === Natives ===

#[test]
fn core_native_surface() {
    assert_eq!(run_ok("print len([1, 2, 3]);"), "3\n");
    assert_eq!(run_ok("print str(42);"), "42\n");
    assert_eq!(run_ok("print str(true);"), "true\n");
    assert_eq!(run_ok("print type(1);"), "CNumber\n");
    assert_eq!(run_ok("print type(nil);"), "CNil\n");
    assert_eq!(run_ok("print type(undefined);"), "CUndef\n");
    assert_eq!(run_ok("class A {} print type(A());"), "A\n");
}

#[test]
fn get_hash_is_stable_and_set_hash_enables_keys() {
    assert_eq!(run_ok("print getHash(\"x\") == getHash(\"x\");"), "true\n");
    let source = "
        class K {}
        let k = K();
        setHash(k, 77);
        let m = Map();
        m.set(k, 1);
        print m.get(k);
    ";
    assert_eq!(run_ok(source), "1\n");
}

#[test]
fn entries_lists_instance_fields() {
    let source = "
        class A {}
        let a = A();
        a.x = 1;
        print len(entries(a));
    ";
    assert_eq!(run_ok(source), "1\n");
}

#[test]
fn unhashable_map_keys_are_rejected() {
    let error = run_err("class K {} let m = Map(); m.set(K(), 1);");
    assert_eq!(
        error,
        RuntimeError::Type("Object lacks a valid hash.".to_string())
    );
}

// === Errors ===

#[test]
fn throw_formats_class_and_message() {
    let source = "
        class Error { init(message) => { this.message = message; } }
        throw Error(\"boom\");
    ";
    let error = run_err(source);
    assert_eq!(
        error,
        RuntimeError::Thrown {
            class: "Error".to_string(),
            message: "boom".to_string(),
        }
    );
}

#[test]
fn throw_requires_a_message_field() {
    let error = run_err("class E {} throw E();");
    assert_eq!(
        error,
        RuntimeError::Type("Error must define a 'message'.".to_string())
    );
}

#[test]
fn undefined_variables_carry_their_name() {
    let error = run_err("print missing;");
    assert_eq!(error, RuntimeError::UndefinedVariable("missing".to_string()));
}

#[test]
fn runtime_traces_name_the_frames() {
    let (_, result) = run("let f = () => missing; f();");
    match result {
        Err(NatError::Runtime(trace)) => {
            assert_eq!(trace.frames.len(), 2);
            assert_eq!(trace.frames[0].name, "f");
            assert_eq!(trace.frames[1].name, "main");
        }
        other => panic!("expected a runtime trace, got {other:?}"),
    }
}

#[test]
fn compile_errors_are_batched() {
    let (_, result) = run("let = 1; print ;");
    match result {
        Err(NatError::Compile(diagnostics)) => assert_eq!(diagnostics.len(), 2),
        other => panic!("expected compile errors, got {other:?}"),
    }
}

#[test]
fn properties_require_objects() {
    let error = run_err("print 1.x;");
    assert_eq!(
        error,
        RuntimeError::Type("Only objects have properties.".to_string())
    );
}

#[test]
fn sequence_indexing_is_bounds_checked() {
    let error = run_err("let xs = [1]; print xs[3];");
    assert_eq!(error, RuntimeError::IndexOutOfBounds { index: 3, len: 1 });
}

// === Imports ===

#[test]
fn imports_compile_and_run_into_shared_globals() {
    let (mut vm, output) = vm_with(&[("lib/util", "let helper = (x) => x + 1;")]);
    vm.interpret("main", "import lib/util; print helper(41);")
        .expect("runs");
    assert_eq!(output.take_string(), "42\n");
}

#[test]
fn import_as_clause_is_accepted() {
    let (mut vm, output) = vm_with(&[("util", "let answer = 42;")]);
    vm.interpret("main", "import util as u; print answer;")
        .expect("runs");
    assert_eq!(output.take_string(), "42\n");
}

#[test]
fn missing_imports_are_compile_errors() {
    let (mut vm, _) = vm_with(&[]);
    let result = vm.interpret("main", "import missing/module;");
    assert!(matches!(result, Err(NatError::Compile(_))));
}
