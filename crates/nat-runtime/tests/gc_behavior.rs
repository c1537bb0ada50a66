//! Collector behavior observable through the public surface: allocation
//! churn must not disturb live program state.

use nat_runtime::module_loader::SourceMap;
use nat_runtime::{SharedOutput, Vm};

fn run_ok(source: &str) -> String {
    let output = SharedOutput::new();
    let mut vm = Vm::with(Box::new(SourceMap::new()), Box::new(output.clone()))
        .expect("core initialization");
    vm.interpret("main", source).expect("runs");
    output.take_string()
}

#[test]
fn allocation_churn_preserves_live_values() {
    // Build and drop many short-lived strings and sequences while keeping
    // one closure-captured value alive across the whole run.
    let source = "
        let make = () => {
          let kept = \"kept-\" + \"value\";
          return () => kept;
        };
        let get = make();

        let i = 0;
        while (i < 200) {
          let garbage = [i, i + 1, i + 2];
          let s = str(i) + \"-tmp\";
          i = i + 1;
        }

        print get();
    ";
    assert_eq!(run_ok(source), "kept-value\n");
}

#[test]
fn collections_survive_growth_across_collections() {
    let source = "
        let xs = Sequence();
        for (let i = 0; i < 100; i = i + 1) {
          xs.push(i * 2);
        }
        print xs.len();
        print xs[99];
    ";
    assert_eq!(run_ok(source), "100\n198\n");
}

#[test]
fn each_closure_gets_its_own_closed_upvalue() {
    let source = "
        let make = (start) => {
          let n = start;
          return () => { n = n + 1; return n; };
        };
        let a = make(10);
        let b = make(100);
        a();
        a();
        b();
        print a();
        print b();
    ";
    assert_eq!(run_ok(source), "13\n102\n");
}

#[test]
fn instances_hold_their_class_alive_through_churn() {
    let source = "
        let make = () => {
          class Local {
            init(v) => { this.v = v; }
            get() => this.v;
          }
          return Local(7);
        };
        let kept = make();

        let i = 0;
        while (i < 200) {
          let tmp = str(i) + str(i);
          i = i + 1;
        }

        print kept.get();
    ";
    assert_eq!(run_ok(source), "7\n");
}
