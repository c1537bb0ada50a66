//! Driver exit codes and output.

use assert_cmd::Command;
use predicates::prelude::*;

fn nat() -> Command {
    Command::cargo_bin("nat").expect("binary builds")
}

fn write_script(dir: &tempfile::TempDir, name: &str, source: &str) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, source).expect("script written");
    path.to_string_lossy().into_owned()
}

#[test]
fn runs_a_module_and_prints() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "main.nat", "let x = 1; print x + 2;");

    nat().arg(script).assert().success().stdout("3\n");
}

#[test]
fn too_many_arguments_is_a_usage_error() {
    nat().args(["a.nat", "b.nat"]).assert().code(64);
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.nat");

    nat()
        .arg(missing.to_string_lossy().as_ref())
        .assert()
        .code(74)
        .stderr(predicate::str::contains("Could not open file"));
}

#[test]
fn compile_errors_exit_65() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "bad.nat", "let = 1;");

    nat()
        .arg(script)
        .assert()
        .code(65)
        .stderr(predicate::str::contains("Expect variable name."));
}

#[test]
fn runtime_errors_exit_70_with_a_trace() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "boom.nat", "print missing;");

    nat()
        .arg(script)
        .assert()
        .code(70)
        .stderr(predicate::str::contains("Undefined variable 'missing'."))
        .stderr(predicate::str::contains("[line 1] in"));
}

#[test]
fn imports_resolve_against_the_script_directory() {
    let dir = tempfile::tempdir().unwrap();
    write_script(&dir, "util.nat", "let answer = 42;");
    let script = write_script(&dir, "main.nat", "import util; print answer;");

    nat().arg(script).assert().success().stdout("42\n");
}
