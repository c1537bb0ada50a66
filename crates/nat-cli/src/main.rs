//! The `nat` driver: run a module, or start the REPL.
//!
//! Exit codes: 0 success, 64 usage error, 65 compile error, 70 runtime
//! error, 2 VM initialization error, 74 file I/O error.

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use termcolor::{ColorChoice, StandardStream};

use nat_runtime::module_loader::FsLoader;
use nat_runtime::{diagnostic, NatError, Vm};

const EX_USAGE: u8 = 64;
const EX_DATAERR: u8 = 65;
const EX_SOFTWARE: u8 = 70;
const EX_IOERR: u8 = 74;
const EX_INIT: u8 = 2;

#[derive(Parser)]
#[command(name = "nat", version, about = "The nat language")]
struct Cli {
    /// Module to run; starts a REPL when omitted.
    path: Option<String>,
}

fn report(error: &NatError) {
    match error {
        NatError::Compile(diagnostics) => {
            let mut stderr = StandardStream::stderr(ColorChoice::Auto);
            let _ = diagnostic::emit(&mut stderr, diagnostics);
        }
        other => eprintln!("{other}"),
    }
}

fn exit_code(error: &NatError) -> u8 {
    match error {
        NatError::Compile(_) => EX_DATAERR,
        NatError::Runtime(_) => EX_SOFTWARE,
        NatError::Init(_) => EX_INIT,
        NatError::Io { .. } => EX_IOERR,
    }
}

fn run_file(path: &str) -> ExitCode {
    // Modules resolve relative to the script's directory.
    let script = Path::new(path);
    let root = script.parent().unwrap_or_else(|| Path::new("."));
    let module = match script.file_name().and_then(|n| n.to_str()) {
        Some(name) => name.to_string(),
        None => {
            eprintln!("Usage: nat [path]");
            return ExitCode::from(EX_USAGE);
        }
    };

    let mut vm = match Vm::with(Box::new(FsLoader::new(root)), Box::new(std::io::stdout())) {
        Ok(vm) => vm,
        Err(error) => {
            report(&error);
            return ExitCode::from(EX_INIT);
        }
    };

    match vm.interpret_module(&module) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            report(&error);
            ExitCode::from(exit_code(&error))
        }
    }
}

fn repl() -> ExitCode {
    let mut vm = match Vm::new() {
        Ok(vm) => vm,
        Err(error) => {
            report(&error);
            return ExitCode::from(EX_INIT);
        }
    };

    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(error) => {
            eprintln!("{error}");
            return ExitCode::from(EX_INIT);
        }
    };

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(&line);
                // Errors are reported and the session continues.
                if let Err(error) = vm.interpret_expr(&line) {
                    report(&error);
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(error) => {
                eprintln!("{error}");
                break;
            }
        }
    }

    ExitCode::SUCCESS
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            // Help and version requests are not usage errors.
            if error.use_stderr() {
                let _ = error.print();
                return ExitCode::from(EX_USAGE);
            }
            let _ = error.print();
            return ExitCode::SUCCESS;
        }
    };

    match cli.path {
        Some(path) => run_file(&path),
        None => repl(),
    }
}
