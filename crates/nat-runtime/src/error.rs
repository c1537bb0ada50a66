//! Runtime and top-level error types.

use std::fmt;

use thiserror::Error;

use crate::diagnostic::Diagnostic;

/// An error raised while the dispatch loop is running. Message texts are
/// part of the runtime's observable surface.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Undefined variable '{0}'.")]
    UndefinedVariable(String),
    #[error("Undefined property '{0}'.")]
    UndefinedProperty(String),
    #[error("Undefined property '{name}' for class '{class}'.")]
    UndefinedMethod { name: String, class: String },
    #[error("Expected {expected} arguments but got {got}.")]
    Arity { expected: usize, got: usize },
    #[error("Stack overflow.")]
    StackOverflow,
    #[error("Can only call functions, classes, and objects with a 'call' method.")]
    NotCallable,
    #[error("Index {index} out of bounds [0:{len}]")]
    IndexOutOfBounds { index: i64, len: usize },
    #[error("{class}: {message}")]
    Thrown { class: String, message: String },
    /// A type or shape error carrying its full message.
    #[error("{0}")]
    Type(String),
    /// Corrupt bytecode or a broken interpreter invariant.
    #[error("internal error: {0}")]
    Internal(String),
}

/// One entry of a runtime stack trace, innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub line: u32,
    pub name: String,
}

/// A runtime error paired with the call stack at the point of failure.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeTrace {
    pub error: RuntimeError,
    pub frames: Vec<TraceFrame>,
}

impl fmt::Display for RuntimeTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.error)?;
        for frame in &self.frames {
            writeln!(f, "[line {}] in {}", frame.line, frame.name)?;
        }
        Ok(())
    }
}

/// Top-level result of driving the runtime.
#[derive(Debug, Error)]
pub enum NatError {
    #[error("{}", format_diagnostics(.0))]
    Compile(Vec<Diagnostic>),
    #[error("{0}")]
    Runtime(RuntimeTrace),
    #[error("initialization failed: {0}")]
    Init(String),
    #[error("Could not open file \"{path}\".")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

fn format_diagnostics(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_formats_innermost_first() {
        let trace = RuntimeTrace {
            error: RuntimeError::UndefinedVariable("x".to_string()),
            frames: vec![
                TraceFrame { line: 2, name: "inner".to_string() },
                TraceFrame { line: 5, name: "script".to_string() },
            ],
        };
        assert_eq!(
            trace.to_string(),
            "Undefined variable 'x'.\n[line 2] in inner\n[line 5] in script\n"
        );
    }

    #[test]
    fn thrown_errors_format_as_class_and_message() {
        let error = RuntimeError::Thrown {
            class: "ParseError".to_string(),
            message: "bad input".to_string(),
        };
        assert_eq!(error.to_string(), "ParseError: bad input");
    }
}
