//! Compile diagnostics.
//!
//! The compiler batches errors under a panic-mode flag and resynchronizes
//! at statement boundaries; each recorded error becomes a [`Diagnostic`]
//! attributed to a line, the enclosing function, and the offending lexeme.

use std::fmt;
use std::io::Write;

use termcolor::{Color, ColorSpec, StandardStream, WriteColor};

/// Where a diagnostic points within its line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticAt {
    /// The error was reported at end of input.
    End,
    /// The error was reported at a lexeme.
    Lexeme(String),
    /// The error token carried no lexeme (scanner errors).
    Nowhere,
}

/// A single compile error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub line: u32,
    /// Name of the function being compiled when the error was found.
    pub location: String,
    pub at: DiagnosticAt,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] in {}, Error", self.line, self.location)?;
        match &self.at {
            DiagnosticAt::End => write!(f, " at end")?,
            DiagnosticAt::Lexeme(lexeme) => write!(f, " at '{lexeme}'")?,
            DiagnosticAt::Nowhere => {}
        }
        write!(f, ": {}", self.message)
    }
}

/// Render diagnostics to a terminal stream, message text in red.
pub fn emit(stream: &mut StandardStream, diagnostics: &[Diagnostic]) -> std::io::Result<()> {
    let mut error_spec = ColorSpec::new();
    error_spec.set_fg(Some(Color::Red));

    for diagnostic in diagnostics {
        stream.set_color(&error_spec)?;
        writeln!(stream, "{diagnostic}")?;
    }
    stream.reset()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_the_reporting_format() {
        let diagnostic = Diagnostic {
            line: 3,
            location: "script".to_string(),
            at: DiagnosticAt::Lexeme("}".to_string()),
            message: "Expect expression.".to_string(),
        };
        assert_eq!(
            diagnostic.to_string(),
            "[line 3] in script, Error at '}': Expect expression."
        );
    }

    #[test]
    fn display_at_end() {
        let diagnostic = Diagnostic {
            line: 1,
            location: "repl".to_string(),
            at: DiagnosticAt::End,
            message: "Expect ';' after expression.".to_string(),
        };
        assert_eq!(
            diagnostic.to_string(),
            "[line 1] in repl, Error at end: Expect ';' after expression."
        );
    }
}
