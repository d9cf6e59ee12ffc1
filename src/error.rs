// Error kinds shared by every stage of the toolchain.
//
// Each variant carries a source location when one is known. The CLI maps
// errors to exit codes by pipeline phase (parse, link/validate, runtime),
// not by variant, so the same kind can surface with different codes
// depending on where it was detected.

use std::fmt;

use thiserror::Error;

// A point in an IR source file. `col` is zero when only the line is known.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Location {
    pub file: String,
    pub line: u32,
    pub col: u32,
}

impl Location {
    pub fn new(file: &str, line: u32, col: u32) -> Location {
        Location {
            file: file.to_string(),
            line,
            col,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.col > 0 {
            write!(f, "{}:{}:{}", self.file, self.line, self.col)
        } else {
            write!(f, "{}:{}", self.file, self.line)
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{loc}: lex error: {msg}")]
    Lex { loc: Location, msg: String },

    #[error("{loc}: parse error: {msg}")]
    Parse { loc: Location, msg: String },

    #[error("{loc}: undefined label `{name}`")]
    UndefinedLabel { loc: Location, name: String },

    #[error("{loc}: undefined variable `{name}`")]
    UndefinedVariable { loc: Location, name: String },

    #[error("{loc}: ambiguous symbol `{name}`")]
    AmbiguousSymbol { loc: Location, name: String },

    #[error("{loc}: `{opcode}` takes {expected} operands, found {found}")]
    OperandArityMismatch {
        loc: Location,
        opcode: String,
        expected: String,
        found: usize,
    },

    #[error("{loc}: type mismatch: {msg}")]
    TypeMismatch { loc: Location, msg: String },

    #[error("{loc}: format mismatch: {msg}")]
    FormatMismatch { loc: Location, msg: String },

    #[error("{loc}: DivideByZero")]
    DivideByZero { loc: Location },

    #[error("library not found: {0}")]
    LibraryNotFound(String),

    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

// The result of any operation.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_display() {
        let loc = Location::new("main.mxvm", 12, 3);
        assert_eq!(format!("{}", loc), "main.mxvm:12:3");

        let loc = Location::new("main.mxvm", 12, 0);
        assert_eq!(format!("{}", loc), "main.mxvm:12");
    }

    #[test]
    fn test_diagnostics_name_their_kind() {
        let err = Error::DivideByZero {
            loc: Location::new("t.mxvm", 4, 0),
        };
        assert!(format!("{}", err).contains("DivideByZero"));

        let err = Error::UndefinedLabel {
            loc: Location::new("t.mxvm", 9, 0),
            name: "nowhere".to_string(),
        };
        let text = format!("{}", err);
        assert!(text.contains("nowhere"));
        assert!(text.contains("t.mxvm:9"));
    }
}
