//! Error types for the Cinnabar compiler and virtual machine

use std::fmt;
use thiserror::Error;

/// Which kind of metadata symbol failed to resolve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// A method reference
    Method,
    /// A field reference
    Field,
    /// A type reference
    Type,
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymbolKind::Method => write!(f, "method"),
            SymbolKind::Field => write!(f, "field"),
            SymbolKind::Type => write!(f, "type"),
        }
    }
}

/// Interpreter fault kinds
///
/// A fault aborts the current `run` invocation and is never retried inside
/// the VM; the host caller decides what happens next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Overflow on an overflow-checked arithmetic opcode
    Overflow,
    /// Integer division or remainder by zero
    DivideByZero,
    /// The instruction pointer reached a byte sequence that is not a known opcode
    InvalidOpcode,
    /// A metadata side-table index in the byte stream is out of range
    BadMetadataIndex,
    /// A register value used as an object-table index does not name a live object
    BadObjectHandle,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::Overflow => write!(f, "arithmetic overflow"),
            FaultKind::DivideByZero => write!(f, "division by zero"),
            FaultKind::InvalidOpcode => write!(f, "invalid opcode"),
            FaultKind::BadMetadataIndex => write!(f, "metadata index out of range"),
            FaultKind::BadObjectHandle => write!(f, "dangling object handle"),
        }
    }
}

/// Main error type for Cinnabar
#[derive(Error, Debug)]
pub enum Error {
    /// A source opcode the compiler does not understand. Fatal for the
    /// enclosing method: no partial bytecode is emitted.
    #[error("unsupported opcode '{opcode}' at instruction {offset}")]
    UnsupportedOpcode { opcode: String, offset: usize },

    /// A method/field/type reference that is not present in the session
    /// metadata tables. Fatal for the enclosing method.
    #[error("unresolved {kind} reference '{name}'")]
    UnresolvedSymbol { kind: SymbolKind, name: String },

    /// Syntax error in the textual instruction form
    #[error("assembly error at line {line}: {message}")]
    AsmError { message: String, line: usize },

    /// The method needs more registers than the instruction encoding can address
    #[error("register budget exceeded: method needs {needed} registers, limit is {limit}")]
    RegisterPressure { needed: usize, limit: usize },

    /// Runtime fault raised by the interpreter
    #[error("runtime fault at byte offset {offset}: {kind}")]
    Fault { kind: FaultKind, offset: usize },

    /// Internal compiler error (a bug, not a user input problem)
    #[error("internal error: {0}")]
    InternalError(String),

    /// IO error (patch cache reads/writes)
    #[error("io error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
}

impl Error {
    /// Create an unsupported-opcode error
    pub fn unsupported_opcode(opcode: impl Into<String>, offset: usize) -> Self {
        Error::UnsupportedOpcode {
            opcode: opcode.into(),
            offset,
        }
    }

    /// Create an unresolved-method error
    pub fn unresolved_method(name: impl Into<String>) -> Self {
        Error::UnresolvedSymbol {
            kind: SymbolKind::Method,
            name: name.into(),
        }
    }

    /// Create an unresolved-field error
    pub fn unresolved_field(name: impl Into<String>) -> Self {
        Error::UnresolvedSymbol {
            kind: SymbolKind::Field,
            name: name.into(),
        }
    }

    /// Create an unresolved-type error
    pub fn unresolved_type(name: impl Into<String>) -> Self {
        Error::UnresolvedSymbol {
            kind: SymbolKind::Type,
            name: name.into(),
        }
    }

    /// Create an assembly syntax error
    pub fn asm_error(message: impl Into<String>, line: usize) -> Self {
        Error::AsmError {
            message: message.into(),
            line,
        }
    }

    /// Create an overflow fault
    pub fn overflow(offset: usize) -> Self {
        Error::Fault {
            kind: FaultKind::Overflow,
            offset,
        }
    }

    /// Create a divide-by-zero fault
    pub fn divide_by_zero(offset: usize) -> Self {
        Error::Fault {
            kind: FaultKind::DivideByZero,
            offset,
        }
    }

    /// Create an invalid-opcode fault
    pub fn invalid_opcode(offset: usize) -> Self {
        Error::Fault {
            kind: FaultKind::InvalidOpcode,
            offset,
        }
    }

    /// True if this error is an interpreter fault (as opposed to a compile error)
    pub fn is_fault(&self) -> bool {
        matches!(self, Error::Fault { .. })
    }
}

/// Result type alias for Cinnabar
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::unsupported_opcode("ldelem", 7);
        assert_eq!(
            err.to_string(),
            "unsupported opcode 'ldelem' at instruction 7"
        );

        let err = Error::unresolved_method("Vector::Dot");
        assert_eq!(err.to_string(), "unresolved method reference 'Vector::Dot'");
    }

    #[test]
    fn test_fault_classification() {
        assert!(Error::overflow(10).is_fault());
        assert!(Error::divide_by_zero(0).is_fault());
        assert!(!Error::unresolved_field("x").is_fault());
    }
}
