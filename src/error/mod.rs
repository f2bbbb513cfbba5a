//! Crate-wide error type.
//!
//! Every fallible operation in this crate returns [`Error`], a flat enum of
//! the [`Kind`]s described by the wire-format and instrumentation-engine
//! documentation. Most variants carry an [`ErrorContext`] so a caller can
//! report the byte offset at which the problem was found.

use typed_builder::TypedBuilder;

/// The byte offset (and, where meaningful, an associated value) at which an
/// [`Error`] was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TypedBuilder)]
pub struct ErrorContext {
    /// File offset at which the error was detected.
    pub offset: usize,
    #[builder(default, setter(strip_option))]
    /// Number of bytes that were expected to be available, if relevant.
    pub expected: Option<usize>,
}

impl ErrorContext {
    /// Build a bare context carrying only an offset.
    pub fn at(offset: usize) -> Self {
        Self::builder().offset(offset).build()
    }
}

impl std::fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.expected {
            Some(expected) => write!(f, "offset {:#x} (expected {} bytes)", self.offset, expected),
            None => write!(f, "offset {:#x}", self.offset),
        }
    }
}

/// Crate-wide error type.
#[derive(thiserror::Error, Debug, PartialEq, Eq, Hash)]
pub enum Error {
    /// An I/O error occurred while loading from or storing to the filesystem.
    #[error("an I/O error occurred: {kind}")]
    Io {
        /// The underlying `std::io::ErrorKind`.
        kind: std::io::ErrorKind,
    },
    /// The byte buffer ended before a declared structure finished decoding.
    #[error("truncated input at {context}")]
    Truncated {
        /// Where truncation was detected.
        context: ErrorContext,
    },
    /// The ELF class is not 64-bit or the data encoding is not little-endian.
    #[error("unsupported ELF class or data encoding at {context}")]
    Unsupported {
        /// Where the unsupported value was read.
        context: ErrorContext,
    },
    /// The file layout does not meet a precondition the instrumentation
    /// engine requires (e.g. the program header table is not immediately
    /// after the ELF header, or a required chunk is missing).
    #[error("unsupported file layout: {reason}")]
    UnsupportedLayout {
        /// Human-readable description of the violated layout precondition.
        reason: &'static str,
    },
    /// Chunks overlap, a declared range exceeds the file, or a structure
    /// that must be unique appears more than once.
    #[error("corrupted input at {context}: {reason}")]
    Corrupted {
        /// Where the corruption was detected.
        context: ErrorContext,
        /// Human-readable description.
        reason: &'static str,
    },
    /// An `allocate_file_memory` target offset is not a chunk boundary and
    /// not inside a `Dummy` chunk.
    #[error("bad allocation offset {offset:#x}")]
    BadOffset {
        /// The offending file offset.
        offset: usize,
    },
    /// A grow operation needed more trailing `Dummy` bytes than were present.
    #[error("insufficient slack at {context}: need {needed} bytes, have {available}")]
    InsufficientSlack {
        /// Where the slack was needed.
        context: ErrorContext,
        /// Bytes required.
        needed: usize,
        /// Bytes actually available.
        available: usize,
    },
    /// A patch or table operation targeted a chunk of the wrong kind (e.g. a
    /// byte patch aimed outside any `RawSection`, or a table operation named
    /// a section index that is not that kind of table).
    #[error("wrong chunk kind at {context}: {reason}")]
    WrongChunkKind {
        /// Where the mismatch was detected.
        context: ErrorContext,
        /// Human-readable description.
        reason: &'static str,
    },
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io { kind: err.kind() }
    }
}

/// Convenience alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
