//! The crate's closed error taxonomy.
//!
//! Conditions that are silently ignored per the node/document contract
//! (an operation addressed at an unknown id, a remote creation whose id
//! already exists, ...) are not represented here — they are logged and
//! dropped, never surfaced to a caller.
use std::fmt;

/// Everything that can go wrong calling into this crate.
#[derive(Debug, Eq, PartialEq, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A non-root record in a `load` input is missing a `parentKey`.
    MissingParentKey,
    /// `load` was given an empty record list.
    EmptyLoad,
    /// `load` input did not contain exactly one parentless record.
    NotExactlyOneRoot(usize),
    /// A `load` record's parent/data shape doesn't match its declared kind.
    MalformedRecord,
    /// A handle was used after its node was deleted, or never existed.
    NotFound,
    /// A handle's node exists but is not the variant the call requires.
    WrongKind,
    /// A list index fell outside the valid range for the attempted operation.
    IndexOutOfRange { index: usize, len: usize },
    /// `batch` was called while already inside a batch.
    NestedBatch,
    /// `undo` or `redo` was called while inside a batch.
    UndoRedoDuringBatch,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingParentKey => write!(f, "non-root record is missing a parentKey"),
            Self::EmptyLoad => write!(f, "load was given an empty record list"),
            Self::NotExactlyOneRoot(n) => {
                write!(f, "expected exactly one parentless record, found {n}")
            }
            Self::MalformedRecord => write!(f, "record's parent/data shape doesn't match its kind"),
            Self::NotFound => write!(f, "node does not exist"),
            Self::WrongKind => write!(f, "node is not the expected kind"),
            Self::IndexOutOfRange { index, len } => {
                write!(f, "index {index} out of range for length {len}")
            }
            Self::NestedBatch => write!(f, "batch called while already inside a batch"),
            Self::UndoRedoDuringBatch => write!(f, "undo/redo called while inside a batch"),
        }
    }
}

impl std::error::Error for Error {}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
