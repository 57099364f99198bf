// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{DecodeError, EncodeError};
use std::path::PathBuf;

/// Represents errors that can occur in the table store
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// Invalid option combination (non-positive sizes, overflowing totals, ...)
    Config(String),

    /// Schema error: sidecar mismatch, unknown column type, misplaced primary key
    Format(String),

    /// On-disk state disagrees with itself or with the open options
    Corruption {
        /// File the corruption was detected in
        path: PathBuf,

        /// What was found
        message: String,
    },

    /// A value exceeds its declared column width
    Overflow {
        /// Offending column
        column: String,

        /// Encoded size
        size: usize,

        /// Declared maximum
        max: usize,
    },

    /// Operation is not implemented in this path
    Unsupported(&'static str),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "FlintDbError: io: {e}"),
            Self::Encode(e) => write!(f, "FlintDbError: {e}"),
            Self::Decode(e) => write!(f, "FlintDbError: {e}"),
            Self::Config(msg) => write!(f, "FlintDbError: config: {msg}"),
            Self::Format(msg) => write!(f, "FlintDbError: format: {msg}"),
            Self::Corruption { path, message } => {
                write!(f, "FlintDbError: corruption in {path:?}: {message}")
            }
            Self::Overflow { column, size, max } => write!(
                f,
                "FlintDbError: value for column {column:?} is {size} bytes, declared max is {max}"
            ),
            Self::Unsupported(what) => write!(f, "FlintDbError: unsupported: {what}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Table store result
pub type Result<T> = std::result::Result<T, Error>;
