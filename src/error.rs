// Copyright (c) 2024-present, tarmac-index
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{expr::EvaluationError, parser::ParseError};

/// Represents errors that can occur while building or querying a trace index
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// A trace line could not be parsed
    Parse(ParseError),

    /// The index file is not usable (bad magic, wrong version, or an
    /// indexing run that never finished)
    CorruptIndex(&'static str),

    /// Expression evaluation failed
    Eval(EvaluationError),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "TarmacIndexError: {e}"),
            Self::Parse(e) => write!(f, "TarmacIndexError: {e}"),
            Self::CorruptIndex(msg) => write!(f, "TarmacIndexError: corrupt index: {msg}"),
            Self::Eval(e) => write!(f, "TarmacIndexError: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<ParseError> for Error {
    fn from(value: ParseError) -> Self {
        Self::Parse(value)
    }
}

impl From<EvaluationError> for Error {
    fn from(value: EvaluationError) -> Self {
        Self::Eval(value)
    }
}

/// Index result
pub type Result<T> = std::result::Result<T, Error>;
