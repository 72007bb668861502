use std::io;

use thiserror::Error;

/// The error taxonomy from the on-disk contract: every public operation in
/// this crate returns one of these kinds, never a bespoke type per module.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unexpected end of file after {got} of {expected} bytes")]
    UnexpectedEof { got: usize, expected: usize },

    #[error("corrupt data: {0}")]
    CorruptData(String),

    #[error("no such chapter {virtual_chapter} (have [{oldest}, {newest}])")]
    NoSuchChapter {
        virtual_chapter: u64,
        oldest: u64,
        newest: u64,
    },

    #[error("index already exists at {0}")]
    IndexExists(String),

    #[error("no index at {0}")]
    NoIndex(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("assertion failed: {0}")]
    AssertionFailed(String),
}

pub type Result<T> = std::result::Result<T, Error>;
