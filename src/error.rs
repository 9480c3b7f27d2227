//! Error types for postern

use std::io;

use crate::DocId;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Posting data corruption: {0}")]
    Corruption(String),

    #[error("Document not found: {0}")]
    DocNotFound(DocId),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, Error>;
