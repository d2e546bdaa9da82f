/*
 * apkzip v1.0.0
 * Copyright (c) 2026 Tiash H Kabir / @MrCarb0n.
 * Licensed under the MIT License.
 */

//! Error types for packaging, compression and signing.
//! Every fallible operation in the crate returns [`PackagingError`].

use std::io;
use thiserror::Error;

/// Comprehensive error type for all packaging operations.
#[derive(Debug, Error)]
pub enum PackagingError {
    /// I/O errors during file operations
    #[error("I/O Error: {0}")]
    Io(#[from] io::Error),
    /// Errors raised by the `zip` reader used for verification
    #[error("ZIP Error: {0}")]
    Zip(#[from] zip::result::ZipError),
    /// Cryptographic operation errors
    #[error("Cryptography Error: {0}")]
    Ring(#[from] ring::error::Unspecified),
    /// PEM format parsing errors
    #[error("PEM Parsing Error: {0}")]
    Pem(#[from] pem::PemError),
    /// Structurally invalid archive or signing block
    #[error("Malformed Archive: {0}")]
    Format(String),
    /// Lookup of an entry the archive does not contain
    #[error("Entry not found: {0}")]
    EntryNotFound(String),
    /// Valid input that this implementation does not handle (ZIP64, DSA, ...)
    #[error("Unsupported: {0}")]
    Unsupported(String),
    /// Validation failures during signature checking
    #[error("Validation Error: {0}")]
    Validation(String),
    /// Configuration or setup errors
    #[error("Configuration Error: {0}")]
    Config(String),
    /// Deflate stream failures
    #[error("Compression Error: {0}")]
    Compression(String),
    /// Dexer process failures
    #[error("Dexer Error: {0}")]
    Dex(String),
}

impl PackagingError {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }
}

impl From<flate2::CompressError> for PackagingError {
    fn from(e: flate2::CompressError) -> Self {
        Self::Compression(e.to_string())
    }
}
