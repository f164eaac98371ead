//! Protocol error types.
//!
//! Receiver-side errors are logged and the read loop continues; only
//! socket failures abort. Sender-side errors within a resend round are
//! logged per file, everything else surfaces to the invoker.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("truncated {what} packet: {got} bytes")]
    TruncatedPacket { what: &'static str, got: usize },

    #[error("truncated manifest: {0} bytes")]
    TruncatedManifest(usize),

    #[error("invalid signature on {0}")]
    InvalidSignature(&'static str),

    #[error("declared manifest size {0} out of bounds")]
    InvalidManifestSize(u32),

    #[error("manifest too large: {size} bytes (limit {limit})")]
    ManifestTooLarge { size: usize, limit: usize },

    #[error("packet for manifest session {got:08x}, current session is {current:08x}")]
    UnknownManifest { got: u32, current: u32 },

    #[error("no manifest session established")]
    NoSession,

    #[error("file index {index} out of range ({count} files in manifest)")]
    InvalidFileIndex { index: u32, count: u32 },

    #[error("unsupported file type {0:#04x} in transfer start")]
    UnknownFileType(u8),

    #[error("out of order {what}: expected {expected}, got {got}")]
    OutOfOrder {
        what: &'static str,
        expected: u32,
        got: u32,
    },

    #[error("received {received} bytes for a transfer of {expected}")]
    OversizeTransfer { expected: u64, received: u64 },

    #[error("no file transfer in progress")]
    NoPendingTransfer,

    #[error("checksum mismatch for {0}")]
    ChecksumMismatch(String),

    #[error("invalid path {0:?}")]
    BadPath(String),
}

pub type Result<T> = std::result::Result<T, Error>;
