//! godiode: authenticated multicast file-tree transfer for data diodes.
//!
//! A transmit-only link allows no acknowledgements, retransmits or flow
//! control, so the protocol leans on self-describing signed manifests,
//! per-packet authentication of control traffic, per-file SHA-256 and
//! optional repetition of the whole broadcast. The payload is
//! authenticated, never encrypted.

pub mod auth;
pub mod config;
pub mod error;
pub mod manifest;
pub mod transfer;

pub use auth::AuthKey;
pub use config::Config;
pub use error::{Error, Result};
pub use manifest::{DirRecord, FileRecord, Manifest};
