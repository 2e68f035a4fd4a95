//! Places packed blocks can live - an in-memory map, the local filesystem,
//! (eventually) a real block server.
//!
//! The tree only ever asks for two things: put bytes, get them back by
//! reference. References are opaque strings; the bundled implementations
//! happen to make them content hashes, but nothing upstream may assume so.

use std::fmt;

use data_encoding::BASE32_DNSSEC;
use serde_derive::{Deserialize, Serialize};
use sha2::{Digest, Sha224};

use crate::error::Result;

mod fs;
mod memory;

pub use fs::FsStorage;
pub use memory::MemoryStorage;

/// Names a store instance. Recorded next to every reference so entries
/// stay resolvable when a tree spans stores.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Endpoint(String);

impl Endpoint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Endpoint {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An opaque handle a store gave us for a block of bytes.
#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reference(String);

impl Reference {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Reference {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A block's full address: which store, and what to ask it for.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub endpoint: Endpoint,
    pub reference: Reference,
}

/// Whatever holds the packed blocks.
pub trait Storage: Send + Sync {
    /// Store the given (already-packed) bytes, returning their reference.
    fn put(&self, ciphertext: &[u8]) -> Result<Reference>;

    /// Fetch bytes previously stored under `reference`.
    fn get(&self, reference: &Reference) -> Result<Vec<u8>>;
}

/// The content-addressed reference both bundled stores hand out:
/// SHA-224, base32.
pub fn reference_for(bytes: &[u8]) -> Reference {
    Reference(BASE32_DNSSEC.encode(&Sha224::digest(bytes)))
}
