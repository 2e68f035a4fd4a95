//! Per-tree configuration, built by whatever embeds the tree.
//!
//! There is no config *file* here; the RPC layer (or a test) assembles one
//! of these from wherever it keeps its settings.

use std::fmt;
use std::sync::Arc;

use crate::entry::Packing;
use crate::path::UserName;
use crate::store::{Endpoint, Storage};

#[derive(Clone)]
pub struct Config {
    /// Who owns the tree. Mutations are stamped with this writer.
    pub user: UserName,
    /// The store blocks are written to.
    pub storage: Arc<dyn Storage>,
    /// Recorded in every block location so entries stay resolvable.
    pub endpoint: Endpoint,
    /// How directory blocks are packed.
    pub packing: Packing,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("user", &self.user)
            .field("endpoint", &self.endpoint)
            .field("packing", &self.packing)
            .finish_non_exhaustive()
    }
}
