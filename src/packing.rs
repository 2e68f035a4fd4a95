//! Packers turn a directory's cleartext into stored cipher blocks and back.
//!
//! The tree knows packers only by their integer [`Packing`] id, which is
//! written into every entry. Implementations register themselves into a
//! process-wide table; loading an entry whose packing nobody registered
//! fails fast.

use std::collections::VecDeque;
use std::sync::{Arc, LazyLock, RwLock};

use rustc_hash::FxHashMap;

use crate::config::Config;
use crate::entry::{DirBlock, DirEntry, Packing};
use crate::error::{Error, Result};
use crate::store::Location;

mod compress;
mod plain;

pub use compress::CompressPack;
pub use plain::PlainPack;

/// A packing scheme: how one entry's bytes become stored blocks.
pub trait Packer: Send + Sync {
    /// The id stamped into entries this packer produces.
    fn packing(&self) -> Packing;

    /// Begin packing `entry`. Feed the returned state one cleartext block
    /// at a time.
    fn pack(&self, config: &Config, entry: &DirEntry) -> Result<Box<dyn BlockPacker>>;

    /// Begin unpacking `entry`'s existing blocks.
    fn unpack(&self, config: &Config, entry: &DirEntry) -> Result<Box<dyn BlockUnpacker>>;
}

/// Per-entry packing state.
///
/// The protocol is strict: each [`pack`](Self::pack) must be followed by a
/// [`set_location`](Self::set_location) recording where the ciphertext
/// landed, and [`close`](Self::close) installs the accumulated blocks (and
/// any signatures) on the entry.
pub trait BlockPacker: Send {
    /// Transform one cleartext block, returning the bytes to store.
    fn pack(&mut self, cleartext: &[u8]) -> Result<Vec<u8>>;

    /// Record where the just-packed block was stored.
    fn set_location(&mut self, location: Location);

    /// Finalise: install blocks and packdata on `entry`.
    fn close(self: Box<Self>, entry: &mut DirEntry) -> Result<()>;
}

/// Per-entry unpacking state: walk the blocks, decrypt each.
pub trait BlockUnpacker: Send {
    /// The next block to fetch, or `None` when the entry is exhausted.
    fn next_block(&mut self) -> Option<DirBlock>;

    /// Transform the fetched ciphertext back into cleartext.
    fn unpack(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

static REGISTRY: LazyLock<RwLock<FxHashMap<Packing, Arc<dyn Packer>>>> = LazyLock::new(|| {
    let mut map: FxHashMap<Packing, Arc<dyn Packer>> = FxHashMap::default();
    map.insert(Packing::PLAIN, Arc::new(PlainPack));
    map.insert(Packing::COMPRESS, Arc::new(CompressPack));
    RwLock::new(map)
});

/// Make a packer available process-wide. Call during initialisation;
/// re-registering an id is refused.
pub fn register(packer: Arc<dyn Packer>) -> Result<()> {
    let id = packer.packing();
    let mut registry = REGISTRY.write().unwrap();
    if registry.contains_key(&id) {
        return Err(Error::Invalid(format!("packing {} already registered", id.0)));
    }
    registry.insert(id, packer);
    Ok(())
}

/// Find the packer for the given id.
pub fn lookup(packing: Packing) -> Result<Arc<dyn Packer>> {
    REGISTRY
        .read()
        .unwrap()
        .get(&packing)
        .cloned()
        .ok_or_else(|| Error::Invalid(format!("no packing registered for {}", packing.0)))
}

/// The block bookkeeping every packer needs: pairs `pack` calls with their
/// `set_location`s and yields finished [`DirBlock`]s.
///
/// Packer implementations embed one of these so the offset/size/location
/// plumbing lives in one place.
pub struct BlockTracker {
    blocks: Vec<DirBlock>,
    cleartext_offset: u64,
    pending: Option<DirBlock>,
}

impl BlockTracker {
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            cleartext_offset: 0,
            pending: None,
        }
    }

    /// Note a block of `size` cleartext bytes was packed.
    pub fn packed(&mut self, size: u64) -> Result<()> {
        if self.pending.is_some() {
            return Err(Error::Internal(
                "pack called twice without set_location".to_owned(),
            ));
        }
        self.pending = Some(DirBlock {
            location: Location::default(),
            offset: self.cleartext_offset,
            size,
            packdata: Vec::new(),
        });
        self.cleartext_offset += size;
        Ok(())
    }

    /// Attach the store location to the block from the last `packed`.
    /// A location with no preceding pack has nothing to attach to and
    /// is dropped.
    pub fn located(&mut self, location: Location) {
        if let Some(mut block) = self.pending.take() {
            block.location = location;
            self.blocks.push(block);
        }
    }

    /// All finished blocks, consuming the tracker.
    pub fn finish(self) -> Result<Vec<DirBlock>> {
        if self.pending.is_some() {
            return Err(Error::Internal(
                "close with a packed block missing its location".to_owned(),
            ));
        }
        Ok(self.blocks)
    }
}

impl Default for BlockTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared unpack-side bookkeeping: hands back the entry's blocks in order.
pub struct BlockWalker {
    blocks: VecDeque<DirBlock>,
}

impl BlockWalker {
    pub fn new(entry: &DirEntry) -> Self {
        Self {
            blocks: entry.blocks.iter().cloned().collect(),
        }
    }

    pub fn next_block(&mut self) -> Option<DirBlock> {
        self.blocks.pop_front()
    }
}
