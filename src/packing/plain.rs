use crate::config::Config;
use crate::entry::{DirEntry, Packing};
use crate::error::Result;
use crate::store::Location;

use super::{BlockPacker, BlockTracker, BlockUnpacker, BlockWalker, Packer};

/// The identity packer: blocks are stored as-is, no encryption, no
/// signatures, empty packdata. What the tree's own directory blocks use
/// unless the configuration says otherwise.
pub struct PlainPack;

impl Packer for PlainPack {
    fn packing(&self) -> Packing {
        Packing::PLAIN
    }

    fn pack(&self, _config: &Config, _entry: &DirEntry) -> Result<Box<dyn BlockPacker>> {
        Ok(Box::new(PlainBlockPacker {
            tracker: BlockTracker::new(),
        }))
    }

    fn unpack(&self, _config: &Config, entry: &DirEntry) -> Result<Box<dyn BlockUnpacker>> {
        Ok(Box::new(PlainBlockUnpacker {
            walker: BlockWalker::new(entry),
        }))
    }
}

struct PlainBlockPacker {
    tracker: BlockTracker,
}

impl BlockPacker for PlainBlockPacker {
    fn pack(&mut self, cleartext: &[u8]) -> Result<Vec<u8>> {
        self.tracker.packed(cleartext.len() as u64)?;
        Ok(cleartext.to_vec())
    }

    fn set_location(&mut self, location: Location) {
        self.tracker.located(location);
    }

    fn close(self: Box<Self>, entry: &mut DirEntry) -> Result<()> {
        entry.blocks = self.tracker.finish()?;
        entry.packdata.clear();
        Ok(())
    }
}

struct PlainBlockUnpacker {
    walker: BlockWalker,
}

impl BlockUnpacker for PlainBlockUnpacker {
    fn next_block(&mut self) -> Option<crate::entry::DirBlock> {
        self.walker.next_block()
    }

    fn unpack(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }
}
