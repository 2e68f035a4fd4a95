use crate::config::Config;
use crate::entry::{DirBlock, DirEntry, Packing};
use crate::error::{Error, Result};
use crate::store::Location;

use super::{BlockPacker, BlockTracker, BlockUnpacker, BlockWalker, Packer};

/// A packer that runs every block through zstd. No secrecy, just fewer
/// bytes in the store; directory blocks full of marshalled entries
/// compress embarrassingly well.
pub struct CompressPack;

impl Packer for CompressPack {
    fn packing(&self) -> Packing {
        Packing::COMPRESS
    }

    fn pack(&self, _config: &Config, _entry: &DirEntry) -> Result<Box<dyn BlockPacker>> {
        Ok(Box::new(CompressBlockPacker {
            tracker: BlockTracker::new(),
        }))
    }

    fn unpack(&self, _config: &Config, entry: &DirEntry) -> Result<Box<dyn BlockUnpacker>> {
        Ok(Box::new(CompressBlockUnpacker {
            walker: BlockWalker::new(entry),
            next_size: 0,
        }))
    }
}

struct CompressBlockPacker {
    tracker: BlockTracker,
}

impl BlockPacker for CompressBlockPacker {
    fn pack(&mut self, cleartext: &[u8]) -> Result<Vec<u8>> {
        self.tracker.packed(cleartext.len() as u64)?;
        zstd::bulk::compress(cleartext, 0).map_err(Error::Io)
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

struct CompressBlockUnpacker {
    walker: BlockWalker,
    /// Cleartext size of the block most recently handed out; the
    /// decompressor wants an upper bound.
    next_size: usize,
}

impl BlockUnpacker for CompressBlockUnpacker {
    fn next_block(&mut self) -> Option<DirBlock> {
        let block = self.walker.next_block()?;
        self.next_size = block.size as usize;
        Some(block)
    }

    fn unpack(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let cleartext = zstd::bulk::decompress(ciphertext, self.next_size).map_err(Error::Io)?;
        if cleartext.len() != self.next_size {
            return Err(Error::Internal(format!(
                "block decompressed to {} bytes, expected {}",
                cleartext.len(),
                self.next_size
            )));
        }
        Ok(cleartext)
    }
}
