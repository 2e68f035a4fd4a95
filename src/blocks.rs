//! Turn a directory's children into packed, content-addressed blocks and
//! back again.
//!
//! A directory entry doesn't hold its children directly; it holds
//! references to blocks in the store whose cleartext is a run of
//! marshalled child entries. We accumulate children until the next one
//! would push a block past [`MAX_BLOCK_SIZE`], then flush. A single child
//! is never split across blocks, so one oversized child makes one
//! oversized block and that's fine.

use std::collections::BTreeMap;
use std::io::Cursor;

use jiff::Timestamp;
use tracing::*;

use crate::config::Config;
use crate::counters;
use crate::entry::{self, DirEntry};
use crate::error::{Error, Result};
use crate::packing::{self, BlockPacker};
use crate::path::Parsed;
use crate::store::Location;

/// Largest cleartext a single packed block may start from.
pub const MAX_BLOCK_SIZE: usize = 1024 * 1024;

/// Packs `children` into fresh blocks on `entry`, writing them to the
/// configured store.
///
/// `entry` must be a directory and every child must already have stable
/// blocks of its own (i.e. be clean); the tree's bottom-up flush
/// guarantees that. The entry's packing, writer, and time are refreshed;
/// its sequence is left as the caller stamped it.
pub fn store_children<'a>(
    config: &Config,
    entry: &mut DirEntry,
    children: impl Iterator<Item = &'a DirEntry>,
) -> Result<()> {
    if !entry.is_dir() {
        return Err(Error::Internal(format!(
            "packing non-directory {}",
            entry.name
        )));
    }
    counters::bump(counters::Op::NodePack);

    entry.blocks.clear();
    entry.packing = config.packing;
    entry.writer = config.user.clone();
    entry.time = Timestamp::now();

    let packer = packing::lookup(config.packing)?;
    let mut state = packer.pack(config, entry)?;

    let mut buf = Vec::new();
    let mut packed = 0usize;
    for child in children {
        let bytes = entry::to_bytes(child)?;
        if !buf.is_empty() && buf.len() + bytes.len() > MAX_BLOCK_SIZE {
            flush_block(config, &mut *state, &mut buf)?;
        }
        buf.extend_from_slice(&bytes);
        packed += 1;
    }
    if !buf.is_empty() {
        flush_block(config, &mut *state, &mut buf)?;
    }
    state.close(entry)?;

    trace!(
        "Packed {packed} children of {} into {} blocks",
        entry.name,
        entry.blocks.len()
    );
    Ok(())
}

fn flush_block(config: &Config, state: &mut dyn BlockPacker, buf: &mut Vec<u8>) -> Result<()> {
    let ciphertext = state.pack(buf)?;
    let reference = config.storage.put(&ciphertext)?;
    state.set_location(Location {
        endpoint: config.endpoint.clone(),
        reference,
    });
    buf.clear();
    Ok(())
}

/// Loads the children of `entry` (a directory at `parent`) from the store,
/// keyed by their single path element.
///
/// Two name shapes come back out of a block:
/// - the usual: the child's name is `parent` plus one element;
/// - a redirection, left behind by a subtree grafted from elsewhere: the
///   child's name still points under its old parent. We key it by its own
///   last element and rewrite `name` to live under `parent`, leaving
///   `signed_name` exactly as packed.
pub fn load_children(
    config: &Config,
    parent: &Parsed,
    entry: &DirEntry,
    v1_transition: Timestamp,
) -> Result<BTreeMap<String, DirEntry>> {
    if !entry.is_dir() {
        return Err(Error::Internal(format!(
            "loading children of non-directory {}",
            entry.name
        )));
    }
    if entry.is_incomplete() {
        return Err(Error::Invalid(format!(
            "{} is incomplete; its contents are withheld",
            entry.name
        )));
    }
    counters::bump(counters::Op::LazyLoad);

    let packer = packing::lookup(entry.packing)?;
    let mut state = packer.unpack(config, entry)?;

    let mut cleartext = Vec::new();
    while let Some(block) = state.next_block() {
        if block.offset != cleartext.len() as u64 {
            return Err(Error::Internal(format!(
                "block of {} starts at {}, expected {}",
                entry.name,
                block.offset,
                cleartext.len()
            )));
        }
        let ciphertext = config.storage.get(&block.location.reference)?;
        cleartext.extend(state.unpack(&ciphertext)?);
    }

    let mut kids = BTreeMap::new();
    let mut cursor = Cursor::new(&cleartext[..]);
    while (cursor.position() as usize) < cleartext.len() {
        let mut child = entry::from_reader(&mut cursor)?;
        let parsed = child.name.parse()?;
        if parsed.is_root() {
            return Err(Error::Internal(format!(
                "root entry {} packed as a child of {}",
                child.name, entry.name
            )));
        }

        let elem = if parsed.nelem() == parent.nelem() + 1 && parsed.parent() == *parent {
            parsed.last().to_owned()
        } else {
            // A redirection. Re-home the name; the signed name stays.
            let elem = parsed.last().to_owned();
            child.name = parent.join(&elem).path();
            elem
        };

        if child.time < v1_transition && v1_transition != Timestamp::UNIX_EPOCH {
            child.sequence &= (1 << 23) - 1;
        }

        if kids.insert(elem, child).is_some() {
            return Err(Error::Internal(format!(
                "duplicate child in blocks of {}",
                entry.name
            )));
        }
    }
    Ok(kids)
}
