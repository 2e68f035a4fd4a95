use std::sync::Mutex;

use rustc_hash::FxHashMap;

use crate::counters;
use crate::error::{Error, Result};

use super::{Reference, Storage, reference_for};

/// A store that keeps everything as reference-addressed buffers.
///
/// Great for testing
#[derive(Default)]
pub struct MemoryStorage {
    blocks: Mutex<FxHashMap<Reference, Vec<u8>>>,
}

impl Storage for MemoryStorage {
    fn put(&self, ciphertext: &[u8]) -> Result<Reference> {
        counters::bump(counters::Op::BlockPut);
        let r = reference_for(ciphertext);
        self.blocks
            .lock()
            .unwrap()
            .insert(r.clone(), ciphertext.to_vec());
        Ok(r)
    }

    fn get(&self, reference: &Reference) -> Result<Vec<u8>> {
        counters::bump(counters::Op::BlockGet);
        self.blocks
            .lock()
            .unwrap()
            .get(reference)
            .cloned()
            .ok_or_else(|| Error::NotExist(format!("block {reference}")))
    }
}

impl MemoryStorage {
    /// How many blocks are held. Lets tests check write-avoidance
    /// (e.g. that a second flush stores nothing new).
    pub fn len(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
