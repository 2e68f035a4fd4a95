use std::fs;
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::*;

use crate::counters;
use crate::error::{Error, Result};

use super::{Reference, Storage, reference_for};

/// A store backed by a directory on the local filesystem.
///
/// Blocks live at `blocks/<first two chars>/<reference>` so no single
/// directory grows absurd. Writes land in a temp file first and are
/// renamed into place, so a crash never leaves a partial block behind.
pub struct FsStorage {
    base: Utf8PathBuf,
}

impl FsStorage {
    pub fn open(base: &Utf8Path) -> Result<Self> {
        fs::create_dir_all(base.join("blocks"))?;
        info!("Opened block store at {base}");
        Ok(Self {
            base: base.to_owned(),
        })
    }

    fn block_path(&self, reference: &Reference) -> Utf8PathBuf {
        let hex = reference.as_str();
        self.base
            .join("blocks")
            .join(&hex[..2.min(hex.len())])
            .join(hex)
    }
}

impl Storage for FsStorage {
    fn put(&self, ciphertext: &[u8]) -> Result<Reference> {
        counters::bump(counters::Op::BlockPut);
        let r = reference_for(ciphertext);
        let to = self.block_path(&r);

        // Content-addressed means a hit is a guaranteed dedupe.
        if to.is_file() {
            trace!("Block {r} already stored");
            return Ok(r);
        }

        fs::create_dir_all(to.parent().unwrap())?;
        let mut temp = tempfile::Builder::new()
            .prefix("temp-block-")
            .tempfile_in(to.parent().unwrap())?;
        temp.write_all(ciphertext)?;
        temp.as_file().sync_all()?;
        temp.persist(&to).map_err(|e| Error::Io(e.error))?;
        trace!("Stored block {r} ({} bytes)", ciphertext.len());
        Ok(r)
    }

    fn get(&self, reference: &Reference) -> Result<Vec<u8>> {
        counters::bump(counters::Op::BlockGet);
        let from = self.block_path(reference);
        match fs::read(&from) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::NotExist(format!("block {reference}")))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }
}
