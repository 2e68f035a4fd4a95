//! [`DirEntry`], the canonical per-path record: the unit the log journals
//! and packed directory blocks carry.

use std::io::Read;
use std::ops::BitOr;

use jiff::Timestamp;
use serde_derive::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::path::{PathName, UserName};
use crate::store::Location;

/// What an entry is. Bits, not variants: `incomplete` combines with
/// `directory`.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attribute(u8);

impl Attribute {
    pub const NONE: Attribute = Attribute(0);
    pub const DIRECTORY: Attribute = Attribute(1);
    pub const LINK: Attribute = Attribute(2);
    /// The entry's blocks are withheld; nothing behind it may be followed.
    pub const INCOMPLETE: Attribute = Attribute(4);

    pub fn has(self, a: Attribute) -> bool {
        self.0 & a.0 != 0
    }
}

impl BitOr for Attribute {
    type Output = Attribute;

    fn bitor(self, rhs: Attribute) -> Attribute {
        Attribute(self.0 | rhs.0)
    }
}

/// Identifies the packer that produced an entry's blocks.
/// Registered packers live in [`crate::packing`].
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Packing(pub u8);

impl Packing {
    /// The identity packer, [`crate::packing::PlainPack`].
    pub const PLAIN: Packing = Packing(0);
    /// The zstd packer, [`crate::packing::CompressPack`].
    pub const COMPRESS: Packing = Packing(1);
}

/// One packed, content-addressed block of an entry.
///
/// For a directory the cleartext is a run of marshalled child entries;
/// for a file it's user data (which the tree never reads).
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct DirBlock {
    /// Where the block lives: a store endpoint plus an opaque reference.
    pub location: Location,
    /// Byte offset of this block's cleartext within the whole entry.
    pub offset: u64,
    /// Cleartext size in bytes.
    pub size: u64,
    /// Per-block packer state. Opaque to us.
    #[serde(with = "serde_bytes")]
    pub packdata: Vec<u8>,
}

/// The full record for one name in the tree.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Fully-qualified, canonical: `user@domain/sub/path`.
    pub name: PathName,
    /// Identical to `name` unless the entry was grafted under a new name,
    /// in which case it keeps the name its packer signed.
    pub signed_name: PathName,
    pub attr: Attribute,
    pub packing: Packing,
    pub time: Timestamp,
    pub blocks: Vec<DirBlock>,
    /// Per-entry packer state (signatures and the like). Opaque to us.
    #[serde(with = "serde_bytes")]
    pub packdata: Vec<u8>,
    /// Where a link points. Present exactly when `attr` has LINK.
    pub link: Option<PathName>,
    /// Who performed the last mutation of this entry.
    pub writer: UserName,
    /// Stamped from the owning tree's sequence on every mutation.
    pub sequence: i64,
}

impl DirEntry {
    /// A fresh entry at `name` with `signed_name` matching. The caller
    /// fills in blocks, links, and the rest as needed.
    pub fn new(name: PathName, attr: Attribute, writer: UserName) -> Self {
        Self {
            signed_name: name.clone(),
            name,
            attr,
            packing: Packing::PLAIN,
            time: Timestamp::now(),
            blocks: Vec::new(),
            packdata: Vec::new(),
            link: None,
            writer,
            sequence: 0,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.attr.has(Attribute::DIRECTORY)
    }

    pub fn is_link(&self) -> bool {
        self.attr.has(Attribute::LINK)
    }

    pub fn is_incomplete(&self) -> bool {
        self.attr.has(Attribute::INCOMPLETE)
    }

    /// Withhold the entry's blocks, e.g. before handing a directory entry
    /// to a watcher. Leaves everything else in place.
    pub fn mark_incomplete(&mut self) {
        self.attr = self.attr | Attribute::INCOMPLETE;
        self.blocks.clear();
        self.packdata.clear();
    }
}

/// Marshals an entry to its wire form (CBOR).
pub fn to_bytes(entry: &DirEntry) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::into_writer(entry, &mut bytes).map_err(Error::internal)?;
    Ok(bytes)
}

/// Unmarshals exactly one entry from the reader, leaving it positioned at
/// the next byte. CBOR is self-delimiting, so a run of marshalled entries
/// can be pulled back out one at a time.
pub fn from_reader<R: Read>(r: R) -> Result<DirEntry> {
    ciborium::from_reader(r).map_err(|e| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("bad entry encoding: {e}"),
        ))
    })
}
