//! The error taxonomy shared by every layer of the crate.
//!
//! Callers (an RPC front end, mostly) dispatch on these kinds, so we keep a
//! real enum instead of erasing everything into a context chain.

use thiserror::Error;

use crate::entry::DirEntry;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The target, or one of its ancestors, is absent.
    #[error("{0}: item does not exist")]
    NotExist(String),

    /// A path component before the leaf resolves to something that isn't
    /// a directory.
    #[error("{0}: not a directory")]
    NotDir(String),

    /// The delete target is a directory with children.
    #[error("{0}: directory not empty")]
    NotEmpty(String),

    /// The create target is already present.
    #[error("{0}: item already exists")]
    Exist(String),

    /// Malformed input: bad path syntax, a root for the wrong user,
    /// an unknown packing, an unknown watch sequence.
    #[error("invalid operation: {0}")]
    Invalid(String),

    /// A violated invariant caught at runtime. Fatal to the call,
    /// not to the process.
    #[error("internal error: {0}")]
    Internal(String),

    /// The log contains a frame that is complete but fails its checksum
    /// (or decodes to garbage). Recovery truncates here.
    #[error("log corrupt at offset {offset}")]
    LogCorrupt { offset: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Not a failure: resolution crossed a link. The caller restarts the
    /// operation under the link's target. Carries the link's entry.
    #[error("{}: path crosses a link", .0.name)]
    FollowLink(Box<DirEntry>),
}

impl Error {
    /// Shorthand for the pervasive "marshal this, it can't really fail"
    /// conversions.
    pub(crate) fn internal(what: impl std::fmt::Display) -> Self {
        Error::Internal(what.to_string())
    }
}
