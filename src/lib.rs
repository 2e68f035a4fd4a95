//! One user's directory namespace as an in-memory tree, journaled to an
//! append-only log and packed into ~1 MiB content-addressed blocks.
//!
//! The shape of the thing, bottom to top:
//!
//! - [`log`] frames and fsyncs every mutation before it's acknowledged,
//!   and remembers (in two sidecar files) how far the block store has
//!   caught up.
//! - [`store`] holds the packed blocks; [`packing`] is the pluggable
//!   codec between cleartext and stored bytes.
//! - [`blocks`] turns a directory's children into packed blocks and back.
//! - [`tree`] is the engine: Put/Delete/Lookup/List/PutDir over lazily
//!   loaded nodes, dirty bookkeeping, bottom-up flush, and crash recovery
//!   by replaying the log tail.
//! - [`watch`] streams mutation events to subscribers without ever
//!   blocking the mutator.

pub mod blocks;
pub mod config;
pub mod counters;
pub mod entry;
pub mod error;
pub mod log;
pub mod packing;
pub mod path;
pub mod store;
pub mod tree;
pub mod watch;
