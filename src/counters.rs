//! Tallies of the operations worth knowing about: log traffic, block
//! traffic, lazy loads, watcher trouble.
//!
//! Always on - an uncontended relaxed atomic per op is too cheap to gate
//! behind a feature. A tree dumps the nonzero tallies at debug level when
//! it closes.

use std::sync::LazyLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use enum_map::{Enum, EnumMap};
use tracing::debug;

#[derive(Debug, Copy, Clone, Enum)]
pub enum Op {
    LogAppend,
    LogReplay,
    BlockPut,
    BlockGet,
    LazyLoad,
    NodePack,
    WatchEvent,
    WatcherTimeout,
}

impl Op {
    fn describe(self) -> &'static str {
        match self {
            Op::LogAppend => "log records appended",
            Op::LogReplay => "log records replayed",
            Op::BlockPut => "blocks stored",
            Op::BlockGet => "blocks fetched",
            Op::LazyLoad => "directories lazy-loaded",
            Op::NodePack => "directories packed",
            Op::WatchEvent => "watch events delivered",
            Op::WatcherTimeout => "watchers dropped on timeout",
        }
    }
}

static TALLIES: LazyLock<EnumMap<Op, AtomicUsize>> = LazyLock::new(EnumMap::default);

/// Count one occurrence of `op`.
#[inline]
pub fn bump(op: Op) {
    TALLIES[op].fetch_add(1, Ordering::Relaxed);
}

/// Log whatever actually happened, one line per nonzero tally.
pub fn log_counts() {
    for (op, tally) in TALLIES.iter() {
        let tally = tally.load(Ordering::Relaxed);
        if tally > 0 {
            debug!("{tally} {}", op.describe());
        }
    }
}
