//! The tree engine: one user's namespace as an in-memory tree of lazily
//! loaded nodes, journaled to an append-only log, flushed bottom-up into
//! content-addressed blocks.
//!
//! Concurrency model: every exported method takes the single tree-wide
//! mutex; the private helpers all assume it is held. Path resolution,
//! dirty bookkeeping, log appends, and watcher wake-ups are short enough
//! that one lock is the right amount of cleverness. Watcher tasks never
//! touch the tree - they get log reader clones and go through the store
//! directly (see [`crate::watch`]).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;

use camino::Utf8Path;
use crossbeam_channel::{Receiver, Sender};
use jiff::Timestamp;
use tracing::*;

use crate::blocks;
use crate::config::Config;
use crate::counters;
use crate::entry::DirEntry;
use crate::error::{Error, Result};
use crate::log::{FileLog, FileOffsets, Log, OffsetStore, Op, Record};
use crate::path::{Parsed, PathName};
use crate::watch::WatcherHandle;

/// One name in the tree: its entry, its lazily-fetched children, and
/// whether it has unflushed changes.
///
/// `kids == None` means "not yet fetched from the store", which is very
/// much not the same as "no children".
pub(crate) struct Node {
    pub(crate) entry: DirEntry,
    pub(crate) kids: Option<BTreeMap<String, Node>>,
    pub(crate) dirty: bool,
}

impl Node {
    fn clean(entry: DirEntry) -> Self {
        Self {
            entry,
            kids: None,
            dirty: false,
        }
    }
}

/// A user's directory tree. One writable instance per user, shareable
/// across threads; see the module docs for the locking story.
pub struct Tree {
    pub(crate) inner: Mutex<Inner>,
}

pub(crate) struct Inner {
    pub(crate) config: Config,
    pub(crate) log: Box<dyn Log>,
    pub(crate) offsets: Box<dyn OffsetStore>,
    pub(crate) root: Option<Node>,
    pub(crate) sequence: i64,
    /// Dirty paths, indexed by depth (root = 0). Paths, not node
    /// references: at flush time each one is re-walked, which costs a few
    /// map lookups and saves us from aliasing a &mut into the tree.
    dirty: Vec<BTreeSet<String>>,
    pub(crate) watchers: Vec<WatcherHandle>,
    pub(crate) tasks: Vec<JoinHandle<()>>,
    /// Dropped on close; every watcher selects on the receive side.
    pub(crate) shutdown_tx: Option<Sender<()>>,
    pub(crate) shutdown_rx: Receiver<()>,
    pub(crate) closed: bool,
}

impl Tree {
    /// Builds a tree over the given log and sidecars, replaying whatever
    /// the last flush didn't cover.
    pub fn new(config: Config, log: Box<dyn Log>, offsets: Box<dyn OffsetStore>) -> Result<Self> {
        if log.user() != &config.user {
            return Err(Error::Invalid(format!(
                "log belongs to {}, config to {}",
                log.user(),
                config.user
            )));
        }
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(0);
        let mut inner = Inner {
            config,
            log,
            offsets,
            root: None,
            sequence: 0,
            dirty: Vec::new(),
            watchers: Vec::new(),
            tasks: Vec::new(),
            shutdown_tx: Some(shutdown_tx),
            shutdown_rx,
            closed: false,
        };
        inner.recover()?;
        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    /// The usual construction: file-backed log and sidecars in `dir`.
    pub fn open(config: Config, dir: &Utf8Path) -> Result<Self> {
        let log = FileLog::open(dir, &config.user)?;
        let offsets = FileOffsets::open(dir, &config.user)?;
        Self::new(config, Box::new(log), Box::new(offsets))
    }

    /// Creates or replaces the entry at `path`. Returns the entry as
    /// stamped. Replacing an existing directory is refused with `Exist`;
    /// everything else (files, links) is fair game, since that is how
    /// updates arrive.
    pub fn put(&self, path: &Parsed, entry: DirEntry) -> Result<DirEntry> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_usable(path)?;
        inner.put(path, entry)
    }

    /// Removes the entry at `path`, returning it with its final sequence.
    /// Directories must be empty; the root must additionally be fully
    /// flushed (which this arranges).
    pub fn delete(&self, path: &Parsed) -> Result<DirEntry> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_usable(path)?;
        inner.delete(path)
    }

    /// Resolves `path` and returns a copy of its entry, along with whether
    /// that node has unflushed changes.
    pub fn lookup(&self, path: &Parsed) -> Result<(DirEntry, bool)> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_usable(path)?;
        inner.lookup(path)
    }

    /// Lists the entries under a directory (or the entry itself, for a
    /// file or link), plus whether the listed node is dirty.
    pub fn list(&self, path: &Parsed) -> Result<(Vec<DirEntry>, bool)> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_usable(path)?;
        inner.list(path)
    }

    /// Grafts an existing directory subtree (whose blocks live in the
    /// store) under a new name. The grafted entries keep their signed
    /// names; the tree flushes immediately so a crash can't lose the
    /// graft.
    pub fn put_dir(&self, dst: &Parsed, source: &DirEntry) -> Result<DirEntry> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_usable(dst)?;
        inner.put_dir(dst, source)
    }

    /// Packs every dirty node bottom-up into the store and advances the
    /// last-processed offset. On failure the dirty state is intact and the
    /// flush can simply be retried.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(Error::Invalid("tree is closed".to_owned()));
        }
        inner.flush()
    }

    /// Shuts down: wakes and joins every watcher, then lets the log and
    /// sidecars close with the tree. Idempotent.
    pub fn close(&self) -> Result<()> {
        let tasks = {
            let mut inner = self.inner.lock().unwrap();
            inner.closed = true;
            // Dropping the sender is the shutdown broadcast.
            inner.shutdown_tx = None;
            inner.watchers.clear();
            std::mem::take(&mut inner.tasks)
        };
        let mut result = Ok(());
        for task in tasks {
            if task.join().is_err() && result.is_ok() {
                result = Err(Error::Internal("watcher task panicked".to_owned()));
            }
        }
        counters::log_counts();
        result
    }
}

impl Drop for Tree {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl Inner {
    fn check_usable(&self, path: &Parsed) -> Result<()> {
        if self.closed {
            return Err(Error::Invalid("tree is closed".to_owned()));
        }
        if path.user() != &self.config.user {
            return Err(Error::Invalid(format!(
                "path {} is not in {}'s tree",
                path,
                self.config.user
            )));
        }
        Ok(())
    }

    // ---- Mutations ----

    fn put(&mut self, path: &Parsed, mut entry: DirEntry) -> Result<DirEntry> {
        if path.is_root() {
            return self.create_root(path, entry);
        }
        entry.name = path.path();
        if entry.signed_name.is_empty() {
            entry.signed_name = entry.name.clone();
        }
        let seq = self.sequence + 1;
        entry.sequence = seq;
        self.attach(path, entry.clone(), None)?;
        self.commit(seq, Op::Put, &entry)?;
        debug!("Put {} (seq {seq})", entry.name);
        Ok(entry)
    }

    fn create_root(&mut self, path: &Parsed, mut entry: DirEntry) -> Result<DirEntry> {
        if self.root.is_some() {
            return Err(Error::Exist(path.path().to_string()));
        }
        if !entry.is_dir() {
            return Err(Error::Invalid("a root must be a directory".to_owned()));
        }
        entry.name = path.path();
        if entry.signed_name.is_empty() {
            entry.signed_name = entry.name.clone();
        }
        let seq = self.sequence + 1;
        entry.sequence = seq;
        self.root = Some(Node {
            entry: entry.clone(),
            // A fresh root has no children yet, and that's knowledge,
            // not a missing fetch.
            kids: Some(BTreeMap::new()),
            dirty: false,
        });
        mark_dirty(&mut self.dirty, self.root.as_mut().unwrap(), path)?;
        self.commit(seq, Op::Put, &entry)?;
        info!("Created root {}", entry.name);
        Ok(entry)
    }

    fn delete(&mut self, path: &Parsed) -> Result<DirEntry> {
        if path.is_root() {
            return self.delete_root(path);
        }
        let seq = self.sequence + 1;
        let mut removed = self.remove(path)?;
        removed.sequence = seq;
        self.commit(seq, Op::Delete, &removed)?;
        debug!("Deleted {} (seq {seq})", removed.name);
        Ok(removed)
    }

    /// Root deletion is special: only legal once the root is empty, and it
    /// wipes the log - so everything must be flushed first, since log
    /// history may still be feeding cloned readers.
    fn delete_root(&mut self, path: &Parsed) -> Result<DirEntry> {
        let v1 = self.log.v1_transition();
        {
            let root = match self.root.as_mut() {
                Some(r) => r,
                None => return Err(Error::NotExist(path.path().to_string())),
            };
            ensure_kids(&self.config, v1, root, path)?;
            if !root.kids.as_ref().unwrap().is_empty() {
                return Err(Error::NotEmpty(path.path().to_string()));
            }
        }
        self.flush()?;
        let entry = self.root.as_ref().unwrap().entry.clone();
        self.offsets.delete_root()?;
        self.log.truncate(0)?;
        self.offsets.save_offset(0)?;
        self.root = None;
        self.dirty.clear();
        info!("Deleted root {}", entry.name);
        Ok(entry)
    }

    /// The shared tail of every successful mutation: advance the
    /// sequence, restamp the root, journal, and poke watchers.
    fn commit(&mut self, seq: i64, op: Op, entry: &DirEntry) -> Result<()> {
        self.sequence = seq;
        if let Some(root) = self.root.as_mut() {
            root.entry.sequence = seq;
        }
        self.log.append(op, entry)?;
        self.notify(&entry.name);
        Ok(())
    }

    /// Inserts a node at `path` and marks the ancestor chain dirty.
    /// Validation only; no sequence, log, or watcher side effects.
    fn attach(&mut self, path: &Parsed, entry: DirEntry, kids: Option<BTreeMap<String, Node>>) -> Result<()> {
        let v1 = self.log.v1_transition();
        let parent_path = path.parent();
        {
            let root = match self.root.as_mut() {
                Some(r) => r,
                None => return Err(Error::NotExist(Parsed::root(path.user()).path().to_string())),
            };
            let parent = walk(&self.config, v1, root, &parent_path)?;
            if parent.entry.is_link() {
                return Err(Error::FollowLink(Box::new(parent.entry.clone())));
            }
            if !parent.entry.is_dir() {
                return Err(Error::NotDir(parent_path.path().to_string()));
            }
            ensure_kids(&self.config, v1, parent, &parent_path)?;
            let map = parent.kids.as_mut().unwrap();
            if let Some(existing) = map.get(path.last()) {
                if existing.entry.is_dir() {
                    return Err(Error::Exist(path.path().to_string()));
                }
            }
            map.insert(
                path.last().to_owned(),
                Node {
                    entry,
                    kids,
                    dirty: false,
                },
            );
        }
        mark_dirty(&mut self.dirty, self.root.as_mut().unwrap(), path)
    }

    /// Unlinks the node at `path` (not the root), returning its entry.
    /// Validation and tree surgery only, like [`attach`](Self::attach).
    fn remove(&mut self, path: &Parsed) -> Result<DirEntry> {
        let v1 = self.log.v1_transition();
        let parent_path = path.parent();
        let node = {
            let root = match self.root.as_mut() {
                Some(r) => r,
                None => return Err(Error::NotExist(path.path().to_string())),
            };
            let parent = walk(&self.config, v1, root, &parent_path)?;
            if parent.entry.is_link() {
                return Err(Error::FollowLink(Box::new(parent.entry.clone())));
            }
            if !parent.entry.is_dir() {
                return Err(Error::NotDir(parent_path.path().to_string()));
            }
            ensure_kids(&self.config, v1, parent, &parent_path)?;
            let map = parent.kids.as_mut().unwrap();
            let target = map
                .get_mut(path.last())
                .ok_or_else(|| Error::NotExist(path.path().to_string()))?;
            if target.entry.is_dir() {
                ensure_kids(&self.config, v1, target, path)?;
                if !target.kids.as_ref().unwrap().is_empty() {
                    return Err(Error::NotEmpty(path.path().to_string()));
                }
            }
            map.remove(path.last()).unwrap()
        };
        if node.dirty {
            if let Some(slot) = self.dirty.get_mut(path.nelem()) {
                slot.remove(path.path().as_str());
            }
        }
        mark_dirty(&mut self.dirty, self.root.as_mut().unwrap(), &parent_path)?;
        Ok(node.entry)
    }

    fn put_dir(&mut self, dst: &Parsed, source: &DirEntry) -> Result<DirEntry> {
        if dst.is_root() {
            return Err(Error::Invalid("cannot graft over the root".to_owned()));
        }
        if !source.is_dir() {
            return Err(Error::Invalid(format!("{} is not a directory", source.name)));
        }
        match self.lookup(dst) {
            Ok(_) => return Err(Error::Exist(dst.path().to_string())),
            Err(Error::NotExist(_)) => {}
            Err(e) => return Err(e),
        }

        // Materialise the source's children as our own (clean) nodes.
        // Loading against `dst` re-homes their names; signed names stay.
        let v1 = self.log.v1_transition();
        let kids = blocks::load_children(&self.config, dst, source, v1)?
            .into_iter()
            .map(|(elem, e)| (elem, Node::clean(e)))
            .collect();

        let mut entry = source.clone();
        entry.name = dst.path();
        if entry.signed_name.is_empty() {
            entry.signed_name = source.name.clone();
        }
        let seq = self.sequence + 1;
        entry.sequence = seq;
        self.attach(dst, entry.clone(), Some(kids))?;
        self.commit(seq, Op::Put, &entry)?;

        // Flush now: a graft a crash could lose is worse than a slow one.
        self.flush()?;
        info!("Grafted {} at {} (seq {seq})", source.name, entry.name);
        Ok(self.lookup(dst)?.0)
    }

    // ---- Reads ----

    fn lookup(&mut self, path: &Parsed) -> Result<(DirEntry, bool)> {
        let v1 = self.log.v1_transition();
        let root = match self.root.as_mut() {
            Some(r) => r,
            None => return Err(Error::NotExist(path.path().to_string())),
        };
        let node = walk(&self.config, v1, root, path)?;
        Ok((node.entry.clone(), node.dirty))
    }

    fn list(&mut self, path: &Parsed) -> Result<(Vec<DirEntry>, bool)> {
        let v1 = self.log.v1_transition();
        let root = match self.root.as_mut() {
            Some(r) => r,
            None => return Err(Error::NotExist(path.path().to_string())),
        };
        let node = walk(&self.config, v1, root, path)?;
        if !node.entry.is_dir() {
            return Ok((vec![node.entry.clone()], node.dirty));
        }
        ensure_kids(&self.config, v1, node, path)?;
        let entries = node
            .kids
            .as_ref()
            .unwrap()
            .values()
            .map(|n| n.entry.clone())
            .collect();
        Ok((entries, node.dirty))
    }

    // ---- Flush ----

    pub(crate) fn flush(&mut self) -> Result<()> {
        let v1 = self.log.v1_transition();
        // Deepest first, so every directory's children already have
        // stable block references by the time it packs.
        for depth in (0..self.dirty.len()).rev() {
            let paths: Vec<String> = self.dirty[depth].iter().cloned().collect();
            for path_str in paths {
                let path = Parsed::parse(&path_str)?;
                let root = self
                    .root
                    .as_mut()
                    .ok_or_else(|| Error::Internal("dirty path with no root".to_owned()))?;
                let node = walk(&self.config, v1, root, &path)?;
                if node.entry.is_dir() {
                    // Packing requires the children in memory. A fresh
                    // empty directory initialises here; a replayed graft
                    // pulls its children out of the source blocks.
                    ensure_kids(&self.config, v1, node, &path)?;
                    let kids = node.kids.as_ref().unwrap();
                    if let Some(bad) = kids.values().find(|n| n.dirty) {
                        return Err(Error::Internal(format!(
                            "dirty child {} under {path_str} during pack",
                            bad.entry.name
                        )));
                    }
                    blocks::store_children(
                        &self.config,
                        &mut node.entry,
                        node.kids.as_ref().unwrap().values().map(|n| &n.entry),
                    )?;
                }
                node.dirty = false;
                self.dirty[depth].remove(&path_str);
            }
        }
        self.offsets.save_offset(self.log.append_offset()?)?;
        if let Some(root) = &self.root {
            self.offsets.save_root(&root.entry)?;
        }
        Ok(())
    }

    // ---- Recovery ----

    fn recover(&mut self) -> Result<()> {
        let last = self.log.append_offset()?;
        let read = self.offsets.read_offset()?;
        match self.offsets.root() {
            Ok(entry) => {
                self.sequence = entry.sequence;
                self.root = Some(Node::clean(entry));
            }
            Err(Error::NotExist(_)) if read == 0 => {}
            Err(Error::NotExist(_)) => {
                return Err(Error::Internal(format!(
                    "log processed to {read} but no root is saved"
                )));
            }
            Err(e) => return Err(e),
        }
        if read == last {
            debug!("{}: log fully processed, no replay", self.config.user);
            return Ok(());
        }

        info!(
            "{}: replaying log from {read} to {last}",
            self.config.user
        );
        let mut offset = read;
        loop {
            match self.log.read_at(offset) {
                Ok((Some(rec), next)) => {
                    self.apply(rec)?;
                    offset = next;
                }
                Ok((None, _)) => break,
                Err(Error::LogCorrupt { offset: bad }) => {
                    warn!("{}: log corrupt at {bad}", self.config.user);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        let end = self.log.append_offset()?;
        if offset < end {
            // Whatever is back there was never acknowledged as readable;
            // drop it so appends don't land after garbage.
            warn!(
                "{}: discarding {} unreadable log bytes",
                self.config.user,
                end - offset
            );
            self.log.truncate(offset)?;
        }
        Ok(())
    }

    /// Replays one record: the tree mutation without the stamping,
    /// journaling, or watcher side effects.
    fn apply(&mut self, rec: Record) -> Result<()> {
        counters::bump(counters::Op::LogReplay);
        let path = rec.entry.name.parse()?;
        self.sequence = self.sequence.max(rec.entry.sequence);
        match rec.op {
            Op::Put if path.is_root() => {
                match self.root.as_mut() {
                    Some(root) => root.entry = rec.entry,
                    None => {
                        self.root = Some(Node {
                            entry: rec.entry,
                            kids: Some(BTreeMap::new()),
                            dirty: false,
                        });
                    }
                }
                mark_dirty(&mut self.dirty, self.root.as_mut().unwrap(), &path)?;
            }
            Op::Put => self.attach(&path, rec.entry, None)?,
            Op::Delete if path.is_root() => {
                return Err(Error::Internal("root deletion journaled".to_owned()));
            }
            Op::Delete => {
                self.remove(&path)?;
            }
        }
        if let Some(root) = self.root.as_mut() {
            root.entry.sequence = self.sequence;
        }
        Ok(())
    }
}

// ---- Lock-held helpers ----
//
// Free functions over split borrows (config here, nodes there) so the
// borrow checker can see the fields don't alias.

/// Makes sure `node`'s children are in memory: a freshly created dirty
/// directory starts empty; anything else is fetched from the store.
fn ensure_kids(config: &Config, v1: Timestamp, node: &mut Node, at: &Parsed) -> Result<()> {
    if node.kids.is_some() {
        return Ok(());
    }
    if node.dirty && node.entry.blocks.is_empty() {
        node.kids = Some(BTreeMap::new());
        return Ok(());
    }
    let kids = blocks::load_children(config, at, &node.entry, v1)?
        .into_iter()
        .map(|(elem, e)| (elem, Node::clean(e)))
        .collect();
    node.kids = Some(kids);
    Ok(())
}

/// Descends from `root` to the node at `path`, loading children on
/// demand. Crossing a link yields [`Error::FollowLink`]; the final node
/// itself may be anything (callers check).
fn walk<'a>(config: &Config, v1: Timestamp, root: &'a mut Node, path: &Parsed) -> Result<&'a mut Node> {
    let mut node = root;
    for i in 0..path.nelem() {
        if node.entry.is_link() {
            return Err(Error::FollowLink(Box::new(node.entry.clone())));
        }
        if !node.entry.is_dir() {
            return Err(Error::NotDir(path.first(i).path().to_string()));
        }
        let at = path.first(i);
        ensure_kids(config, v1, node, &at)?;
        node = node
            .kids
            .as_mut()
            .unwrap()
            .get_mut(path.elem(i))
            .ok_or_else(|| Error::NotExist(path.first(i + 1).path().to_string()))?;
    }
    Ok(node)
}

/// Stamps the root-to-`path` chain dirty, in both the nodes and the
/// per-depth index.
///
/// Only directories get the flag: a file has nothing of its own to
/// repack, its entry rides in the parent's blocks. (The final element of
/// `path` is the only one that can be a non-directory.)
fn mark_dirty(dirty: &mut Vec<BTreeSet<String>>, root: &mut Node, path: &Parsed) -> Result<()> {
    while dirty.len() <= path.nelem() {
        dirty.push(BTreeSet::new());
    }
    let mut node = root;
    for i in 0..=path.nelem() {
        if node.entry.is_dir() {
            node.dirty = true;
            dirty[i].insert(path.first(i).path().to_string());
        }
        if i < path.nelem() {
            node = node
                .kids
                .as_mut()
                .ok_or_else(|| Error::Internal("dirty chain not loaded".to_owned()))?
                .get_mut(path.elem(i))
                .ok_or_else(|| Error::Internal("dirty chain vanished".to_owned()))?;
        }
    }
    Ok(())
}

impl Inner {
    /// Wakes every watcher whose path covers `name`. Non-blocking; a
    /// watcher that is already signalled stays signalled.
    fn notify(&mut self, name: &PathName) {
        self.watchers.retain(|w| !w.closed.load(Ordering::Relaxed));
        for watcher in &self.watchers {
            if watcher.path.is_prefix_of(name) {
                let _ = watcher.has_work.try_send(());
            }
        }
    }
}
