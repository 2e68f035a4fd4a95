//! Watchers: subscriptions to mutations at or under a path.
//!
//! Each watcher is a plain thread that owns the write end of its events
//! channel. It never touches the tree or its mutex; it reads a cloned log
//! handle and loads blocks straight from the store. The tree's only
//! contact with a running watcher is a non-blocking poke on its has-work
//! channel after each mutation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded, select};
use jiff::Timestamp;
use tracing::*;

use crate::blocks;
use crate::config::Config;
use crate::counters;
use crate::entry::DirEntry;
use crate::error::{Error, Result};
use crate::log::{LogReader, Op};
use crate::path::Parsed;
use crate::tree::Tree;

/// Watch the current state first: one Put per live entry at or under the
/// path, then live events.
pub const WATCH_CURRENT: i64 = 0;

/// Skip history; live events only. (Real sequences start at 1.)
pub const WATCH_NEW: i64 = -1;

/// How many events may sit undelivered before senders block.
const EVENT_BUFFER: usize = 100;

/// How long a blocked delivery waits before the watcher is dropped.
const SEND_TIMEOUT: Duration = Duration::from_secs(60);

/// What comes out of a watch channel.
#[derive(Debug)]
pub enum Event {
    Put(DirEntry),
    Delete(DirEntry),
    /// Something went wrong (an unknown starting sequence, a corrupt log
    /// tail); the channel closes after this.
    Error(Error),
}

impl Event {
    pub fn entry(&self) -> Option<&DirEntry> {
        match self {
            Event::Put(e) | Event::Delete(e) => Some(e),
            Event::Error(_) => None,
        }
    }
}

/// The tree's side of a running watcher.
pub(crate) struct WatcherHandle {
    pub(crate) path: Parsed,
    pub(crate) has_work: Sender<()>,
    pub(crate) closed: Arc<AtomicBool>,
}

enum Start {
    /// Tail the log from the captured offset.
    Tail,
    /// Walk the flushed tree from this root first, then tail.
    Traverse(DirEntry),
    /// Report this as the first (and last) event.
    Fail(Error),
}

impl Tree {
    /// Subscribes to events at or under `path`.
    ///
    /// `sequence` picks the starting point: [`WATCH_CURRENT`] replays the
    /// current state before going live, [`WATCH_NEW`] goes straight to
    /// live, and any other value starts from that sequence's log record
    /// (an unknown one arrives as an [`Event::Error`], not a call error).
    ///
    /// The caller keeps the send side of `done` alive for as long as it
    /// wants events; dropping it (or sending on it) cancels the watcher.
    /// The events channel closes when the watcher ends for any reason.
    pub fn watch(
        &self,
        path: &Parsed,
        sequence: i64,
        done: Receiver<()>,
    ) -> Result<Receiver<Event>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(Error::Invalid("tree is closed".to_owned()));
        }
        if path.user() != &inner.config.user {
            return Err(Error::Invalid(format!(
                "path {} is not in {}'s tree",
                path, inner.config.user
            )));
        }

        let (start, offset) = match sequence {
            WATCH_CURRENT => {
                // Flush so the store holds exactly the state we'll walk,
                // and so the log tail starts where the walk ends.
                inner.flush()?;
                let offset = inner.log.append_offset()?;
                let start = match &inner.root {
                    Some(root) => Start::Traverse(root.entry.clone()),
                    None => Start::Tail,
                };
                (start, offset)
            }
            WATCH_NEW => {
                inner.flush()?;
                (Start::Tail, inner.log.append_offset()?)
            }
            seq => match inner.log.offset_of(seq) {
                Ok(offset) => (Start::Tail, offset),
                // Not a call-site error: the subscriber learns from the
                // channel, like every other watcher failure.
                Err(e @ Error::Invalid(_)) => (Start::Fail(e), 0),
                Err(e) => return Err(e),
            },
        };

        let (events_tx, events_rx) = bounded(EVENT_BUFFER);
        let (work_tx, work_rx) = bounded(1);
        let closed = Arc::new(AtomicBool::new(false));

        let watcher = Watcher {
            path: path.clone(),
            config: inner.config.clone(),
            v1: inner.log.v1_transition(),
            log: inner.log.clone_reader()?,
            offset,
            events: events_tx,
            done,
            has_work: work_rx,
            shutdown: inner.shutdown_rx.clone(),
            closed: Arc::clone(&closed),
        };
        inner.watchers.push(WatcherHandle {
            path: path.clone(),
            has_work: work_tx,
            closed,
        });
        let task = thread::Builder::new()
            .name(format!("watcher {path}"))
            .spawn(move || watcher.run(start))?;
        inner.tasks.push(task);
        Ok(events_rx)
    }
}

struct Watcher {
    path: Parsed,
    config: Config,
    v1: Timestamp,
    log: Box<dyn LogReader>,
    offset: u64,
    events: Sender<Event>,
    done: Receiver<()>,
    has_work: Receiver<()>,
    shutdown: Receiver<()>,
    closed: Arc<AtomicBool>,
}

impl Watcher {
    fn run(mut self, start: Start) {
        debug!("Watcher on {} starting at offset {}", self.path, self.offset);
        if let Err(e) = self.serve(start) {
            warn!("Watcher on {} failed: {e}", self.path);
            // Best effort; the subscriber may already be gone.
            let _ = self.events.try_send(Event::Error(e));
        }
        self.closed.store(true, Ordering::Relaxed);
        debug!("Watcher on {} finished", self.path);
        // Dropping self.events closes the channel.
    }

    fn serve(&mut self, start: Start) -> Result<()> {
        match start {
            Start::Fail(e) => {
                self.send(Event::Error(e))?;
                return Ok(());
            }
            Start::Traverse(root) => {
                if !self.traverse(root)? {
                    return Ok(());
                }
            }
            Start::Tail => {}
        }

        loop {
            // Drain everything the log has for us...
            loop {
                match self.log.read_at(self.offset)? {
                    (Some(rec), next) => {
                        self.offset = next;
                        if self.path.is_prefix_of(&rec.entry.name) {
                            let event = match rec.op {
                                Op::Put => Event::Put(scrub(rec.entry)),
                                Op::Delete => Event::Delete(scrub(rec.entry)),
                            };
                            if !self.send(event)? {
                                return Ok(());
                            }
                        }
                    }
                    (None, _) => break,
                }
            }
            // ...then park until there's more, or we're cancelled.
            select! {
                recv(self.done) -> _ => return Ok(()),
                recv(self.shutdown) -> _ => return Ok(()),
                recv(self.has_work) -> msg => {
                    if msg.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Walks the flushed tree at the watched path, emitting one Put per
    /// live entry: the node itself first, then children in signed-name
    /// order, depth first. Returns false if the subscriber went away.
    fn traverse(&mut self, root: DirEntry) -> Result<bool> {
        let mut entry = root;
        for i in 0..self.path.nelem() {
            if !entry.is_dir() || entry.is_link() {
                // The watched path runs through a non-directory; there is
                // no current state to report.
                return Ok(true);
            }
            let at = self.path.first(i);
            let kids = blocks::load_children(&self.config, &at, &entry, self.v1)?;
            match kids.get(self.path.elem(i)) {
                Some(child) => entry = child.clone(),
                None => return Ok(true), // not born yet; go live
            }
        }
        let at = self.path.clone();
        self.emit_tree(entry, at)
    }

    fn emit_tree(&mut self, entry: DirEntry, at: Parsed) -> Result<bool> {
        let descend = entry.is_dir() && !entry.is_link();
        if !self.send(Event::Put(scrub(entry.clone())))? {
            return Ok(false);
        }
        if descend {
            let mut kids: Vec<(String, DirEntry)> =
                blocks::load_children(&self.config, &at, &entry, self.v1)?
                    .into_iter()
                    .collect();
            kids.sort_by(|a, b| a.1.signed_name.cmp(&b.1.signed_name));
            for (elem, child) in kids {
                if !self.emit_tree(child, at.join(&elem))? {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Delivers one event. Returns false when the watcher should stop:
    /// cancelled, shut down, abandoned, or too slow for too long.
    fn send(&mut self, event: Event) -> Result<bool> {
        // Cancellation is observed between events, even when the channel
        // has room.
        match self.done.try_recv() {
            Err(crossbeam_channel::TryRecvError::Empty) => {}
            _ => return Ok(false),
        }
        select! {
            send(self.events, event) -> res => {
                if res.is_err() {
                    // Subscriber dropped the receiver; that's a cancel.
                    return Ok(false);
                }
                counters::bump(counters::Op::WatchEvent);
                Ok(true)
            }
            recv(self.done) -> _ => Ok(false),
            recv(self.shutdown) -> _ => Ok(false),
            default(SEND_TIMEOUT) => {
                counters::bump(counters::Op::WatcherTimeout);
                error!(
                    "Watcher on {}: no room for an event after {SEND_TIMEOUT:?}; dropping the watcher",
                    self.path
                );
                Ok(false)
            }
        }
    }
}

/// Directory entries cross a subscription without their block references.
fn scrub(mut entry: DirEntry) -> DirEntry {
    if entry.is_dir() {
        entry.mark_incomplete();
    }
    entry
}
