#![allow(dead_code)]

use std::sync::Arc;

use camino::Utf8Path;
use dirtree::config::Config;
use dirtree::entry::{Attribute, DirEntry, Packing};
use dirtree::log::{MemLog, MemOffsets};
use dirtree::path::{Parsed, PathName, UserName};
use dirtree::store::{Endpoint, MemoryStorage, Storage};
use dirtree::tree::Tree;

pub const USER: &str = "ann@example.com";

pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn user() -> UserName {
    UserName::new(USER).unwrap()
}

pub fn p(s: &str) -> Parsed {
    Parsed::parse(s).unwrap()
}

pub fn config(storage: Arc<dyn Storage>) -> Config {
    Config {
        user: user(),
        storage,
        endpoint: Endpoint::from("mem"),
        packing: Packing::PLAIN,
    }
}

/// A tree over an in-memory log and store. For tests that never "crash".
pub fn mem_tree() -> (Tree, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::default());
    let tree = Tree::new(
        config(storage.clone()),
        Box::new(MemLog::new(user())),
        Box::new(MemOffsets::default()),
    )
    .unwrap();
    (tree, storage)
}

/// A tree over file-backed log and sidecars, for crash-and-reopen tests.
/// The store is shared so blocks outlive the "crash" (dropping the tree).
pub fn disk_tree(dir: &Utf8Path, storage: Arc<MemoryStorage>) -> Tree {
    Tree::open(config(storage), dir).unwrap()
}

pub fn dir_entry(name: &str) -> DirEntry {
    DirEntry::new(PathName::from(name), Attribute::DIRECTORY, user())
}

pub fn file_entry(name: &str) -> DirEntry {
    DirEntry::new(PathName::from(name), Attribute::NONE, user())
}

pub fn link_entry(name: &str, target: &str) -> DirEntry {
    let mut e = DirEntry::new(PathName::from(name), Attribute::LINK, user());
    e.link = Some(PathName::from(target));
    e
}

/// Builds `user@.../` plus each of the given paths, directories getting
/// directory entries by the trailing-slash convention.
pub fn populate(tree: &Tree, paths: &[&str]) {
    tree.put(&p(&format!("{USER}/")), dir_entry(&format!("{USER}/")))
        .unwrap();
    for path in paths {
        let entry = if let Some(stripped) = path.strip_suffix('/') {
            dir_entry(stripped)
        } else {
            file_entry(path)
        };
        let parsed = entry.name.parse().unwrap();
        tree.put(&parsed, entry).unwrap();
    }
}
