//! End-to-end scenarios over the tree engine: the basics, crash recovery,
//! block splitting, links, grafts, and log corruption.

use std::io::prelude::*;
use std::sync::Arc;

use camino::Utf8Path;
use tempfile::tempdir;

use dirtree::blocks::MAX_BLOCK_SIZE;
use dirtree::error::{Error, Result};
use dirtree::log::{FileOffsets, OffsetStore};
use dirtree::store::MemoryStorage;

mod common;

use common::*;

#[test]
fn basic_put_lookup_delete() -> Result<()> {
    init();
    let (tree, _) = mem_tree();

    tree.put(&p("ann@example.com/"), dir_entry("ann@example.com/"))?;
    tree.put(&p("ann@example.com/dir"), dir_entry("ann@example.com/dir"))?;
    tree.put(
        &p("ann@example.com/dir/doc.pdf"),
        file_entry("ann@example.com/dir/doc.pdf"),
    )?;

    // The file's entry lives in its parent's blocks, so the parent is the
    // dirty one.
    let (doc, dirty) = tree.lookup(&p("ann@example.com/dir/doc.pdf"))?;
    assert_eq!(doc.name.as_str(), "ann@example.com/dir/doc.pdf");
    assert!(!dirty);
    let (dir, dirty) = tree.lookup(&p("ann@example.com/dir"))?;
    assert_eq!(dir.name.as_str(), "ann@example.com/dir");
    assert!(dirty);

    tree.delete(&p("ann@example.com/dir/doc.pdf"))?;
    assert!(matches!(
        tree.lookup(&p("ann@example.com/dir/doc.pdf")),
        Err(Error::NotExist(_))
    ));
    Ok(())
}

#[test]
fn deleting_a_full_directory_is_refused() -> Result<()> {
    init();
    let (tree, _) = mem_tree();
    populate(&tree, &["ann@example.com/dir/", "ann@example.com/dir/kid"]);

    assert!(matches!(
        tree.delete(&p("ann@example.com/dir")),
        Err(Error::NotEmpty(_))
    ));
    tree.delete(&p("ann@example.com/dir/kid"))?;
    tree.delete(&p("ann@example.com/dir"))?;
    Ok(())
}

#[test]
fn listing() -> Result<()> {
    init();
    let (tree, _) = mem_tree();
    populate(
        &tree,
        &[
            "ann@example.com/dir/",
            "ann@example.com/dir/a",
            "ann@example.com/dir/b",
        ],
    );

    let (entries, dirty) = tree.list(&p("ann@example.com/dir"))?;
    assert!(dirty);
    assert_eq!(
        entries.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
        ["ann@example.com/dir/a", "ann@example.com/dir/b"]
    );

    // Listing a file is just that file.
    let (entries, _) = tree.list(&p("ann@example.com/dir/a"))?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name.as_str(), "ann@example.com/dir/a");
    Ok(())
}

#[test]
fn crash_recovery_without_flush() -> Result<()> {
    init();
    let scratch = tempdir()?;
    let dir: &Utf8Path = scratch.path().try_into().unwrap();
    let storage = Arc::new(MemoryStorage::default());

    let tree = disk_tree(dir, storage.clone());
    populate(
        &tree,
        &[
            "ann@example.com/file1",
            "ann@example.com/dir0/",
            "ann@example.com/dir0/fin",
        ],
    );
    drop(tree); // crash: no flush

    // Nothing was processed into the store, so the saved offset is still
    // zero, and replay rebuilds the whole thing.
    assert_eq!(FileOffsets::open(dir, &user())?.read_offset()?, 0);
    let tree = disk_tree(dir, storage.clone());
    let (fin, _) = tree.lookup(&p("ann@example.com/dir0/fin"))?;
    assert_eq!(fin.name.as_str(), "ann@example.com/dir0/fin");

    tree.flush()?;
    tree.put(
        &p("ann@example.com/file2"),
        file_entry("ann@example.com/file2"),
    )?;
    tree.delete(&p("ann@example.com/file1"))?;
    drop(tree); // crash again, post-flush mutations only in the log

    let tree = disk_tree(dir, storage);
    assert!(matches!(
        tree.lookup(&p("ann@example.com/file1")),
        Err(Error::NotExist(_))
    ));
    tree.lookup(&p("ann@example.com/file2"))?;
    tree.lookup(&p("ann@example.com/dir0/fin"))?;
    Ok(())
}

#[test]
fn large_directories_split_into_two_blocks() -> Result<()> {
    init();
    let (tree, _) = mem_tree();

    tree.put(&p("ann@example.com/"), dir_entry("ann@example.com/"))?;
    let mut big = file_entry("ann@example.com/big");
    big.packdata = vec![0x5A; MAX_BLOCK_SIZE + 1];
    tree.put(&p("ann@example.com/big"), big)?;
    tree.put(
        &p("ann@example.com/small"),
        file_entry("ann@example.com/small"),
    )?;
    tree.flush()?;

    let (root, dirty) = tree.lookup(&p("ann@example.com/"))?;
    assert!(!dirty);
    assert_eq!(root.blocks.len(), 2);
    Ok(())
}

#[test]
fn links_stop_resolution() -> Result<()> {
    init();
    let (tree, _) = mem_tree();
    populate(&tree, &["ann@example.com/mysubdir/"]);
    tree.put(
        &p("ann@example.com/mysubdir/link"),
        link_entry("ann@example.com/mysubdir/link", "other@y/target"),
    )?;

    // Anything under the link bounces with the link's entry, mutation-free.
    match tree.put(
        &p("ann@example.com/mysubdir/link/file"),
        file_entry("ann@example.com/mysubdir/link/file"),
    ) {
        Err(Error::FollowLink(e)) => {
            assert_eq!(e.link.as_ref().unwrap().as_str(), "other@y/target");
        }
        other => panic!("expected FollowLink, got {other:?}"),
    }
    assert!(matches!(
        tree.delete(&p("ann@example.com/mysubdir/link/anything")),
        Err(Error::FollowLink(_))
    ));
    assert!(matches!(
        tree.lookup(&p("ann@example.com/mysubdir/link/deeper/still")),
        Err(Error::FollowLink(_))
    ));

    // The link itself resolves and deletes like any other leaf.
    let (entry, _) = tree.lookup(&p("ann@example.com/mysubdir/link"))?;
    assert!(entry.is_link());
    tree.delete(&p("ann@example.com/mysubdir/link"))?;
    Ok(())
}

#[test]
fn put_dir_grafts_a_flushed_subtree() -> Result<()> {
    init();
    let scratch = tempdir()?;
    let dir: &Utf8Path = scratch.path().try_into().unwrap();
    let storage = Arc::new(MemoryStorage::default());

    let tree = disk_tree(dir, storage.clone());
    populate(
        &tree,
        &[
            "ann@example.com/orig/",
            "ann@example.com/orig/x",
            "ann@example.com/orig/y",
        ],
    );
    tree.flush()?;
    let (source, _) = tree.lookup(&p("ann@example.com/orig"))?;

    let grafted = tree.put_dir(&p("ann@example.com/snap"), &source)?;
    assert_eq!(grafted.name.as_str(), "ann@example.com/snap");
    assert_eq!(grafted.signed_name.as_str(), "ann@example.com/orig");

    // Children re-homed by name, untouched by signature.
    let (x, _) = tree.lookup(&p("ann@example.com/snap/x"))?;
    assert_eq!(x.name.as_str(), "ann@example.com/snap/x");
    assert_eq!(x.signed_name.as_str(), "ann@example.com/orig/x");

    // Grafting over anything existing is refused.
    assert!(matches!(
        tree.put_dir(&p("ann@example.com/snap"), &source),
        Err(Error::Exist(_))
    ));

    // put_dir flushes, so a crash right after keeps the graft.
    drop(tree);
    let tree = disk_tree(dir, storage);
    let (x, _) = tree.lookup(&p("ann@example.com/snap/x"))?;
    assert_eq!(x.signed_name.as_str(), "ann@example.com/orig/x");
    Ok(())
}

#[test]
fn log_corruption_truncates_the_tail() -> Result<()> {
    init();
    let scratch = tempdir()?;
    let dir: &Utf8Path = scratch.path().try_into().unwrap();
    let storage = Arc::new(MemoryStorage::default());

    let tree = disk_tree(dir, storage.clone());
    populate(
        &tree,
        &[
            "ann@example.com/a",
            "ann@example.com/b",
            "ann@example.com/c",
        ],
    );
    drop(tree);

    // Scribble garbage straight onto the log file, past the good frames.
    let log_path = dir.join(format!("tree.log.{USER}"));
    let mut fh = std::fs::OpenOptions::new().append(true).open(&log_path)?;
    fh.write_all(&[0xFF; 12])?;
    fh.sync_all()?;
    drop(fh);

    // Recovery keeps the readable prefix and drops the junk.
    let tree = disk_tree(dir, storage.clone());
    let (entries, _) = tree.list(&p("ann@example.com/"))?;
    assert_eq!(
        entries.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
        [
            "ann@example.com/a",
            "ann@example.com/b",
            "ann@example.com/c"
        ]
    );

    // New appends land where the junk was, and survive another reopen.
    tree.put(&p("ann@example.com/d"), file_entry("ann@example.com/d"))?;
    drop(tree);
    let tree = disk_tree(dir, storage);
    let (entries, _) = tree.list(&p("ann@example.com/"))?;
    assert_eq!(entries.len(), 4);
    Ok(())
}

#[test]
fn root_deletion_wipes_the_log() -> Result<()> {
    init();
    let scratch = tempdir()?;
    let dir: &Utf8Path = scratch.path().try_into().unwrap();
    let storage = Arc::new(MemoryStorage::default());

    let tree = disk_tree(dir, storage.clone());
    populate(&tree, &["ann@example.com/leftover"]);

    // Not while it has children.
    assert!(matches!(
        tree.delete(&p("ann@example.com/")),
        Err(Error::NotEmpty(_))
    ));
    tree.delete(&p("ann@example.com/leftover"))?;
    tree.delete(&p("ann@example.com/"))?;
    assert!(matches!(
        tree.lookup(&p("ann@example.com/")),
        Err(Error::NotExist(_))
    ));
    drop(tree);

    // A fresh tree starts from nothing and can build a new namespace.
    let tree = disk_tree(dir, storage);
    assert!(matches!(
        tree.lookup(&p("ann@example.com/")),
        Err(Error::NotExist(_))
    ));
    tree.put(&p("ann@example.com/"), dir_entry("ann@example.com/"))?;
    Ok(())
}

#[test]
fn recovered_sequences_stay_monotonic() -> Result<()> {
    init();
    let scratch = tempdir()?;
    let dir: &Utf8Path = scratch.path().try_into().unwrap();
    let storage = Arc::new(MemoryStorage::default());

    let tree = disk_tree(dir, storage.clone());
    populate(&tree, &["ann@example.com/a", "ann@example.com/b"]);
    let before = tree.lookup(&p("ann@example.com/b"))?.0.sequence;
    tree.flush()?;
    drop(tree);

    // A clean reopen (no replay) must pick the sequence up where it was.
    let tree = disk_tree(dir, storage);
    let after = tree
        .put(&p("ann@example.com/c"), file_entry("ann@example.com/c"))?
        .sequence;
    assert!(after > before, "{after} vs {before}");
    Ok(())
}
