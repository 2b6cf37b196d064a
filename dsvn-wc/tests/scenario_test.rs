//! End-to-end working copy scenarios through the public session API

use std::fs;
use std::path::{Path, PathBuf};

use dsvn_wc::area::text_base_path;
use dsvn_wc::{
    AdminArea, CommitInfo, Depth, EntryField, EntryPatch, Log, MergeStatus, NodeKind, PropDiff, PropMap, PropSet,
    Schedule, WcAccess, WcError, WcOptions, merge_props,
};
use tempfile::TempDir;

const URL: &str = "http://host/repos/trunk";
const ROOT: &str = "http://host/repos";

/// A working copy at `revision` holding `a.txt`
fn checkout(tmp: &TempDir, revision: u64) -> PathBuf {
    let root = tmp.path().join("wc");
    let mut area = AdminArea::create_versioned_directory(
        &root,
        URL,
        Some(ROOT),
        Some("uuid-1"),
        revision,
        Depth::Infinity,
        &WcOptions::default(),
    )
    .unwrap();
    area.lock(false).unwrap();
    area.modify_entry("", EntryPatch::new().flag(EntryField::Incomplete, false), false, true)
        .unwrap();
    fs::write(root.join("a.txt"), "alpha\n").unwrap();
    fs::write(root.join(text_base_path("a.txt", false)), "alpha\n").unwrap();
    area.modify_entry("a.txt", EntryPatch::new().set(EntryField::Kind, "file"), true, true)
        .unwrap();
    area.unlock().unwrap();
    root
}

fn open(root: &Path) -> WcAccess {
    let mut access = WcAccess::default();
    access.open(root, true, false, None).unwrap();
    access
}

#[test]
fn test_add_then_delete_forgets_entry() {
    let tmp = TempDir::new().unwrap();
    let root = checkout(&tmp, 5);
    let mut access = open(&root);
    let area = access.retrieve(&root).unwrap();

    fs::write(root.join("new.txt"), "new\n").unwrap();
    let add = EntryPatch::new().set(EntryField::Kind, "file").schedule(Schedule::Add);
    area.modify_entry("new.txt", add, true, false).unwrap();
    area.modify_entry("new.txt", EntryPatch::new().schedule(Schedule::Delete), true, false)
        .unwrap();

    assert!(area.entry("new.txt", true).unwrap().is_none());
    drop(access);
    let mut reopened = AdminArea::open(&root).unwrap();
    assert!(reopened.entry("new.txt", true).unwrap().is_none());
    assert!(reopened.entry("a.txt", false).unwrap().is_some());
}

fn commit_deletion(root: &Path, revision: u64) -> WcAccess {
    let mut access = open(root);
    access
        .retrieve(root)
        .unwrap()
        .modify_entry("a.txt", EntryPatch::new().schedule(Schedule::Delete), true, false)
        .unwrap();
    let info = CommitInfo {
        revision,
        date: None,
        author: Some("alice".to_string()),
    };
    access
        .process_committed(root, "a.txt", &info, &PropDiff::new(), false, false)
        .unwrap();
    access
}

#[test]
fn test_committed_deletion_leaves_tombstone_above_parent_revision() {
    let tmp = TempDir::new().unwrap();
    let root = checkout(&tmp, 5);
    let mut access = commit_deletion(&root, 42);

    let area = access.retrieve(&root).unwrap();
    assert!(area.entry("a.txt", false).unwrap().is_none());
    let tombstone = area.entry("a.txt", true).unwrap().unwrap();
    assert!(tombstone.deleted);
    assert_eq!(tombstone.revision, Some(42));
    assert_eq!(tombstone.schedule, Schedule::Normal);
    assert!(!root.join(text_base_path("a.txt", false)).exists());

    drop(access);
    let mut reopened = AdminArea::open(&root).unwrap();
    let tombstone = reopened.entry("a.txt", true).unwrap().unwrap();
    assert!(tombstone.deleted);
    assert_eq!(tombstone.revision, Some(42));
}

#[test]
fn test_committed_deletion_below_parent_revision_disappears() {
    let tmp = TempDir::new().unwrap();
    let root = checkout(&tmp, 50);
    let mut access = commit_deletion(&root, 42);
    assert!(access.entry(&root.join("a.txt"), true).unwrap().is_none());
}

/// Add a versioned, empty subdirectory `name` to the working copy at `root`
fn add_subdirectory(root: &Path, name: &str, revision: u64) {
    let mut parent = AdminArea::open(root).unwrap();
    parent.lock(false).unwrap();
    parent
        .modify_entry(name, EntryPatch::new().set(EntryField::Kind, "dir"), true, true)
        .unwrap();
    parent.unlock().unwrap();

    let mut sub = AdminArea::create_versioned_directory(
        &root.join(name),
        &format!("{}/{}", URL, name),
        Some(ROOT),
        Some("uuid-1"),
        revision,
        Depth::Infinity,
        &WcOptions::default(),
    )
    .unwrap();
    sub.lock(false).unwrap();
    sub.modify_entry("", EntryPatch::new().flag(EntryField::Incomplete, false), true, true)
        .unwrap();
    sub.unlock().unwrap();
}

#[test]
fn test_committed_directory_deletion_leaves_plain_tombstone() {
    let tmp = TempDir::new().unwrap();
    let root = checkout(&tmp, 5);
    add_subdirectory(&root, "sub", 5);
    let sub = root.join("sub");

    let mut access = open(&root);
    let delete = || EntryPatch::new().schedule(Schedule::Delete);
    access.retrieve(&root).unwrap().modify_entry("sub", delete(), true, false).unwrap();
    access.retrieve(&sub).unwrap().modify_entry("", delete(), true, false).unwrap();
    let info = CommitInfo {
        revision: 42,
        date: None,
        author: Some("alice".to_string()),
    };
    access
        .process_committed(&root, "sub", &info, &PropDiff::new(), false, false)
        .unwrap();

    assert!(!sub.exists());
    assert!(access.retrieve(&sub).is_err());
    let area = access.retrieve(&root).unwrap();
    assert!(area.entry("sub", false).unwrap().is_none());
    let tombstone = area.entry("sub", true).unwrap().unwrap();
    assert!(tombstone.deleted);
    assert_eq!(tombstone.kind, NodeKind::Dir);
    assert_eq!(tombstone.revision, Some(42));
    assert_eq!(tombstone.schedule, Schedule::Normal);
    assert!(!tombstone.copied);
    assert!(tombstone.copyfrom_url.is_none());

    // the name can be scheduled for addition again
    let add = EntryPatch::new().set(EntryField::Kind, "dir").schedule(Schedule::Add);
    area.modify_entry("sub", add, true, false).unwrap();
    assert_eq!(area.entry("sub", true).unwrap().unwrap().schedule, Schedule::Add);
}

#[test]
fn test_failed_open_releases_the_root_lock() {
    let tmp = TempDir::new().unwrap();
    let root = checkout(&tmp, 5);
    let entries = root.join(".svn/entries");
    let mut permissions = fs::metadata(&entries).unwrap().permissions();
    permissions.set_readonly(false);
    fs::set_permissions(&entries, permissions).unwrap();
    fs::write(&entries, "10\n\ndir\nnot-a-revision\n\x0c\n").unwrap();

    let mut access = WcAccess::default();
    let err = access.open(&root, true, false, None).unwrap_err();
    assert!(matches!(err, WcError::MalformedRecord { .. }));
    assert!(access.open_paths().is_empty());
    assert!(!root.join(".svn/lock").exists());

    drop(access);
    assert!(!root.join(".svn/lock").exists());
}

#[test]
fn test_add_of_locally_deleted_property_conflicts() {
    let base: PropMap = [("p".to_string(), "X".to_string())].into_iter().collect();
    let mut incoming = PropDiff::new();
    incoming.insert("p".to_string(), Some("Y".to_string()));
    let merged = merge_props(&base, &PropMap::new(), None, &incoming, false);
    assert_eq!(merged.status, MergeStatus::Conflicted);
    assert_eq!(merged.conflicts.len(), 1);
    assert!(!merged.working.contains_key("p"));

    // the same triple through an admin area records a reject file
    let tmp = TempDir::new().unwrap();
    let root = checkout(&tmp, 5);
    let mut access = open(&root);
    let area = access.retrieve(&root).unwrap();
    area.props(PropSet::Base, "a.txt").unwrap().replace(base.clone());
    area.props(PropSet::Working, "a.txt").unwrap().replace(PropMap::new());
    let mut log = Log::new(area.admin_dir());
    area.save_versioned_properties(&mut log).unwrap();
    log.save().unwrap();
    access.run_logs(&root).unwrap();

    let area = access.retrieve(&root).unwrap();
    assert!(area.has_prop_modifications("a.txt").unwrap());
    let mut log = Log::new(area.admin_dir());
    let status = area
        .merge_properties("a.txt", None, &incoming, false, false, &mut log)
        .unwrap();
    assert_eq!(status, MergeStatus::Conflicted);
    log.save().unwrap();
    access.run_logs(&root).unwrap();

    let area = access.retrieve(&root).unwrap();
    let entry = area.entry("a.txt", false).unwrap().unwrap();
    assert_eq!(entry.prop_reject_file.as_deref(), Some("a.txt.prej"));
    assert!(area.has_prop_conflict("a.txt").unwrap());
    assert!(fs::read_to_string(root.join("a.txt.prej")).unwrap().contains("'p'"));
    assert_eq!(area.props(PropSet::Working, "a.txt").unwrap().get("p"), None);
}

#[test]
fn test_unlock_refused_while_log_pending() {
    let tmp = TempDir::new().unwrap();
    let root = checkout(&tmp, 5);
    let mut area = AdminArea::open(&root).unwrap();
    area.lock(false).unwrap();
    fs::write(area.admin_dir().join("log.3"), "").unwrap();

    assert!(!area.unlock().unwrap());
    assert!(area.is_locked());
    assert!(root.join(".svn/lock").exists());

    // a second session cannot take the directory meanwhile
    let mut access = WcAccess::default();
    assert!(matches!(
        access.open(&root, true, false, None),
        Err(WcError::WorkingCopyLocked(_))
    ));
}
