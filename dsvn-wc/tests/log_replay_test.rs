//! Crash-recovery behaviour of the log chain

use std::fs;
use std::path::{Path, PathBuf};

use dsvn_wc::area::text_base_path;
use dsvn_wc::log::{log_files, parse};
use dsvn_wc::{
    AdminArea, Command, Depth, EntryField, EntryPatch, Log, LogRunner, NodeKind, PropSet, RunContext,
    TextMerger, WcAccess, WcError, WcOptions, WholeFileMerger,
};
use proptest::prelude::*;
use tempfile::TempDir;

fn checkout(tmp: &TempDir) -> PathBuf {
    let root = tmp.path().join("wc");
    let mut area = AdminArea::create_versioned_directory(
        &root,
        "http://host/repos/trunk",
        Some("http://host/repos"),
        Some("uuid-1"),
        3,
        Depth::Infinity,
        &WcOptions::default(),
    )
    .unwrap();
    area.lock(false).unwrap();
    fs::write(root.join("a.txt"), "alpha\n").unwrap();
    fs::write(root.join(text_base_path("a.txt", false)), "alpha\n").unwrap();
    area.modify_entry("a.txt", EntryPatch::new().set(EntryField::Kind, "file"), true, true)
        .unwrap();
    area.unlock().unwrap();
    root
}

fn modify(patch: EntryPatch) -> Command {
    Command::ModifyEntry {
        name: "a.txt".to_string(),
        patch,
        force: true,
    }
}

fn save_log(admin_dir: &Path, commands: &[Command]) -> PathBuf {
    let mut log = Log::new(admin_dir);
    for command in commands {
        log.add(command.clone());
    }
    log.save().unwrap().unwrap()
}

#[test]
fn test_failed_chain_respools_into_the_failing_file() {
    let tmp = TempDir::new().unwrap();
    let root = checkout(&tmp);
    let admin_dir = root.join(".svn");

    let first = vec![modify(EntryPatch::new().set(EntryField::LastAuthor, "alice"))];
    let second = vec![
        modify(EntryPatch::new().revision(EntryField::CommittedRev, 7)),
        modify(EntryPatch::new().set(EntryField::Changelist, "cl")),
        modify(EntryPatch::new().set(EntryField::Revision, "xyz")),
        Command::Delete {
            name: "a.txt".to_string(),
        },
        modify(EntryPatch::new().set(EntryField::LastAuthor, "bob")),
    ];
    assert_eq!(save_log(&admin_dir, &first), admin_dir.join("log"));
    assert_eq!(save_log(&admin_dir, &second), admin_dir.join("log.1"));

    let mut access = WcAccess::default();
    access.open(&root, true, false, None).unwrap();
    let err = access.run_logs(&root).unwrap_err();
    assert!(matches!(err, WcError::MalformedRecord { .. }));

    assert!(!admin_dir.join("log").exists());
    assert!(!admin_dir.join("log.2").exists());
    let respooled = admin_dir.join("log.1");
    let left = parse(&fs::read_to_string(&respooled).unwrap(), &respooled).unwrap();
    assert_eq!(left, second[2..].to_vec());
    assert!(root.join("a.txt").exists());

    let entry = access.entry(&root.join("a.txt"), false).unwrap().unwrap();
    assert_eq!(entry.last_author.as_deref(), Some("alice"));
    assert_eq!(entry.committed_rev, Some(7));
    assert_eq!(entry.changelist.as_deref(), Some("cl"));

    // the directory stays locked until the chain completes
    drop(access);
    assert!(admin_dir.join("lock").exists());
}

#[test]
fn test_new_logs_queue_after_a_respooled_one() {
    let tmp = TempDir::new().unwrap();
    let root = checkout(&tmp);
    let admin_dir = root.join(".svn");
    save_log(&admin_dir, &[modify(EntryPatch::new().set(EntryField::LastAuthor, "a"))]);
    save_log(&admin_dir, &[modify(EntryPatch::new().set(EntryField::LastAuthor, "b"))]);
    fs::remove_file(admin_dir.join("log")).unwrap();

    let queued = save_log(&admin_dir, &[modify(EntryPatch::new().set(EntryField::LastAuthor, "c"))]);
    assert_eq!(queued, admin_dir.join("log.2"));
    let ids: Vec<u32> = log_files(&admin_dir).unwrap().into_iter().map(|(id, _)| id).collect();
    assert_eq!(ids, vec![1, 2]);
}

#[test]
fn test_empty_log_replay_changes_nothing() {
    let tmp = TempDir::new().unwrap();
    let root = checkout(&tmp);
    let entries = fs::read(root.join(".svn/entries")).unwrap();

    let mut access = WcAccess::default();
    access.open(&root, true, false, None).unwrap();
    for _ in 0..2 {
        fs::write(root.join(".svn/log"), "").unwrap();
        access.run_logs(&root).unwrap();
        assert!(!root.join(".svn/log").exists());
    }
    assert_eq!(fs::read(root.join(".svn/entries")).unwrap(), entries);
}

// ─────────────────────────────────────────────────────
// Prefix / suffix replay
// ─────────────────────────────────────────────────────

#[derive(Default)]
struct Session {
    merger: WholeFileMerger,
}

impl RunContext for Session {
    fn merger(&mut self) -> &mut dyn TextMerger {
        &mut self.merger
    }

    fn allow_delete(&self, _path: &Path, _kind: NodeKind) -> bool {
        true
    }

    fn remove_directory(&mut self, _path: &Path) -> dsvn_wc::Result<()> {
        Ok(())
    }

    fn finish_directory_commit(&mut self, _dir: &Path, _implicit: bool) -> dsvn_wc::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Step {
    Author(String),
    Changelist(Option<String>),
    WcProp(Option<String>),
    AppendTo,
}

impl Step {
    fn command(&self) -> Command {
        match self {
            Step::Author(author) => modify(EntryPatch::new().set(EntryField::LastAuthor, author.clone())),
            Step::Changelist(Some(cl)) => modify(EntryPatch::new().set(EntryField::Changelist, cl.clone())),
            Step::Changelist(None) => modify(EntryPatch::new().clear(EntryField::Changelist)),
            Step::WcProp(value) => Command::ModifyWcProperty {
                name: "a.txt".to_string(),
                prop: "svn:wc:ra_dav:version-url".to_string(),
                value: value.clone(),
            },
            Step::AppendTo => Command::Append {
                name: "a.txt".to_string(),
                dest: "journal".to_string(),
            },
        }
    }
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        "[a-z]{1,8}".prop_map(Step::Author),
        proptest::option::of("[a-z]{1,8}").prop_map(Step::Changelist),
        proptest::option::of("/[a-z]{1,8}").prop_map(Step::WcProp),
        Just(Step::AppendTo),
    ]
}

type Snapshot = (Option<String>, Option<String>, Option<String>, Option<String>);

fn snapshot(root: &Path) -> Snapshot {
    let mut area = AdminArea::open(root).unwrap();
    let entry = area.entry("a.txt", false).unwrap().unwrap();
    let wc = area
        .props(PropSet::Wc, "a.txt")
        .unwrap()
        .get("svn:wc:ra_dav:version-url")
        .map(str::to_string);
    let journal = fs::read_to_string(root.join("journal")).ok();
    (entry.last_author, entry.changelist, wc, journal)
}

fn replay(root: &Path, batches: &[&[Command]]) {
    let mut area = AdminArea::open(root).unwrap();
    area.lock(false).unwrap();
    for batch in batches.iter().filter(|b| !b.is_empty()) {
        save_log(area.admin_dir(), batch);
        LogRunner::new().run(&mut area, &mut Session::default()).unwrap();
    }
    assert!(area.unlock().unwrap());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_prefix_then_suffix_matches_full_replay(
        steps in proptest::collection::vec(step(), 1..8),
        split in 0usize..8,
    ) {
        let commands: Vec<Command> = steps.iter().map(Step::command).collect();
        let split = split.min(commands.len());

        let whole = TempDir::new().unwrap();
        let whole_root = checkout(&whole);
        replay(&whole_root, &[&commands]);

        let parts = TempDir::new().unwrap();
        let parts_root = checkout(&parts);
        replay(&parts_root, &[&commands[..split], &commands[split..]]);

        prop_assert_eq!(snapshot(&whole_root), snapshot(&parts_root));
    }
}
