//! Log replay
//!
//! Executes the log files of one admin area in ascending order. Commands
//! are idempotent where they can be: moves and appends of vanished sources
//! are skipped, deletions of missing files succeed. When a command fails,
//! the failing command and everything after it are written back to the same
//! log file so a later run resumes exactly there.

use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, warn};

use crate::area::{AdminArea, ConflictLabels};
use crate::callbacks::TextMerger;
use crate::entry::{format_date, EntryField, EntryPatch, NodeKind};
use crate::error::{Result, WcError};
use crate::log::{log_files, parse, write_log_file, Command, WORKING_TIMESTAMP};
use crate::path::{
    file_mtime, make_writable, remove_if_exists, set_executable, set_file_mtime, set_readonly,
};
use crate::props::{svn_props, PropSet};
use crate::translate::{translate_file, Direction};

/// Session services the log runner calls back into
///
/// Commands that reach outside one admin area (removing a subdirectory,
/// updating a directory's entry in its parent) go through this trait.
pub trait RunContext {
    fn merger(&mut self) -> &mut dyn TextMerger;

    /// Whether a node leaving revision control is also deleted from disk
    fn allow_delete(&self, path: &Path, kind: NodeKind) -> bool;

    /// Take the versioned subdirectory at `path` out of revision control.
    fn remove_directory(&mut self, path: &Path) -> Result<()>;

    /// Record a finished directory commit in the parent's entry for `dir`.
    fn finish_directory_commit(&mut self, dir: &Path, implicit: bool) -> Result<()>;
}

/// Replays the log files of an admin area
#[derive(Debug, Default)]
pub struct LogRunner {
    entries_changed: bool,
    wc_props_changed: bool,
}

impl LogRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every pending log file of `area`; returns the number of commands executed.
    pub fn run(&mut self, area: &mut AdminArea, ctx: &mut dyn RunContext) -> Result<usize> {
        if !area.is_locked() {
            return Err(WcError::NotLocked(area.root().to_path_buf()));
        }
        let files = log_files(area.admin_dir())?;
        let mut executed = 0;

        for (index, (id, path)) in files.iter().enumerate() {
            let data = fs::read_to_string(path)?;
            let commands = parse(&data, path)?;
            debug!("Running log {} of {:?} ({} commands)", id, area.root(), commands.len());

            for (position, command) in commands.iter().enumerate() {
                if let Err(e) = self.execute(area, ctx, command) {
                    warn!(
                        "Log command {} '{}' on '{}' failed in {:?}: {}",
                        position,
                        command.opcode(),
                        command.name(),
                        area.root(),
                        e
                    );
                    // keep what already happened and leave the rest for the next run
                    write_log_file(area.admin_dir(), path, &commands[position..])?;
                    for (_, done) in &files[..index] {
                        remove_if_exists(done)?;
                    }
                    if let Err(flush_err) = self.flush(area) {
                        warn!("Failed to save the state of {:?} after log failure: {}", area.root(), flush_err);
                    }
                    return Err(e);
                }
                executed += 1;
            }

            self.flush(area)?;
            write_log_file(area.admin_dir(), path, &[])?;
        }

        for (_, path) in &files {
            remove_if_exists(path)?;
        }
        Ok(executed)
    }

    fn flush(&mut self, area: &mut AdminArea) -> Result<()> {
        if self.wc_props_changed {
            area.save_wc_properties()?;
            self.wc_props_changed = false;
        }
        if self.entries_changed {
            area.save_entries(false)?;
            self.entries_changed = false;
        }
        Ok(())
    }

    fn execute(&mut self, area: &mut AdminArea, ctx: &mut dyn RunContext, command: &Command) -> Result<()> {
        match command {
            Command::DeleteEntry { name } => {
                let Some(entry) = area.entry(name, true)? else {
                    return Ok(());
                };
                let path = area.path(name);
                let result = if entry.is_dir() {
                    ctx.remove_directory(&path).and_then(|()| {
                        area.delete_entry(name)?;
                        area.save_entries(false)
                    })
                } else {
                    let delete = ctx.allow_delete(&path, entry.kind);
                    area.remove_file_from_revision_control(name, delete, false)
                };
                match result {
                    Err(WcError::LocalModificationsPresent(path)) => {
                        debug!("Kept locally modified {:?}", path);
                        Ok(())
                    }
                    other => other,
                }
            }
            Command::ModifyEntry { name, patch, force } => {
                let patch = resolve_working_values(area, name, patch)?;
                area.modify_entry(name, patch, false, *force)?;
                self.entries_changed = true;
                Ok(())
            }
            Command::ModifyWcProperty { name, prop, value } => {
                area.props(PropSet::Wc, name)?.set(prop, value.as_deref());
                self.wc_props_changed = true;
                Ok(())
            }
            Command::DeleteLock { name } => {
                let patch = EntryPatch::new()
                    .clear(EntryField::LockToken)
                    .clear(EntryField::LockOwner)
                    .clear(EntryField::LockComment)
                    .clear(EntryField::LockCreationDate);
                area.modify_entry(name, patch, false, true)?;
                self.entries_changed = true;
                Ok(())
            }
            Command::Move { name, dest } => {
                let src = area.path(name);
                if fs::symlink_metadata(&src).is_err() {
                    return Ok(());
                }
                let dst = area.path(dest);
                make_writable(&dst)?;
                fs::rename(&src, &dst)?;
                Ok(())
            }
            Command::Append { name, dest } => {
                let mut src = match fs::File::open(area.path(name)) {
                    Ok(file) => file,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                    Err(e) => return Err(e.into()),
                };
                let mut dst = fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(area.path(dest))?;
                io::copy(&mut src, &mut dst)?;
                Ok(())
            }
            Command::Delete { name } => {
                remove_if_exists(&area.path(name))?;
                Ok(())
            }
            Command::Readonly { name } => {
                let path = area.path(name);
                if path.exists() {
                    set_readonly(&path, true)?;
                }
                Ok(())
            }
            Command::MaybeReadonly { name } => {
                let path = area.path(name);
                let unlocked = area.entry(name, true)?.is_some_and(|e| e.lock_token.is_none());
                if unlocked && path.exists() && area.props(PropSet::Working, name)?.contains(svn_props::NEEDS_LOCK) {
                    set_readonly(&path, true)?;
                }
                Ok(())
            }
            Command::CopyAndTranslate { name, dest } => {
                let src = area.path(name);
                if fs::symlink_metadata(&src).is_err() {
                    return Ok(());
                }
                let translation = area.translation(dest)?;
                let dst = area.path(dest);
                make_writable(&dst)?;
                translate_file(&src, &dst, &translation, Direction::Expand)?;
                if !translation.special {
                    let locked = area.entry(dest, true)?.is_some_and(|e| e.lock_token.is_some());
                    let props = area.props(PropSet::Working, dest)?;
                    set_readonly(&dst, props.contains(svn_props::NEEDS_LOCK) && !locked)?;
                    if props.contains(svn_props::EXECUTABLE) {
                        set_executable(&dst, true)?;
                    }
                }
                Ok(())
            }
            Command::CopyAndDetranslate { name, dest } => {
                let translation = area.translation(name)?;
                let dst = area.path(dest);
                make_writable(&dst)?;
                translate_file(&area.path(name), &dst, &translation, Direction::Contract)
            }
            Command::Copy { name, dest } => {
                let dst = area.path(dest);
                make_writable(&dst)?;
                fs::copy(area.path(name), &dst)?;
                Ok(())
            }
            Command::Merge {
                name,
                left,
                right,
                left_label,
                right_label,
                target_label,
            } => {
                let labels = ConflictLabels {
                    left: left_label.clone(),
                    right: right_label.clone(),
                    target: target_label.clone(),
                };
                area.merge_text(name, left, right, &labels, false, ctx.merger())?;
                self.entries_changed = true;
                Ok(())
            }
            Command::SetTimestamp { name, timestamp } => {
                let path = area.path(name);
                if fs::symlink_metadata(&path).is_ok() {
                    set_file_mtime(&path, timestamp)?;
                }
                Ok(())
            }
            Command::Committed {
                name,
                revision,
                implicit,
            } => {
                let follow_up = area.post_commit(name, *revision, *implicit)?;
                self.entries_changed = true;
                for dir in follow_up.removed_dirs {
                    ctx.remove_directory(&area.path(&dir))?;
                    area.delete_entry(&dir)?;
                }
                if let Some(implicit) = follow_up.parent_update {
                    self.flush(area)?;
                    ctx.finish_directory_commit(area.root(), implicit)?;
                }
                Ok(())
            }
            Command::UpgradeFormat { format } => {
                area.apply_generation(*format)?;
                Ok(())
            }
        }
    }
}

/// Replace `working` placeholders in a patch with values read from disk.
fn resolve_working_values(area: &mut AdminArea, name: &str, patch: &EntryPatch) -> Result<EntryPatch> {
    let is_placeholder = |field| patch.get(field) == Some(Some(WORKING_TIMESTAMP));
    let (text_time, prop_time, size) = (
        is_placeholder(EntryField::TextTime),
        is_placeholder(EntryField::PropTime),
        is_placeholder(EntryField::WorkingSize),
    );
    let mut patch = patch.clone();

    if text_time {
        let time = file_mtime(&area.path(name))?;
        patch.insert(EntryField::TextTime, time.map(|t| format_date(&t)));
    }
    if prop_time {
        let props_file = area.path(&area.prop_path(PropSet::Working, name, false));
        let time = file_mtime(&props_file)?;
        patch.insert(EntryField::PropTime, time.map(|t| format_date(&t)));
    }
    if size {
        let size = fs::symlink_metadata(area.path(name)).ok().map(|m| m.len().to_string());
        patch.insert(EntryField::WorkingSize, size);
    }
    Ok(patch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::area::text_base_path;
    use crate::callbacks::WholeFileMerger;
    use crate::config::WcOptions;
    use crate::entry::{Depth, Schedule};
    use crate::log::Log;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[derive(Default)]
    struct TestContext {
        merger: WholeFileMerger,
        keep_files: bool,
        removed_dirs: Vec<PathBuf>,
        finished_dirs: Vec<(PathBuf, bool)>,
    }

    impl RunContext for TestContext {
        fn merger(&mut self) -> &mut dyn TextMerger {
            &mut self.merger
        }

        fn allow_delete(&self, _path: &Path, _kind: NodeKind) -> bool {
            !self.keep_files
        }

        fn remove_directory(&mut self, path: &Path) -> Result<()> {
            self.removed_dirs.push(path.to_path_buf());
            Ok(())
        }

        fn finish_directory_commit(&mut self, dir: &Path, implicit: bool) -> Result<()> {
            self.finished_dirs.push((dir.to_path_buf(), implicit));
            Ok(())
        }
    }

    fn checkout(tmp: &TempDir) -> AdminArea {
        let mut area = AdminArea::create_versioned_directory(
            &tmp.path().join("wc"),
            "http://host/repos/trunk",
            Some("http://host/repos"),
            Some("uuid-1"),
            5,
            Depth::Infinity,
            &WcOptions::default(),
        )
        .unwrap();
        area.lock(false).unwrap();
        area
    }

    fn add_file(area: &mut AdminArea, name: &str, text: &str) {
        fs::write(area.path(name), text).unwrap();
        fs::write(area.path(&text_base_path(name, false)), text).unwrap();
        area.modify_entry(name, EntryPatch::new().set(EntryField::Kind, "file"), true, true)
            .unwrap();
    }

    fn run(area: &mut AdminArea, commands: Vec<Command>) -> Result<usize> {
        let mut log = Log::new(area.admin_dir());
        for command in commands {
            log.add(command);
        }
        log.save().unwrap();
        LogRunner::new().run(area, &mut TestContext::default())
    }

    #[test]
    fn test_property_change_lands_through_log() {
        let tmp = TempDir::new().unwrap();
        let mut area = checkout(&tmp);
        add_file(&mut area, "a.txt", "a");
        area.props(PropSet::Working, "a.txt")
            .unwrap()
            .set(svn_props::EXECUTABLE, Some("*"));
        let mut log = Log::new(area.admin_dir());
        area.save_versioned_properties(&mut log).unwrap();
        log.save().unwrap();

        let executed = LogRunner::new().run(&mut area, &mut TestContext::default()).unwrap();
        assert!(executed >= 3);
        assert!(!area.has_logs().unwrap());
        let props_file = area.path(".svn/props/a.txt.svn-work");
        assert!(fs::metadata(&props_file).unwrap().permissions().readonly());

        let mut reopened = AdminArea::open(area.root()).unwrap();
        let entry = reopened.entry("a.txt", false).unwrap().unwrap();
        assert!(entry.has_prop_mods);
        assert!(entry.has_props);
        assert!(reopened.has_prop_modifications("a.txt").unwrap());
        assert_eq!(
            reopened.props(PropSet::Working, "a.txt").unwrap().get(svn_props::EXECUTABLE),
            Some("*")
        );
    }

    #[test]
    fn test_failure_keeps_remaining_commands() {
        let tmp = TempDir::new().unwrap();
        let mut area = checkout(&tmp);
        add_file(&mut area, "a.txt", "a");
        let commands = vec![
            Command::ModifyEntry {
                name: "a.txt".to_string(),
                patch: EntryPatch::new().set(EntryField::LastAuthor, "alice"),
                force: true,
            },
            Command::ModifyEntry {
                name: "a.txt".to_string(),
                patch: EntryPatch::new().set(EntryField::Revision, "xyz"),
                force: true,
            },
            Command::Delete {
                name: "a.txt".to_string(),
            },
        ];
        let err = run(&mut area, commands.clone()).unwrap_err();
        assert!(matches!(err, WcError::MalformedRecord { .. }));

        let (_, log_path) = log_files(area.admin_dir()).unwrap().remove(0);
        let left = parse(&fs::read_to_string(&log_path).unwrap(), &log_path).unwrap();
        assert_eq!(left, commands[1..].to_vec());
        assert!(area.path("a.txt").exists());

        let mut reopened = AdminArea::open(area.root()).unwrap();
        let entry = reopened.entry("a.txt", false).unwrap().unwrap();
        assert_eq!(entry.last_author.as_deref(), Some("alice"));
    }

    #[test]
    fn test_failure_respools_when_state_cannot_be_saved() {
        let tmp = TempDir::new().unwrap();
        let mut area = checkout(&tmp);
        add_file(&mut area, "a.txt", "a");
        // a directory in place of the server property temp file makes the save fail
        fs::create_dir_all(area.admin_dir().join("tmp/all-wcprops/blocked")).unwrap();
        let commands = vec![
            Command::ModifyWcProperty {
                name: "a.txt".to_string(),
                prop: "svn:wc:ra_dav:version-url".to_string(),
                value: Some("/repos/!svn/ver/5/trunk/a.txt".to_string()),
            },
            Command::ModifyEntry {
                name: "a.txt".to_string(),
                patch: EntryPatch::new().set(EntryField::Revision, "xyz"),
                force: true,
            },
            Command::Delete {
                name: "a.txt".to_string(),
            },
        ];
        let err = run(&mut area, commands.clone()).unwrap_err();
        assert!(matches!(err, WcError::MalformedRecord { .. }));

        let files = log_files(area.admin_dir()).unwrap();
        assert_eq!(files.len(), 1);
        let left = parse(&fs::read_to_string(&files[0].1).unwrap(), &files[0].1).unwrap();
        assert_eq!(left, commands[1..].to_vec());
        assert!(area.path("a.txt").exists());
    }

    #[test]
    fn test_empty_log_is_noop() {
        let tmp = TempDir::new().unwrap();
        let mut area = checkout(&tmp);
        fs::write(area.admin_dir().join("log"), "").unwrap();
        let executed = LogRunner::new().run(&mut area, &mut TestContext::default()).unwrap();
        assert_eq!(executed, 0);
        assert!(!area.has_logs().unwrap());
        assert!(area.unlock().unwrap());
    }

    #[test]
    fn test_run_requires_lock() {
        let tmp = TempDir::new().unwrap();
        let mut area = checkout(&tmp);
        area.unlock().unwrap();
        let err = LogRunner::new().run(&mut area, &mut TestContext::default()).unwrap_err();
        assert!(matches!(err, WcError::NotLocked(_)));
    }

    #[test]
    fn test_file_commands_tolerate_missing_sources() {
        let tmp = TempDir::new().unwrap();
        let mut area = checkout(&tmp);
        fs::write(area.path("dst"), "keep").unwrap();
        let commands = vec![
            Command::Move {
                name: "gone".to_string(),
                dest: "dst".to_string(),
            },
            Command::Append {
                name: "gone".to_string(),
                dest: "dst".to_string(),
            },
            Command::Delete {
                name: "gone".to_string(),
            },
            Command::Readonly {
                name: "gone".to_string(),
            },
        ];
        assert_eq!(run(&mut area, commands).unwrap(), 4);
        assert_eq!(fs::read_to_string(area.path("dst")).unwrap(), "keep");
    }

    #[test]
    fn test_append_and_move() {
        let tmp = TempDir::new().unwrap();
        let mut area = checkout(&tmp);
        fs::write(area.path("part"), "two\n").unwrap();
        fs::write(area.path("whole"), "one\n").unwrap();
        fs::write(area.path("staged"), "new").unwrap();
        fs::write(area.path("target"), "old").unwrap();
        set_readonly(&area.path("target"), true).unwrap();
        let commands = vec![
            Command::Append {
                name: "part".to_string(),
                dest: "whole".to_string(),
            },
            Command::Move {
                name: "staged".to_string(),
                dest: "target".to_string(),
            },
        ];
        run(&mut area, commands).unwrap();
        assert_eq!(fs::read_to_string(area.path("whole")).unwrap(), "one\ntwo\n");
        assert_eq!(fs::read_to_string(area.path("target")).unwrap(), "new");
        assert!(!area.path("staged").exists());
    }

    #[test]
    fn test_working_placeholders_resolve_to_disk() {
        let tmp = TempDir::new().unwrap();
        let mut area = checkout(&tmp);
        add_file(&mut area, "t.txt", "twelve bytes");
        let patch = EntryPatch::new()
            .set(EntryField::TextTime, WORKING_TIMESTAMP)
            .set(EntryField::WorkingSize, WORKING_TIMESTAMP);
        run(
            &mut area,
            vec![Command::ModifyEntry {
                name: "t.txt".to_string(),
                patch,
                force: false,
            }],
        )
        .unwrap();
        let entry = area.entry("t.txt", false).unwrap().unwrap();
        let mtime = file_mtime(&area.path("t.txt")).unwrap().unwrap();
        assert_eq!(entry.text_time.map(|t| t.timestamp()), Some(mtime.timestamp()));
        assert_eq!(entry.working_size, Some(12));
    }

    #[test]
    fn test_delete_entry_respects_policy() {
        let tmp = TempDir::new().unwrap();
        let mut area = checkout(&tmp);
        add_file(&mut area, "a.txt", "a");
        let mut log = Log::new(area.admin_dir());
        log.add(Command::DeleteEntry {
            name: "a.txt".to_string(),
        });
        log.save().unwrap();
        let mut ctx = TestContext {
            keep_files: true,
            ..Default::default()
        };
        LogRunner::new().run(&mut area, &mut ctx).unwrap();
        assert!(area.entry("a.txt", true).unwrap().is_none());
        assert!(area.path("a.txt").exists());
        assert!(!area.path(&text_base_path("a.txt", false)).exists());
    }

    #[test]
    fn test_committed_file_installs_base() {
        let tmp = TempDir::new().unwrap();
        let mut area = checkout(&tmp);
        fs::write(area.path("new.txt"), "content\n").unwrap();
        let patch = EntryPatch::new()
            .set(EntryField::Kind, "file")
            .schedule(Schedule::Add);
        area.modify_entry("new.txt", patch, true, false).unwrap();
        fs::write(area.path(&text_base_path("new.txt", true)), "content\n").unwrap();

        run(
            &mut area,
            vec![Command::Committed {
                name: "new.txt".to_string(),
                revision: 6,
                implicit: false,
            }],
        )
        .unwrap();
        let entry = area.entry("new.txt", false).unwrap().unwrap();
        assert_eq!(entry.revision, Some(6));
        assert_eq!(entry.schedule, Schedule::Normal);
        assert!(entry.text_time.is_some());
        let base = area.path(&text_base_path("new.txt", false));
        assert_eq!(fs::read_to_string(&base).unwrap(), "content\n");
        assert!(fs::metadata(&base).unwrap().permissions().readonly());
        assert!(!area.path(&text_base_path("new.txt", true)).exists());
        assert!(!area.has_text_modifications("new.txt", false, false, false).unwrap());
    }

    #[test]
    fn test_committed_directory_notifies_parent() {
        let tmp = TempDir::new().unwrap();
        let mut area = checkout(&tmp);
        let mut log = Log::new(area.admin_dir());
        log.add(Command::Committed {
            name: String::new(),
            revision: 9,
            implicit: false,
        });
        log.save().unwrap();
        let mut ctx = TestContext::default();
        LogRunner::new().run(&mut area, &mut ctx).unwrap();
        assert_eq!(ctx.finished_dirs, vec![(area.root().to_path_buf(), false)]);
        assert_eq!(area.this_dir().unwrap().revision, Some(9));
    }

    #[test]
    fn test_committed_deleted_directory_marks_kill_me() {
        let tmp = TempDir::new().unwrap();
        let mut area = checkout(&tmp);
        area.modify_entry("", EntryPatch::new().schedule(Schedule::Delete), true, false)
            .unwrap();
        run(
            &mut area,
            vec![Command::Committed {
                name: String::new(),
                revision: 9,
                implicit: false,
            }],
        )
        .unwrap();
        assert!(area.is_kill_me());
        assert!(!area.unlock().unwrap());
    }
}
