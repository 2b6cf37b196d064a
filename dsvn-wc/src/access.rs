//! Working-copy session
//!
//! [`WcAccess`] owns every admin area opened for one operation, keyed by
//! directory path. It batches recursive opens, coordinates operations that
//! span several directories (commit finalization, removal, cleanup) and
//! releases all locks it holds when closed or dropped.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

use crate::area::{text_base_path, AdminArea};
use crate::callbacks::{
    AllowDeletion, CancellationToken, DeletionPolicy, Event, EventAction, EventSink, NoOpEventSink,
    TextMerger, WholeFileMerger,
};
use crate::config::WcOptions;
use crate::entry::{format_date, Entry, EntryField, EntryPatch, NodeKind, Schedule, THIS_DIR};
use crate::error::{Result, WcError};
use crate::log::{Command, Log};
use crate::path::ADMIN_DIR;
use crate::props::{write_hash_file, PropDiff, PropSet};
use crate::runner::{LogRunner, RunContext};

type CloseHook = Box<dyn FnOnce(&mut AdminArea) -> Result<()>>;

/// Revision metadata of a finished commit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitInfo {
    pub revision: u64,
    pub date: Option<DateTime<Utc>>,
    pub author: Option<String>,
}

/// Result of [`WcAccess::open_anchor`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorInfo {
    /// Directory the operation is anchored at
    pub anchor: PathBuf,
    /// The path the caller asked for
    pub target: PathBuf,
    /// Name of the target inside the anchor; empty when both coincide
    pub target_name: String,
}

fn normalize(path: &Path) -> PathBuf {
    let normalized: PathBuf = path.components().collect();
    if normalized.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        normalized
    }
}

fn parent_of(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().and_then(|n| n.to_str()).map(str::to_string)
}

/// Drop the lock of an area being discarded, reporting what stays behind.
fn release(area: &mut AdminArea) {
    match area.unlock() {
        Ok(true) => {}
        Ok(false) => warn!("{:?} stays locked: unfinished logs remain", area.root()),
        Err(e) => warn!("Failed to unlock {:?}: {}", area.root(), e),
    }
}

/// A set of admin areas opened together
pub struct WcAccess {
    options: WcOptions,
    /// `None` marks a versioned subdirectory missing on disk
    areas: BTreeMap<PathBuf, Option<AdminArea>>,
    events: Box<dyn EventSink>,
    deletion: Box<dyn DeletionPolicy>,
    merger: Box<dyn TextMerger>,
    close_hooks: BTreeMap<PathBuf, CloseHook>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for WcAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WcAccess")
            .field("options", &self.options)
            .field("areas", &self.areas.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Default for WcAccess {
    fn default() -> Self {
        Self::new(WcOptions::default())
    }
}

impl WcAccess {
    pub fn new(options: WcOptions) -> Self {
        Self {
            options,
            areas: BTreeMap::new(),
            events: Box::new(NoOpEventSink),
            deletion: Box::new(AllowDeletion),
            merger: Box::new(WholeFileMerger),
            close_hooks: BTreeMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_event_sink(mut self, sink: impl EventSink + 'static) -> Self {
        self.events = Box::new(sink);
        self
    }

    pub fn with_deletion_policy(mut self, policy: impl DeletionPolicy + 'static) -> Self {
        self.deletion = Box::new(policy);
        self
    }

    pub fn with_merger(mut self, merger: impl TextMerger + 'static) -> Self {
        self.merger = Box::new(merger);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn options(&self) -> &WcOptions {
        &self.options
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Register a callback run on the area of `dir` right before it is unlocked.
    pub fn on_close(
        &mut self,
        dir: impl AsRef<Path>,
        hook: impl FnOnce(&mut AdminArea) -> Result<()> + 'static,
    ) {
        self.close_hooks.insert(normalize(dir.as_ref()), Box::new(hook));
    }

    /// Directories currently held by the session
    pub fn open_paths(&self) -> Vec<PathBuf> {
        self.areas
            .iter()
            .filter(|(_, area)| area.is_some())
            .map(|(path, _)| path.clone())
            .collect()
    }

    fn notify(&mut self, path: &Path, action: EventAction) {
        self.events.handle_event(&Event::new(path, action));
    }

    // ─────────────────────────────────────────────────────
    // Opening
    // ─────────────────────────────────────────────────────

    /// Open `dir` and, up to `levels` deep (`None` = unlimited), its subdirectories.
    ///
    /// The batch is all or nothing: if any directory fails to open for a
    /// reason other than being missing on disk, every area opened so far is
    /// released and the error returned.
    pub fn open(&mut self, dir: &Path, write_lock: bool, steal: bool, levels: Option<u32>) -> Result<()> {
        let dir = normalize(dir);
        if matches!(self.areas.get(&dir), Some(Some(_))) {
            return Err(WcError::WorkingCopyLocked(dir));
        }
        let mut opened = Vec::new();
        match self.open_batch(&dir, write_lock, steal, levels, &mut opened) {
            Ok(()) => {
                debug!("Opened {} areas under {:?}", opened.len(), dir);
                self.areas.extend(opened);
                Ok(())
            }
            Err(e) => {
                warn!("Opening {:?} failed, releasing {} areas: {}", dir, opened.len(), e);
                if write_lock {
                    for (_, area) in &mut opened {
                        if let Some(area) = area {
                            release(area);
                        }
                    }
                }
                Err(e)
            }
        }
    }

    fn open_batch(
        &mut self,
        dir: &Path,
        write_lock: bool,
        steal: bool,
        levels: Option<u32>,
        opened: &mut Vec<(PathBuf, Option<AdminArea>)>,
    ) -> Result<()> {
        self.cancel.check()?;
        let mut area = AdminArea::open(dir)?.with_options(self.options.clone());
        if write_lock {
            area.lock(steal)?;
        }
        // from here on a failure unwinds this area with the rest of the batch
        opened.push((dir.to_path_buf(), Some(area)));
        let Some((_, Some(area))) = opened.last_mut() else {
            return Ok(());
        };
        if write_lock {
            self.auto_upgrade(area)?;
        }

        let subdirs: Vec<String> = if levels == Some(0) {
            Vec::new()
        } else {
            area.entries(false)?
                .into_iter()
                .filter(|e| e.is_dir() && !e.is_this_dir())
                .map(|e| e.name)
                .collect()
        };

        for name in subdirs {
            let child = dir.join(&name);
            if self.areas.contains_key(&child) {
                continue;
            }
            if !child.is_dir() {
                debug!("Versioned directory {:?} is missing", child);
                opened.push((child, None));
                continue;
            }
            self.open_batch(&child, write_lock, steal, levels.map(|l| l - 1), opened)?;
        }
        Ok(())
    }

    fn auto_upgrade(&mut self, area: &mut AdminArea) -> Result<()> {
        if !self.options.auto_upgrade || !area.needs_upgrade() {
            return Ok(());
        }
        if area.upgrade(self.options.target_generation)? {
            LogRunner::new().run(area, self)?;
            let root = area.root().to_path_buf();
            self.notify(&root, EventAction::Upgraded);
        }
        Ok(())
    }

    /// Open the versioned directory containing `path`.
    ///
    /// A file or unversioned directory resolves to its parent, opened
    /// without descending. Returns the directory actually opened.
    pub fn probe_open(&mut self, path: &Path, write_lock: bool, steal: bool, levels: Option<u32>) -> Result<PathBuf> {
        if matches!(path.components().next_back(), Some(Component::CurDir | Component::ParentDir)) {
            return Err(WcError::BadPath(path.to_path_buf()));
        }
        let path = normalize(path);
        let (dir, levels) = if path.join(ADMIN_DIR).is_dir() {
            (path.clone(), levels)
        } else {
            (parent_of(&path), Some(0))
        };
        match self.open(&dir, write_lock, steal, levels) {
            Err(e) if e.is_not_working_copy() => Err(WcError::NotAWorkingCopy(path)),
            other => other.map(|()| dir),
        }
    }

    /// Open the parent of `path` together with `path` itself.
    ///
    /// When only one of the two can be opened the session falls back to
    /// that one; a versioned target that is a working-copy root or a
    /// switched subtree anchors at itself.
    pub fn open_anchor(&mut self, path: &Path, write_lock: bool, levels: Option<u32>) -> Result<AnchorInfo> {
        let path = normalize(path);
        let single = |path: &Path| AnchorInfo {
            anchor: path.to_path_buf(),
            target: path.to_path_buf(),
            target_name: String::new(),
        };
        let Some(name) = file_name(&path) else {
            self.open(&path, write_lock, false, levels)?;
            return Ok(single(&path));
        };
        let parent = parent_of(&path);
        let anchored = AnchorInfo {
            anchor: parent.clone(),
            target: path.clone(),
            target_name: name,
        };

        let parent_err = self.open(&parent, write_lock, false, Some(0)).err();
        if !path.join(ADMIN_DIR).is_dir() {
            return match parent_err {
                Some(e) => Err(e),
                None => Ok(anchored),
            };
        }

        let target_err = self.open(&path, write_lock, false, levels).err();
        match (parent_err, target_err) {
            (Some(_), Some(e)) => Err(e),
            (Some(e), None) => {
                debug!("Anchoring at {:?}: parent unavailable: {}", path, e);
                Ok(single(&path))
            }
            (None, Some(e)) => {
                debug!("Anchoring at {:?} without its target: {}", parent, e);
                Ok(anchored)
            }
            (None, None) => {
                if self.is_wc_root(&path)? {
                    self.close_area(&parent, false)?;
                    Ok(single(&path))
                } else {
                    Ok(anchored)
                }
            }
        }
    }

    // ─────────────────────────────────────────────────────
    // Lookup
    // ─────────────────────────────────────────────────────

    /// The open area of `dir`.
    pub fn retrieve(&mut self, dir: &Path) -> Result<&mut AdminArea> {
        let key = normalize(dir);
        match self.areas.get_mut(&key) {
            Some(Some(area)) => Ok(area),
            _ => Err(WcError::NotLocked(key)),
        }
    }

    /// The open area of `path` if it is a directory in the session, otherwise of its parent.
    pub fn probe_retrieve(&mut self, path: &Path) -> Result<&mut AdminArea> {
        let key = normalize(path);
        let dir = if matches!(self.areas.get(&key), Some(Some(_))) {
            key
        } else {
            parent_of(&key)
        };
        self.retrieve(&dir)
    }

    /// Versioned directory recorded as missing on disk
    pub fn is_missing(&self, path: &Path) -> bool {
        matches!(self.areas.get(&normalize(path)), Some(None))
    }

    /// Entry for `path`: a directory's own entry when it is open, otherwise
    /// the entry in its parent.
    pub fn entry(&mut self, path: &Path, show_hidden: bool) -> Result<Option<Entry>> {
        let key = normalize(path);
        if let Some(Some(area)) = self.areas.get_mut(&key) {
            if let Some(entry) = area.entry(THIS_DIR, show_hidden)? {
                return Ok(Some(entry));
            }
        }
        let Some(name) = file_name(&key) else {
            return Ok(None);
        };
        match self.areas.get_mut(&parent_of(&key)) {
            Some(Some(area)) => area.entry(&name, show_hidden),
            _ => Ok(None),
        }
    }

    fn read_entry(&mut self, dir: &Path, name: &str) -> Result<Option<Entry>> {
        match self.areas.get_mut(dir) {
            Some(Some(area)) => area.entry(name, true),
            _ => AdminArea::open(dir)?.entry(name, true),
        }
    }

    /// Whether `path` is the top of a working copy or a switched subtree.
    pub fn is_wc_root(&mut self, path: &Path) -> Result<bool> {
        let path = normalize(path);
        let Some(name) = file_name(&path) else {
            return Ok(true);
        };
        let this_dir = self
            .read_entry(&path, THIS_DIR)?
            .ok_or_else(|| WcError::NotAWorkingCopy(path.clone()))?;
        let parent = parent_of(&path);
        if !parent.join(ADMIN_DIR).is_dir() {
            return Ok(true);
        }
        let parent_dir = match self.read_entry(&parent, THIS_DIR) {
            Ok(Some(entry)) => entry,
            Ok(None) => return Ok(true),
            Err(e) if e.is_not_working_copy() => return Ok(true),
            Err(e) => return Err(e),
        };
        match self.read_entry(&parent, &name)? {
            Some(entry) if entry.is_dir() => {}
            _ => return Ok(true),
        }
        Ok(match (parent_dir.url, this_dir.url) {
            (Some(parent_url), Some(url)) => Entry::expected_url(&parent_url, &name) != url,
            _ => false,
        })
    }

    // ─────────────────────────────────────────────────────
    // Closing
    // ─────────────────────────────────────────────────────

    /// Release `dir`, and with `recursive` every open area below it.
    ///
    /// Close hooks run before unlocking. Areas with unfinished logs stay
    /// locked on disk.
    pub fn close_area(&mut self, dir: &Path, recursive: bool) -> Result<()> {
        let key = normalize(dir);
        let keys: Vec<PathBuf> = if recursive {
            self.areas.keys().filter(|k| k.starts_with(&key)).cloned().collect()
        } else {
            vec![key]
        };
        // children before parents
        for key in keys.into_iter().rev() {
            let Some(slot) = self.areas.remove(&key) else {
                continue;
            };
            let Some(mut area) = slot else {
                continue;
            };
            if let Some(hook) = self.close_hooks.remove(&key) {
                if let Err(e) = hook(&mut area) {
                    self.areas.insert(key, Some(area));
                    return Err(e);
                }
            }
            if area.is_locked() && !area.unlock()? {
                info!("{:?} stays locked: unfinished logs remain", key);
            }
        }
        Ok(())
    }

    /// Release every area of the session.
    pub fn close(&mut self) -> Result<()> {
        let roots: Vec<PathBuf> = self.areas.keys().rev().cloned().collect();
        for root in roots {
            self.close_area(&root, false)?;
        }
        Ok(())
    }

    fn with_taken<T>(
        &mut self,
        dir: &Path,
        f: impl FnOnce(&mut Self, &mut AdminArea) -> Result<T>,
    ) -> Result<T> {
        let key = normalize(dir);
        let Some(mut area) = self.areas.get_mut(&key).and_then(Option::take) else {
            return Err(WcError::NotLocked(key));
        };
        let result = f(self, &mut area);
        self.put_area(key, area);
        result
    }

    fn put_area(&mut self, key: PathBuf, area: AdminArea) {
        if area.is_destroyed() {
            self.areas.remove(&key);
            self.close_hooks.remove(&key);
        } else {
            self.areas.insert(key, Some(area));
        }
    }

    // ─────────────────────────────────────────────────────
    // Logs
    // ─────────────────────────────────────────────────────

    /// Replay the pending logs of `dir`, then honour a kill-me sentinel.
    pub fn run_logs(&mut self, dir: &Path) -> Result<()> {
        self.with_taken(dir, |access, area| {
            let executed = LogRunner::new().run(area, access)?;
            if area.is_kill_me() {
                access.handle_kill_me(area)?;
            }
            if executed > 0 {
                let root = area.root().to_path_buf();
                access.notify(&root, EventAction::LogsReplayed);
            }
            Ok(())
        })
    }

    fn handle_kill_me(&mut self, area: &mut AdminArea) -> Result<()> {
        let dir = area.root().to_path_buf();
        let revision = area.this_dir()?.revision.unwrap_or(0);
        info!("Removing {:?}: its deletion was committed in r{}", dir, revision);
        match self.remove_tree(area, true, false) {
            Ok(()) | Err(WcError::LocalModificationsPresent(_)) => {}
            Err(e) => return Err(e),
        }

        let Some(name) = file_name(&dir) else {
            return Ok(());
        };
        let parent = parent_of(&dir);
        let Some(Some(parent_area)) = self.areas.get_mut(&parent) else {
            debug!("Parent of {:?} is not open, leaving its entry for '{}' as is", dir, name);
            return Ok(());
        };
        if !parent_area.is_locked() {
            debug!("Parent of {:?} is not locked, leaving its entry for '{}' as is", dir, name);
            return Ok(());
        }
        let parent_revision = parent_area.this_dir()?.revision.unwrap_or(0);
        parent_area.delete_entry(&name)?;
        if revision > parent_revision {
            let tombstone = parent_area.add_entry(&name)?;
            tombstone.kind = NodeKind::Dir;
            tombstone.deleted = true;
            tombstone.revision = Some(revision);
        }
        parent_area.save_entries(false)
    }

    // ─────────────────────────────────────────────────────
    // Removal
    // ─────────────────────────────────────────────────────

    /// Take `name` in `dir` (or the whole directory for the self-entry) out
    /// of revision control.
    ///
    /// Locally modified files are kept on disk; unless
    /// `report_instant_error` is set, the removal finishes first and
    /// `LocalModificationsPresent` is returned at the end.
    pub fn remove_from_revision_control(
        &mut self,
        dir: &Path,
        name: &str,
        delete_working_files: bool,
        report_instant_error: bool,
    ) -> Result<()> {
        self.cancel.check()?;
        let dir = normalize(dir);
        if name == THIS_DIR {
            return self.with_taken(&dir, |access, area| {
                access.remove_tree(area, delete_working_files, report_instant_error)
            });
        }

        let entry = self
            .retrieve(&dir)?
            .entry(name, true)?
            .ok_or_else(|| WcError::EntryNotFound {
                dir: dir.clone(),
                name: name.to_string(),
            })?;
        let path = dir.join(name);
        if entry.is_dir() {
            let result = self.remove_subtree(&path, delete_working_files, report_instant_error);
            if let Err(e) = &result {
                if !matches!(e, WcError::LocalModificationsPresent(_)) {
                    return result;
                }
            }
            let area = self.retrieve(&dir)?;
            area.delete_entry(name)?;
            area.save_entries(false)?;
            return result;
        }

        let delete = delete_working_files && self.deletion.allow_delete(&path, NodeKind::File);
        let result = self
            .retrieve(&dir)?
            .remove_file_from_revision_control(name, delete, report_instant_error);
        match &result {
            Ok(()) => self.notify(&path, EventAction::Removed),
            Err(WcError::LocalModificationsPresent(_)) => self.notify(&path, EventAction::KeptModified),
            Err(_) => {}
        }
        result
    }

    fn remove_subtree(&mut self, dir: &Path, delete_working_files: bool, report: bool) -> Result<()> {
        let key = normalize(dir);
        if matches!(self.areas.get(&key), Some(Some(_))) {
            return self.with_taken(&key, |access, area| access.remove_tree(area, delete_working_files, report));
        }
        if !key.join(ADMIN_DIR).is_dir() {
            return Ok(());
        }
        let mut area = AdminArea::open(&key)?.with_options(self.options.clone());
        area.lock(false)?;
        let result = self.remove_tree(&mut area, delete_working_files, report);
        if !area.is_destroyed() {
            area.unlock()?;
        }
        result
    }

    fn remove_tree(&mut self, area: &mut AdminArea, delete_working_files: bool, report: bool) -> Result<()> {
        let dir = area.root().to_path_buf();
        // an interrupted removal leaves an incomplete, not a healthy-looking, directory
        area.modify_entry(THIS_DIR, EntryPatch::new().flag(EntryField::Incomplete, true), true, true)?;

        let mut kept_modified = false;
        for entry in area.entries(true)? {
            if entry.is_this_dir() {
                continue;
            }
            self.cancel.check()?;
            let path = area.path(&entry.name);
            match entry.kind {
                NodeKind::File => {
                    let delete = delete_working_files && self.deletion.allow_delete(&path, NodeKind::File);
                    match area.remove_file_from_revision_control(&entry.name, delete, report) {
                        Ok(()) => self.notify(&path, EventAction::Removed),
                        Err(WcError::LocalModificationsPresent(_)) if !report => {
                            kept_modified = true;
                            self.notify(&path, EventAction::KeptModified);
                        }
                        Err(e) => return Err(e),
                    }
                }
                NodeKind::Dir => {
                    match self.remove_subtree(&path, delete_working_files, report) {
                        Ok(()) => {}
                        Err(WcError::LocalModificationsPresent(_)) if !report => kept_modified = true,
                        Err(e) => return Err(e),
                    }
                    area.delete_entry(&entry.name)?;
                }
                NodeKind::None => {
                    area.delete_entry(&entry.name)?;
                }
            }
        }

        area.save_entries(false)?;
        area.destroy()?;
        if delete_working_files && !kept_modified && self.deletion.allow_delete(&dir, NodeKind::Dir) {
            if let Err(e) = fs::remove_dir(&dir) {
                debug!("Left {:?} on disk: {}", dir, e);
            }
        }
        self.notify(&dir, EventAction::Removed);
        if kept_modified {
            Err(WcError::LocalModificationsPresent(dir))
        } else {
            Ok(())
        }
    }

    // ─────────────────────────────────────────────────────
    // Commit finalization
    // ─────────────────────────────────────────────────────

    /// Finalize a commit of `name` in `dir`.
    ///
    /// Stages the commit metadata, base checksum, lock removal and server
    /// property changes as one log and runs it. With `recursive` on a
    /// directory, subdirectories and then the files of the directory are
    /// finalized before the directory's own entry.
    pub fn process_committed(
        &mut self,
        dir: &Path,
        name: &str,
        info: &CommitInfo,
        wc_prop_changes: &PropDiff,
        remove_lock: bool,
        recursive: bool,
    ) -> Result<()> {
        self.cancel.check()?;
        let dir = normalize(dir);
        if name != THIS_DIR {
            let entry = self
                .retrieve(&dir)?
                .entry(name, true)?
                .ok_or_else(|| WcError::EntryNotFound {
                    dir: dir.clone(),
                    name: name.to_string(),
                })?;
            if entry.is_dir() {
                return self.process_committed(&dir.join(name), THIS_DIR, info, wc_prop_changes, remove_lock, recursive);
            }
        }

        let recurse = name == THIS_DIR && recursive;
        if recurse {
            let subdirs: Vec<String> = self
                .retrieve(&dir)?
                .entries(true)?
                .into_iter()
                .filter(|e| e.is_dir() && !e.is_this_dir())
                .map(|e| e.name)
                .collect();
            for sub in subdirs {
                let child = dir.join(&sub);
                if matches!(self.areas.get(&child), Some(Some(_))) {
                    self.process_committed(&child, THIS_DIR, info, &PropDiff::new(), remove_lock, true)?;
                }
            }
        }

        self.with_taken(&dir, |_, area| {
            let mut log = Log::new(area.admin_dir());
            if recurse {
                for child in area.entries(true)? {
                    if child.is_file() {
                        stage_commit(area, &mut log, &child.name, info, None, remove_lock, true)?;
                    }
                }
            }
            stage_commit(area, &mut log, name, info, Some(wc_prop_changes), remove_lock, false)?;
            log.save()?;
            Ok(())
        })?;
        self.run_logs(&dir)?;
        self.notify(&dir.join(name), EventAction::Committed);
        Ok(())
    }

    // ─────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────

    /// Migrate `dir` to the configured generation; `false` when nothing was done.
    pub fn upgrade(&mut self, dir: &Path) -> Result<bool> {
        let target = self.options.target_generation;
        let staged = self.retrieve(dir)?.upgrade(target)?;
        if staged {
            self.run_logs(dir)?;
            self.notify(dir, EventAction::Upgraded);
        }
        Ok(staged)
    }

    /// Recover the working copy at `path` after an interruption.
    ///
    /// Subdirectories first; each directory's lock is broken, pending logs
    /// and kill-me removals completed, text timestamps refreshed and `tmp/`
    /// emptied.
    pub fn cleanup(&mut self, path: &Path) -> Result<()> {
        let key = normalize(path);
        let owned = !matches!(self.areas.get(&key), Some(Some(_)));
        if owned {
            let mut area = AdminArea::open(&key)?.with_options(self.options.clone());
            let stale = area.admin_dir().join("lock").is_file();
            area.lock(true)?;
            self.areas.insert(key.clone(), Some(area));
            if stale {
                self.notify(&key, EventAction::LockBroken);
            }
        }

        let subdirs: Vec<String> = self
            .retrieve(&key)?
            .entries(false)?
            .into_iter()
            .filter(|e| e.is_dir() && !e.is_this_dir())
            .map(|e| e.name)
            .collect();
        for sub in subdirs {
            self.cancel.check()?;
            let child = key.join(&sub);
            if !child.join(ADMIN_DIR).is_dir() {
                continue;
            }
            debug!("Cleaning up {:?}", child);
            if let Err(e) = self.cleanup(&child) {
                if self.options.safe_cleanup && !matches!(e, WcError::Cancelled) {
                    warn!("Cleanup of {:?} failed, continuing: {}", child, e);
                } else {
                    return Err(e);
                }
            }
        }

        self.run_logs(&key)?;
        if let Some(Some(area)) = self.areas.get_mut(&key) {
            for entry in area.entries(false)? {
                if entry.is_file() {
                    area.has_text_modifications(&entry.name, false, false, false)?;
                }
            }
            area.clear_tmp()?;
        }
        if owned {
            self.close_area(&key, false)?;
        }
        Ok(())
    }

    /// Point `dir` (and with `recursive` its open subdirectories) at `new_url`.
    pub fn update_url(&mut self, dir: &Path, new_url: &str, recursive: bool) -> Result<()> {
        let key = normalize(dir);
        let area = self.retrieve(&key)?;
        let repos = area.this_dir()?.repos;
        let mut subdirs = Vec::new();
        for entry in area.entries(true)? {
            if entry.is_this_dir() {
                area.tweak_entry(THIS_DIR, Some(new_url), repos.as_deref(), None, false)?;
                continue;
            }
            let url = Entry::expected_url(new_url, &entry.name);
            if entry.is_dir() {
                if recursive {
                    subdirs.push((entry.name, url));
                }
                continue;
            }
            area.tweak_entry(&entry.name, Some(&url), repos.as_deref(), None, false)?;
        }
        area.save_entries(false)?;

        for (name, url) in subdirs {
            let child = key.join(&name);
            if matches!(self.areas.get(&child), Some(Some(_))) {
                self.update_url(&child, &url, true)?;
            }
        }
        Ok(())
    }
}

/// Stage the finalization commands of one entry into `log`.
fn stage_commit(
    area: &mut AdminArea,
    log: &mut Log,
    name: &str,
    info: &CommitInfo,
    wc_prop_changes: Option<&PropDiff>,
    remove_lock: bool,
    implicit: bool,
) -> Result<()> {
    let entry = area.entry(name, true)?.unwrap_or_default();
    let mut patch = EntryPatch::new().revision(EntryField::CommittedRev, info.revision);
    patch.insert(EntryField::CommittedDate, info.date.map(|d| format_date(&d)));
    patch.insert(EntryField::LastAuthor, info.author.clone());
    if name != THIS_DIR {
        let tmp_base = area.path(&text_base_path(name, true));
        let base = area.path(&text_base_path(name, false));
        let source = [tmp_base, base].into_iter().find(|p| p.is_file());
        if let Some(source) = source {
            patch = patch.set(EntryField::Checksum, format!("{:x}", md5::compute(fs::read(&source)?)));
        }
    }
    log.add(Command::ModifyEntry {
        name: name.to_string(),
        patch,
        force: true,
    });
    if remove_lock {
        log.add(Command::DeleteLock { name: name.to_string() });
    }

    // the working properties become the new base
    if entry.schedule == Schedule::Replace || area.has_prop_modifications(name)? {
        let working = area.props(PropSet::Working, name)?.as_map().clone();
        let tmp = area.path(&area.prop_path(PropSet::Working, name, true));
        write_hash_file(&tmp, &working)?;
    }
    log.add(Command::Committed {
        name: name.to_string(),
        revision: info.revision,
        implicit,
    });

    if let (Some(changes), false) = (wc_prop_changes, entry.schedule == Schedule::Delete) {
        for (prop, value) in changes {
            log.add(Command::ModifyWcProperty {
                name: name.to_string(),
                prop: prop.clone(),
                value: value.clone(),
            });
        }
    }
    Ok(())
}

impl RunContext for WcAccess {
    fn merger(&mut self) -> &mut dyn TextMerger {
        self.merger.as_mut()
    }

    fn allow_delete(&self, path: &Path, kind: NodeKind) -> bool {
        self.deletion.allow_delete(path, kind)
    }

    fn remove_directory(&mut self, path: &Path) -> Result<()> {
        self.remove_subtree(path, true, false)
    }

    fn finish_directory_commit(&mut self, dir: &Path, implicit: bool) -> Result<()> {
        let key = normalize(dir);
        if self.is_wc_root(&key)? {
            return Ok(());
        }
        let Some(name) = file_name(&key) else {
            return Ok(());
        };
        let Some(Some(parent)) = self.areas.get_mut(&parent_of(&key)) else {
            return Ok(());
        };
        if !parent.is_locked() {
            return Ok(());
        }
        let mut patch = EntryPatch::new()
            .flag(EntryField::Copied, false)
            .flag(EntryField::Deleted, false)
            .clear(EntryField::CopyfromUrl)
            .clear(EntryField::CopyfromRev);
        if !implicit {
            patch = patch.clear(EntryField::Schedule);
        }
        parent.modify_entry(&name, patch, true, true)
    }
}

impl Drop for WcAccess {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to release working copy locks: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Depth;
    use std::cell::RefCell;
    use std::rc::Rc;
    use tempfile::TempDir;

    const URL: &str = "http://host/repos/trunk";
    const ROOT: &str = "http://host/repos";

    fn add_file(area: &mut AdminArea, name: &str, text: &str) {
        fs::write(area.path(name), text).unwrap();
        fs::write(area.path(&text_base_path(name, false)), text).unwrap();
        area.modify_entry(name, EntryPatch::new().set(EntryField::Kind, "file"), true, true)
            .unwrap();
    }

    /// `wc/` with `a.txt` and `sub/` holding `b.txt`, all at r5
    fn make_wc(tmp: &TempDir) -> PathBuf {
        let root = tmp.path().join("wc");
        let options = WcOptions::default();
        let mut area =
            AdminArea::create_versioned_directory(&root, URL, Some(ROOT), Some("uuid"), 5, Depth::Infinity, &options)
                .unwrap();
        area.lock(false).unwrap();
        area.modify_entry(THIS_DIR, EntryPatch::new().flag(EntryField::Incomplete, false), false, true)
            .unwrap();
        add_file(&mut area, "a.txt", "alpha\n");
        area.modify_entry("sub", EntryPatch::new().set(EntryField::Kind, "dir"), true, true)
            .unwrap();
        area.unlock().unwrap();

        let sub_url = format!("{}/sub", URL);
        let mut sub = AdminArea::create_versioned_directory(
            &root.join("sub"),
            &sub_url,
            Some(ROOT),
            Some("uuid"),
            5,
            Depth::Infinity,
            &options,
        )
        .unwrap();
        sub.lock(false).unwrap();
        sub.modify_entry(THIS_DIR, EntryPatch::new().flag(EntryField::Incomplete, false), false, true)
            .unwrap();
        add_file(&mut sub, "b.txt", "beta\n");
        sub.unlock().unwrap();
        root
    }

    #[test]
    fn test_open_recursive_and_close() {
        let tmp = TempDir::new().unwrap();
        let root = make_wc(&tmp);
        let mut access = WcAccess::default();
        access.open(&root, true, false, None).unwrap();
        assert_eq!(access.open_paths(), vec![root.clone(), root.join("sub")]);
        assert!(root.join(".svn/lock").exists());
        assert!(root.join("sub/.svn/lock").exists());

        assert!(matches!(
            access.open(&root, true, false, None),
            Err(WcError::WorkingCopyLocked(_))
        ));

        access.close().unwrap();
        assert!(!root.join(".svn/lock").exists());
        assert!(!root.join("sub/.svn/lock").exists());
    }

    #[test]
    fn test_failed_batch_is_unwound() {
        let tmp = TempDir::new().unwrap();
        let root = make_wc(&tmp);
        let entries = root.join("sub/.svn/entries");
        crate::path::set_readonly(&entries, false).unwrap();
        fs::write(&entries, "99\n").unwrap();

        let mut access = WcAccess::default();
        assert!(access.open(&root, true, false, None).is_err());
        assert!(access.open_paths().is_empty());
        assert!(!root.join(".svn/lock").exists());
    }

    #[test]
    fn test_failed_batch_keeps_areas_with_pending_logs_locked() {
        let tmp = TempDir::new().unwrap();
        let root = make_wc(&tmp);
        let entries = root.join("sub/.svn/entries");
        crate::path::set_readonly(&entries, false).unwrap();
        fs::write(&entries, "10\n\ndir\nnot-a-revision\n\x0c\n").unwrap();
        fs::write(root.join("sub/.svn/log"), "").unwrap();

        let mut access = WcAccess::default();
        let err = access.open(&root, true, false, None).unwrap_err();
        assert!(matches!(err, WcError::MalformedRecord { .. }));
        assert!(access.open_paths().is_empty());
        assert!(!root.join(".svn/lock").exists());
        assert!(root.join("sub/.svn/lock").exists());
    }

    #[test]
    fn test_missing_subdirectory() {
        let tmp = TempDir::new().unwrap();
        let root = make_wc(&tmp);
        fs::remove_dir_all(root.join("sub")).unwrap();
        let mut access = WcAccess::default();
        access.open(&root, false, false, None).unwrap();
        assert!(access.is_missing(&root.join("sub")));
        assert!(access.retrieve(&root.join("sub")).is_err());
    }

    #[test]
    fn test_probe_open_resolves_files_to_parent() {
        let tmp = TempDir::new().unwrap();
        let root = make_wc(&tmp);
        let mut access = WcAccess::default();
        let dir = access.probe_open(&root.join("a.txt"), false, false, None).unwrap();
        assert_eq!(dir, root);
        assert_eq!(access.open_paths(), vec![root.clone()]);
        assert!(access.probe_retrieve(&root.join("a.txt")).is_ok());

        assert!(matches!(
            access.probe_open(&root.join(".."), false, false, None),
            Err(WcError::BadPath(_))
        ));
        assert!(access
            .probe_open(tmp.path(), false, false, None)
            .unwrap_err()
            .is_not_working_copy());
    }

    #[test]
    fn test_open_anchor() {
        let tmp = TempDir::new().unwrap();
        let root = make_wc(&tmp);

        let mut access = WcAccess::default();
        let anchor = access.open_anchor(&root.join("sub"), true, None).unwrap();
        assert_eq!(anchor.anchor, root);
        assert_eq!(anchor.target_name, "sub");
        access.close().unwrap();

        let anchor = access.open_anchor(&root, true, None).unwrap();
        assert_eq!(anchor.anchor, root);
        assert!(anchor.target_name.is_empty());
        assert!(access.is_wc_root(&root).unwrap());
        assert!(!access.is_wc_root(&root.join("sub")).unwrap());
    }

    #[test]
    fn test_entry_lookup() {
        let tmp = TempDir::new().unwrap();
        let root = make_wc(&tmp);
        let mut access = WcAccess::default();
        access.open(&root, false, false, None).unwrap();
        let file = access.entry(&root.join("a.txt"), false).unwrap().unwrap();
        assert_eq!(file.name, "a.txt");
        let dir = access.entry(&root.join("sub"), false).unwrap().unwrap();
        assert_eq!(dir.url.as_deref(), Some("http://host/repos/trunk/sub"));
        assert!(access.entry(&root.join("nope"), false).unwrap().is_none());
    }

    #[test]
    fn test_close_hook_runs_before_unlock() {
        let tmp = TempDir::new().unwrap();
        let root = make_wc(&tmp);
        let mut access = WcAccess::default();
        access.open(&root, true, false, Some(0)).unwrap();
        let seen = Rc::new(RefCell::new(false));
        let flag = seen.clone();
        access.on_close(&root, move |area| {
            *flag.borrow_mut() = area.is_locked();
            Ok(())
        });
        access.close_area(&root, true).unwrap();
        assert!(*seen.borrow());
    }

    #[test]
    fn test_drop_releases_locks() {
        let tmp = TempDir::new().unwrap();
        let root = make_wc(&tmp);
        {
            let mut access = WcAccess::default();
            access.open(&root, true, false, None).unwrap();
        }
        assert!(!root.join(".svn/lock").exists());
        assert!(!root.join("sub/.svn/lock").exists());
    }

    #[test]
    fn test_remove_keeps_modified_files() {
        let tmp = TempDir::new().unwrap();
        let root = make_wc(&tmp);
        fs::write(root.join("sub/b.txt"), "edited\n").unwrap();
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = events.clone();
        let mut access =
            WcAccess::default().with_event_sink(move |e: &Event| sink.borrow_mut().push(e.action));
        access.open(&root, true, false, None).unwrap();

        let err = access
            .remove_from_revision_control(&root, "sub", true, false)
            .unwrap_err();
        assert!(matches!(err, WcError::LocalModificationsPresent(_)));
        assert!(root.join("sub/b.txt").exists());
        assert!(!root.join("sub/.svn").exists());
        assert!(access.entry(&root.join("sub"), true).unwrap().is_none());
        assert!(events.borrow().contains(&EventAction::KeptModified));
    }

    #[test]
    fn test_process_committed_file() {
        let tmp = TempDir::new().unwrap();
        let root = make_wc(&tmp);
        let mut access = WcAccess::default();
        access.open(&root, true, false, None).unwrap();
        fs::write(root.join("a.txt"), "alpha 2\n").unwrap();
        fs::write(root.join(".svn/tmp/text-base/a.txt.svn-base"), "alpha 2\n").unwrap();

        let info = CommitInfo {
            revision: 6,
            date: None,
            author: Some("bob".to_string()),
        };
        let mut wc_props = PropDiff::new();
        wc_props.insert(
            "svn:wc:ra_dav:version-url".to_string(),
            Some("/repos/!svn/ver/6/trunk/a.txt".to_string()),
        );
        access.process_committed(&root, "a.txt", &info, &wc_props, false, false).unwrap();

        let area = access.retrieve(&root).unwrap();
        let entry = area.entry("a.txt", false).unwrap().unwrap();
        assert_eq!(entry.revision, Some(6));
        assert_eq!(entry.committed_rev, Some(6));
        assert_eq!(entry.last_author.as_deref(), Some("bob"));
        assert_eq!(entry.checksum, Some(format!("{:x}", md5::compute("alpha 2\n"))));
        assert_eq!(
            area.props(PropSet::Wc, "a.txt").unwrap().get("svn:wc:ra_dav:version-url"),
            Some("/repos/!svn/ver/6/trunk/a.txt")
        );
        assert!(!area.has_logs().unwrap());
    }

    #[test]
    fn test_cleanup_breaks_stale_locks() {
        let tmp = TempDir::new().unwrap();
        let root = make_wc(&tmp);
        fs::write(root.join("sub/.svn/lock"), "").unwrap();
        fs::write(root.join(".svn/tmp/leftover"), "x").unwrap();

        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = events.clone();
        let mut access =
            WcAccess::default().with_event_sink(move |e: &Event| sink.borrow_mut().push(e.clone()));
        access.cleanup(&root).unwrap();

        assert!(!root.join("sub/.svn/lock").exists());
        assert!(!root.join(".svn/lock").exists());
        assert!(!root.join(".svn/tmp/leftover").exists());
        assert!(events
            .borrow()
            .contains(&Event::new(root.join("sub"), EventAction::LockBroken)));
    }

    #[test]
    fn test_update_url() {
        let tmp = TempDir::new().unwrap();
        let root = make_wc(&tmp);
        let mut access = WcAccess::default();
        access.open(&root, true, false, None).unwrap();
        access.update_url(&root, "http://host/repos/branches/b1", true).unwrap();
        assert_eq!(
            access.entry(&root.join("sub/b.txt"), false).unwrap().unwrap().url.as_deref(),
            Some("http://host/repos/branches/b1/sub/b.txt")
        );
        assert_eq!(
            access.retrieve(&root).unwrap().this_dir().unwrap().url.as_deref(),
            Some("http://host/repos/branches/b1")
        );
    }
}
