//! Administrative area of one versioned directory
//!
//! An [`AdminArea`] owns the `.svn` directory of a working-copy directory:
//! the entries store, the four property sets of every entry and the
//! advisory lock. Entries and properties are read on first use and kept in
//! the area's [`AreaCache`] until saved or closed.
//!
//! Multi-step changes to versioned properties are never written in place;
//! they are staged as log commands and applied by the log runner.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::callbacks::{MergeOutcome, MergeRequest, TextMerger};
use crate::config::WcOptions;
use crate::entry::{Depth, Entry, EntryField, EntryPatch, NodeKind, Schedule, THIS_DIR};
use crate::error::{Result, WcError};
use crate::format::{self, Entries, Generation};
use crate::log::{log_files, Command, Log, WORKING_TIMESTAMP};
use crate::merge::{merge_props, reject_text, MergeStatus};
use crate::path::{
    file_mtime, install_file, make_writable, remove_if_exists, set_executable, set_file_mtime,
    set_readonly, unique_name, url_is_ancestor, ADMIN_DIR,
};
use crate::props::{
    parse_all_wcprops, read_hash_file, render_all_wcprops, render_hash, svn_props, write_hash_file,
    PropDiff, PropMap, PropSet, VersionedProps,
};
use crate::translate::{
    normal_form, translate_bytes, translate_file, Direction, KeywordSource, Translation,
};

const ENTRIES: &str = "entries";
const FORMAT: &str = "format";
const LOCK: &str = "lock";
const KILL_ME: &str = "KILLME";
const TMP: &str = "tmp";

/// Subdirectories every admin directory carries
const ADMIN_SUBDIRS: &[&str] = &[
    "tmp",
    "tmp/props",
    "tmp/prop-base",
    "tmp/text-base",
    "props",
    "prop-base",
    "text-base",
];

/// Leftovers of the XML generation removed by an upgrade
const XML_ONLY_FILES: &[&str] = &["README.txt", "empty-file", "dir-wcprops"];
const XML_ONLY_DIRS: &[&str] = &["wcprops", "tmp/wcprops"];

/// Admin file path relative to the versioned directory.
fn admin_rel(tmp: bool, rel: &str) -> String {
    if tmp {
        format!("{}/{}/{}", ADMIN_DIR, TMP, rel)
    } else {
        format!("{}/{}", ADMIN_DIR, rel)
    }
}

/// Text-base path of `name`, relative to the versioned directory
pub fn text_base_path(name: &str, tmp: bool) -> String {
    admin_rel(tmp, &format!("text-base/{}.svn-base", name))
}

fn dirty(props: PropMap) -> VersionedProps {
    let mut props = VersionedProps::from_map(props);
    props.set_modified(true);
    props
}

/// Loaded state of one admin area
#[derive(Debug, Default)]
pub struct AreaCache {
    entries: Option<Entries>,
    working: BTreeMap<String, VersionedProps>,
    base: BTreeMap<String, VersionedProps>,
    revert: BTreeMap<String, VersionedProps>,
    wc: BTreeMap<String, VersionedProps>,
    /// `all-wcprops` has been read into `wc`
    wc_loaded: bool,
}

impl AreaCache {
    pub fn entries_loaded(&self) -> bool {
        self.entries.is_some()
    }

    fn props(&self, set: PropSet) -> &BTreeMap<String, VersionedProps> {
        match set {
            PropSet::Working => &self.working,
            PropSet::Base => &self.base,
            PropSet::Revert => &self.revert,
            PropSet::Wc => &self.wc,
        }
    }

    fn props_mut(&mut self, set: PropSet) -> &mut BTreeMap<String, VersionedProps> {
        match set {
            PropSet::Working => &mut self.working,
            PropSet::Base => &mut self.base,
            PropSet::Revert => &mut self.revert,
            PropSet::Wc => &mut self.wc,
        }
    }

    fn modified_names(&self, set: PropSet) -> Vec<String> {
        self.props(set)
            .iter()
            .filter(|(_, props)| props.is_modified())
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn set_clean(&mut self, set: PropSet, name: &str) {
        if let Some(props) = self.props_mut(set).get_mut(name) {
            props.set_modified(false);
        }
    }

    /// Drop the cached versioned property sets of one entry.
    fn forget(&mut self, name: &str) {
        self.working.remove(name);
        self.base.remove(name);
        self.revert.remove(name);
    }
}

/// Outcome of validating a requested schedule change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleFold {
    /// Record this schedule
    Apply(Schedule),
    /// Leave the current schedule alone
    Keep,
    /// Undo a pending addition by dropping the entry
    RemoveEntry,
}

/// Labels of the files left behind by a conflicted text merge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictLabels {
    pub left: Option<String>,
    pub right: Option<String>,
    pub target: Option<String>,
}

/// Work a finalized commit leaves for the session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitFollowUp {
    /// The directory itself was committed; holds the effective `implicit` flag
    pub parent_update: Option<bool>,
    /// Subdirectories scheduled for deletion inside a replaced directory
    pub removed_dirs: Vec<String>,
}

/// Metadata store of one versioned directory
#[derive(Debug)]
pub struct AdminArea {
    root: PathBuf,
    admin_dir: PathBuf,
    generation: Generation,
    options: WcOptions,
    locked: bool,
    destroyed: bool,
    cache: AreaCache,
}

impl AdminArea {
    fn new(root: PathBuf, admin_dir: PathBuf, generation: Generation) -> Self {
        Self {
            root,
            admin_dir,
            generation,
            options: WcOptions::default(),
            locked: false,
            destroyed: false,
            cache: AreaCache::default(),
        }
    }

    /// Open the admin area of `root`, detecting its generation.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let admin_dir = root.join(ADMIN_DIR);
        if !admin_dir.is_dir() {
            return Err(WcError::NotAWorkingCopy(root));
        }
        let number = format::detect(&admin_dir)?;
        let generation = Generation::check(number, &root)?;
        debug!("Opened {:?} (format {})", root, generation);
        Ok(Self::new(root, admin_dir, generation))
    }

    /// Create the admin area for a checkout of `url` into `dir`.
    ///
    /// An existing area for the same URL is reused; one for another URL is
    /// an obstruction.
    pub fn create_versioned_directory(
        dir: &Path,
        url: &str,
        repos_root: Option<&str>,
        uuid: Option<&str>,
        revision: u64,
        depth: Depth,
        options: &WcOptions,
    ) -> Result<Self> {
        if dir.join(ADMIN_DIR).join(ENTRIES).is_file() {
            let mut area = Self::open(dir)?.with_options(options.clone());
            if area.this_dir()?.url.as_deref() != Some(url) {
                return Err(WcError::ObstructedUpdate {
                    path: dir.to_path_buf(),
                    url: url.to_string(),
                });
            }
            return Ok(area);
        }

        let generation = options.target_generation;
        let admin_dir = dir.join(ADMIN_DIR);
        for sub in ADMIN_SUBDIRS {
            fs::create_dir_all(admin_dir.join(sub))?;
        }
        if generation.is_xml() {
            for sub in XML_ONLY_DIRS {
                fs::create_dir_all(admin_dir.join(sub))?;
            }
        }
        fs::write(admin_dir.join(FORMAT), format!("{}\n", generation.number()))?;

        let mut area = Self::new(dir.to_path_buf(), admin_dir, generation).with_options(options.clone());
        area.lock(false)?;

        let mut this_dir = Entry::new(THIS_DIR);
        this_dir.kind = NodeKind::Dir;
        this_dir.url = Some(url.to_string());
        this_dir.repos = repos_root.map(str::to_string);
        this_dir.uuid = uuid.map(str::to_string);
        this_dir.revision = Some(revision);
        this_dir.incomplete = revision > 0;
        this_dir.depth = depth;
        this_dir.cachable_props = svn_props::CACHABLE.iter().map(|p| p.to_string()).collect();
        let mut entries = Entries::new();
        entries.insert(THIS_DIR.to_string(), this_dir);
        area.cache.entries = Some(entries);

        let saved = area.save_entries(false);
        area.unlock()?;
        saved?;
        info!("Created admin area {:?} for {} at r{}", dir, url, revision);
        Ok(area)
    }

    pub fn with_options(mut self, options: WcOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &WcOptions {
        &self.options
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn admin_dir(&self) -> &Path {
        &self.admin_dir
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Older than the configured target generation
    pub fn needs_upgrade(&self) -> bool {
        self.generation < self.options.target_generation
    }

    pub fn cache(&self) -> &AreaCache {
        &self.cache
    }

    /// Absolute path of an entry name or a root-relative admin path
    pub fn path(&self, rel: &str) -> PathBuf {
        if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        }
    }

    fn admin_path(&self, rel: &str) -> PathBuf {
        self.admin_dir.join(rel)
    }

    /// Property file of `name` in `set`, relative to the versioned directory
    pub fn prop_path(&self, set: PropSet, name: &str, tmp: bool) -> String {
        let this_dir = name == THIS_DIR;
        let rel = match (set, this_dir) {
            (PropSet::Working, true) => "dir-props".to_string(),
            (PropSet::Working, false) => format!("props/{}.svn-work", name),
            (PropSet::Base, true) => "dir-prop-base".to_string(),
            (PropSet::Base, false) => format!("prop-base/{}.svn-base", name),
            (PropSet::Revert, true) => "dir-prop-revert".to_string(),
            (PropSet::Revert, false) => format!("prop-base/{}.svn-revert", name),
            (PropSet::Wc, _) if !self.generation.is_xml() => "all-wcprops".to_string(),
            (PropSet::Wc, true) => "dir-wcprops".to_string(),
            (PropSet::Wc, false) => format!("wcprops/{}.svn-work", name),
        };
        admin_rel(tmp, &rel)
    }

    // ─────────────────────────────────────────────────────
    // Locking
    // ─────────────────────────────────────────────────────

    fn lock_path(&self) -> PathBuf {
        self.admin_path(LOCK)
    }

    /// Take the advisory lock.
    ///
    /// With `steal`, an existing lock file is adopted instead of refused.
    pub fn lock(&mut self, steal: bool) -> Result<()> {
        let lock_path = self.lock_path();
        if steal && lock_path.is_file() {
            debug!("Stealing lock of {:?}", self.root);
            self.locked = true;
            return Ok(());
        }
        match fs::OpenOptions::new().write(true).create_new(true).open(&lock_path) {
            Ok(_) => {
                self.locked = true;
                debug!("Locked {:?}", self.root);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(WcError::WorkingCopyLocked(self.root.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// Release the lock.
    ///
    /// Returns `false`, staying locked, while log files or the kill-me
    /// sentinel remain.
    pub fn unlock(&mut self) -> Result<bool> {
        let lock_path = self.lock_path();
        if !lock_path.exists() {
            self.locked = false;
            return Ok(true);
        }
        if self.is_kill_me() || !log_files(&self.admin_dir)?.is_empty() {
            debug!("Keeping lock of {:?}: unfinished work remains", self.root);
            return Ok(false);
        }
        fs::remove_file(&lock_path)?;
        self.locked = false;
        debug!("Unlocked {:?}", self.root);
        Ok(true)
    }

    pub fn is_locked(&self) -> bool {
        self.locked && self.lock_path().is_file()
    }

    /// Admin directory present with a readable self-entry
    pub fn is_versioned(&mut self) -> bool {
        self.admin_dir.is_dir()
            && self.admin_path(ENTRIES).is_file()
            && matches!(self.entry(THIS_DIR, true), Ok(Some(_)))
    }

    pub fn is_kill_me(&self) -> bool {
        self.admin_path(KILL_ME).exists()
    }

    fn mark_kill_me(&self) -> Result<()> {
        fs::write(self.admin_path(KILL_ME), b"")?;
        Ok(())
    }

    pub fn has_logs(&self) -> Result<bool> {
        Ok(!log_files(&self.admin_dir)?.is_empty())
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Delete the whole admin directory.
    pub fn destroy(&mut self) -> Result<()> {
        match fs::remove_dir_all(&self.admin_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.cache = AreaCache::default();
        self.locked = false;
        self.destroyed = true;
        info!("Removed admin area of {:?}", self.root);
        Ok(())
    }

    /// Empty `tmp/` and recreate its skeleton.
    pub fn clear_tmp(&self) -> Result<()> {
        let tmp = self.admin_path(TMP);
        match fs::remove_dir_all(&tmp) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        for sub in ADMIN_SUBDIRS.iter().filter(|s| s.starts_with(TMP)) {
            fs::create_dir_all(self.admin_path(sub))?;
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────
    // Entries
    // ─────────────────────────────────────────────────────

    fn read_entries_file(&self) -> Result<Entries> {
        let path = self.admin_path(ENTRIES);
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(WcError::NotAWorkingCopy(self.root.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        self.generation.read_entries(&data, &path)
    }

    fn load_entries(&mut self) -> Result<&mut Entries> {
        let entries = match self.cache.entries.take() {
            Some(entries) => entries,
            None => self.read_entries_file()?,
        };
        Ok(self.cache.entries.insert(entries))
    }

    /// Look up one entry; hidden entries only with `show_hidden`.
    pub fn entry(&mut self, name: &str, show_hidden: bool) -> Result<Option<Entry>> {
        Ok(self
            .load_entries()?
            .get(name)
            .filter(|e| show_hidden || !e.is_hidden())
            .cloned())
    }

    pub fn entry_mut(&mut self, name: &str) -> Result<Option<&mut Entry>> {
        Ok(self.load_entries()?.get_mut(name))
    }

    /// The self-entry
    pub fn this_dir(&mut self) -> Result<Entry> {
        let path = self.admin_path(ENTRIES);
        self.entry(THIS_DIR, true)?
            .ok_or_else(|| WcError::malformed(path, "missing default entry"))
    }

    /// All entries sorted by name.
    pub fn entries(&mut self, show_hidden: bool) -> Result<Vec<Entry>> {
        Ok(self
            .load_entries()?
            .values()
            .filter(|e| show_hidden || !e.is_hidden())
            .cloned()
            .collect())
    }

    pub fn add_entry(&mut self, name: &str) -> Result<&mut Entry> {
        Ok(self
            .load_entries()?
            .entry(name.to_string())
            .or_insert_with(|| Entry::new(name)))
    }

    pub fn delete_entry(&mut self, name: &str) -> Result<bool> {
        Ok(self.load_entries()?.remove(name).is_some())
    }

    /// Drop the cached entry set without saving.
    pub fn close_entries(&mut self) {
        self.cache.entries = None;
    }

    /// Write the cached entry set back.
    ///
    /// The file is written to `tmp/`, renamed over `entries` and made
    /// read-only. With `close` the cache is dropped afterwards.
    pub fn save_entries(&mut self, close: bool) -> Result<()> {
        if let Some(entries) = &self.cache.entries {
            if !self.is_locked() {
                return Err(WcError::NotLocked(self.root.clone()));
            }
            let path = self.admin_path(ENTRIES);
            let this_dir = entries
                .get(THIS_DIR)
                .ok_or_else(|| WcError::malformed(&path, "missing default entry"))?;
            if this_dir.url.is_none() {
                return Err(WcError::malformed(&path, "default entry is missing URL"));
            }
            for entry in entries.values() {
                if let (Some(repos), Some(url)) = (entry.repos.as_deref(), entry.url.as_deref()) {
                    if !url_is_ancestor(repos, url) {
                        return Err(WcError::malformed(
                            &path,
                            format!("entry '{}' has invalid repository root", entry.name),
                        ));
                    }
                }
            }
            let data = self.generation.write_entries(entries);
            install_file(&self.admin_path(TMP).join(ENTRIES), &path, data.as_bytes())?;
            debug!("Saved {} entries of {:?}", entries.len(), self.root);
        }
        if close {
            self.cache.entries = None;
        }
        Ok(())
    }

    /// Validate a schedule change against the entry and its directory.
    pub fn fold_scheduling(&mut self, name: &str, requested: Schedule) -> Result<ScheduleFold> {
        let conflict = |reason: String| WcError::ScheduleConflict {
            name: name.to_string(),
            reason,
        };
        let Some(entry) = self.entry(name, true)? else {
            return if requested == Schedule::Add {
                Ok(ScheduleFold::Apply(Schedule::Add))
            } else {
                Err(conflict(format!("'{}' is not under version control", name)))
            };
        };

        let this_dir = self.this_dir()?;
        if name != THIS_DIR && this_dir.schedule == Schedule::Delete {
            match requested {
                Schedule::Add => {
                    return Err(conflict(format!(
                        "Can't add '{}' to deleted directory; try undeleting its parent directory first",
                        name
                    )));
                }
                Schedule::Replace => {
                    return Err(conflict(format!(
                        "Can't replace '{}' in deleted directory; try undeleting its parent directory first",
                        name
                    )));
                }
                _ => {}
            }
        }
        if entry.absent && requested == Schedule::Add {
            return Err(conflict(format!(
                "'{}' is marked as absent, so it cannot be scheduled for addition",
                name
            )));
        }

        Ok(match (entry.schedule, requested) {
            (Schedule::Add, Schedule::Delete) if !entry.deleted => ScheduleFold::RemoveEntry,
            (Schedule::Add, Schedule::Delete) => ScheduleFold::Apply(Schedule::Normal),
            (Schedule::Add, _) => ScheduleFold::Keep,
            (Schedule::Delete, Schedule::Delete) => ScheduleFold::Keep,
            (Schedule::Delete, Schedule::Add) => ScheduleFold::Apply(Schedule::Replace),
            (Schedule::Replace, Schedule::Delete) => ScheduleFold::Apply(Schedule::Delete),
            (Schedule::Replace, Schedule::Add | Schedule::Replace) => ScheduleFold::Keep,
            (Schedule::Normal, Schedule::Add) if !entry.deleted => {
                return Err(conflict(format!("Entry '{}' is already under version control", name)));
            }
            (Schedule::Normal, Schedule::Normal) => ScheduleFold::Keep,
            (_, requested) => ScheduleFold::Apply(requested),
        })
    }

    /// Apply a field patch to an entry, creating it when missing.
    ///
    /// Unless `force` is set, a schedule change goes through
    /// [`fold_scheduling`](Self::fold_scheduling) first.
    pub fn modify_entry(&mut self, name: &str, mut patch: EntryPatch, save: bool, force: bool) -> Result<()> {
        let requested = patch
            .get(EntryField::Schedule)
            .map(|v| v.unwrap_or_default().to_string());
        if let (Some(requested), false) = (requested, force) {
            let schedule = Schedule::parse(&requested).ok_or_else(|| WcError::ScheduleConflict {
                name: name.to_string(),
                reason: format!("invalid schedule '{}'", requested),
            })?;
            match self.fold_scheduling(name, schedule)? {
                ScheduleFold::Apply(s) => patch.insert(EntryField::Schedule, s.as_str().map(str::to_string)),
                ScheduleFold::Keep => {
                    patch.remove(EntryField::Schedule);
                }
                ScheduleFold::RemoveEntry => {
                    self.delete_entry(name)?;
                    self.cache.forget(name);
                    return if save { self.save_entries(false) } else { Ok(()) };
                }
            }
        }

        let schedule_changed = patch.contains(EntryField::Schedule);
        let entries_path = self.admin_path(ENTRIES);
        let entries = self.load_entries()?;
        let dir = entries.get(THIS_DIR).cloned();
        let entry = entries
            .entry(name.to_string())
            .or_insert_with(|| Entry::new(name));
        entry
            .apply(&patch)
            .map_err(|reason| WcError::malformed(&entries_path, format!("entry '{}': {}", name, reason)))?;
        if let (false, Some(dir)) = (entry.is_this_dir(), &dir) {
            entry.inherit_from(dir);
        }
        if schedule_changed && entry.schedule == Schedule::Delete {
            entry.copied = false;
            entry.copyfrom_url = None;
            entry.copyfrom_rev = None;
        }
        if save {
            self.save_entries(false)?;
        }
        Ok(())
    }

    /// Bring an entry to `new_url`/`new_revision` after an update.
    ///
    /// Returns whether anything changed. With `allow_removal`, deleted
    /// entries and absent ones left at another revision are dropped.
    pub fn tweak_entry(
        &mut self,
        name: &str,
        new_url: Option<&str>,
        repos_root: Option<&str>,
        new_revision: Option<u64>,
        allow_removal: bool,
    ) -> Result<bool> {
        let root = self.root.clone();
        let entries = self.load_entries()?;
        let root_fits_children = match repos_root {
            Some(repos) if name == THIS_DIR => entries.values().all(|e| {
                e.repos.is_some() || e.url.as_deref().is_none_or(|u| url_is_ancestor(repos, u))
            }),
            _ => true,
        };
        let entry = entries.get_mut(name).ok_or_else(|| WcError::EntryNotFound {
            dir: root,
            name: name.to_string(),
        })?;

        let mut rewrite = false;
        if let Some(url) = new_url {
            if entry.url.as_deref() != Some(url) {
                entry.url = Some(url.to_string());
                rewrite = true;
            }
        }
        if let Some(repos) = repos_root {
            if root_fits_children
                && entry.repos.as_deref() != Some(repos)
                && entry.url.as_deref().is_some_and(|u| url_is_ancestor(repos, u))
            {
                entry.repos = Some(repos.to_string());
                rewrite = true;
            }
        }
        if let Some(revision) = new_revision {
            if !matches!(entry.schedule, Schedule::Add | Schedule::Replace) && entry.revision != Some(revision) {
                entry.revision = Some(revision);
                rewrite = true;
            }
        }
        if allow_removal && (entry.deleted || (entry.absent && entry.revision != new_revision)) {
            entries.remove(name);
            rewrite = true;
        }
        Ok(rewrite)
    }

    // ─────────────────────────────────────────────────────
    // Properties
    // ─────────────────────────────────────────────────────

    /// One property set of an entry, loaded on first access.
    pub fn props(&mut self, set: PropSet, name: &str) -> Result<&mut VersionedProps> {
        if set == PropSet::Wc && !self.generation.is_xml() {
            self.load_all_wc_props()?;
        } else if !self.cache.props(set).contains_key(name) {
            let loaded = self.load_props(set, name)?;
            self.cache.props_mut(set).insert(name.to_string(), loaded);
        }
        Ok(self.cache.props_mut(set).entry(name.to_string()).or_default())
    }

    fn load_props(&mut self, set: PropSet, name: &str) -> Result<VersionedProps> {
        // line generations keep a working file only while it differs from base
        if set == PropSet::Working && !self.generation.is_xml() {
            let has_mods = self.entry(name, true)?.is_some_and(|e| e.has_prop_mods);
            if !has_mods {
                let base = self.props(PropSet::Base, name)?.as_map().clone();
                return Ok(VersionedProps::from_map(base));
            }
        }
        let path = self.path(&self.prop_path(set, name, false));
        Ok(VersionedProps::from_map(read_hash_file(&path)?))
    }

    fn load_all_wc_props(&mut self) -> Result<()> {
        if self.cache.wc_loaded {
            return Ok(());
        }
        let path = self.path(&self.prop_path(PropSet::Wc, THIS_DIR, false));
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        if !data.is_empty() {
            for (name, map) in parse_all_wcprops(&data, &path)? {
                self.cache.wc.insert(name, VersionedProps::from_map(map));
            }
        }
        self.cache.wc_loaded = true;
        Ok(())
    }

    pub fn has_properties(&mut self, name: &str) -> Result<bool> {
        Ok(!self.props(PropSet::Working, name)?.is_empty())
    }

    /// Whether the working properties of `name` differ from base.
    pub fn has_prop_modifications(&mut self, name: &str) -> Result<bool> {
        let Some(entry) = self.entry(name, true)? else {
            return Ok(false);
        };
        if !self.generation.is_xml() {
            return Ok(entry.has_prop_mods);
        }
        let dirty_in_memory = self
            .cache
            .working
            .get(name)
            .is_some_and(|p| p.is_modified());
        let props_file = self.path(&self.prop_path(PropSet::Working, name, false));
        if let (false, Some(prop_time), Some(mtime)) = (dirty_in_memory, entry.prop_time, file_mtime(&props_file)?) {
            if prop_time.timestamp() == mtime.timestamp() {
                return Ok(false);
            }
        }
        let working = self.props(PropSet::Working, name)?.as_map().clone();
        let base = self.props(PropSet::Base, name)?;
        Ok(&working != base.as_map())
    }

    /// Stage every modified versioned property set into `log`.
    ///
    /// New files are written under `tmp/` and moved into place by the log;
    /// in line generations the entry's property flags are logged as well.
    pub fn save_versioned_properties(&mut self, log: &mut Log) -> Result<()> {
        let xml = self.generation.is_xml();
        if !xml {
            // a new base may turn an unchanged working set into a modified one
            for name in self.cache.modified_names(PropSet::Base) {
                if let Some(working) = self.cache.working.get_mut(&name) {
                    working.set_modified(true);
                }
            }
        }

        let mut flagged = BTreeSet::new();
        for name in self.cache.modified_names(PropSet::Working) {
            let working = self.props(PropSet::Working, &name)?.as_map().clone();
            let base = self.props(PropSet::Base, &name)?.as_map().clone();
            let has_mods = working != base;
            let keep_file = if xml { !working.is_empty() } else { has_mods };
            if keep_file {
                self.stage_prop_file(log, PropSet::Working, &name, &working)?;
            } else {
                log.add(Command::Delete {
                    name: self.prop_path(PropSet::Working, &name, false),
                });
            }
            if xml {
                let patch = if has_mods {
                    EntryPatch::new().clear(EntryField::PropTime)
                } else {
                    EntryPatch::new().set(EntryField::PropTime, WORKING_TIMESTAMP)
                };
                log.add(Command::ModifyEntry {
                    name: name.clone(),
                    patch,
                    force: false,
                });
            } else {
                log.add(prop_flags(&name, &working, has_mods));
            }
            flagged.insert(name.clone());
            self.cache.set_clean(PropSet::Working, &name);
        }

        for set in [PropSet::Base, PropSet::Revert] {
            for name in self.cache.modified_names(set) {
                let map = self.props(set, &name)?.as_map().clone();
                if set == PropSet::Base && !xml && !flagged.contains(&name) {
                    let working = self.props(PropSet::Working, &name)?.as_map().clone();
                    let has_mods = working != map;
                    log.add(prop_flags(&name, &working, has_mods));
                    flagged.insert(name.clone());
                }
                if map.is_empty() {
                    log.add(Command::Delete {
                        name: self.prop_path(set, &name, false),
                    });
                } else {
                    self.stage_prop_file(log, set, &name, &map)?;
                }
                self.cache.set_clean(set, &name);
            }
        }
        Ok(())
    }

    fn stage_prop_file(&self, log: &mut Log, set: PropSet, name: &str, map: &PropMap) -> Result<()> {
        let tmp = self.prop_path(set, name, true);
        write_hash_file(&self.path(&tmp), map)?;
        let dest = self.prop_path(set, name, false);
        log.add(Command::Move {
            name: tmp,
            dest: dest.clone(),
        });
        log.add(Command::Readonly { name: dest });
        Ok(())
    }

    /// Write modified server properties directly.
    pub fn save_wc_properties(&mut self) -> Result<()> {
        let dirty = self.cache.modified_names(PropSet::Wc);
        if dirty.is_empty() {
            return Ok(());
        }
        if self.generation.is_xml() {
            for name in dirty {
                let path = self.path(&self.prop_path(PropSet::Wc, &name, false));
                let tmp_path = self.path(&self.prop_path(PropSet::Wc, &name, true));
                let map = self.props(PropSet::Wc, &name)?.as_map().clone();
                if map.is_empty() {
                    remove_if_exists(&path)?;
                } else {
                    install_file(&tmp_path, &path, &render_hash(&map))?;
                }
                self.cache.set_clean(PropSet::Wc, &name);
            }
            return Ok(());
        }

        let sets: BTreeMap<String, PropMap> = self
            .cache
            .wc
            .iter()
            .map(|(name, props)| (name.clone(), props.as_map().clone()))
            .collect();
        let path = self.path(&self.prop_path(PropSet::Wc, THIS_DIR, false));
        if sets.values().all(|map| map.is_empty()) {
            remove_if_exists(&path)?;
        } else {
            let tmp_path = self.path(&self.prop_path(PropSet::Wc, THIS_DIR, true));
            install_file(&tmp_path, &path, &render_all_wcprops(&sets))?;
        }
        for name in dirty {
            self.cache.set_clean(PropSet::Wc, &name);
        }
        Ok(())
    }

    /// Three-way merge an incoming property diff into `name`.
    ///
    /// Unless `dry_run`, the resulting sets are staged into `log`, and any
    /// conflicts are appended to the entry's reject file through the log.
    pub fn merge_properties(
        &mut self,
        name: &str,
        server_base: Option<&PropMap>,
        diff: &PropDiff,
        base_merge: bool,
        dry_run: bool,
        log: &mut Log,
    ) -> Result<MergeStatus> {
        let entry = self.entry(name, true)?.ok_or_else(|| WcError::EntryNotFound {
            dir: self.root.clone(),
            name: name.to_string(),
        })?;
        let base = self.props(PropSet::Base, name)?.as_map().clone();
        let working = self.props(PropSet::Working, name)?.as_map().clone();
        let merged = merge_props(&base, &working, server_base, diff, base_merge);
        if dry_run {
            return Ok(merged.status);
        }

        if merged.working != working {
            self.props(PropSet::Working, name)?.replace(merged.working.clone());
        }
        if base_merge && merged.base != base {
            self.props(PropSet::Base, name)?.replace(merged.base.clone());
        }
        self.save_versioned_properties(log)?;

        if merged.is_conflicted() {
            let is_dir = name == THIS_DIR;
            let tmp_dir_rel = if is_dir {
                format!("{}/{}", ADMIN_DIR, TMP)
            } else {
                format!("{}/{}/props", ADMIN_DIR, TMP)
            };
            let base_name = if is_dir { "dir_conflicts" } else { name };
            let tmp_dir = self.path(&tmp_dir_rel);
            fs::create_dir_all(&tmp_dir)?;
            let tmp_rel = format!("{}/{}", tmp_dir_rel, unique_name(&tmp_dir, base_name, ".prej")?);
            fs::write(self.path(&tmp_rel), reject_text(&merged.conflicts))?;

            let reject = match entry.prop_reject_file {
                Some(existing) => existing,
                None => unique_name(&self.root, base_name, ".prej")?,
            };
            info!("{} property conflicts on '{}' recorded in {}", merged.conflicts.len(), name, reject);
            log.add(Command::Append {
                name: tmp_rel.clone(),
                dest: reject.clone(),
            });
            log.add(Command::Delete { name: tmp_rel });
            log.add(Command::ModifyEntry {
                name: name.to_string(),
                patch: EntryPatch::new().set(EntryField::PropRejectFile, reject),
                force: false,
            });
        }
        Ok(merged.status)
    }

    // ─────────────────────────────────────────────────────
    // Text
    // ─────────────────────────────────────────────────────

    /// Translator configuration of a file.
    pub fn translation(&mut self, name: &str) -> Result<Translation> {
        let props = self.props(PropSet::Working, name)?.as_map().clone();
        let entry = self.entry(name, true)?.unwrap_or_default();
        let source = KeywordSource {
            url: entry.url,
            revision: entry.committed_rev,
            date: entry.committed_date,
            author: entry.last_author,
            utc: self.options.keyword_date_utc,
        };
        Ok(Translation::from_props(&props, &source))
    }

    /// Whether the working file differs from its text base.
    ///
    /// Without `force`, a recorded text-time matching the file's mtime (to
    /// the second) answers "unchanged" without reading the file. A clean
    /// full comparison refreshes that memo when the area is locked.
    pub fn has_text_modifications(
        &mut self,
        name: &str,
        force: bool,
        compare_text_base: bool,
        verify_checksum: bool,
    ) -> Result<bool> {
        let entry = self.entry(name, false)?;
        let path = self.path(name);
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let mtime = DateTime::<Utc>::from(meta.modified()?);

        if !force {
            let Some(entry) = &entry else {
                return Ok(false);
            };
            if entry.is_dir() {
                return Ok(false);
            }
            if let Some(text_time) = entry.text_time {
                if text_time.timestamp() == mtime.timestamp() && entry.working_size.is_none_or(|s| s == meta.len()) {
                    return Ok(false);
                }
            }
        }
        if !(meta.is_file() || meta.file_type().is_symlink()) {
            return Ok(false);
        }
        let base_path = self.path(&text_base_path(name, false));
        if !base_path.is_file() {
            return Ok(true);
        }

        let checksum = entry.and_then(|e| e.checksum);
        let modified = self.differs_from_base(
            name,
            &path,
            &base_path,
            checksum.as_deref().filter(|_| verify_checksum),
            compare_text_base,
        )?;
        if !modified && self.is_locked() {
            if let Some(entry) = self.entry_mut(name)? {
                entry.text_time = Some(mtime);
                entry.working_size = Some(meta.len());
            }
            self.save_entries(false)?;
        }
        Ok(modified)
    }

    fn differs_from_base(
        &mut self,
        name: &str,
        path: &Path,
        base_path: &Path,
        expected_checksum: Option<&str>,
        compare_text_base: bool,
    ) -> Result<bool> {
        let base = fs::read(base_path)?;
        if let Some(expected) = expected_checksum {
            let actual = format!("{:x}", md5::compute(&base));
            if actual != expected {
                return Err(WcError::ChecksumMismatch {
                    path: base_path.to_path_buf(),
                    expected: expected.to_string(),
                    actual,
                });
            }
        }
        let translation = self.translation(name)?;
        if translation.is_identity() {
            return Ok(fs::read(path)? != base);
        }
        if compare_text_base || translation.special {
            Ok(normal_form(path, &translation)? != base)
        } else {
            let expanded = translate_bytes(&base, &translation, Direction::Expand)?;
            Ok(fs::read(path)? != expanded)
        }
    }

    /// Run a text merge of `left`→`right` into the working file of `name`.
    ///
    /// `left` and `right` are paths relative to the directory. On conflict
    /// the working, left and right texts are left next to the file and
    /// recorded in the entry.
    pub fn merge_text(
        &mut self,
        name: &str,
        left: &str,
        right: &str,
        labels: &ConflictLabels,
        dry_run: bool,
        merger: &mut dyn TextMerger,
    ) -> Result<MergeOutcome> {
        let Some(entry) = self.entry(name, false)? else {
            return Ok(MergeOutcome::Unchanged);
        };
        let translation = self.translation(name)?;
        let target = self.path(name);
        let left_path = self.path(left);
        let right_path = self.path(right);
        if !dry_run {
            make_writable(&target)?;
        }

        let outcome = merger.merge(&MergeRequest {
            target: &target,
            left: &left_path,
            right: &right_path,
            translation: &translation,
            dry_run,
        })?;
        if dry_run {
            return Ok(outcome);
        }

        if outcome == MergeOutcome::Conflicted {
            let mut patch = EntryPatch::new();
            if target.exists() {
                let working = unique_name(&self.root, name, labels.target.as_deref().unwrap_or(".working"))?;
                fs::copy(&target, self.path(&working))?;
                patch = patch.set(EntryField::ConflictWrk, working);
            }
            let old = unique_name(&self.root, name, labels.left.as_deref().unwrap_or(".old"))?;
            translate_file(&left_path, &self.path(&old), &translation, Direction::Expand)?;
            let new = unique_name(&self.root, name, labels.right.as_deref().unwrap_or(".new"))?;
            translate_file(&right_path, &self.path(&new), &translation, Direction::Expand)?;
            patch = patch
                .set(EntryField::ConflictOld, old)
                .set(EntryField::ConflictNew, new);
            self.modify_entry(name, patch, false, true)?;
        }

        if target.exists() && !translation.special {
            let props = self.props(PropSet::Working, name)?;
            if props.contains(svn_props::EXECUTABLE) {
                set_executable(&target, true)?;
            }
            if props.contains(svn_props::NEEDS_LOCK) && entry.lock_token.is_none() {
                set_readonly(&target, true)?;
            }
        }
        Ok(outcome)
    }

    /// Rematerialize the working file of `name` from its text base.
    pub fn restore_file(&mut self, name: &str) -> Result<()> {
        let entry = self.entry(name, true)?.ok_or_else(|| WcError::EntryNotFound {
            dir: self.root.clone(),
            name: name.to_string(),
        })?;
        let translation = self.translation(name)?;
        let (executable, needs_lock) = {
            let props = self.props(PropSet::Working, name)?;
            (props.contains(svn_props::EXECUTABLE), props.contains(svn_props::NEEDS_LOCK))
        };

        let dst = self.path(name);
        make_writable(&dst)?;
        translate_file(&self.path(&text_base_path(name, false)), &dst, &translation, Direction::Expand)?;
        if !translation.special {
            set_readonly(&dst, needs_lock && entry.lock_token.is_none())?;
            if executable {
                set_executable(&dst, true)?;
            }
        }
        self.mark_resolved(name, true, false)?;

        let text_time = match entry.committed_date {
            Some(date) if self.options.use_commit_times && !translation.special => {
                set_file_mtime(&dst, &date)?;
                date
            }
            _ => file_mtime(&dst)?.unwrap_or_else(Utc::now),
        };
        let size = fs::symlink_metadata(&dst).ok().map(|m| m.len());
        if let Some(entry) = self.entry_mut(name)? {
            entry.text_time = Some(text_time);
            entry.working_size = size;
        }
        self.save_entries(false)
    }

    // ─────────────────────────────────────────────────────
    // Conflicts
    // ─────────────────────────────────────────────────────

    fn any_exists(&self, files: &[Option<String>]) -> bool {
        files
            .iter()
            .flatten()
            .any(|f| fs::symlink_metadata(self.path(f)).is_ok())
    }

    pub fn has_text_conflict(&mut self, name: &str) -> Result<bool> {
        Ok(match self.entry(name, true)? {
            Some(e) => self.any_exists(&[e.conflict_old, e.conflict_new, e.conflict_wrk]),
            None => false,
        })
    }

    pub fn has_prop_conflict(&mut self, name: &str) -> Result<bool> {
        Ok(match self.entry(name, true)? {
            Some(e) => self.any_exists(&[e.prop_reject_file]),
            None => false,
        })
    }

    /// Delete conflict artifacts of `name` and clear the matching fields.
    ///
    /// Returns whether any artifact was removed.
    pub fn mark_resolved(&mut self, name: &str, text: bool, props: bool) -> Result<bool> {
        if !text && !props {
            return Ok(false);
        }
        let Some(entry) = self.entry(name, true)? else {
            return Ok(false);
        };
        let mut fields = Vec::new();
        if text {
            fields.push((EntryField::ConflictOld, entry.conflict_old));
            fields.push((EntryField::ConflictNew, entry.conflict_new));
            fields.push((EntryField::ConflictWrk, entry.conflict_wrk));
        }
        if props {
            fields.push((EntryField::PropRejectFile, entry.prop_reject_file));
        }

        let mut removed = false;
        for file in fields.iter().filter_map(|(_, f)| f.as_deref()) {
            removed |= remove_if_exists(&self.path(file))?;
        }
        if removed {
            let mut patch = EntryPatch::new();
            for (field, _) in fields {
                patch.insert(field, None);
            }
            self.modify_entry(name, patch, true, true)?;
        }
        Ok(removed)
    }

    // ─────────────────────────────────────────────────────
    // Removal and commit
    // ─────────────────────────────────────────────────────

    /// Remove a file entry and its admin files.
    ///
    /// A locally modified file stays on disk and yields
    /// `LocalModificationsPresent`, immediately with
    /// `report_instant_error`, otherwise after the metadata is gone.
    pub fn remove_file_from_revision_control(
        &mut self,
        name: &str,
        delete_working_file: bool,
        report_instant_error: bool,
    ) -> Result<()> {
        let path = self.path(name);
        let modified = self.has_text_modifications(name, false, false, false)?;
        if report_instant_error && modified {
            return Err(WcError::LocalModificationsPresent(path));
        }

        self.props(PropSet::Wc, name)?.replace(PropMap::new());
        self.save_wc_properties()?;
        self.cache.wc.remove(name);
        self.delete_entry(name)?;
        self.save_entries(false)?;

        let admin_files = [
            text_base_path(name, false),
            self.prop_path(PropSet::Working, name, false),
            self.prop_path(PropSet::Base, name, false),
            self.prop_path(PropSet::Revert, name, false),
        ];
        for rel in admin_files {
            remove_if_exists(&self.path(&rel))?;
        }
        self.cache.forget(name);

        if delete_working_file {
            if modified {
                return Err(WcError::LocalModificationsPresent(path));
            }
            remove_if_exists(&path)?;
        }
        Ok(())
    }

    /// Finalize the commit of `name` at `revision`.
    ///
    /// Installs the new text base and base properties, refreshes the
    /// working file and clears the entry's pending state. Called by the log
    /// runner for the `committed` command.
    pub(crate) fn post_commit(&mut self, name: &str, revision: u64, implicit: bool) -> Result<CommitFollowUp> {
        let is_dir = name == THIS_DIR;
        let entry = match self.entry(name, true)? {
            Some(entry) if is_dir || entry.is_file() => entry,
            _ => {
                return Err(WcError::malformed(
                    self.admin_path(ENTRIES),
                    format!("log command for '{}' is mislocated", name),
                ));
            }
        };
        let implicit = implicit && entry.copied;
        let mut follow_up = CommitFollowUp::default();

        if !implicit && entry.schedule == Schedule::Delete {
            if is_dir {
                let patch = EntryPatch::new()
                    .revision(EntryField::Revision, revision)
                    .set(EntryField::Kind, "dir");
                self.modify_entry(THIS_DIR, patch, true, true)?;
                self.mark_kill_me()?;
            } else {
                self.remove_file_from_revision_control(name, false, false)?;
                let dir_revision = self.this_dir()?.revision.unwrap_or(0);
                if revision > dir_revision {
                    let patch = EntryPatch::new()
                        .set(EntryField::Kind, "file")
                        .flag(EntryField::Deleted, true)
                        .revision(EntryField::Revision, revision);
                    self.modify_entry(name, patch, true, true)?;
                }
            }
            return Ok(follow_up);
        }

        if !implicit && is_dir && entry.schedule == Schedule::Replace {
            for child in self.entries(true)? {
                if child.is_this_dir() || child.schedule != Schedule::Delete {
                    continue;
                }
                match child.kind {
                    NodeKind::File => self.remove_file_from_revision_control(&child.name, false, false)?,
                    NodeKind::Dir => follow_up.removed_dirs.push(child.name),
                    NodeKind::None => {}
                }
            }
        }

        let working_file = self.path(name);
        let tmp_base = self.path(&text_base_path(name, true));
        let tmp_base_exists = !is_dir && tmp_base.is_file();
        let mut text_time = None;
        if !implicit && tmp_base_exists {
            let tmp_time = file_mtime(&tmp_base)?;
            let working_time = file_mtime(&working_file)?;
            let mut modified = false;
            if tmp_time != working_time && working_time.is_some() {
                let translation = self.translation(name)?;
                modified = normal_form(&working_file, &translation)? != fs::read(&tmp_base)?;
            }
            text_time = if modified { tmp_time } else { working_time };
        }

        if !implicit && entry.schedule == Schedule::Replace {
            remove_if_exists(&self.path(&self.prop_path(PropSet::Base, name, false)))?;
        }

        let tmp_props = self.path(&self.prop_path(PropSet::Working, name, true));
        let mut set_read_write = false;
        let mut set_not_executable = false;
        if tmp_props.is_file() {
            if !is_dir {
                let base = self.props(PropSet::Base, name)?.as_map().clone();
                let working = self.props(PropSet::Working, name)?.as_map().clone();
                let dropped = |prop: &str| base.contains_key(prop) && !working.contains_key(prop);
                set_read_write = dropped(svn_props::NEEDS_LOCK);
                set_not_executable = dropped(svn_props::EXECUTABLE);
            }
            let base_props = self.path(&self.prop_path(PropSet::Base, name, false));
            if fs::metadata(&tmp_props)?.len() <= 4 {
                remove_if_exists(&base_props)?;
            } else {
                make_writable(&base_props)?;
                fs::copy(&tmp_props, &base_props)?;
                set_readonly(&base_props, true)?;
            }
            remove_if_exists(&tmp_props)?;
        }

        if !implicit && !is_dir {
            let translation = self.translation(name)?;
            let (executable, needs_lock) = {
                let props = self.props(PropSet::Working, name)?;
                (props.contains(svn_props::EXECUTABLE), props.contains(svn_props::NEEDS_LOCK))
            };
            let mut overwritten = false;
            if !translation.special || cfg!(not(unix)) {
                let normal = if tmp_base_exists {
                    fs::read(&tmp_base)?
                } else {
                    normal_form(&working_file, &translation)?
                };
                let expanded = translate_bytes(&normal, &translation, Direction::Expand)?;
                if fs::read(&working_file).ok().as_deref() != Some(expanded.as_slice()) {
                    make_writable(&working_file)?;
                    fs::write(&working_file, &expanded)?;
                    overwritten = true;
                }
            }
            if tmp_base_exists {
                let base = self.path(&text_base_path(name, false));
                make_writable(&base)?;
                fs::rename(&tmp_base, &base)?;
                set_readonly(&base, true)?;
            }
            if !translation.special {
                if needs_lock && entry.lock_token.is_none() {
                    set_readonly(&working_file, true)?;
                    overwritten = true;
                }
                if executable {
                    set_executable(&working_file, true)?;
                    overwritten = true;
                }
                if set_read_write {
                    set_readonly(&working_file, false)?;
                    overwritten = true;
                }
                if set_not_executable {
                    set_executable(&working_file, false)?;
                    overwritten = true;
                }
            }
            if overwritten {
                text_time = file_mtime(&working_file)?;
            }
        }

        let mut patch = EntryPatch::new()
            .revision(EntryField::Revision, revision)
            .set(EntryField::Kind, if is_dir { "dir" } else { "file" });
        if !implicit {
            patch = patch.clear(EntryField::Schedule);
        }
        patch = patch
            .flag(EntryField::Copied, false)
            .flag(EntryField::Deleted, false);
        if let (Some(time), false) = (text_time, implicit) {
            patch = patch.date(EntryField::TextTime, &time);
        }
        for field in [
            EntryField::ConflictNew,
            EntryField::ConflictOld,
            EntryField::ConflictWrk,
            EntryField::PropRejectFile,
            EntryField::CopyfromRev,
            EntryField::CopyfromUrl,
        ] {
            patch = patch.clear(field);
        }
        patch = patch.flag(EntryField::HasPropMods, false);
        self.modify_entry(name, patch, false, true)?;

        if !self.generation.is_xml() {
            remove_if_exists(&self.path(&self.prop_path(PropSet::Working, name, false)))?;
        }
        self.cache.forget(name);
        if is_dir {
            follow_up.parent_update = Some(implicit);
        }
        debug!("Finalized commit of '{}' in {:?} at r{}", name, self.root, revision);
        Ok(follow_up)
    }

    // ─────────────────────────────────────────────────────
    // Format upgrade
    // ─────────────────────────────────────────────────────

    /// Stage a migration of this area to `target` as a log file.
    ///
    /// Returns `false` when nothing was staged: the area is already at or
    /// past `target`, or unfinished logs are pending.
    pub fn upgrade(&mut self, target: Generation) -> Result<bool> {
        if self.generation >= target {
            return Ok(false);
        }
        if self.has_logs()? {
            info!("Upgrade of {:?} skipped: found a log file", self.root);
            return Ok(false);
        }
        if !self.is_locked() {
            return Err(WcError::NotLocked(self.root.clone()));
        }

        let mut log = Log::new(&self.admin_dir);
        log.add(Command::UpgradeFormat { format: target });

        let mut sets = Vec::new();
        for entry in self.entries(true)? {
            if !(entry.is_this_dir() || entry.is_file()) {
                continue;
            }
            let base = self.props(PropSet::Base, &entry.name)?.as_map().clone();
            let working = self.props(PropSet::Working, &entry.name)?.as_map().clone();
            let wc = self.props(PropSet::Wc, &entry.name)?.as_map().clone();
            sets.push((entry.name, base, working, wc));
        }

        let old = self.generation;
        self.cache.wc.clear();
        self.cache.wc_loaded = false;
        for (name, base, working, wc) in sets {
            self.cache.base.insert(name.clone(), dirty(base));
            self.cache.working.insert(name.clone(), dirty(working));
            for (prop, value) in wc {
                log.add(Command::ModifyWcProperty {
                    name: name.clone(),
                    prop,
                    value: Some(value),
                });
            }
        }
        // property files are staged in the target layout; the entries keep
        // the current codec until `upgrade-format` is replayed
        self.generation = target;
        let staged = self.save_versioned_properties(&mut log);
        self.generation = old;
        staged?;
        log.save()?;

        if old.is_xml() {
            for file in XML_ONLY_FILES {
                remove_if_exists(&self.admin_path(file))?;
            }
            for dir in XML_ONLY_DIRS {
                match fs::remove_dir_all(self.admin_path(dir)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        info!("Staged upgrade of {:?} from format {} to {}", self.root, old, target);
        Ok(true)
    }

    /// Switch the entries store to `generation`, rewriting it.
    ///
    /// Replay of `upgrade-format`; the entries are read in whatever
    /// generation the file is currently in.
    pub(crate) fn apply_generation(&mut self, generation: Generation) -> Result<()> {
        self.load_entries()?;
        self.generation = generation;
        fs::write(self.admin_path(FORMAT), format!("{}\n", generation.number()))?;
        self.save_entries(false)
    }
}

/// `modify-entry` recording the property flags of a line-generation entry
fn prop_flags(name: &str, working: &PropMap, has_mods: bool) -> Command {
    let present: Vec<&str> = svn_props::CACHABLE
        .iter()
        .copied()
        .filter(|p| working.contains_key(*p))
        .collect();
    let mut patch = EntryPatch::new()
        .set(EntryField::CachableProps, svn_props::CACHABLE.join(" "))
        .flag(EntryField::HasProps, !working.is_empty())
        .flag(EntryField::HasPropMods, has_mods);
    patch.insert(
        EntryField::PresentProps,
        if present.is_empty() { None } else { Some(present.join(" ")) },
    );
    Command::ModifyEntry {
        name: name.to_string(),
        patch,
        force: false,
    }
}
