//! Versioned entry model
//!
//! One `Entry` describes a single versioned node inside an admin area.
//! Every field is addressable through `EntryField` so the on-disk codecs
//! and the log's `modify-entry` command share one naming scheme.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::path::{uri_encode, url_append};

/// Name of the entry describing the directory itself
pub const THIS_DIR: &str = "";

/// Format a timestamp the way entries and logs store it.
pub fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp.
pub fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Node kind of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    #[default]
    None,
    File,
    Dir,
}

impl NodeKind {
    pub fn as_str(&self) -> Option<&'static str> {
        match self {
            NodeKind::None => None,
            NodeKind::File => Some("file"),
            NodeKind::Dir => Some("dir"),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "" | "none" => Some(NodeKind::None),
            "file" => Some(NodeKind::File),
            "dir" => Some(NodeKind::Dir),
            _ => None,
        }
    }
}

/// Pending change state of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Schedule {
    #[default]
    Normal,
    Add,
    Delete,
    Replace,
}

impl Schedule {
    pub fn as_str(&self) -> Option<&'static str> {
        match self {
            Schedule::Normal => None,
            Schedule::Add => Some("add"),
            Schedule::Delete => Some("delete"),
            Schedule::Replace => Some("replace"),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "" | "normal" => Some(Schedule::Normal),
            "add" => Some(Schedule::Add),
            "delete" => Some(Schedule::Delete),
            "replace" => Some(Schedule::Replace),
            _ => None,
        }
    }
}

/// Ambient depth recorded for a directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Depth {
    Empty,
    Files,
    Immediates,
    #[default]
    Infinity,
    Exclude,
}

impl Depth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Depth::Empty => "empty",
            Depth::Files => "files",
            Depth::Immediates => "immediates",
            Depth::Infinity => "infinity",
            Depth::Exclude => "exclude",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "empty" => Some(Depth::Empty),
            "files" => Some(Depth::Files),
            "immediates" => Some(Depth::Immediates),
            "" | "infinity" => Some(Depth::Infinity),
            "exclude" => Some(Depth::Exclude),
            _ => None,
        }
    }
}

/// How a field is spelled in the line-oriented encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldEncoding {
    /// Free text, `\xHH` escaped
    Text,
    /// Token written verbatim
    Value,
    /// Present as the field's own name when true
    Flag,
    /// Non-negative revision number
    Revision,
}

macro_rules! entry_fields {
    ($($variant:ident => $name:literal, $enc:ident;)*) => {
        /// Every named attribute an entry carries
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum EntryField {
            $($variant,)*
        }

        impl EntryField {
            pub const ALL: &'static [EntryField] = &[$(EntryField::$variant,)*];

            /// On-disk attribute name
            pub fn name(&self) -> &'static str {
                match self {
                    $(EntryField::$variant => $name,)*
                }
            }

            pub fn encoding(&self) -> FieldEncoding {
                match self {
                    $(EntryField::$variant => FieldEncoding::$enc,)*
                }
            }

            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(EntryField::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

entry_fields! {
    Name => "name", Text;
    Kind => "kind", Value;
    Revision => "revision", Revision;
    Url => "url", Text;
    Repos => "repos", Text;
    Schedule => "schedule", Value;
    TextTime => "text-time", Value;
    Checksum => "checksum", Value;
    CommittedDate => "committed-date", Value;
    CommittedRev => "committed-rev", Revision;
    LastAuthor => "last-author", Text;
    HasProps => "has-props", Flag;
    HasPropMods => "has-prop-mods", Flag;
    CachableProps => "cachable-props", Value;
    PresentProps => "present-props", Value;
    PropRejectFile => "prop-reject-file", Text;
    ConflictOld => "conflict-old", Text;
    ConflictNew => "conflict-new", Text;
    ConflictWrk => "conflict-wrk", Text;
    Copied => "copied", Flag;
    CopyfromUrl => "copyfrom-url", Text;
    CopyfromRev => "copyfrom-rev", Revision;
    Deleted => "deleted", Flag;
    Absent => "absent", Flag;
    Incomplete => "incomplete", Flag;
    Uuid => "uuid", Value;
    LockToken => "lock-token", Text;
    LockOwner => "lock-owner", Text;
    LockComment => "lock-comment", Text;
    LockCreationDate => "lock-creation-date", Value;
    Changelist => "changelist", Text;
    KeepLocal => "keep-local", Flag;
    WorkingSize => "working-size", Value;
    Depth => "depth", Value;
    TreeConflicts => "tree-conflicts", Text;
    FileExternal => "file-external", Text;
    PropTime => "prop-time", Value;
}

/// Metadata for one versioned file or directory
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub name: String,
    pub kind: NodeKind,
    pub schedule: Schedule,
    pub revision: Option<u64>,
    pub url: Option<String>,
    pub repos: Option<String>,
    pub uuid: Option<String>,
    pub checksum: Option<String>,
    pub text_time: Option<DateTime<Utc>>,
    pub prop_time: Option<DateTime<Utc>>,
    pub committed_rev: Option<u64>,
    pub committed_date: Option<DateTime<Utc>>,
    pub last_author: Option<String>,
    pub has_props: bool,
    pub has_prop_mods: bool,
    pub cachable_props: Vec<String>,
    pub present_props: Vec<String>,
    pub prop_reject_file: Option<String>,
    pub conflict_old: Option<String>,
    pub conflict_new: Option<String>,
    pub conflict_wrk: Option<String>,
    pub copied: bool,
    pub copyfrom_url: Option<String>,
    pub copyfrom_rev: Option<u64>,
    pub deleted: bool,
    pub absent: bool,
    pub incomplete: bool,
    pub keep_local: bool,
    pub lock_token: Option<String>,
    pub lock_owner: Option<String>,
    pub lock_comment: Option<String>,
    pub lock_creation_date: Option<DateTime<Utc>>,
    pub changelist: Option<String>,
    pub working_size: Option<u64>,
    pub depth: Depth,
    pub tree_conflicts: Option<String>,
    pub file_external: Option<String>,
    /// Attributes this version does not recognize, kept for write-back
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

fn opt_text(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

fn opt_rev(value: Option<&str>) -> Result<Option<u64>, String> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(v) => match v.parse::<i64>() {
            Ok(n) if n < 0 => Ok(None),
            Ok(n) => Ok(Some(n as u64)),
            Err(_) => Err(format!("invalid revision '{}'", v)),
        },
    }
}

fn opt_date(value: Option<&str>) -> Result<Option<DateTime<Utc>>, String> {
    match value.filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(v) => parse_date(v)
            .map(Some)
            .ok_or_else(|| format!("invalid date '{}'", v)),
    }
}

fn flag(field: EntryField, value: Option<&str>) -> Result<bool, String> {
    match value {
        None | Some("") | Some("false") => Ok(false),
        Some("true") => Ok(true),
        Some(v) if v == field.name() => Ok(true),
        Some(v) => Err(format!("invalid value '{}' for field '{}'", v, field.name())),
    }
}

fn prop_names(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| v.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

fn join_names(names: &[String]) -> Option<String> {
    if names.is_empty() {
        None
    } else {
        Some(names.join(" "))
    }
}

impl Entry {
    /// Create an empty entry with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn is_this_dir(&self) -> bool {
        self.name == THIS_DIR
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Dir
    }

    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }

    /// Deleted or absent entries not scheduled for re-addition
    pub fn is_hidden(&self) -> bool {
        (self.deleted || self.absent) && self.schedule != Schedule::Add
    }

    /// Read a field as its stored string form
    pub fn get(&self, field: EntryField) -> Option<String> {
        let flag = |on: bool| if on { Some("true".to_string()) } else { None };
        match field {
            EntryField::Name => Some(self.name.clone()),
            EntryField::Kind => self.kind.as_str().map(str::to_string),
            EntryField::Revision => self.revision.map(|r| r.to_string()),
            EntryField::Url => self.url.clone(),
            EntryField::Repos => self.repos.clone(),
            EntryField::Schedule => self.schedule.as_str().map(str::to_string),
            EntryField::TextTime => self.text_time.as_ref().map(format_date),
            EntryField::Checksum => self.checksum.clone(),
            EntryField::CommittedDate => self.committed_date.as_ref().map(format_date),
            EntryField::CommittedRev => self.committed_rev.map(|r| r.to_string()),
            EntryField::LastAuthor => self.last_author.clone(),
            EntryField::HasProps => flag(self.has_props),
            EntryField::HasPropMods => flag(self.has_prop_mods),
            EntryField::CachableProps => join_names(&self.cachable_props),
            EntryField::PresentProps => join_names(&self.present_props),
            EntryField::PropRejectFile => self.prop_reject_file.clone(),
            EntryField::ConflictOld => self.conflict_old.clone(),
            EntryField::ConflictNew => self.conflict_new.clone(),
            EntryField::ConflictWrk => self.conflict_wrk.clone(),
            EntryField::Copied => flag(self.copied),
            EntryField::CopyfromUrl => self.copyfrom_url.clone(),
            EntryField::CopyfromRev => self.copyfrom_rev.map(|r| r.to_string()),
            EntryField::Deleted => flag(self.deleted),
            EntryField::Absent => flag(self.absent),
            EntryField::Incomplete => flag(self.incomplete),
            EntryField::Uuid => self.uuid.clone(),
            EntryField::LockToken => self.lock_token.clone(),
            EntryField::LockOwner => self.lock_owner.clone(),
            EntryField::LockComment => self.lock_comment.clone(),
            EntryField::LockCreationDate => self.lock_creation_date.as_ref().map(format_date),
            EntryField::Changelist => self.changelist.clone(),
            EntryField::KeepLocal => flag(self.keep_local),
            EntryField::WorkingSize => self.working_size.map(|s| s.to_string()),
            EntryField::Depth => match self.depth {
                Depth::Infinity => None,
                d => Some(d.as_str().to_string()),
            },
            EntryField::TreeConflicts => self.tree_conflicts.clone(),
            EntryField::FileExternal => self.file_external.clone(),
            EntryField::PropTime => self.prop_time.as_ref().map(format_date),
        }
    }

    /// Set a field from its stored string form; `None` clears it.
    ///
    /// Returns the reason when the value does not parse.
    pub fn set(&mut self, field: EntryField, value: Option<&str>) -> Result<(), String> {
        match field {
            EntryField::Name => self.name = value.unwrap_or_default().to_string(),
            EntryField::Kind => {
                self.kind = NodeKind::parse(value.unwrap_or_default())
                    .ok_or_else(|| format!("invalid kind '{}'", value.unwrap_or_default()))?
            }
            EntryField::Revision => self.revision = opt_rev(value)?,
            EntryField::Url => self.url = opt_text(value),
            EntryField::Repos => self.repos = opt_text(value),
            EntryField::Schedule => {
                self.schedule = Schedule::parse(value.unwrap_or_default())
                    .ok_or_else(|| format!("invalid schedule '{}'", value.unwrap_or_default()))?
            }
            EntryField::TextTime => self.text_time = opt_date(value)?,
            EntryField::Checksum => self.checksum = opt_text(value),
            EntryField::CommittedDate => self.committed_date = opt_date(value)?,
            EntryField::CommittedRev => self.committed_rev = opt_rev(value)?,
            EntryField::LastAuthor => self.last_author = opt_text(value),
            EntryField::HasProps => self.has_props = flag(field, value)?,
            EntryField::HasPropMods => self.has_prop_mods = flag(field, value)?,
            EntryField::CachableProps => self.cachable_props = prop_names(value),
            EntryField::PresentProps => self.present_props = prop_names(value),
            EntryField::PropRejectFile => self.prop_reject_file = opt_text(value),
            EntryField::ConflictOld => self.conflict_old = opt_text(value),
            EntryField::ConflictNew => self.conflict_new = opt_text(value),
            EntryField::ConflictWrk => self.conflict_wrk = opt_text(value),
            EntryField::Copied => self.copied = flag(field, value)?,
            EntryField::CopyfromUrl => self.copyfrom_url = opt_text(value),
            EntryField::CopyfromRev => self.copyfrom_rev = opt_rev(value)?,
            EntryField::Deleted => self.deleted = flag(field, value)?,
            EntryField::Absent => self.absent = flag(field, value)?,
            EntryField::Incomplete => self.incomplete = flag(field, value)?,
            EntryField::Uuid => self.uuid = opt_text(value),
            EntryField::LockToken => self.lock_token = opt_text(value),
            EntryField::LockOwner => self.lock_owner = opt_text(value),
            EntryField::LockComment => self.lock_comment = opt_text(value),
            EntryField::LockCreationDate => self.lock_creation_date = opt_date(value)?,
            EntryField::Changelist => self.changelist = opt_text(value),
            EntryField::KeepLocal => self.keep_local = flag(field, value)?,
            EntryField::WorkingSize => {
                self.working_size = match value.map(str::trim).filter(|v| !v.is_empty()) {
                    None => None,
                    Some(v) => match v.parse::<i64>() {
                        Ok(n) if n < 0 => None,
                        Ok(n) => Some(n as u64),
                        Err(_) => return Err(format!("invalid working size '{}'", v)),
                    },
                }
            }
            EntryField::Depth => {
                self.depth = Depth::parse(value.unwrap_or_default())
                    .ok_or_else(|| format!("invalid depth '{}'", value.unwrap_or_default()))?
            }
            EntryField::TreeConflicts => self.tree_conflicts = opt_text(value),
            EntryField::FileExternal => self.file_external = opt_text(value),
            EntryField::PropTime => self.prop_time = opt_date(value)?,
        }
        Ok(())
    }

    /// Apply every change in a patch, in order.
    pub fn apply(&mut self, patch: &EntryPatch) -> Result<(), String> {
        for (field, value) in patch.iter() {
            self.set(field, value)?;
        }
        Ok(())
    }

    /// URL a file child is expected to have under `dir_url`
    pub fn expected_url(dir_url: &str, name: &str) -> String {
        url_append(dir_url, &uri_encode(name))
    }

    /// Fill absent values of a file child from the directory's own entry.
    pub fn inherit_from(&mut self, dir: &Entry) {
        if self.kind != NodeKind::File {
            return;
        }
        if self.revision.is_none() {
            self.revision = dir.revision;
        }
        if self.url.is_none() {
            self.url = dir.url.as_deref().map(|u| Self::expected_url(u, &self.name));
        }
        if self.repos.is_none() {
            self.repos = dir.repos.clone();
        }
        if self.uuid.is_none() && !matches!(self.schedule, Schedule::Add | Schedule::Replace) {
            self.uuid = dir.uuid.clone();
        }
        if self.cachable_props.is_empty() {
            self.cachable_props = dir.cachable_props.clone();
        }
    }
}

/// An ordered set of field changes for one entry
///
/// This is the payload of the log's `modify-entry` command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryPatch {
    changes: Vec<(EntryField, Option<String>)>,
}

impl EntryPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set or replace one field's value
    pub fn insert(&mut self, field: EntryField, value: Option<String>) {
        match self.changes.iter_mut().find(|(f, _)| *f == field) {
            Some(slot) => slot.1 = value,
            None => self.changes.push((field, value)),
        }
    }

    pub fn set(mut self, field: EntryField, value: impl Into<String>) -> Self {
        self.insert(field, Some(value.into()));
        self
    }

    pub fn clear(mut self, field: EntryField) -> Self {
        self.insert(field, None);
        self
    }

    pub fn flag(self, field: EntryField, on: bool) -> Self {
        self.set(field, if on { "true" } else { "false" })
    }

    pub fn revision(self, field: EntryField, rev: u64) -> Self {
        self.set(field, rev.to_string())
    }

    pub fn date(self, field: EntryField, date: &DateTime<Utc>) -> Self {
        self.set(field, format_date(date))
    }

    pub fn schedule(self, schedule: Schedule) -> Self {
        match schedule.as_str() {
            Some(s) => self.set(EntryField::Schedule, s),
            None => self.clear(EntryField::Schedule),
        }
    }

    /// `Some(value)` when the patch touches the field
    pub fn get(&self, field: EntryField) -> Option<Option<&str>> {
        self.changes
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, v)| v.as_deref())
    }

    pub fn contains(&self, field: EntryField) -> bool {
        self.get(field).is_some()
    }

    pub fn remove(&mut self, field: EntryField) -> Option<Option<String>> {
        let idx = self.changes.iter().position(|(f, _)| *f == field)?;
        Some(self.changes.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntryField, Option<&str>)> {
        self.changes.iter().map(|(f, v)| (*f, v.as_deref()))
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}
