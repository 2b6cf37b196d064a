//! Write-ahead command log
//!
//! Each admin area keeps zero or more log files (`log`, `log.1`, ...).
//! A file holds a sequence of commands in a pseudo-markup form:
//!
//! ```text
//! <modify-entry
//!    name="foo.c"
//!    revision="12"/>
//! <mv
//!    name=".svn/tmp/text-base/foo.c.svn-base"
//!    dest=".svn/text-base/foo.c.svn-base"/>
//! ```
//!
//! Paths are relative to the versioned directory. Files run in ascending
//! numeric order, commands within a file in append order.

use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::entry::{format_date, parse_date, EntryField, EntryPatch};
use crate::error::{Result, WcError};
use crate::format::xml::escape_attr;
use crate::format::Generation;
use crate::path::install_file;

pub const ATTR_NAME: &str = "name";
pub const ATTR_DEST: &str = "dest";
pub const ATTR_PROPNAME: &str = "propname";
pub const ATTR_PROPVAL: &str = "propval";
pub const ATTR_TIMESTAMP: &str = "timestamp";
pub const ATTR_REVISION: &str = "revision";
pub const ATTR_FORMAT: &str = "format";
pub const ATTR_IMPLICIT: &str = "implicit";
pub const ATTR_FORCE: &str = "force";

/// Placeholder for `text-time`/`prop-time` resolved from the file at replay
pub const WORKING_TIMESTAMP: &str = "working";

/// One journaled step
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Remove an entry from the entries file
    DeleteEntry { name: String },
    /// Apply field changes to an entry
    ModifyEntry {
        name: String,
        patch: EntryPatch,
        force: bool,
    },
    /// Set or delete a server property
    ModifyWcProperty {
        name: String,
        prop: String,
        value: Option<String>,
    },
    /// Drop the lock fields of an entry
    DeleteLock { name: String },
    /// Rename a file
    Move { name: String, dest: String },
    /// Append a file to another
    Append { name: String, dest: String },
    /// Delete a file
    Delete { name: String },
    /// Make a file read-only
    Readonly { name: String },
    /// Make a file read-only when it needs a lock and none is held
    MaybeReadonly { name: String },
    /// Copy base form to working form
    CopyAndTranslate { name: String, dest: String },
    /// Copy working form to base form
    CopyAndDetranslate { name: String, dest: String },
    /// Plain copy
    Copy { name: String, dest: String },
    /// Three-way text merge into the working file
    Merge {
        name: String,
        left: String,
        right: String,
        left_label: Option<String>,
        right_label: Option<String>,
        target_label: Option<String>,
    },
    /// Set a file's modification time
    SetTimestamp {
        name: String,
        timestamp: DateTime<Utc>,
    },
    /// Finalize a commit of an entry
    Committed {
        name: String,
        revision: u64,
        implicit: bool,
    },
    /// Rewrite the entries store in another generation
    UpgradeFormat { format: Generation },
}

impl Command {
    /// Opcode as written to disk
    pub fn opcode(&self) -> &'static str {
        match self {
            Command::DeleteEntry { .. } => "delete-entry",
            Command::ModifyEntry { .. } => "modify-entry",
            Command::ModifyWcProperty { .. } => "modify-wcprop",
            Command::DeleteLock { .. } => "delete-lock",
            Command::Move { .. } => "mv",
            Command::Append { .. } => "append",
            Command::Delete { .. } => "rm",
            Command::Readonly { .. } => "readonly",
            Command::MaybeReadonly { .. } => "maybe-readonly",
            Command::CopyAndTranslate { .. } => "cp-and-translate",
            Command::CopyAndDetranslate { .. } => "cp-and-detranslate",
            Command::Copy { .. } => "cp",
            Command::Merge { .. } => "merge",
            Command::SetTimestamp { .. } => "set-timestamp",
            Command::Committed { .. } => "committed",
            Command::UpgradeFormat { .. } => "upgrade-format",
        }
    }

    /// Target name the command operates on
    pub fn name(&self) -> &str {
        match self {
            Command::DeleteEntry { name }
            | Command::ModifyEntry { name, .. }
            | Command::ModifyWcProperty { name, .. }
            | Command::DeleteLock { name }
            | Command::Move { name, .. }
            | Command::Append { name, .. }
            | Command::Delete { name }
            | Command::Readonly { name }
            | Command::MaybeReadonly { name }
            | Command::CopyAndTranslate { name, .. }
            | Command::CopyAndDetranslate { name, .. }
            | Command::Copy { name, .. }
            | Command::Merge { name, .. }
            | Command::SetTimestamp { name, .. }
            | Command::Committed { name, .. } => name,
            Command::UpgradeFormat { .. } => "",
        }
    }

    fn attributes(&self) -> Vec<(String, String)> {
        let mut attrs = Vec::new();
        let mut push = |k: &str, v: &str| attrs.push((k.to_string(), v.to_string()));
        match self {
            Command::UpgradeFormat { format } => push(ATTR_FORMAT, &format.to_string()),
            _ => push(ATTR_NAME, self.name()),
        }
        match self {
            Command::ModifyEntry { patch, force, .. } => {
                for (field, value) in patch.iter() {
                    push(field.name(), value.unwrap_or_default());
                }
                if *force {
                    push(ATTR_FORCE, "true");
                }
            }
            Command::ModifyWcProperty { prop, value, .. } => {
                push(ATTR_PROPNAME, prop);
                push(ATTR_PROPVAL, value.as_deref().unwrap_or_default());
            }
            Command::Move { dest, .. }
            | Command::Append { dest, .. }
            | Command::CopyAndTranslate { dest, .. }
            | Command::CopyAndDetranslate { dest, .. }
            | Command::Copy { dest, .. } => push(ATTR_DEST, dest),
            Command::Merge {
                left,
                right,
                left_label,
                right_label,
                target_label,
                ..
            } => {
                push("arg1", left);
                push("arg2", right);
                for (key, label) in [("arg3", left_label), ("arg4", right_label), ("arg5", target_label)] {
                    if let Some(label) = label {
                        push(key, label);
                    }
                }
            }
            Command::SetTimestamp { timestamp, .. } => push(ATTR_TIMESTAMP, &format_date(timestamp)),
            Command::Committed { revision, implicit, .. } => {
                push(ATTR_REVISION, &revision.to_string());
                if *implicit {
                    push(ATTR_IMPLICIT, "true");
                }
            }
            _ => {}
        }
        attrs
    }

    fn from_record(opcode: &str, mut attrs: Attributes, path: &Path) -> Result<Self> {
        let missing = |key: &str| {
            WcError::malformed(path, format!("missing '{}' attribute in '{}' command", key, opcode))
        };

        match opcode {
            "upgrade-format" => {
                let raw = take_attr(&mut attrs, ATTR_FORMAT).ok_or_else(|| missing(ATTR_FORMAT))?;
                let format = raw
                    .parse::<u32>()
                    .ok()
                    .and_then(Generation::from_number)
                    .ok_or_else(|| WcError::malformed(path, format!("invalid format '{}'", raw)))?;
                return Ok(Command::UpgradeFormat { format });
            }
            "modify-entry" => {
                let name = remove_attr(&mut attrs, ATTR_NAME).unwrap_or_default();
                let force = remove_attr(&mut attrs, ATTR_FORCE).as_deref() == Some("true");
                let mut patch = EntryPatch::new();
                for (key, value) in attrs {
                    let field = EntryField::from_name(&key).ok_or_else(|| {
                        WcError::malformed(path, format!("unknown entry attribute '{}'", key))
                    })?;
                    patch.insert(field, if value.is_empty() { None } else { Some(value) });
                }
                return Ok(Command::ModifyEntry { name, patch, force });
            }
            _ => {}
        }

        // the self entry is addressed by an empty name
        let name = remove_attr(&mut attrs, ATTR_NAME).ok_or_else(|| missing(ATTR_NAME))?;
        let mut take = |key: &str| take_attr(&mut attrs, key);

        Ok(match opcode {
            "delete-entry" => Command::DeleteEntry { name },
            "modify-wcprop" => Command::ModifyWcProperty {
                name,
                prop: take(ATTR_PROPNAME).ok_or_else(|| missing(ATTR_PROPNAME))?,
                value: take(ATTR_PROPVAL),
            },
            "delete-lock" => Command::DeleteLock { name },
            "mv" => Command::Move {
                name,
                dest: take(ATTR_DEST).ok_or_else(|| missing(ATTR_DEST))?,
            },
            "append" => Command::Append {
                name,
                dest: take(ATTR_DEST).ok_or_else(|| missing(ATTR_DEST))?,
            },
            "rm" => Command::Delete { name },
            "readonly" => Command::Readonly { name },
            "maybe-readonly" => Command::MaybeReadonly { name },
            "cp-and-translate" => Command::CopyAndTranslate {
                name,
                dest: take(ATTR_DEST).ok_or_else(|| missing(ATTR_DEST))?,
            },
            "cp-and-detranslate" => Command::CopyAndDetranslate {
                name,
                dest: take(ATTR_DEST).ok_or_else(|| missing(ATTR_DEST))?,
            },
            "cp" => Command::Copy {
                name,
                dest: take(ATTR_DEST).ok_or_else(|| missing(ATTR_DEST))?,
            },
            "merge" => Command::Merge {
                name,
                left: take("arg1").ok_or_else(|| missing("arg1"))?,
                right: take("arg2").ok_or_else(|| missing("arg2"))?,
                left_label: take("arg3"),
                right_label: take("arg4"),
                target_label: take("arg5"),
            },
            "set-timestamp" => {
                let raw = take(ATTR_TIMESTAMP).ok_or_else(|| missing(ATTR_TIMESTAMP))?;
                let timestamp = parse_date(&raw)
                    .ok_or_else(|| WcError::malformed(path, format!("invalid timestamp '{}'", raw)))?;
                Command::SetTimestamp { name, timestamp }
            }
            "committed" => {
                let raw = take(ATTR_REVISION).ok_or_else(|| missing(ATTR_REVISION))?;
                let revision = raw
                    .parse::<u64>()
                    .map_err(|_| WcError::malformed(path, format!("invalid revision '{}'", raw)))?;
                Command::Committed {
                    name,
                    revision,
                    implicit: take(ATTR_IMPLICIT).as_deref() == Some("true"),
                }
            }
            other => {
                return Err(WcError::malformed(path, format!("unrecognized log command '{}'", other)));
            }
        })
    }
}

/// Attributes of one record, in file order
type Attributes = Vec<(String, String)>;

fn remove_attr(attrs: &mut Attributes, key: &str) -> Option<String> {
    let idx = attrs.iter().position(|(k, _)| k == key)?;
    Some(attrs.remove(idx).1)
}

/// Remove an attribute, treating an empty value as absent
fn take_attr(attrs: &mut Attributes, key: &str) -> Option<String> {
    remove_attr(attrs, key).filter(|v| !v.is_empty())
}

/// Render commands in log-file form.
pub fn render(commands: &[Command]) -> String {
    let mut out = String::new();
    for command in commands {
        out.push('<');
        out.push_str(command.opcode());
        for (key, value) in command.attributes() {
            out.push_str("\n   ");
            out.push_str(&key);
            out.push_str("=\"");
            out.push_str(&escape_attr(&value));
            out.push('"');
        }
        out.push_str("/>\n");
    }
    out
}

fn parse_attribute(line: &str, path: &Path) -> Result<(String, String)> {
    let (key, value) = line
        .split_once('=')
        .ok_or_else(|| WcError::malformed(path, format!("bad log attribute '{}'", line)))?;
    let value = value
        .trim()
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .ok_or_else(|| WcError::malformed(path, format!("unquoted log attribute '{}'", line)))?;
    let value = quick_xml::escape::unescape(value)
        .map_err(|e| WcError::malformed(path, e.to_string()))?;
    Ok((key.trim().to_string(), value.into_owned()))
}

/// Parse the contents of one log file.
pub fn parse(data: &str, path: &Path) -> Result<Vec<Command>> {
    let mut commands = Vec::new();
    let mut current: Option<(String, Attributes)> = None;

    for line in data.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (body, closes) = match line.strip_suffix("/>") {
            Some(body) => (body.trim_end(), true),
            None => (line, false),
        };
        if let Some(opcode) = body.strip_prefix('<') {
            if current.is_some() {
                return Err(WcError::malformed(path, "unterminated log command"));
            }
            current = Some((opcode.trim().to_string(), Attributes::new()));
        } else if !body.is_empty() {
            let (_, attrs) = current
                .as_mut()
                .ok_or_else(|| WcError::malformed(path, "log attribute outside a command"))?;
            let (key, value) = parse_attribute(body, path)?;
            attrs.push((key, value));
        }
        if closes {
            let (opcode, attrs) = current
                .take()
                .ok_or_else(|| WcError::malformed(path, "unexpected '/>' in log"))?;
            commands.push(Command::from_record(&opcode, attrs, path)?);
        }
    }
    if current.is_some() {
        return Err(WcError::malformed(path, "unterminated log command"));
    }
    Ok(commands)
}

/// File name of the log with the given sequence number
pub fn log_file_name(id: u32) -> String {
    if id == 0 {
        "log".to_string()
    } else {
        format!("log.{}", id)
    }
}

/// Existing log files of an admin directory, in execution order
pub fn log_files(admin_dir: &Path) -> Result<Vec<(u32, PathBuf)>> {
    let mut files = Vec::new();
    let read_dir = match fs::read_dir(admin_dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(e.into()),
    };
    for dirent in read_dir {
        let dirent = dirent?;
        let name = dirent.file_name();
        let Some(name) = name.to_str() else { continue };
        let id = match name {
            "log" => Some(0),
            _ => name.strip_prefix("log.").and_then(|n| n.parse::<u32>().ok()),
        };
        if let Some(id) = id {
            files.push((id, dirent.path()));
        }
    }
    files.sort();
    Ok(files)
}

/// Commands staged for one admin area
#[derive(Debug)]
pub struct Log {
    admin_dir: PathBuf,
    commands: Vec<Command>,
}

impl Log {
    pub fn new(admin_dir: impl Into<PathBuf>) -> Self {
        Self {
            admin_dir: admin_dir.into(),
            commands: Vec::new(),
        }
    }

    pub fn add(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Persist staged commands to a new log file and clear them.
    ///
    /// The file takes the number after the highest existing log.
    pub fn save(&mut self) -> Result<Option<PathBuf>> {
        if self.commands.is_empty() {
            return Ok(None);
        }
        let id = log_files(&self.admin_dir)?
            .last()
            .map(|(id, _)| id + 1)
            .unwrap_or(0);
        let name = log_file_name(id);
        let path = self.admin_dir.join(&name);
        write_log_file(&self.admin_dir, &path, &self.commands)?;
        debug!("Saved {} log commands to {:?}", self.commands.len(), path);
        self.commands.clear();
        Ok(Some(path))
    }
}

/// Write `commands` to `path` through the area's tmp directory.
pub(crate) fn write_log_file(admin_dir: &Path, path: &Path, commands: &[Command]) -> Result<()> {
    let file_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    let tmp_path = admin_dir.join("tmp").join(file_name);
    install_file(&tmp_path, path, render(commands).as_bytes())
}
