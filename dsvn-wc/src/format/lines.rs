//! Line-oriented entries codec (generations 8, 9 and 10)
//!
//! One field per line in a fixed order, a blank line for an absent field,
//! and a form-feed line closing each record. A record may end early; the
//! remaining fields are then absent.

use std::path::Path;

use super::{elided_value, Entries, Generation};
use crate::entry::{Entry, EntryField, FieldEncoding, THIS_DIR};
use crate::error::{Result, WcError};

use EntryField as F;

const LINES8: &[EntryField] = &[
    F::Name,
    F::Kind,
    F::Revision,
    F::Url,
    F::Repos,
    F::Schedule,
    F::TextTime,
    F::Checksum,
    F::CommittedDate,
    F::CommittedRev,
    F::LastAuthor,
    F::HasProps,
    F::HasPropMods,
    F::CachableProps,
    F::PresentProps,
    F::PropRejectFile,
    F::ConflictOld,
    F::ConflictNew,
    F::ConflictWrk,
    F::Copied,
    F::CopyfromUrl,
    F::CopyfromRev,
    F::Deleted,
    F::Absent,
    F::Incomplete,
    F::Uuid,
    F::LockToken,
    F::LockOwner,
    F::LockComment,
    F::LockCreationDate,
];

const LINES9: &[EntryField] = &[
    F::Name,
    F::Kind,
    F::Revision,
    F::Url,
    F::Repos,
    F::Schedule,
    F::TextTime,
    F::Checksum,
    F::CommittedDate,
    F::CommittedRev,
    F::LastAuthor,
    F::HasProps,
    F::HasPropMods,
    F::CachableProps,
    F::PresentProps,
    F::PropRejectFile,
    F::ConflictOld,
    F::ConflictNew,
    F::ConflictWrk,
    F::Copied,
    F::CopyfromUrl,
    F::CopyfromRev,
    F::Deleted,
    F::Absent,
    F::Incomplete,
    F::Uuid,
    F::LockToken,
    F::LockOwner,
    F::LockComment,
    F::LockCreationDate,
    F::Changelist,
    F::KeepLocal,
    F::WorkingSize,
    F::Depth,
];

const LINES10: &[EntryField] = &[
    F::Name,
    F::Kind,
    F::Revision,
    F::Url,
    F::Repos,
    F::Schedule,
    F::TextTime,
    F::Checksum,
    F::CommittedDate,
    F::CommittedRev,
    F::LastAuthor,
    F::HasProps,
    F::HasPropMods,
    F::CachableProps,
    F::PresentProps,
    F::PropRejectFile,
    F::ConflictOld,
    F::ConflictNew,
    F::ConflictWrk,
    F::Copied,
    F::CopyfromUrl,
    F::CopyfromRev,
    F::Deleted,
    F::Absent,
    F::Incomplete,
    F::Uuid,
    F::LockToken,
    F::LockOwner,
    F::LockComment,
    F::LockCreationDate,
    F::Changelist,
    F::KeepLocal,
    F::WorkingSize,
    F::Depth,
    F::TreeConflicts,
    F::FileExternal,
];

const TERMINATOR: &str = "\x0c";

/// Field order of a line generation
pub fn fields(generation: Generation) -> &'static [EntryField] {
    match generation {
        Generation::Lines8 => LINES8,
        Generation::Lines9 => LINES9,
        Generation::Lines10 | Generation::Xml4 => LINES10,
    }
}

/// Escape control bytes and backslashes as `\xHH`.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        if ch.is_ascii_control() || ch == '\\' {
            out.push_str(&format!("\\x{:02x}", ch as u32));
        } else {
            out.push(ch);
        }
    }
    out
}

/// Reverse of [`escape`]. Anything but `\x` plus two hex digits after a
/// backslash is rejected.
pub fn unescape(s: &str) -> std::result::Result<String, String> {
    if !s.contains('\\') {
        return Ok(s.to_string());
    }
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        if i + 4 > bytes.len() || bytes[i + 1] != b'x' {
            return Err("invalid escape sequence".to_string());
        }
        let value = match (hex_digit(bytes[i + 2]), hex_digit(bytes[i + 3])) {
            (Some(hi), Some(lo)) => hi << 4 | lo,
            _ => return Err("invalid escape sequence".to_string()),
        };
        out.push(value);
        i += 4;
    }
    String::from_utf8(out).map_err(|_| "escaped value is not valid UTF-8".to_string())
}

fn hex_digit(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

fn decode_field(field: EntryField, line: &str) -> std::result::Result<Option<String>, String> {
    if line.is_empty() {
        return Ok(None);
    }
    match field.encoding() {
        FieldEncoding::Text => unescape(line).map(Some),
        FieldEncoding::Value | FieldEncoding::Revision => Ok(Some(line.to_string())),
        FieldEncoding::Flag => {
            if line == field.name() {
                Ok(Some("true".to_string()))
            } else {
                Err(format!("invalid value for field '{}'", field.name()))
            }
        }
    }
}

/// Decode an entries file. The leading generation line is skipped.
pub fn read(data: &str, generation: Generation, path: &Path) -> Result<Entries> {
    let mut lines: Vec<&str> = data.split('\n').collect();
    if lines.last() == Some(&"") {
        lines.pop();
    }
    let mut idx = 1;
    let mut entries = Entries::new();
    let mut number = 0;
    let layout = fields(generation);

    while idx < lines.len() {
        let mut entry = Entry::default();
        let mut finished = false;
        for &field in layout {
            let line = *lines.get(idx).ok_or_else(|| {
                WcError::malformed(path, format!("unexpected end of entry {}", number))
            })?;
            idx += 1;
            if line.starts_with(TERMINATOR) {
                finished = true;
                break;
            }
            let value = decode_field(field, line)
                .map_err(|reason| WcError::malformed(path, format!("entry {}: {}", number, reason)))?;
            entry
                .set(field, value.as_deref())
                .map_err(|reason| WcError::malformed(path, format!("entry {}: {}", number, reason)))?;
        }
        if !finished {
            match lines.get(idx) {
                Some(line) if *line == TERMINATOR => idx += 1,
                Some(_) => {
                    return Err(WcError::malformed(
                        path,
                        format!("invalid entry terminator in entry {}", number),
                    ))
                }
                None => {
                    return Err(WcError::malformed(
                        path,
                        format!("missing entry terminator in entry {}", number),
                    ))
                }
            }
        }
        entries.insert(entry.name.clone(), entry);
        number += 1;
    }
    Ok(entries)
}

fn write_record(out: &mut String, entry: &Entry, dir: Option<&Entry>, generation: Generation) {
    let mut blanks = 0;
    for &field in fields(generation) {
        let value = elided_value(entry, dir, field).filter(|v| !v.is_empty());
        let Some(value) = value else {
            blanks += 1;
            continue;
        };
        for _ in 0..blanks {
            out.push('\n');
        }
        blanks = 0;
        match field.encoding() {
            FieldEncoding::Text => out.push_str(&escape(&value)),
            FieldEncoding::Flag => out.push_str(field.name()),
            FieldEncoding::Value | FieldEncoding::Revision => out.push_str(&value),
        }
        out.push('\n');
    }
    out.push_str(TERMINATOR);
    out.push('\n');
}

/// Encode an entry set; the self-entry is always written first.
pub fn write(entries: &Entries, generation: Generation) -> String {
    let mut out = format!("{}\n", generation.number());
    let dir = entries.get(THIS_DIR);
    if let Some(dir) = dir {
        write_record(&mut out, dir, None, generation);
    }
    for (name, entry) in entries {
        if name == THIS_DIR {
            continue;
        }
        match dir {
            Some(dir) => {
                let mut entry = entry.clone();
                entry.inherit_from(dir);
                write_record(&mut out, &entry, Some(dir), generation);
            }
            None => write_record(&mut out, entry, None, generation),
        }
    }
    out
}
