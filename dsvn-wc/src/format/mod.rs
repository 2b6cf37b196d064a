//! On-disk schema generations for the entries store
//!
//! The set of generations is closed:
//! - 4: legacy XML entries, generation number kept in the `format` file
//! - 8: line-oriented entries, generation number on the first line
//! - 9: adds changelist, keep-local, working-size and depth
//! - 10: adds tree-conflict data and file-external data
//!
//! The codec for an admin area is picked once, when the area is opened.

pub mod lines;
pub mod xml;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use crate::entry::{Entry, EntryField, THIS_DIR};
use crate::error::{FormatProblem, Result, WcError};
use crate::path::url_is_ancestor;

/// Entry set of one directory, keyed and sorted by name
pub type Entries = BTreeMap<String, Entry>;

/// A supported entries schema generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Generation {
    Xml4,
    Lines8,
    Lines9,
    Lines10,
}

impl Generation {
    /// Newest generation this library writes
    pub const LATEST: Generation = Generation::Lines10;

    pub const ALL: &'static [Generation] = &[
        Generation::Xml4,
        Generation::Lines8,
        Generation::Lines9,
        Generation::Lines10,
    ];

    pub fn number(&self) -> u32 {
        match self {
            Generation::Xml4 => 4,
            Generation::Lines8 => 8,
            Generation::Lines9 => 9,
            Generation::Lines10 => 10,
        }
    }

    pub fn from_number(n: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|g| g.number() == n)
    }

    /// Map an on-disk number to a generation, or explain why it is unusable.
    pub fn check(n: u32, path: &Path) -> Result<Self> {
        if let Some(generation) = Self::from_number(n) {
            return Ok(generation);
        }
        let problem = if n > Self::LATEST.number() {
            FormatProblem::TooNew
        } else {
            FormatProblem::TooOld
        };
        Err(WcError::UnsupportedFormat {
            path: path.to_path_buf(),
            format: n,
            problem,
        })
    }

    pub fn is_xml(&self) -> bool {
        matches!(self, Generation::Xml4)
    }

    /// Whether this generation persists the given field
    pub fn stores(&self, field: EntryField) -> bool {
        match self {
            Generation::Xml4 => !matches!(
                field,
                EntryField::HasProps
                    | EntryField::HasPropMods
                    | EntryField::CachableProps
                    | EntryField::PresentProps
                    | EntryField::Changelist
                    | EntryField::KeepLocal
                    | EntryField::WorkingSize
                    | EntryField::Depth
                    | EntryField::TreeConflicts
                    | EntryField::FileExternal
            ),
            _ => lines::fields(*self).contains(&field),
        }
    }

    /// Decode an entries file written in this generation.
    pub fn read_entries(&self, data: &str, path: &Path) -> Result<Entries> {
        let entries = match self {
            Generation::Xml4 => xml::read(data, path)?,
            _ => lines::read(data, *self, path)?,
        };
        resolve_entries(entries, path)
    }

    /// Encode an entry set in this generation.
    pub fn write_entries(&self, entries: &Entries) -> String {
        match self {
            Generation::Xml4 => xml::write(entries),
            _ => lines::write(entries, *self),
        }
    }
}

impl TryFrom<u32> for Generation {
    type Error = String;

    fn try_from(n: u32) -> std::result::Result<Self, Self::Error> {
        Generation::from_number(n).ok_or_else(|| format!("unsupported entries generation {}", n))
    }
}

impl From<Generation> for u32 {
    fn from(generation: Generation) -> u32 {
        generation.number()
    }
}

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Read the generation number of the admin directory `admin_dir`.
///
/// Line generations carry it on the first line of `entries`; the XML
/// generation keeps it in `format`.
pub fn detect(admin_dir: &Path) -> Result<u32> {
    let entries_path = admin_dir.join("entries");
    let data = match fs::read_to_string(&entries_path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(WcError::NotAWorkingCopy(
                admin_dir.parent().unwrap_or(admin_dir).to_path_buf(),
            ));
        }
        Err(e) => return Err(e.into()),
    };
    let first = data.lines().next().unwrap_or_default().trim();
    if let Ok(n) = first.parse::<u32>() {
        return Ok(n);
    }
    let format_path = admin_dir.join("format");
    let text = fs::read_to_string(&format_path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => WcError::NotAWorkingCopy(
            admin_dir.parent().unwrap_or(admin_dir).to_path_buf(),
        ),
        _ => WcError::Io(e),
    })?;
    text.trim()
        .parse::<u32>()
        .map_err(|_| WcError::malformed(&format_path, "invalid format number"))
}

/// Validate the self-entry and apply inheritance to file children.
fn resolve_entries(mut entries: Entries, path: &Path) -> Result<Entries> {
    let dir = entries
        .get(THIS_DIR)
        .cloned()
        .ok_or_else(|| WcError::malformed(path, "missing default entry"))?;
    if dir.revision.is_none() {
        return Err(WcError::malformed(path, "default entry has no revision number"));
    }
    let dir_url = dir
        .url
        .as_deref()
        .ok_or_else(|| WcError::malformed(path, "default entry is missing URL"))?;
    if let Some(repos) = dir.repos.as_deref() {
        if !url_is_ancestor(repos, dir_url) {
            return Err(WcError::malformed(
                path,
                format!("entry '{}' has invalid repository root", dir.name),
            ));
        }
    }
    for entry in entries.values_mut() {
        if entry.is_this_dir() {
            continue;
        }
        entry.inherit_from(&dir);
        if let (Some(repos), Some(url)) = (entry.repos.as_deref(), entry.url.as_deref()) {
            if !url_is_ancestor(repos, url) {
                return Err(WcError::malformed(
                    path,
                    format!("entry '{}' has invalid repository root", entry.name),
                ));
            }
        }
    }
    Ok(entries)
}

/// Values a child entry writes after eliding what it inherits.
pub(crate) fn elided_value(entry: &Entry, dir: Option<&Entry>, field: EntryField) -> Option<String> {
    let value = entry.get(field);
    let Some(dir) = dir else {
        return value;
    };
    let inherited = matches!(
        field,
        EntryField::Revision | EntryField::Url | EntryField::Repos | EntryField::Uuid
    );
    if !inherited {
        return value;
    }
    if entry.is_dir() {
        return if field == EntryField::Uuid && value != dir.get(field) {
            value
        } else {
            None
        };
    }
    let expected = match field {
        EntryField::Url => dir.url.as_deref().map(|u| Entry::expected_url(u, &entry.name)),
        _ => dir.get(field),
    };
    if value == expected { None } else { value }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_generation_numbers() {
        for generation in Generation::ALL {
            assert_eq!(Generation::from_number(generation.number()), Some(*generation));
        }
        assert_eq!(Generation::LATEST.number(), 10);
    }

    #[test]
    fn test_check_rejects_unknown() {
        let p = PathBuf::from("/wc");
        match Generation::check(12, &p) {
            Err(WcError::UnsupportedFormat { problem, .. }) => assert_eq!(problem, FormatProblem::TooNew),
            other => panic!("unexpected {:?}", other),
        }
        match Generation::check(3, &p) {
            Err(WcError::UnsupportedFormat { problem, .. }) => assert_eq!(problem, FormatProblem::TooOld),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_generation_serde_as_number() {
        let json = serde_json::to_string(&Generation::Lines9).unwrap();
        assert_eq!(json, "9");
        let back: Generation = serde_json::from_str("8").unwrap();
        assert_eq!(back, Generation::Lines8);
        assert!(serde_json::from_str::<Generation>("5").is_err());
    }

    #[test]
    fn test_stores_fields_per_generation() {
        assert!(Generation::Xml4.stores(EntryField::PropTime));
        assert!(!Generation::Xml4.stores(EntryField::HasProps));
        assert!(!Generation::Lines8.stores(EntryField::Changelist));
        assert!(Generation::Lines9.stores(EntryField::Changelist));
        assert!(Generation::Lines10.stores(EntryField::FileExternal));
        assert!(!Generation::Lines10.stores(EntryField::PropTime));
    }
}
