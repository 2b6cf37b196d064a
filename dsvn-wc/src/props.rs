//! Versioned property storage
//!
//! Property sets are plain name -> value maps. Each entry has four of
//! them: working, base, revert and server ("wc") properties. On disk they
//! use the hash dump format:
//!
//! ```text
//! K 13
//! svn:eol-style
//! V 6
//! native
//! END
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use crate::error::{Result, WcError};

/// Property name -> value
pub type PropMap = BTreeMap<String, String>;

/// Property name -> new value, `None` meaning deletion
pub type PropDiff = BTreeMap<String, Option<String>>;

/// The four parallel property sets of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropSet {
    Working,
    Base,
    Revert,
    Wc,
}

/// Which namespace a property name belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropKind {
    /// User-visible versioned property
    Regular,
    /// Entry metadata delivered as `svn:entry:*`
    Entry,
    /// Server-side bookkeeping delivered as `svn:wc:*`
    Wc,
}

/// Classify a property name by prefix
pub fn prop_kind(name: &str) -> PropKind {
    if name.starts_with(svn_props::ENTRY_PREFIX) {
        PropKind::Entry
    } else if name.starts_with(svn_props::WC_PREFIX) {
        PropKind::Wc
    } else {
        PropKind::Regular
    }
}

/// One property set plus a dirty flag
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VersionedProps {
    map: PropMap,
    modified: bool,
}

impl VersionedProps {
    /// Create an empty, unmodified set
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a loaded map, unmodified
    pub fn from_map(map: PropMap) -> Self {
        Self { map, modified: false }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.map.get(name).map(String::as_str)
    }

    /// Set or delete a value; marks the set modified when it changes.
    pub fn set(&mut self, name: &str, value: Option<&str>) {
        let changed = match value {
            Some(v) => self.map.insert(name.to_string(), v.to_string()).as_deref() != Some(v),
            None => self.map.remove(name).is_some(),
        };
        if changed {
            self.modified = true;
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn as_map(&self) -> &PropMap {
        &self.map
    }

    /// Replace the whole map and mark the set modified
    pub fn replace(&mut self, map: PropMap) {
        self.map = map;
        self.modified = true;
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn set_modified(&mut self, modified: bool) {
        self.modified = modified;
    }

    /// Diff turning `self` into `other`.
    ///
    /// Keys missing from `other` map to `None`; new or changed keys map to
    /// the value in `other`.
    pub fn compare_to(&self, other: &VersionedProps) -> PropDiff {
        diff_maps(&self.map, &other.map)
    }
}

/// Diff turning `from` into `to`
pub fn diff_maps(from: &PropMap, to: &PropMap) -> PropDiff {
    let mut diff = PropDiff::new();
    for name in from.keys() {
        if !to.contains_key(name) {
            diff.insert(name.clone(), None);
        }
    }
    for (name, value) in to {
        if from.get(name) != Some(value) {
            diff.insert(name.clone(), Some(value.clone()));
        }
    }
    diff
}

fn read_line<'a>(data: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    if *pos >= data.len() {
        return None;
    }
    let rest = &data[*pos..];
    let end = rest.iter().position(|&b| b == b'\n').unwrap_or(rest.len());
    *pos += (end + 1).min(rest.len());
    Some(&rest[..end])
}

fn read_counted<'a>(data: &'a [u8], pos: &mut usize, len: usize, path: &Path) -> Result<&'a [u8]> {
    let end = pos
        .checked_add(len)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| WcError::malformed(path, "property value runs past end of file"))?;
    let value = &data[*pos..end];
    *pos = end;
    if data.get(*pos) != Some(&b'\n') {
        return Err(WcError::malformed(path, "missing newline after property data"));
    }
    *pos += 1;
    Ok(value)
}

fn header_len(line: &[u8], tag: u8, path: &Path) -> Result<usize> {
    let text = std::str::from_utf8(line).map_err(|_| WcError::malformed(path, "bad property header"))?;
    let mut parts = text.splitn(2, ' ');
    match (parts.next(), parts.next()) {
        (Some(t), Some(n)) if t.as_bytes() == [tag] => n
            .trim()
            .parse::<usize>()
            .map_err(|_| WcError::malformed(path, format!("bad length in '{}'", text))),
        _ => Err(WcError::malformed(path, format!("unexpected property header '{}'", text))),
    }
}

fn utf8(bytes: &[u8], path: &Path) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|_| WcError::malformed(path, "property data is not UTF-8"))
}

/// Parse one hash starting at `pos`, leaving `pos` after its `END` line.
pub fn parse_hash_at(data: &[u8], pos: &mut usize, path: &Path) -> Result<PropMap> {
    let mut map = PropMap::new();
    loop {
        let line = read_line(data, pos).ok_or_else(|| WcError::malformed(path, "missing END marker"))?;
        if line == b"END" {
            return Ok(map);
        }
        let key_len = header_len(line, b'K', path)?;
        let key = utf8(read_counted(data, pos, key_len, path)?, path)?;
        let line = read_line(data, pos).ok_or_else(|| WcError::malformed(path, "missing value header"))?;
        let value_len = header_len(line, b'V', path)?;
        let value = utf8(read_counted(data, pos, value_len, path)?, path)?;
        map.insert(key, value);
    }
}

/// Serialize a map in hash dump form
pub fn render_hash(map: &PropMap) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, value) in map {
        out.extend_from_slice(format!("K {}\n", name.len()).as_bytes());
        out.extend_from_slice(name.as_bytes());
        out.push(b'\n');
        out.extend_from_slice(format!("V {}\n", value.len()).as_bytes());
        out.extend_from_slice(value.as_bytes());
        out.push(b'\n');
    }
    out.extend_from_slice(b"END\n");
    out
}

/// Load a property file. A missing or near-empty file is an empty set.
pub fn read_hash_file(path: &Path) -> Result<PropMap> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(PropMap::new()),
        Err(e) => return Err(e.into()),
    };
    if data.len() <= 4 {
        return Ok(PropMap::new());
    }
    let mut pos = 0;
    parse_hash_at(&data, &mut pos, path)
}

/// Write a property file, creating parent directories as needed.
pub fn write_hash_file(path: &Path, map: &PropMap) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, render_hash(map))?;
    Ok(())
}

/// Parse the combined server-property file of line generations.
///
/// The directory's own set comes first, followed by `name` lines each
/// introducing one child's set.
pub fn parse_all_wcprops(data: &[u8], path: &Path) -> Result<BTreeMap<String, PropMap>> {
    let mut result = BTreeMap::new();
    if data.is_empty() {
        return Ok(result);
    }
    let mut pos = 0;
    let dir_props = parse_hash_at(data, &mut pos, path)?;
    result.insert(String::new(), dir_props);
    while let Some(name) = read_line(data, &mut pos) {
        if name.is_empty() && pos >= data.len() {
            break;
        }
        let name = utf8(name, path)?;
        let props = parse_hash_at(data, &mut pos, path)?;
        result.insert(name, props);
    }
    Ok(result)
}

/// Render the combined server-property file; empty child sets are skipped.
pub fn render_all_wcprops(sets: &BTreeMap<String, PropMap>) -> Vec<u8> {
    let empty = PropMap::new();
    let mut out = render_hash(sets.get("").unwrap_or(&empty));
    for (name, props) in sets {
        if name.is_empty() || props.is_empty() {
            continue;
        }
        out.extend_from_slice(name.as_bytes());
        out.push(b'\n');
        out.extend_from_slice(&render_hash(props));
    }
    out
}

/// SVN standard properties
pub mod svn_props {
    /// Executable flag
    pub const EXECUTABLE: &str = "svn:executable";

    /// MIME type
    pub const MIME_TYPE: &str = "svn:mime-type";

    /// End-of-line style
    pub const EOL_STYLE: &str = "svn:eol-style";

    /// Keywords
    pub const KEYWORDS: &str = "svn:keywords";

    /// Needs lock
    pub const NEEDS_LOCK: &str = "svn:needs-lock";

    /// Special file (symlink)
    pub const SPECIAL: &str = "svn:special";

    /// Externals
    pub const EXTERNALS: &str = "svn:externals";

    /// Merge info
    pub const MERGE_INFO: &str = "svn:mergeinfo";

    /// Prefix of entry metadata pseudo-properties
    pub const ENTRY_PREFIX: &str = "svn:entry:";

    /// Prefix of server bookkeeping properties
    pub const WC_PREFIX: &str = "svn:wc:";

    /// Properties whose presence is cached in the entry itself
    pub const CACHABLE: &[&str] = &[SPECIAL, EXTERNALS, NEEDS_LOCK];

    /// Check if a property name is an SVN standard property
    pub fn is_svn_property(name: &str) -> bool {
        name.starts_with("svn:")
    }
}
