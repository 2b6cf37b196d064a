//! Three-way property merge
//!
//! Incoming changes are described by a diff against the server's idea of
//! the base (`server_base`, falling back to the local base). Each changed
//! name is classified against the local working and base values.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::props::{prop_kind, svn_props, PropDiff, PropKind, PropMap};

/// Outcome of merging a property diff into one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStatus {
    /// Nothing incoming
    Unchanged,
    /// Incoming changes applied cleanly
    Changed,
    /// Incoming changes already present locally, or combined with local ones
    Merged,
    /// At least one property could not be merged
    Conflicted,
}

/// New property sets plus the status and conflict descriptions
#[derive(Debug, Clone, PartialEq)]
pub struct PropMerge {
    pub status: MergeStatus,
    pub base: PropMap,
    pub working: PropMap,
    pub conflicts: Vec<String>,
}

impl PropMerge {
    pub fn is_conflicted(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// Merge `diff` into the local `base`/`working` sets.
///
/// Only regular properties are merged; entry and server bookkeeping names
/// in the diff are ignored. With `base_merge` the incoming values are also
/// written into the returned base set.
pub fn merge_props(
    base: &PropMap,
    working: &PropMap,
    server_base: Option<&PropMap>,
    diff: &PropDiff,
    base_merge: bool,
) -> PropMerge {
    let mut result = PropMerge {
        status: if diff.is_empty() { MergeStatus::Unchanged } else { MergeStatus::Changed },
        base: base.clone(),
        working: working.clone(),
        conflicts: Vec::new(),
    };

    for (name, to) in diff {
        if prop_kind(name) != PropKind::Regular {
            continue;
        }
        let from = match server_base {
            Some(server_base) => server_base.get(name),
            None => base.get(name),
        };
        let base_value = base.get(name);
        let working_value = working.get(name).cloned();
        let to = to.as_ref();

        if base_merge {
            match to {
                Some(v) => result.base.insert(name.clone(), v.clone()),
                None => result.base.remove(name),
            };
        }

        let verdict = match (from, to) {
            (None, Some(to)) => remote_add(name, to, base_value, working_value.as_ref()),
            (_, None) => remote_delete(name, from, working_value.as_ref()),
            (Some(from), Some(to)) => remote_change(name, from, to, working_value.as_ref()),
        };

        match verdict {
            Verdict::Accept(value) => set(&mut result.working, name, value),
            Verdict::Merged(value) => {
                set(&mut result.working, name, value);
                if result.status != MergeStatus::Conflicted {
                    result.status = MergeStatus::Merged;
                }
            }
            Verdict::Conflict(description) => {
                result.status = MergeStatus::Conflicted;
                result.conflicts.push(description);
            }
        }
    }
    result
}

enum Verdict {
    Accept(Option<String>),
    Merged(Option<String>),
    Conflict(String),
}

fn set(map: &mut PropMap, name: &str, value: Option<String>) {
    match value {
        Some(v) => map.insert(name.to_string(), v),
        None => map.remove(name),
    };
}

fn remote_add(name: &str, to: &str, base: Option<&String>, working: Option<&String>) -> Verdict {
    match working {
        None => match base {
            Some(b) if b != to => Verdict::Conflict(format!(
                "Trying to add new property '{}' with value '{}',\nbut property has been locally deleted and had value '{}'.",
                name, to, b
            )),
            _ => Verdict::Accept(Some(to.to_string())),
        },
        Some(w) if w == to => Verdict::Merged(Some(to.to_string())),
        Some(w) => match union_if_mergeinfo(name, w, to) {
            Some(merged) => Verdict::Merged(Some(merged)),
            None => Verdict::Conflict(format!(
                "Trying to add new property '{}' with value '{}',\nbut property already exists with value '{}'.",
                name, to, w
            )),
        },
    }
}

fn remote_delete(name: &str, from: Option<&String>, working: Option<&String>) -> Verdict {
    match working {
        None => Verdict::Merged(None),
        Some(w) if Some(w) == from => Verdict::Accept(None),
        Some(w) => Verdict::Conflict(format!(
            "Trying to delete property '{}' but value has been modified from '{}' to '{}'.",
            name,
            from.map(String::as_str).unwrap_or_default(),
            w
        )),
    }
}

fn remote_change(name: &str, from: &str, to: &str, working: Option<&String>) -> Verdict {
    match working {
        Some(w) if w == from => Verdict::Accept(Some(to.to_string())),
        Some(w) if w == to => Verdict::Merged(Some(to.to_string())),
        None => Verdict::Conflict(format!(
            "Trying to change property '{}' from '{}' to '{}',\nbut the property does not exist.",
            name, from, to
        )),
        Some(w) => match union_if_mergeinfo(name, w, to) {
            Some(merged) => Verdict::Merged(Some(merged)),
            None => Verdict::Conflict(format!(
                "Trying to change property '{}' from '{}' to '{}',\nbut property has been locally changed from '{}' to '{}'.",
                name, from, to, from, w
            )),
        },
    }
}

fn union_if_mergeinfo(name: &str, local: &str, incoming: &str) -> Option<String> {
    if name != svn_props::MERGE_INFO {
        return None;
    }
    mergeinfo_union(local, incoming)
}

// ─────────────────────────────────────────────────────
// Merge info
// ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct RevRange {
    start: u64,
    end: u64,
    non_inheritable: bool,
}

type MergeInfo = BTreeMap<String, Vec<RevRange>>;

fn parse_range(text: &str) -> Option<RevRange> {
    let (text, non_inheritable) = match text.strip_suffix('*') {
        Some(t) => (t, true),
        None => (text, false),
    };
    let (start, end) = match text.split_once('-') {
        Some((a, b)) => (a.trim().parse().ok()?, b.trim().parse().ok()?),
        None => {
            let r = text.trim().parse().ok()?;
            (r, r)
        }
    };
    if start > end {
        return None;
    }
    Some(RevRange { start, end, non_inheritable })
}

fn parse_mergeinfo(text: &str) -> Option<MergeInfo> {
    let mut info = MergeInfo::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (path, ranges) = line.rsplit_once(':')?;
        let slot = info.entry(path.to_string()).or_default();
        for range in ranges.split(',').filter(|r| !r.trim().is_empty()) {
            slot.push(parse_range(range.trim())?);
        }
    }
    Some(info)
}

fn coalesce(mut ranges: Vec<RevRange>) -> Vec<RevRange> {
    ranges.sort();
    let mut out: Vec<RevRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match out.last_mut() {
            Some(last)
                if last.non_inheritable == range.non_inheritable
                    && range.start <= last.end.saturating_add(1) =>
            {
                last.end = last.end.max(range.end);
            }
            _ => out.push(range),
        }
    }
    out
}

fn render_mergeinfo(info: &MergeInfo) -> String {
    let mut lines = Vec::with_capacity(info.len());
    for (path, ranges) in info {
        let ranges: Vec<String> = ranges
            .iter()
            .map(|r| {
                let mut s = if r.start == r.end {
                    r.start.to_string()
                } else {
                    format!("{}-{}", r.start, r.end)
                };
                if r.non_inheritable {
                    s.push('*');
                }
                s
            })
            .collect();
        lines.push(format!("{}:{}", path, ranges.join(",")));
    }
    lines.join("\n")
}

/// Set-union of two merge-info values, or `None` if either does not parse.
pub fn mergeinfo_union(a: &str, b: &str) -> Option<String> {
    let mut info = parse_mergeinfo(a)?;
    for (path, ranges) in parse_mergeinfo(b)? {
        info.entry(path).or_default().extend(ranges);
    }
    let info: MergeInfo = info.into_iter().map(|(p, r)| (p, coalesce(r))).collect();
    Some(render_mergeinfo(&info))
}

/// Text of a `.prej` reject file for the given conflict descriptions
pub fn reject_text(conflicts: &[String]) -> String {
    let mut out = String::new();
    for conflict in conflicts {
        out.push_str(conflict);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> PropMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn diff(pairs: &[(&str, Option<&str>)]) -> PropDiff {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
            .collect()
    }

    #[test]
    fn test_empty_diff_is_unchanged() {
        let base = map(&[("a", "1")]);
        let r = merge_props(&base, &base, None, &PropDiff::new(), false);
        assert_eq!(r.status, MergeStatus::Unchanged);
        assert_eq!(r.working, base);
    }

    #[test]
    fn test_clean_remote_change() {
        let base = map(&[("a", "1")]);
        let r = merge_props(&base, &base, None, &diff(&[("a", Some("2"))]), true);
        assert_eq!(r.status, MergeStatus::Changed);
        assert_eq!(r.working["a"], "2");
        assert_eq!(r.base["a"], "2");
    }

    #[test]
    fn test_remote_add_same_as_local_is_merged() {
        let base = PropMap::new();
        let working = map(&[("a", "v")]);
        let r = merge_props(&base, &working, None, &diff(&[("a", Some("v"))]), false);
        assert_eq!(r.status, MergeStatus::Merged);
        assert!(r.conflicts.is_empty());
    }

    #[test]
    fn test_remote_add_conflicts_with_local_add() {
        let base = PropMap::new();
        let working = map(&[("a", "mine")]);
        let r = merge_props(&base, &working, None, &diff(&[("a", Some("theirs"))]), false);
        assert_eq!(r.status, MergeStatus::Conflicted);
        assert_eq!(r.working["a"], "mine");
        assert!(r.conflicts[0].contains("already exists with value 'mine'"));
    }

    #[test]
    fn test_add_against_locally_deleted_property_conflicts() {
        // no server base, base "X", locally deleted, incoming "Y"
        let base = map(&[("p", "X")]);
        let working = PropMap::new();
        let incoming = diff(&[("p", Some("Y"))]);

        let r = merge_props(&base, &working, Some(&PropMap::new()), &incoming, false);
        assert_eq!(r.status, MergeStatus::Conflicted);
        assert!(r.conflicts[0].contains("locally deleted and had value 'X'"));

        let r = merge_props(&base, &working, None, &incoming, false);
        assert_eq!(r.status, MergeStatus::Conflicted);
        assert_eq!(r.conflicts.len(), 1);
    }

    #[test]
    fn test_remote_delete() {
        let base = map(&[("a", "1")]);
        let r = merge_props(&base, &base, None, &diff(&[("a", None)]), false);
        assert_eq!(r.status, MergeStatus::Changed);
        assert!(!r.working.contains_key("a"));

        let modified = map(&[("a", "local")]);
        let r = merge_props(&base, &modified, None, &diff(&[("a", None)]), false);
        assert_eq!(r.status, MergeStatus::Conflicted);
        assert!(r.conflicts[0].contains("modified from '1' to 'local'"));

        let r = merge_props(&base, &PropMap::new(), None, &diff(&[("a", None)]), false);
        assert_eq!(r.status, MergeStatus::Merged);
    }

    #[test]
    fn test_divergent_change_conflicts() {
        let base = map(&[("a", "1")]);
        let working = map(&[("a", "local")]);
        let r = merge_props(&base, &working, None, &diff(&[("a", Some("remote"))]), false);
        assert_eq!(r.status, MergeStatus::Conflicted);
        assert!(r.conflicts[0].contains("locally changed from '1' to 'local'"));
    }

    #[test]
    fn test_independent_names_merge_independently() {
        let base = map(&[("a", "1"), ("b", "1")]);
        let working = map(&[("a", "local"), ("b", "1")]);
        let r = merge_props(
            &base,
            &working,
            None,
            &diff(&[("a", Some("remote")), ("b", Some("2"))]),
            false,
        );
        assert_eq!(r.status, MergeStatus::Conflicted);
        assert_eq!(r.working["b"], "2");
        assert_eq!(r.conflicts.len(), 1);
    }

    #[test]
    fn test_bookkeeping_names_are_skipped() {
        let base = PropMap::new();
        let r = merge_props(
            &base,
            &base,
            None,
            &diff(&[("svn:entry:committed-rev", Some("5")), ("svn:wc:ra_dav:version-url", Some("/x"))]),
            false,
        );
        assert!(r.working.is_empty());
        assert_eq!(r.status, MergeStatus::Changed);
    }

    #[test]
    fn test_mergeinfo_is_unioned() {
        let base = map(&[(svn_props::MERGE_INFO, "/trunk:1-5")]);
        let working = map(&[(svn_props::MERGE_INFO, "/trunk:1-5,9\n/branch:3")]);
        let r = merge_props(
            &base,
            &working,
            None,
            &diff(&[(svn_props::MERGE_INFO, Some("/trunk:1-7"))]),
            false,
        );
        assert_eq!(r.status, MergeStatus::Merged);
        assert_eq!(r.working[svn_props::MERGE_INFO], "/branch:3\n/trunk:1-7,9");
    }

    #[test]
    fn test_mergeinfo_union_keeps_non_inheritable_apart() {
        assert_eq!(mergeinfo_union("/a:1-3", "/a:4-6").as_deref(), Some("/a:1-6"));
        assert_eq!(mergeinfo_union("/a:1-3*", "/a:2-6").as_deref(), Some("/a:1-3*,2-6"));
        assert_eq!(mergeinfo_union("/a:x", "/a:1"), None);
    }

    #[test]
    fn test_merge_is_deterministic() {
        let base = map(&[("a", "1"), ("c", "3")]);
        let working = map(&[("a", "2"), ("c", "3")]);
        let incoming = diff(&[("a", Some("9")), ("c", None), ("d", Some("4"))]);
        let first = merge_props(&base, &working, Some(&base), &incoming, true);
        let second = merge_props(&base, &working, Some(&base), &incoming, true);
        assert_eq!(first, second);
    }
}
