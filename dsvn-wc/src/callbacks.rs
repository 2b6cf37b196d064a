//! Collaborator seams of a working-copy session
//!
//! - `EventSink`: receives progress notifications
//! - `DeletionPolicy`: decides whether removal from revision control also
//!   removes the node from disk
//! - `TextMerger`: executes the log's `merge` command
//! - `CancellationToken`: polled during recursive walks

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::entry::NodeKind;
use crate::error::{Result, WcError};
use crate::translate::{normal_form, translate_file, Direction, Translation};

/// What happened to a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    /// Working file rematerialized from its base text
    Restored,
    /// Conflict markers removed
    Resolved,
    /// Node removed from revision control
    Removed,
    /// Node kept on disk because it has local modifications
    KeptModified,
    /// Commit finalized for the node
    Committed,
    /// Pending log files replayed
    LogsReplayed,
    /// Admin area migrated to a newer generation
    Upgraded,
    /// Stale lock broken during cleanup
    LockBroken,
}

/// A progress notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub path: PathBuf,
    pub action: EventAction,
}

impl Event {
    pub fn new(path: impl Into<PathBuf>, action: EventAction) -> Self {
        Self {
            path: path.into(),
            action,
        }
    }
}

/// Receives progress events
pub trait EventSink {
    fn handle_event(&mut self, event: &Event);
}

impl<F: FnMut(&Event)> EventSink for F {
    fn handle_event(&mut self, event: &Event) {
        self(event)
    }
}

/// Event sink that discards everything
#[derive(Clone, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn handle_event(&mut self, _event: &Event) {}
}

/// Decides whether nodes leaving revision control are deleted from disk
pub trait DeletionPolicy {
    fn allow_delete(&self, path: &Path, kind: NodeKind) -> bool;
}

/// Delete everything that leaves revision control
#[derive(Clone, Default)]
pub struct AllowDeletion;

impl DeletionPolicy for AllowDeletion {
    fn allow_delete(&self, _path: &Path, _kind: NodeKind) -> bool {
        true
    }
}

/// Never touch working files
#[derive(Clone, Default)]
pub struct KeepWorkingFiles;

impl DeletionPolicy for KeepWorkingFiles {
    fn allow_delete(&self, _path: &Path, _kind: NodeKind) -> bool {
        false
    }
}

/// Shared cooperative cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancellation was requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(WcError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Inputs of a text merge
///
/// `left` and `right` are base-form texts; `target` is the working file.
#[derive(Debug, Clone)]
pub struct MergeRequest<'a> {
    pub target: &'a Path,
    pub left: &'a Path,
    pub right: &'a Path,
    pub translation: &'a Translation,
    pub dry_run: bool,
}

/// Result of a text merge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Unchanged,
    Merged,
    Conflicted,
}

/// Performs three-way text merges for the log runner
pub trait TextMerger {
    fn merge(&mut self, request: &MergeRequest<'_>) -> Result<MergeOutcome>;
}

/// Whole-file three-way selection without line diffing
#[derive(Clone, Default)]
pub struct WholeFileMerger;

impl TextMerger for WholeFileMerger {
    fn merge(&mut self, request: &MergeRequest<'_>) -> Result<MergeOutcome> {
        let left = fs::read(request.left)?;
        let right = fs::read(request.right)?;
        let mine = if request.target.exists() {
            Some(normal_form(request.target, request.translation)?)
        } else {
            None
        };

        match mine {
            Some(ref mine) if *mine == right => Ok(MergeOutcome::Unchanged),
            _ if left == right => Ok(MergeOutcome::Unchanged),
            Some(ref mine) if *mine != left => Ok(MergeOutcome::Conflicted),
            _ => {
                if !request.dry_run {
                    translate_file(request.right, request.target, request.translation, Direction::Expand)?;
                }
                Ok(MergeOutcome::Merged)
            }
        }
    }
}
