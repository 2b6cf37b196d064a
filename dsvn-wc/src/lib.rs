//! DSvn Working Copy Library
//!
//! Client-side metadata engine for Subversion working copies:
//! - Entry model with field-level patches and inheritance
//! - Entries storage in the XML (format 4) and line-based (8-10) generations
//! - Versioned, base, revert and wc property sets
//! - Three-way property merge with conflict records
//! - EOL / keyword / special-file translation
//! - Per-directory admin areas with locking and text-base tracking
//! - Crash-safe command logs and their replay
//! - Multi-directory sessions: commit finalization, removal, cleanup, upgrade

pub mod error;
pub mod entry;
pub mod path;
pub mod format;
pub mod props;
pub mod merge;
pub mod translate;
pub mod log;
pub mod config;
pub mod callbacks;
pub mod area;
pub mod runner;
pub mod access;

pub use error::{FormatProblem, Result, WcError};
pub use entry::{Depth, Entry, EntryField, EntryPatch, NodeKind, Schedule, THIS_DIR};
pub use format::{Entries, Generation};
pub use props::{PropDiff, PropMap, PropSet, VersionedProps};
pub use merge::{merge_props, MergeStatus, PropMerge};
pub use translate::{Direction, EolStyle, KeywordSource, Translation};
pub use log::{Command, Log};
pub use config::WcOptions;
pub use callbacks::{
    AllowDeletion, CancellationToken, DeletionPolicy, Event, EventAction, EventSink, KeepWorkingFiles,
    MergeOutcome, MergeRequest, NoOpEventSink, TextMerger, WholeFileMerger,
};
pub use area::{AdminArea, ConflictLabels, ScheduleFold};
pub use runner::{LogRunner, RunContext};
pub use access::{AnchorInfo, CommitInfo, WcAccess};
