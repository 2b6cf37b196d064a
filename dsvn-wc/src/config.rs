//! Working-copy options
//!
//! Stored as JSON, e.g. `~/.dsvn/wc-options.json`. Missing fields take
//! their defaults and a missing file means all defaults.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{Result, WcError};
use crate::format::Generation;

/// Behaviour switches for a working-copy session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WcOptions {
    /// Set restored or committed files' mtime to the last commit date.
    pub use_commit_times: bool,
    /// Upgrade older areas in place when they are write-locked.
    pub auto_upgrade: bool,
    /// Generation for new areas and upgrades.
    pub target_generation: Generation,
    /// Log and continue past non-fatal errors during recursive cleanup.
    pub safe_cleanup: bool,
    /// Render keyword dates in UTC.
    pub keyword_date_utc: bool,
}

impl Default for WcOptions {
    fn default() -> Self {
        Self {
            use_commit_times: false,
            auto_upgrade: true,
            target_generation: Generation::LATEST,
            safe_cleanup: false,
            keyword_date_utc: true,
        }
    }
}

impl WcOptions {
    /// Load options from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path)
            .map_err(|e| WcError::Config(format!("Failed to read {:?}: {}", path, e)))?;
        serde_json::from_str(&data)
            .map_err(|e| WcError::Config(format!("Failed to parse {:?}: {}", path, e)))
    }

    /// Save options to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp_path = path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| WcError::Config(e.to_string()))?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_is_default() {
        let tmp = TempDir::new().unwrap();
        let options = WcOptions::load(&tmp.path().join("wc-options.json")).unwrap();
        assert_eq!(options, WcOptions::default());
        assert!(options.auto_upgrade);
        assert_eq!(options.target_generation, Generation::Lines10);
    }

    #[test]
    fn test_save_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("wc-options.json");
        let options = WcOptions {
            use_commit_times: true,
            target_generation: Generation::Lines8,
            ..Default::default()
        };
        options.save(&path).unwrap();
        assert!(!path.with_extension("tmp").exists());
        assert_eq!(WcOptions::load(&path).unwrap(), options);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("wc-options.json");
        fs::write(&path, r#"{"safe_cleanup": true, "unknown": 1}"#).unwrap();
        let options = WcOptions::load(&path).unwrap();
        assert!(options.safe_cleanup);
        assert!(options.keyword_date_utc);
    }

    #[test]
    fn test_bad_generation_is_config_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("wc-options.json");
        fs::write(&path, r#"{"target_generation": 6}"#).unwrap();
        assert!(matches!(WcOptions::load(&path), Err(WcError::Config(_))));
    }
}
