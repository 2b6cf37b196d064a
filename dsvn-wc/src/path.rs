//! URL, admin-path and file-attribute helpers

use chrono::{DateTime, Utc};
use filetime::FileTime;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use crate::error::{Result, WcError};

/// Name of the per-directory administrative directory
pub const ADMIN_DIR: &str = ".svn";

fn is_uri_safe(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'$' | b'&' | b'\'' | b'(' | b')' | b'*' | b'+' | b',' | b'-' | b'.' | b'/'
                | b':' | b'=' | b'@' | b'_' | b'~'
        )
}

/// Percent-encode everything outside the URI-safe set.
pub fn uri_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        if is_uri_safe(b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

/// Percent-decode a URL path. Broken escapes are kept literally.
pub fn uri_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Join a URL and an already-encoded path segment.
pub fn url_append(base: &str, segment: &str) -> String {
    if segment.is_empty() {
        return base.to_string();
    }
    let base = base.trim_end_matches('/');
    format!("{}/{}", base, segment.trim_start_matches('/'))
}

/// True when `ancestor` equals `url` or is a path prefix of it.
pub fn url_is_ancestor(ancestor: &str, url: &str) -> bool {
    let ancestor = ancestor.trim_end_matches('/');
    if url == ancestor {
        return true;
    }
    url.len() > ancestor.len() && url.starts_with(ancestor) && url.as_bytes()[ancestor.len()] == b'/'
}

/// Last path segment of a URL, still encoded.
pub fn url_tail(url: &str) -> &str {
    let url = url.trim_end_matches('/');
    match url.rfind('/') {
        Some(idx) => &url[idx + 1..],
        None => url,
    }
}

/// URL with its last path segment removed.
pub fn url_remove_tail(url: &str) -> &str {
    let url = url.trim_end_matches('/');
    match url.rfind('/') {
        Some(idx) => &url[..idx],
        None => url,
    }
}

// ─────────────────────────────────────────────────────
// File attributes
// ─────────────────────────────────────────────────────

pub(crate) fn set_readonly(path: &Path, readonly: bool) -> Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    #[allow(clippy::permissions_set_readonly_false)]
    perms.set_readonly(readonly);
    fs::set_permissions(path, perms)?;
    Ok(())
}

/// Make an existing file writable so it can be replaced.
pub(crate) fn make_writable(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_file() && meta.permissions().readonly() => set_readonly(path, false),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
pub(crate) fn set_executable(path: &Path, executable: bool) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    let mode = perms.mode();
    // grant execute wherever read is granted
    let mode = if executable {
        mode | ((mode & 0o444) >> 2)
    } else {
        mode & !0o111
    };
    perms.set_mode(mode);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn set_executable(_path: &Path, _executable: bool) -> Result<()> {
    Ok(())
}

/// Delete a file; a missing file is not an error.
pub(crate) fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => {
            make_writable(path)?;
            fs::remove_file(path).map_err(|_| WcError::Io(e))?;
            Ok(true)
        }
    }
}

/// Modification time of a file or symlink, `None` when it does not exist.
pub(crate) fn file_mtime(path: &Path) -> Result<Option<DateTime<Utc>>> {
    match fs::symlink_metadata(path) {
        Ok(meta) => Ok(Some(DateTime::<Utc>::from(meta.modified()?))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn set_file_mtime(path: &Path, time: &DateTime<Utc>) -> Result<()> {
    let mtime = FileTime::from_unix_time(time.timestamp(), time.timestamp_subsec_nanos());
    filetime::set_file_mtime(path, mtime)?;
    Ok(())
}

/// Write `data` to `tmp_path`, then rename it over `path` and mark it read-only.
pub(crate) fn install_file(tmp_path: &Path, path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = tmp_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(tmp_path, data)?;
    make_writable(path)?;
    fs::rename(tmp_path, path)?;
    set_readonly(path, true)?;
    Ok(())
}

/// First free name of the form `base + suffix`, `base.1 + suffix`, ... in `dir`.
pub(crate) fn unique_name(dir: &Path, base: &str, suffix: &str) -> Result<String> {
    let mut name = format!("{}{}", base, suffix);
    for i in 1..100_000 {
        if fs::symlink_metadata(dir.join(&name)).is_err() {
            return Ok(name);
        }
        name = format!("{}.{}{}", base, i, suffix);
    }
    Err(WcError::Io(std::io::Error::new(
        ErrorKind::AlreadyExists,
        format!("unable to make a unique name for '{}' in {:?}", base, dir),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_encode_decode() {
        assert_eq!(uri_encode("a b#c"), "a%20b%23c");
        assert_eq!(uri_decode("a%20b%23c"), "a b#c");
        assert_eq!(uri_decode("100%"), "100%");
        assert_eq!(uri_encode("caf\u{e9}"), "caf%C3%A9");
        assert_eq!(uri_decode("caf%C3%A9"), "caf\u{e9}");
    }

    #[test]
    fn test_url_ancestry() {
        assert!(url_is_ancestor("http://h/repo", "http://h/repo/trunk"));
        assert!(url_is_ancestor("http://h/repo/", "http://h/repo/trunk"));
        assert!(url_is_ancestor("http://h/repo", "http://h/repo"));
        assert!(!url_is_ancestor("http://h/rep", "http://h/repo/trunk"));
    }

    #[test]
    fn test_url_tail() {
        assert_eq!(url_append("http://h/repo/", "a%20b"), "http://h/repo/a%20b");
        assert_eq!(url_tail("http://h/repo/trunk"), "trunk");
        assert_eq!(url_remove_tail("http://h/repo/trunk"), "http://h/repo");
    }

    #[test]
    fn test_unique_name_skips_existing() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert_eq!(unique_name(tmp.path(), "foo.c", ".mine").unwrap(), "foo.c.mine");
        fs::write(tmp.path().join("foo.c.mine"), "").unwrap();
        assert_eq!(unique_name(tmp.path(), "foo.c", ".mine").unwrap(), "foo.c.1.mine");
    }

    #[test]
    fn test_install_file_replaces_readonly_target() {
        let tmp = tempfile::TempDir::new().unwrap();
        let target = tmp.path().join("entries");
        install_file(&tmp.path().join("tmp/entries"), &target, b"one").unwrap();
        install_file(&tmp.path().join("tmp/entries"), &target, b"two").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"two");
        assert!(fs::metadata(&target).unwrap().permissions().readonly());
        assert!(!tmp.path().join("tmp/entries").exists());
        assert!(remove_if_exists(&target).unwrap());
        assert!(!remove_if_exists(&target).unwrap());
    }
}
