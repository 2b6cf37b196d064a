//! Content translation between base ("normal") and working form
//!
//! Three properties drive the transform:
//! - `svn:eol-style`: line endings are rewritten to the base or working EOL
//! - `svn:keywords`: `$Keyword$` placeholders are expanded or collapsed
//! - `svn:special`: the base form `link TARGET` becomes a symlink
//!
//! [`Translator`] is a streaming writer adapter; neither an EOL pair nor a
//! keyword has to arrive within a single chunk.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use chrono::{DateTime, Local, Utc};
use tracing::warn;

use crate::error::{Result, WcError};
use crate::path::{uri_decode, url_tail};
use crate::props::{svn_props, PropMap};

/// Longest keyword placeholder, delimiters included
pub const MAX_KEYWORD_LEN: usize = 255;

const LF: &[u8] = b"\n";
const CR: &[u8] = b"\r";
const CRLF: &[u8] = b"\r\n";
const NATIVE_EOL: &[u8] = if cfg!(windows) { CRLF } else { LF };

/// Value of `svn:eol-style`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EolStyle {
    Native,
    Lf,
    Cr,
    CrLf,
}

impl EolStyle {
    /// Parse a property value; unknown styles mean no EOL translation.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "native" => Some(EolStyle::Native),
            "LF" => Some(EolStyle::Lf),
            "CR" => Some(EolStyle::Cr),
            "CRLF" => Some(EolStyle::CrLf),
            _ => None,
        }
    }

    /// Line ending used in the base text
    pub fn base_eol(&self) -> &'static [u8] {
        match self {
            EolStyle::Native | EolStyle::Lf => LF,
            EolStyle::Cr => CR,
            EolStyle::CrLf => CRLF,
        }
    }

    /// Line ending used in the working file
    pub fn working_eol(&self) -> &'static [u8] {
        match self {
            EolStyle::Native => NATIVE_EOL,
            other => other.base_eol(),
        }
    }
}

/// Direction of a translation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Base form to working form
    Expand,
    /// Working form to base form
    Contract,
}

/// Entry metadata substituted into keywords
#[derive(Debug, Clone, Default)]
pub struct KeywordSource {
    pub url: Option<String>,
    pub revision: Option<u64>,
    pub date: Option<DateTime<Utc>>,
    pub author: Option<String>,
    /// Render `Date` in UTC rather than local time
    pub utc: bool,
}

fn human_date(date: &DateTime<Utc>, utc: bool) -> String {
    const FORMAT: &str = "%Y-%m-%d %H:%M:%S %z (%a, %d %b %Y)";
    if utc {
        date.format(FORMAT).to_string()
    } else {
        date.with_timezone(&Local).format(FORMAT).to_string()
    }
}

/// Enabled keywords and their current values
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keywords {
    values: BTreeMap<&'static str, String>,
}

impl Keywords {
    /// Build the keyword table from an `svn:keywords` value.
    ///
    /// Names are matched case-insensitively and enable every alias.
    pub fn new(property: &str, source: &KeywordSource) -> Self {
        let revision = source.revision.map(|r| r.to_string()).unwrap_or_default();
        let author = source.author.clone().unwrap_or_default();
        let mut values = BTreeMap::new();

        for token in property.split_whitespace() {
            let (names, value): (&[&'static str], String) = match token.to_ascii_lowercase().as_str() {
                "lastchangeddate" | "date" => (
                    &["LastChangedDate", "Date"][..],
                    source.date.as_ref().map(|d| human_date(d, source.utc)).unwrap_or_default(),
                ),
                "lastchangedrevision" | "revision" | "rev" => {
                    (&["LastChangedRevision", "Revision", "Rev"][..], revision.clone())
                }
                "lastchangedby" | "author" => (&["LastChangedBy", "Author"][..], author.clone()),
                "headurl" | "url" => (
                    &["HeadURL", "URL"][..],
                    source.url.as_deref().map(uri_decode).unwrap_or_default(),
                ),
                "id" => {
                    let id = match source.url.as_deref() {
                        Some(url) => format!(
                            "{} {} {} {}",
                            uri_decode(url_tail(url)),
                            revision,
                            source
                                .date
                                .map(|d| d.format("%Y-%m-%d %H:%M:%SZ").to_string())
                                .unwrap_or_default(),
                            author
                        ),
                        None => String::new(),
                    };
                    (&["Id"][..], id)
                }
                _ => continue,
            };
            for name in names {
                values.insert(*name, value.clone());
            }
        }
        Self { values }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

/// Full translator configuration for one file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Translation {
    pub eol: Option<EolStyle>,
    pub keywords: Keywords,
    pub special: bool,
    /// Normalize mixed line endings instead of failing
    pub repair: bool,
}

impl Translation {
    /// Derive a translation from an entry's working properties.
    pub fn from_props(props: &PropMap, source: &KeywordSource) -> Self {
        let eol = props.get(svn_props::EOL_STYLE).and_then(|v| EolStyle::parse(v));
        let keywords = props
            .get(svn_props::KEYWORDS)
            .map(|k| Keywords::new(k, source))
            .unwrap_or_default();
        Self {
            eol,
            keywords,
            special: props.contains_key(svn_props::SPECIAL),
            repair: false,
        }
    }

    /// True when both forms are byte-identical
    pub fn is_identity(&self) -> bool {
        self.eol.is_none() && self.keywords.is_empty() && !self.special
    }

    fn translator<W: Write>(&self, out: W, direction: Direction) -> Translator<W> {
        let eol = self.eol.map(|style| match direction {
            Direction::Expand => style.working_eol(),
            Direction::Contract => style.base_eol(),
        });
        let repair = self.repair || self.eol == Some(EolStyle::Native);
        Translator::new(out, eol, repair, self.keywords.clone(), direction)
    }
}

/// Streaming EOL and keyword rewriter
pub struct Translator<W: Write> {
    out: W,
    eol: Option<&'static [u8]>,
    repair: bool,
    keywords: Keywords,
    direction: Direction,
    seen_eol: Option<&'static [u8]>,
    pending_cr: bool,
    keyword: Vec<u8>,
}

impl<W: Write> Translator<W> {
    pub fn new(
        out: W,
        eol: Option<&'static [u8]>,
        repair: bool,
        keywords: Keywords,
        direction: Direction,
    ) -> Self {
        Self {
            out,
            eol,
            repair,
            keywords,
            direction,
            seen_eol: None,
            pending_cr: false,
            keyword: Vec::with_capacity(MAX_KEYWORD_LEN),
        }
    }

    /// Feed the next chunk of input.
    pub fn push(&mut self, chunk: &[u8]) -> Result<()> {
        for &b in chunk {
            self.push_byte(b)?;
        }
        Ok(())
    }

    /// Flush pending state and return the inner writer.
    pub fn finish(mut self) -> Result<W> {
        if self.pending_cr {
            self.pending_cr = false;
            self.write_eol(CR)?;
        }
        self.flush_keyword()?;
        self.out.flush()?;
        Ok(self.out)
    }

    fn push_byte(&mut self, b: u8) -> Result<()> {
        if self.pending_cr {
            self.pending_cr = false;
            if b == b'\n' {
                return self.write_eol(CRLF);
            }
            self.write_eol(CR)?;
        }

        if b == b'\r' || b == b'\n' {
            self.flush_keyword()?;
            if self.eol.is_none() {
                self.out.write_all(&[b])?;
            } else if b == b'\r' {
                self.pending_cr = true;
            } else {
                self.write_eol(LF)?;
            }
            return Ok(());
        }

        if self.keywords.is_empty() {
            self.out.write_all(&[b])?;
            return Ok(());
        }

        if b == b'$' {
            if self.keyword.is_empty() {
                self.keyword.push(b);
            } else {
                self.keyword.push(b);
                self.close_keyword()?;
            }
        } else if !self.keyword.is_empty() {
            self.keyword.push(b);
            if self.keyword.len() >= MAX_KEYWORD_LEN {
                self.flush_keyword()?;
            }
        } else {
            self.out.write_all(&[b])?;
        }
        Ok(())
    }

    fn write_eol(&mut self, found: &'static [u8]) -> Result<()> {
        if !self.repair {
            match self.seen_eol {
                None => self.seen_eol = Some(found),
                Some(seen) if seen != found => {
                    return Err(WcError::InconsistentEol(format!(
                        "found {:?} after {:?}",
                        String::from_utf8_lossy(found),
                        String::from_utf8_lossy(seen)
                    )));
                }
                Some(_) => {}
            }
        }
        let eol = self.eol.unwrap_or(found);
        self.out.write_all(eol)?;
        Ok(())
    }

    fn flush_keyword(&mut self) -> Result<()> {
        if !self.keyword.is_empty() {
            self.out.write_all(&self.keyword)?;
            self.keyword.clear();
        }
        Ok(())
    }

    /// The buffer holds `$...$`; rewrite it or pass it through.
    fn close_keyword(&mut self) -> Result<()> {
        let buf = std::mem::take(&mut self.keyword);
        match rewrite_keyword(&buf, &self.keywords, self.direction) {
            Some(rewritten) => {
                self.out.write_all(&rewritten)?;
            }
            None => {
                // the closing '$' may open the next keyword
                self.out.write_all(&buf[..buf.len() - 1])?;
                self.keyword.push(b'$');
            }
        }
        Ok(())
    }
}

fn rewrite_keyword(buf: &[u8], keywords: &Keywords, direction: Direction) -> Option<Vec<u8>> {
    let len = buf.len();
    let inner = &buf[1..len - 1];
    let name_len = inner.iter().position(|&b| b == b':').unwrap_or(inner.len());
    let name = std::str::from_utf8(&inner[..name_len]).ok()?;
    let stored = keywords.get(name)?;
    let value: &[u8] = match direction {
        Direction::Expand => stored.as_bytes(),
        Direction::Contract => &[],
    };
    let rest = &inner[name_len..];
    let mut out = Vec::with_capacity(len);

    if rest.starts_with(b":: ") && len > name_len + 6 && matches!(buf[len - 2], b' ' | b'#') {
        // fixed width: "$Name:: " field " $"
        let width = len - name_len - 6;
        out.extend_from_slice(&buf[..name_len + 4]);
        for i in 0..width {
            out.push(value.get(i).copied().unwrap_or(b' '));
        }
        out.push(if value.len() > width { b'#' } else { b' ' });
        out.push(b'$');
        return Some(out);
    }

    let plain = rest.is_empty() || rest == b":";
    let expanded = rest.starts_with(b": ") && rest.len() >= 3 && buf[len - 2] == b' ';
    if !plain && !expanded {
        return None;
    }
    out.push(b'$');
    out.extend_from_slice(name.as_bytes());
    if !value.is_empty() {
        let cap = 250usize.saturating_sub(name.len());
        out.extend_from_slice(b": ");
        out.extend_from_slice(&value[..value.len().min(cap)]);
        out.push(b' ');
    }
    out.push(b'$');
    Some(out)
}

/// Translate an in-memory buffer.
pub fn translate_bytes(data: &[u8], translation: &Translation, direction: Direction) -> Result<Vec<u8>> {
    let mut translator = translation.translator(Vec::with_capacity(data.len()), direction);
    translator.push(data)?;
    translator.finish()
}

/// Translate `src` into `dst`, replacing `dst`.
pub fn translate_file(src: &Path, dst: &Path, translation: &Translation, direction: Direction) -> Result<()> {
    if translation.special {
        return match direction {
            Direction::Expand => materialize_special(src, dst),
            Direction::Contract => detranslate_special(src, dst),
        };
    }
    if translation.is_identity() {
        fs::copy(src, dst)?;
        return Ok(());
    }

    let mut input = fs::File::open(src)?;
    let output = BufWriter::new(fs::File::create(dst)?);
    let mut translator = translation.translator(output, direction);
    let mut chunk = [0u8; 8192];
    let result = (|| -> Result<()> {
        loop {
            let n = input.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            translator.push(&chunk[..n])?;
        }
        translator.finish()?;
        Ok(())
    })();
    if result.is_err() {
        if let Err(e) = fs::remove_file(dst) {
            warn!("Failed to remove partial translation {:?}: {}", dst, e);
        }
    }
    result
}

/// Read the base form of `path`, contracting it when a translation applies.
pub fn normal_form(path: &Path, translation: &Translation) -> Result<Vec<u8>> {
    if translation.special {
        if let Ok(target) = fs::read_link(path) {
            return Ok(format!("link {}", target.display()).into_bytes());
        }
    }
    let data = fs::read(path)?;
    if translation.is_identity() || translation.special {
        return Ok(data);
    }
    let repairing = Translation {
        repair: true,
        ..translation.clone()
    };
    translate_bytes(&data, &repairing, Direction::Contract)
}

fn remove_existing(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn materialize_special(src: &Path, dst: &Path) -> Result<()> {
    let data = fs::read(src)?;
    let target = data
        .strip_prefix(b"link ")
        .and_then(|t| std::str::from_utf8(t).ok())
        .map(|t| t.trim_end_matches('\n').to_string());
    remove_existing(dst)?;
    match target {
        #[cfg(unix)]
        Some(target) => {
            std::os::unix::fs::symlink(target, dst)?;
        }
        _ => {
            fs::write(dst, &data)?;
        }
    }
    Ok(())
}

fn detranslate_special(src: &Path, dst: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(src)?;
    if meta.file_type().is_symlink() {
        let target = fs::read_link(src)?;
        fs::write(dst, format!("link {}", target.display()))?;
    } else {
        let data = fs::read(src)?;
        fs::write(dst, data)?;
    }
    Ok(())
}
