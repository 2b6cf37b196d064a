//! Legacy XML entries codec (generation 4)

use quick_xml::events::Event;
use quick_xml::Reader;
use std::path::Path;

use super::{elided_value, Entries, Generation};
use crate::entry::{Entry, EntryField, THIS_DIR};
use crate::error::{Result, WcError};

const HEADER: &str = "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<wc-entries\n   xmlns=\"svn:\">\n";
const FOOTER: &str = "</wc-entries>\n";

/// Escape an attribute value, including whitespace control characters.
pub fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            '\n' => out.push_str("&#10;"),
            '\r' => out.push_str("&#13;"),
            '\t' => out.push_str("&#9;"),
            c => out.push(c),
        }
    }
    out
}

fn parse_entry(
    element: &quick_xml::events::BytesStart<'_>,
    path: &Path,
) -> Result<Entry> {
    let mut entry = Entry::default();
    for attr in element.attributes() {
        let attr = attr.map_err(|e| WcError::malformed(path, e.to_string()))?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|e| WcError::malformed(path, e.to_string()))?
            .to_string();
        if key == "xmlns" || key.starts_with("xmlns:") {
            continue;
        }
        let value = attr
            .unescape_value()
            .map_err(|e| WcError::malformed(path, e.to_string()))?;
        match EntryField::from_name(&key) {
            Some(field) => entry
                .set(field, Some(value.as_ref()))
                .map_err(|reason| WcError::malformed(path, reason))?,
            None => {
                entry.extra.insert(key, value.into_owned());
            }
        }
    }
    Ok(entry)
}

/// Decode an XML entries document.
pub fn read(data: &str, path: &Path) -> Result<Entries> {
    let mut reader = Reader::from_str(data);
    reader.config_mut().trim_text(true);

    let mut entries = Entries::new();
    let mut buf = Vec::new();
    let mut seen_root = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => match e.local_name().as_ref() {
                b"wc-entries" => seen_root = true,
                b"entry" if seen_root => {
                    let entry = parse_entry(e, path)?;
                    entries.insert(entry.name.clone(), entry);
                }
                other => {
                    return Err(WcError::malformed(
                        path,
                        format!("unexpected element '{}'", String::from_utf8_lossy(other)),
                    ));
                }
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(WcError::malformed(path, e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    if !seen_root {
        return Err(WcError::malformed(path, "missing wc-entries element"));
    }
    Ok(entries)
}

fn write_entry(out: &mut String, entry: &Entry, dir: Option<&Entry>) {
    out.push_str("<entry");
    for &field in EntryField::ALL {
        if !Generation::Xml4.stores(field) {
            continue;
        }
        let value = match field {
            EntryField::Name => Some(entry.name.clone()),
            _ => elided_value(entry, dir, field),
        };
        if let Some(value) = value {
            out.push_str("\n   ");
            out.push_str(field.name());
            out.push_str("=\"");
            out.push_str(&escape_attr(&value));
            out.push('"');
        }
    }
    for (key, value) in &entry.extra {
        out.push_str("\n   ");
        out.push_str(key);
        out.push_str("=\"");
        out.push_str(&escape_attr(value));
        out.push('"');
    }
    out.push_str("/>\n");
}

/// Encode an entry set as an XML entries document.
pub fn write(entries: &Entries) -> String {
    let mut out = String::from(HEADER);
    let dir = entries.get(THIS_DIR);
    if let Some(dir) = dir {
        write_entry(&mut out, dir, None);
    }
    for (name, entry) in entries {
        if name == THIS_DIR {
            continue;
        }
        match dir {
            Some(dir) => {
                let mut entry = entry.clone();
                entry.inherit_from(dir);
                write_entry(&mut out, &entry, Some(dir));
            }
            None => write_entry(&mut out, entry, None),
        }
    }
    out.push_str(FOOTER);
    out
}
