//! Ordered header collection.
//!
//! Fields keep their arrival order and original name spelling; lookups
//! compare names case-insensitively. Repeated names are kept as separate
//! entries, the way they arrived on the wire.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::http::charset::CharacterSet;

/// One field as received. The value is kept byte for byte, including
/// obs-text, so forwarding never rewrites it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: String,
    pub value: Bytes,
}

impl HeaderField {
    /// The value as text, when it is valid UTF-8.
    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    fields: Vec<HeaderField>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("header line without a colon: {0:?}")]
    MissingColon(String),
    #[error("empty or invalid header name: {0:?}")]
    InvalidName(String),
    #[error("whitespace between header name and colon: {0:?}")]
    WhitespaceBeforeColon(String),
    #[error("invalid characters in value of {0}")]
    InvalidValue(String),
    #[error("obsolete line folding")]
    ObsoleteFold,
    #[error("header line not terminated by CRLF")]
    BareLf,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a raw header block as produced by the request parser.
    ///
    /// In relaxed mode bare LF terminators are accepted, whitespace before
    /// the colon is trimmed and obsolete line folding is joined with a single
    /// space. Strict mode rejects all three.
    pub fn parse(block: &[u8], relaxed: bool) -> Result<Self, HeaderError> {
        let mut map = HeaderMap::new();

        for raw in block.split_inclusive(|b| *b == b'\n') {
            let line = match raw.strip_suffix(b"\r\n") {
                Some(line) => line,
                None if relaxed => raw.strip_suffix(b"\n").unwrap_or(raw),
                None if raw.ends_with(b"\n") => return Err(HeaderError::BareLf),
                None => raw,
            };
            if line.is_empty() {
                break;
            }

            if CharacterSet::WSP.contains(line[0]) {
                if !relaxed {
                    return Err(HeaderError::ObsoleteFold);
                }
                let last = map.fields.last_mut().ok_or(HeaderError::ObsoleteFold)?;
                let continuation = trim_ows(line);
                let mut joined = BytesMut::with_capacity(last.value.len() + 1 + continuation.len());
                joined.put_slice(&last.value);
                joined.put_u8(b' ');
                joined.put_slice(continuation);
                last.value = joined.freeze();
                continue;
            }

            let Some(colon) = line.iter().position(|b| *b == b':') else {
                return Err(HeaderError::MissingColon(
                    String::from_utf8_lossy(line).into_owned(),
                ));
            };
            let (name, value) = (&line[..colon], &line[colon + 1..]);

            let name = if name.last().is_some_and(|b| CharacterSet::WSP.contains(*b)) {
                if !relaxed {
                    return Err(HeaderError::WhitespaceBeforeColon(
                        String::from_utf8_lossy(name).into_owned(),
                    ));
                }
                trim_ows(name)
            } else {
                name
            };
            if name.is_empty() || !name.iter().all(|b| CharacterSet::TCHAR.contains(*b)) {
                return Err(HeaderError::InvalidName(
                    String::from_utf8_lossy(name).into_owned(),
                ));
            }
            // tchar is ASCII
            let name = String::from_utf8_lossy(name).into_owned();

            let value = trim_ows(value);
            if !value.iter().all(|b| CharacterSet::HEADER_VALUE.contains(*b)) {
                return Err(HeaderError::InvalidValue(name));
            }

            map.fields.push(HeaderField {
                name,
                value: Bytes::copy_from_slice(value),
            });
        }

        Ok(map)
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push(HeaderField {
            name: name.into(),
            value: Bytes::from(value.into()),
        });
    }

    /// Replaces every field called `name` with a single one.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.append(name, value);
    }

    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.fields.len();
        self.fields.retain(|f| !f.name.eq_ignore_ascii_case(name));
        before - self.fields.len()
    }

    fn fields_named<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a HeaderField> {
        self.fields
            .iter()
            .filter(move |f| f.name.eq_ignore_ascii_case(name))
    }

    /// First value of `name`, if it is text.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields_named(name).next().and_then(HeaderField::value_str)
    }

    /// First value of `name` as received.
    pub fn get_bytes(&self, name: &str) -> Option<&[u8]> {
        self.fields_named(name).next().map(|f| &f.value[..])
    }

    /// Every textual value of `name`, in arrival order.
    pub fn get_all<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> {
        self.fields_named(name).filter_map(HeaderField::value_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields_named(name).next().is_some()
    }

    /// All values of `name` joined into one comma-separated list.
    pub fn get_list(&self, name: &str) -> Option<String> {
        let values: Vec<&str> = self.get_all(name).collect();
        if values.is_empty() {
            None
        } else {
            Some(values.join(", "))
        }
    }

    /// True when `name` carries `member` as one of its list items.
    pub fn has_list_member(&self, name: &str, member: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|item| item.trim().eq_ignore_ascii_case(member))
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderField> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

fn trim_ows(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !CharacterSet::WSP.contains(*b))
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !CharacterSet::WSP.contains(*b))
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}
